//! Authoritative replication server.
//!
//! Accepts client connections, brings each one up to date with a create
//! message per object, dispatches object requests, and broadcasts
//! confirmations to every client.

use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use groovebox_types::ObjId;

use crate::command::{Command, CommandPayload};
use crate::context::{ContextHandle, ContextThread};
use crate::error::{ContextError, HandlerError, MessageError, ObjectError};
use crate::framing::{decode_datagram, exchange_introduction, MAX_DATAGRAM};
use crate::handler::MessageHandler;
use crate::message::{Message, MessagePool};
use crate::object::{downcast, IdAllocator, ObjectBase, ObjectTable, ServerObject};
use crate::protocol::{self, ClientId, ControlCode, Target};

const ACCEPT_POLL: Duration = Duration::from_millis(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Listener settings.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub bind: String,
    /// Open the datagram side channel on the same port.
    pub udp: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:0".to_string(),
            udp: true,
        }
    }
}

struct ClientAgent {
    handler: MessageHandler,
}

/// Server state, owned by the server context thread.
pub struct ServerCore {
    handle: ContextHandle<ServerCore>,
    clients: BTreeMap<ClientId, ClientAgent>,
    next_client: u32,
    objects: ObjectTable<dyn ServerObject>,
    ids: IdAllocator,
    pool: MessagePool,
    udp: bool,
}

impl ServerCore {
    fn new(handle: ContextHandle<ServerCore>, udp: bool) -> Self {
        Self {
            handle,
            clients: BTreeMap::new(),
            next_client: 1,
            objects: ObjectTable::new(),
            ids: IdAllocator::new(),
            pool: MessagePool::default(),
            udp,
        }
    }

    pub fn handle(&self) -> ContextHandle<ServerCore> {
        self.handle.clone()
    }

    pub fn acquire_message(&self) -> Message {
        self.pool.acquire()
    }

    pub fn recycle(&self, msg: Message) {
        self.pool.recycle(msg);
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    // ---- connections ----

    fn add_client(&mut self, stream: TcpStream) {
        let id = ClientId::new(self.next_client);
        self.next_client += 1;

        let handle = self.handle.clone();
        let handler = match MessageHandler::new(stream, move || {
            let _ = handle.post(move |core: &mut ServerCore| core.remove_client(id));
        }) {
            Ok(h) => h,
            Err(e) => {
                error!(target: "net::server", "failed to set up {}: {}", id, e);
                return;
            }
        };
        info!(target: "net::server", "{} connected from {}", id, handler.peer());

        if let Err(e) = self.send_catch_up(id, &handler) {
            error!(target: "net::server", "catch-up for {} failed: {}", id, e);
            return;
        }

        let handle = self.handle.clone();
        let started = handler.start_receive(move |msg| {
            let _ = handle.post(move |core: &mut ServerCore| core.on_message(id, msg, false));
        });
        if let Err(e) = started {
            error!(target: "net::server", "failed to start reader for {}: {}", id, e);
            return;
        }
        self.clients.insert(id, ClientAgent { handler });
    }

    fn send_catch_up(&mut self, id: ClientId, handler: &MessageHandler) -> Result<(), MessageError> {
        let mut msg = self.acquire_message();
        protocol::protocol_version(&mut msg)?;
        handler.deliver_message(&msg, false);
        msg.clear();

        if self.udp {
            protocol::client_id(&mut msg, id)?;
            handler.deliver_message(&msg, false);
        }
        self.recycle(msg);

        let objects: Vec<_> = self.objects.iter().cloned().collect();
        for object in objects {
            let msg = self.create_message(object.as_ref())?;
            handler.deliver_message(&msg, false);
            self.recycle(msg);
        }
        Ok(())
    }

    /// Drop a client connection. Safe to call more than once.
    pub fn remove_client(&mut self, id: ClientId) {
        if let Some(agent) = self.clients.remove(&id) {
            agent.handler.close();
            info!(target: "net::server", "{} disconnected", id);
        }
    }

    // ---- dispatch ----

    fn on_message(&mut self, client: ClientId, msg: Message, via_udp: bool) {
        if !self.clients.contains_key(&client) {
            return;
        }
        let target = match protocol::target_of(&msg) {
            Ok(target) => target,
            Err(e) => {
                warn!(target: "net::server", "bad message from {}: {}", client, e);
                self.drop_if_reliable(client, via_udp);
                return;
            }
        };
        let id = match target {
            Target::Object(id) => id,
            Target::Control(code) => {
                warn!(target: "net::server", "{} sent control message {:?}", client, code);
                self.drop_if_reliable(client, via_udp);
                return;
            }
        };

        let result = match self.objects.get(id) {
            Ok(object) => object.process_message(self, client, &msg),
            Err(e) => Err(HandlerError::Object(e)),
        };
        match result {
            Ok(()) => {}
            Err(HandlerError::Failure(reason)) => self.send_failure(client, &reason, msg.reply_id()),
            Err(HandlerError::Object(
                e @ (ObjectError::NoSuchObject(_) | ObjectError::ObjectWasDeleted),
            )) => self.send_failure(client, &e.to_string(), msg.reply_id()),
            Err(e) => {
                warn!(target: "net::server", "dropping {}: {}", client, e);
                self.drop_if_reliable(client, via_udp);
            }
        }
        self.recycle(msg);
    }

    fn drop_if_reliable(&mut self, client: ClientId, via_udp: bool) {
        if !via_udp {
            self.remove_client(client);
        }
    }

    fn on_datagram(&mut self, client: ClientId, source: SocketAddr, msg: Message) {
        let Some(agent) = self.clients.get(&client) else {
            debug!(target: "net::server", "datagram for unknown {}", client);
            return;
        };
        if agent.handler.peer().ip() != source.ip() {
            debug!(target: "net::server", "datagram for {} from foreign address {}", client, source);
            return;
        }
        self.on_message(client, msg, true);
    }

    // ---- sending ----

    /// Send to one client.
    pub fn send_to(&self, client: ClientId, msg: &Message) {
        if let Some(agent) = self.clients.get(&client) {
            agent.handler.deliver_message(msg, false);
        }
    }

    /// Send to every connected client. The frame is encoded once.
    pub fn distribute_message(&self, msg: &Message) {
        let frame = Arc::new(msg.encode());
        for agent in self.clients.values() {
            agent.handler.deliver_frame(Arc::clone(&frame));
        }
    }

    /// Broadcast a confirmation from object `obj`.
    pub fn distribute_command<P: CommandPayload>(
        &self,
        obj: ObjId,
        payload: P,
    ) -> Result<(), MessageError> {
        let mut msg = self.acquire_message();
        Command::Confirm(payload).write(obj, &mut msg)?;
        self.distribute_message(&msg);
        self.recycle(msg);
        Ok(())
    }

    /// Targeted failure response. Never broadcast.
    pub fn send_failure(&self, client: ClientId, reason: &str, repid: Option<u32>) {
        warn!(target: "net::server", "failure response to {}: {}", client, reason);
        let mut msg = self.acquire_message();
        match protocol::failure_response(&mut msg, reason, repid) {
            Ok(()) => self.send_to(client, &msg),
            Err(e) => error!(target: "net::server", "cannot encode failure response: {}", e),
        }
        self.recycle(msg);
    }

    /// Answer `request` if it awaits a reply. `fill` adds the reply fields.
    pub fn acknowledge<F>(&self, client: ClientId, request: &Message, fill: F) -> Result<(), MessageError>
    where
        F: FnOnce(&mut Message) -> Result<(), MessageError>,
    {
        let Some(repid) = request.reply_id() else {
            return Ok(());
        };
        let mut msg = self.acquire_message();
        protocol::reply(&mut msg, repid)?;
        fill(&mut msg)?;
        self.send_to(client, &msg);
        self.recycle(msg);
        Ok(())
    }

    // ---- objects ----

    fn create_message(&self, object: &dyn ServerObject) -> Result<Message, MessageError> {
        let mut msg = self.acquire_message();
        protocol::create_object(&mut msg, object.obj_id(), object.factory())?;
        object.serialize(&mut msg)?;
        Ok(msg)
    }

    /// Reserve an id, build the object and announce it to every client.
    pub fn create_object<T, F>(&mut self, build: F) -> Result<Arc<T>, HandlerError>
    where
        T: ServerObject,
        F: FnOnce(ObjectBase) -> T,
    {
        let id = self.ids.reserve()?;
        let object = Arc::new(build(ObjectBase::new(id)));
        let msg = self.create_message(object.as_ref())?;
        self.objects.insert(id, object.clone())?;
        self.distribute_message(&msg);
        self.recycle(msg);
        info!(target: "net::server", "created {} #{}", object.factory(), id);
        Ok(object)
    }

    /// Remove an object, invalidate it and announce the deletion.
    pub fn remove_object(&mut self, id: ObjId) -> Result<(), HandlerError> {
        let object = self.objects.remove(id)?;
        object.on_delete(self);
        object.base().invalidate();
        let mut msg = self.acquire_message();
        protocol::delete_object(&mut msg, id)?;
        self.distribute_message(&msg);
        self.recycle(msg);
        info!(target: "net::server", "deleted {} #{}", object.factory(), id);
        Ok(())
    }

    pub fn get_object(&self, id: ObjId) -> Result<Arc<dyn ServerObject>, ObjectError> {
        self.objects.get(id)
    }

    /// Typed lookup. A type mismatch reads as a missing object.
    pub fn object<T: ServerObject>(&self, id: ObjId) -> Result<Arc<T>, ObjectError> {
        let object = self.objects.get(id)?;
        downcast::<T>(object.as_any_arc()).ok_or(ObjectError::NoSuchObject(id))
    }

    /// Every object of type `T`, in id order.
    pub fn objects_of<T: ServerObject>(&self) -> Vec<Arc<T>> {
        self.objects
            .iter()
            .filter_map(|o| downcast::<T>(Arc::clone(o).as_any_arc()))
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Tell every client to drop its replicas, then recreate them all.
    pub fn resync_all(&mut self) -> Result<(), MessageError> {
        let mut msg = self.acquire_message();
        protocol::control(&mut msg, ControlCode::FlushAllObjects)?;
        self.distribute_message(&msg);
        self.recycle(msg);

        let objects: Vec<_> = self.objects.iter().cloned().collect();
        for object in objects {
            let msg = self.create_message(object.as_ref())?;
            self.distribute_message(&msg);
            self.recycle(msg);
        }
        info!(target: "net::server", "resynced {} objects", self.objects.len());
        Ok(())
    }

    fn shutdown(&mut self) {
        for object in self.objects.drain() {
            object.base().invalidate();
        }
        for (_, agent) in std::mem::take(&mut self.clients) {
            agent.handler.close();
        }
    }
}

/// Running server: context thread plus listener threads.
pub struct Server {
    context: Option<ContextThread<ServerCore>>,
    handle: ContextHandle<ServerCore>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn bind(options: &ServerOptions) -> io::Result<Server> {
        let listener = TcpListener::bind(&options.bind)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let udp = if options.udp {
            let socket = UdpSocket::bind(local_addr)?;
            socket.set_read_timeout(Some(Duration::from_millis(100)))?;
            Some(socket)
        } else {
            None
        };

        let with_udp = udp.is_some();
        let context = ContextThread::spawn("net-server", move |handle| ServerCore::new(handle, with_udp))?;
        let handle = context.handle();
        let running = Arc::new(AtomicBool::new(true));

        let mut threads = Vec::new();
        {
            let handle = handle.clone();
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name("net-accept".into())
                    .spawn(move || accept_loop(listener, handle, running))?,
            );
        }
        if let Some(socket) = udp {
            let handle = handle.clone();
            let running = Arc::clone(&running);
            threads.push(
                thread::Builder::new()
                    .name("net-udp".into())
                    .spawn(move || datagram_loop(socket, handle, running))?,
            );
        }

        info!(target: "net::server", "listening on {} (udp: {})", local_addr, with_udp);
        Ok(Server {
            context: Some(context),
            handle,
            local_addr,
            running,
            threads,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn handle(&self) -> ContextHandle<ServerCore> {
        self.handle.clone()
    }

    pub fn post_action<F>(&self, f: F, synchronous: bool) -> Result<(), ContextError>
    where
        F: FnOnce(&mut ServerCore) + Send + 'static,
    {
        self.handle.post_action(f, synchronous)
    }

    pub fn invoke<F, R>(&self, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut ServerCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.handle.invoke(f)
    }

    pub fn client_count(&self) -> usize {
        self.invoke(|core| core.client_count()).unwrap_or(0)
    }

    pub fn resync_all(&self) -> Result<(), ContextError> {
        self.handle.post(|core| {
            if let Err(e) = core.resync_all() {
                error!(target: "net::server", "resync failed: {}", e);
            }
        })
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        let _ = self.handle.invoke(|core| core.shutdown());
        if let Some(context) = self.context.take() {
            context.shutdown();
        }
        info!(target: "net::server", "server on {} stopped", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.context.is_some() {
            self.stop();
        }
    }
}

fn accept_loop(listener: TcpListener, handle: ContextHandle<ServerCore>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                debug!(target: "net::server", "connection from {}", addr);
                match handshake(stream) {
                    Ok(stream) => {
                        if handle.post(move |core| core.add_client(stream)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(target: "net::server", "handshake with {} failed: {}", addr, e),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                error!(target: "net::server", "accept error: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!(target: "net::server", "accept loop exiting");
}

fn handshake(mut stream: TcpStream) -> io::Result<TcpStream> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    exchange_introduction(&mut stream)?;
    Ok(stream)
}

fn datagram_loop(socket: UdpSocket, handle: ContextHandle<ServerCore>, running: Arc<AtomicBool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while running.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => match decode_datagram(&buf[..len]) {
                Ok((client, msg)) => {
                    if handle
                        .post(move |core| core.on_datagram(client, source, msg))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => debug!(target: "net::server", "bad datagram from {}: {}", source, e),
            },
            Err(ref e)
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!(target: "net::server", "datagram receive failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    debug!(target: "net::server", "datagram loop exiting");
}
