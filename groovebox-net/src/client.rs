//! Replication client.
//!
//! Keeps a replica of every server object, sends requests, correlates
//! replies and tears all replicas down when the connection is lost.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;
use log::{debug, error, info, warn};

use groovebox_types::ObjId;

use crate::command::{Command, CommandPayload};
use crate::context::{ContextHandle, ContextThread};
use crate::error::{ContextError, HandlerError, MessageError, ObjectError, ReplyError};
use crate::framing::exchange_introduction;
use crate::handler::{MessageHandler, UdpLink};
use crate::message::{Message, MessagePool};
use crate::object::{downcast, ClientObject, FactoryRegistry, ObjectTable};
use crate::protocol::{self, ClientId, ControlCode, Target, PROTOCOL_VERSION};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback receiving the reply to one request.
pub type ReplyHandler = Box<dyn FnOnce(Result<Message, ReplyError>) + Send>;

/// Session-level notifications, delivered on the client context thread.
pub trait ClientEvents: Send + Sync {
    fn object_registered(&self, _object: &Arc<dyn ClientObject>) {}
    fn object_unregistered(&self, _object: &Arc<dyn ClientObject>) {}
    /// A failure response that no pending request claimed.
    fn failure(&self, _reason: &str) {}
    fn disconnected(&self) {}
}

/// Client state, owned by the client context thread.
pub struct ClientCore {
    handle: ContextHandle<ClientCore>,
    server: Option<MessageHandler>,
    objects: ObjectTable<dyn ClientObject>,
    factories: Arc<FactoryRegistry>,
    events: Option<Arc<dyn ClientEvents>>,
    pending: HashMap<u32, ReplyHandler>,
    next_reply: u32,
    pool: MessagePool,
    client_id: Option<ClientId>,
    server_version: Option<u32>,
}

impl ClientCore {
    fn new(
        handle: ContextHandle<ClientCore>,
        factories: Arc<FactoryRegistry>,
        events: Option<Arc<dyn ClientEvents>>,
    ) -> Self {
        Self {
            handle,
            server: None,
            objects: ObjectTable::new(),
            factories,
            events,
            pending: HashMap::new(),
            next_reply: 1,
            pool: MessagePool::default(),
            client_id: None,
            server_version: None,
        }
    }

    pub fn link(&self) -> ServerLink {
        ServerLink {
            handle: self.handle.clone(),
        }
    }

    pub fn acquire_message(&self) -> Message {
        self.pool.acquire()
    }

    pub fn recycle(&self, msg: Message) {
        self.pool.recycle(msg);
    }

    pub fn is_connected(&self) -> bool {
        self.server.as_ref().is_some_and(|s| !s.is_dropped())
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.client_id
    }

    pub fn server_version(&self) -> Option<u32> {
        self.server_version
    }

    pub fn pending_replies(&self) -> usize {
        self.pending.len()
    }

    fn attach(&mut self, stream: TcpStream) -> io::Result<()> {
        let handle = self.handle.clone();
        let handler = MessageHandler::new(stream, move || {
            let _ = handle.post(|core: &mut ClientCore| core.on_connection_dropped());
        })?;
        let handle = self.handle.clone();
        handler.start_receive(move |msg| {
            let _ = handle.post(move |core: &mut ClientCore| core.on_message(msg));
        })?;
        info!(target: "net::client", "connected to {}", handler.peer());
        self.server = Some(handler);
        Ok(())
    }

    // ---- sending ----

    /// Send to the server. `via_udp` allows the datagram side channel.
    pub fn distribute_message(&mut self, msg: &Message, via_udp: bool) {
        match &self.server {
            Some(server) => server.deliver_message(msg, via_udp),
            None => debug!(target: "net::client", "send while disconnected ignored"),
        }
    }

    /// Send `msg` tagged with a fresh reply id and register `on_reply`.
    pub fn send_with_reply(&mut self, mut msg: Message, on_reply: ReplyHandler) {
        if !self.is_connected() {
            on_reply(Err(ReplyError::ConnectionLost));
            return;
        }
        let repid = self.next_reply;
        self.next_reply = self.next_reply.wrapping_add(1).max(1);
        if self.pending.contains_key(&repid) {
            on_reply(Err(ReplyError::IdCollision));
            return;
        }
        if let Err(e) = msg.set_reply_id(repid) {
            on_reply(Err(e.into()));
            return;
        }
        self.pending.insert(repid, on_reply);
        self.distribute_message(&msg, false);
        self.recycle(msg);
    }

    // ---- receiving ----

    fn on_message(&mut self, msg: Message) {
        if let Err(e) = self.dispatch(&msg) {
            match e {
                HandlerError::Object(ObjectError::NoSuchObject(id)) => {
                    warn!(target: "net::client", "message for unknown object {}", id)
                }
                HandlerError::Failure(reason) => {
                    warn!(target: "net::client", "replica rejected update: {}", reason)
                }
                e => {
                    error!(target: "net::client", "protocol error, disconnecting: {}", e);
                    self.disconnect();
                }
            }
        }
        self.recycle(msg);
    }

    fn dispatch(&mut self, msg: &Message) -> Result<(), HandlerError> {
        match protocol::target_of(msg)? {
            Target::Object(id) => {
                let object = self.objects.get(id)?;
                object.process_message(self, msg)
            }
            Target::Control(code) => self.on_control(code, msg),
        }
    }

    fn on_control(&mut self, code: ControlCode, msg: &Message) -> Result<(), HandlerError> {
        match code {
            ControlCode::CreateObject => {
                let id = ObjId::new(msg.get(protocol::KEY_NEW_OBJID)?);
                let factory = msg.get_value(protocol::KEY_FACTORY)?;
                let object = match self.factories.create(factory, id, msg, self.link()) {
                    Ok(object) => object,
                    Err(HandlerError::Object(ObjectError::NoSuchFactory(name))) => {
                        error!(target: "net::client", "no factory for {}, object {} skipped", name, id);
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                self.objects.insert(id, Arc::clone(&object))?;
                debug!(target: "net::client", "created {} #{}", factory, id);
                if let Some(events) = &self.events {
                    events.object_registered(&object);
                }
            }
            ControlCode::DeleteObject => {
                let id = ObjId::new(msg.get(protocol::KEY_OBJID)?);
                let object = self.objects.remove(id)?;
                object.invalidate();
                debug!(target: "net::client", "deleted {} #{}", object.factory(), id);
                if let Some(events) = &self.events {
                    events.object_unregistered(&object);
                }
            }
            ControlCode::FlushAllObjects => self.flush_objects(),
            ControlCode::FailureResponse => {
                let reason = msg.get_text(protocol::KEY_REASON)?;
                let handler = msg.reply_id().and_then(|repid| self.pending.remove(&repid));
                match handler {
                    Some(handler) => handler(Err(ReplyError::Failed(reason))),
                    None => {
                        warn!(target: "net::client", "server reported failure: {}", reason);
                        if let Some(events) = &self.events {
                            events.failure(&reason);
                        }
                    }
                }
            }
            ControlCode::ProtocolVersion => {
                let version: u32 = msg.get(protocol::KEY_VERSION)?;
                self.server_version = Some(version);
                if version != PROTOCOL_VERSION {
                    return Err(MessageError::BadValue(protocol::KEY_VERSION.to_string()).into());
                }
            }
            ControlCode::Reply => {
                let repid = msg.reply_id().ok_or_else(|| {
                    MessageError::NoSuchKey(crate::message::KEY_REPLY.to_string())
                })?;
                match self.pending.remove(&repid) {
                    Some(handler) => handler(Ok(msg.clone())),
                    None => warn!(target: "net::client", "reply {} has no pending request", repid),
                }
            }
            ControlCode::ClientId => {
                let id = ClientId::new(msg.get(protocol::KEY_CLIENT_ID)?);
                self.client_id = Some(id);
                self.open_udp(id);
            }
        }
        Ok(())
    }

    fn open_udp(&mut self, id: ClientId) {
        let Some(server) = &self.server else {
            return;
        };
        let target = server.peer();
        let local: SocketAddr = if target.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        match UdpSocket::bind(local) {
            Ok(socket) => {
                server.set_udp_link(UdpLink {
                    socket: Arc::new(socket),
                    target,
                    client: id,
                });
                debug!(target: "net::client", "datagram channel open as {}", id);
            }
            Err(e) => warn!(target: "net::client", "no datagram channel: {}", e),
        }
    }

    fn flush_objects(&mut self) {
        for object in self.objects.drain() {
            object.invalidate();
            if let Some(events) = &self.events {
                events.object_unregistered(&object);
            }
        }
    }

    fn on_connection_dropped(&mut self) {
        if self.server.take().is_none() {
            return;
        }
        info!(target: "net::client", "connection to server lost");
        for (_, handler) in self.pending.drain() {
            handler(Err(ReplyError::ConnectionLost));
        }
        self.flush_objects();
        if let Some(events) = &self.events {
            events.disconnected();
        }
    }

    /// Close the connection; replicas and pending replies are torn down.
    pub fn disconnect(&mut self) {
        if let Some(server) = &self.server {
            server.close();
        }
        self.on_connection_dropped();
    }

    // ---- objects ----

    pub fn get_object(&self, id: ObjId) -> Result<Arc<dyn ClientObject>, ObjectError> {
        self.objects.get(id)
    }

    pub fn object<T: ClientObject>(&self, id: ObjId) -> Result<Arc<T>, ObjectError> {
        let object = self.objects.get(id)?;
        downcast::<T>(object.as_any_arc()).ok_or(ObjectError::NoSuchObject(id))
    }

    pub fn objects_of<T: ClientObject>(&self) -> Vec<Arc<T>> {
        self.objects
            .iter()
            .filter_map(|o| downcast::<T>(Arc::clone(o).as_any_arc()))
            .collect()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

/// What a replica holds to talk to the server.
#[derive(Clone)]
pub struct ServerLink {
    handle: ContextHandle<ClientCore>,
}

impl ServerLink {
    pub fn handle(&self) -> &ContextHandle<ClientCore> {
        &self.handle
    }

    /// Fire-and-forget send.
    pub fn send(&self, msg: Message, via_udp: bool) -> Result<(), ContextError> {
        self.handle
            .post(move |core| core.distribute_message(&msg, via_udp))
    }

    /// Send a request command to object `obj`.
    pub fn send_command<P: CommandPayload>(
        &self,
        obj: ObjId,
        payload: P,
        via_udp: bool,
    ) -> Result<(), ReplyError> {
        let msg = Command::Request(payload).to_message(obj)?;
        Ok(self.send(msg, via_udp)?)
    }

    /// Send and have `on_reply` called with the outcome.
    pub fn send_with_reply(&self, msg: Message, on_reply: ReplyHandler) -> Result<(), ContextError> {
        self.handle.post(move |core| core.send_with_reply(msg, on_reply))
    }

    /// Send and block until the reply arrives or the connection drops.
    pub fn request(&self, msg: Message) -> Result<Message, ReplyError> {
        if self.handle.is_context_thread() {
            return Err(ContextError::Reentrant.into());
        }
        let (tx, rx) = bounded(1);
        self.send_with_reply(
            msg,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        )?;
        rx.recv().map_err(|_| ReplyError::ConnectionLost)?
    }

    /// Blocking request for a typed command.
    pub fn request_command<P: CommandPayload>(
        &self,
        obj: ObjId,
        payload: P,
    ) -> Result<Message, ReplyError> {
        let msg = Command::Request(payload).to_message(obj)?;
        self.request(msg)
    }
}

/// A connected client with its own context thread.
pub struct Client {
    context: Option<ContextThread<ClientCore>>,
    link: ServerLink,
}

impl Client {
    /// Connect, exchange introductions and start receiving.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        factories: FactoryRegistry,
        events: Option<Arc<dyn ClientEvents>>,
    ) -> io::Result<Client> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(CONNECT_TIMEOUT))?;
        exchange_introduction(&mut stream)?;

        let factories = Arc::new(factories);
        let context = ContextThread::spawn("net-client", move |handle| {
            ClientCore::new(handle, factories, events)
        })?;
        let link = ServerLink {
            handle: context.handle(),
        };
        link.handle
            .invoke(move |core| core.attach(stream))
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        Ok(Client {
            context: Some(context),
            link,
        })
    }

    pub fn link(&self) -> ServerLink {
        self.link.clone()
    }

    pub fn handle(&self) -> ContextHandle<ClientCore> {
        self.link.handle.clone()
    }

    pub fn invoke<F, R>(&self, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut ClientCore) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.link.handle.invoke(f)
    }

    pub fn post_action<F>(&self, f: F, synchronous: bool) -> Result<(), ContextError>
    where
        F: FnOnce(&mut ClientCore) + Send + 'static,
    {
        self.link.handle.post_action(f, synchronous)
    }

    pub fn object<T: ClientObject>(&self, id: ObjId) -> Result<Arc<T>, ReplyError> {
        Ok(self.invoke(move |core| core.object::<T>(id))??)
    }

    pub fn objects_of<T: ClientObject>(&self) -> Vec<Arc<T>> {
        self.invoke(|core| core.objects_of::<T>()).unwrap_or_default()
    }

    pub fn is_connected(&self) -> bool {
        self.invoke(|core| core.is_connected()).unwrap_or(false)
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.invoke(|core| core.client_id()).ok().flatten()
    }

    pub fn request(&self, msg: Message) -> Result<Message, ReplyError> {
        self.link.request(msg)
    }

    pub fn disconnect(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.link.handle.invoke(|core| core.disconnect());
        if let Some(context) = self.context.take() {
            context.shutdown();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.context.is_some() {
            self.stop();
        }
    }
}
