//! Per-connection message handler.
//!
//! Each connection gets a reader thread and a writer thread. Outgoing frames
//! go through a FIFO so concurrent senders never interleave on the socket.
//! Any I/O or decode failure fires the drop callback exactly once, after
//! which the handler ignores further sends.

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::framing::{encode_datagram, read_message_into, write_frame};
use crate::message::Message;
use crate::protocol::ClientId;

enum Outgoing {
    Frame(Arc<Vec<u8>>),
    Close,
}

type DropCallback = Box<dyn FnOnce() + Send>;

/// Fires its callback once, on the first failure from either direction.
struct DropSignal {
    dropped: AtomicBool,
    stream: TcpStream,
    callback: Mutex<Option<DropCallback>>,
}

impl DropSignal {
    fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }

    fn fire(&self) {
        if self.dropped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(callback) = self.callback.lock().take() {
            callback();
        }
    }
}

/// Unreliable side channel for high-frequency events.
pub struct UdpLink {
    pub socket: Arc<UdpSocket>,
    pub target: SocketAddr,
    pub client: ClientId,
}

pub struct MessageHandler {
    peer: SocketAddr,
    outgoing: Sender<Outgoing>,
    signal: Arc<DropSignal>,
    reader: Mutex<Option<TcpStream>>,
    udp: Mutex<Option<UdpLink>>,
}

impl MessageHandler {
    /// Wrap a connected stream. The writer starts immediately; reading
    /// starts with `start_receive`.
    pub fn new<F>(stream: TcpStream, on_dropped: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(None)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;

        let signal = Arc::new(DropSignal {
            dropped: AtomicBool::new(false),
            stream,
            callback: Mutex::new(Some(Box::new(on_dropped))),
        });

        let (tx, rx) = unbounded();
        let writer_signal = Arc::clone(&signal);
        thread::Builder::new()
            .name(format!("net-writer-{}", peer))
            .spawn(move || writer_thread(writer, rx, writer_signal))?;

        Ok(Self {
            peer,
            outgoing: tx,
            signal,
            reader: Mutex::new(Some(reader)),
            udp: Mutex::new(None),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_dropped(&self) -> bool {
        self.signal.is_dropped()
    }

    /// Begin the read loop. Only the first call has an effect.
    pub fn start_receive<F>(&self, on_message: F) -> io::Result<()>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let Some(stream) = self.reader.lock().take() else {
            return Ok(());
        };
        let signal = Arc::clone(&self.signal);
        let peer = self.peer;
        thread::Builder::new()
            .name(format!("net-reader-{}", peer))
            .spawn(move || reader_thread(stream, peer, on_message, signal))?;
        Ok(())
    }

    /// Attach the datagram side channel.
    pub fn set_udp_link(&self, link: UdpLink) {
        *self.udp.lock() = Some(link);
    }

    pub fn has_udp_link(&self) -> bool {
        self.udp.lock().is_some()
    }

    /// Send a message. With `via_udp`, a message that fits in one datagram
    /// goes over the side channel; everything else takes the stream.
    pub fn deliver_message(&self, msg: &Message, via_udp: bool) {
        if via_udp && self.try_datagram(msg) {
            return;
        }
        self.deliver_frame(Arc::new(msg.encode()));
    }

    /// Queue an already encoded frame on the stream.
    pub fn deliver_frame(&self, frame: Arc<Vec<u8>>) {
        if self.signal.is_dropped() {
            return;
        }
        if self.outgoing.send(Outgoing::Frame(frame)).is_err() {
            self.signal.fire();
        }
    }

    /// Flush queued frames, then drop the connection.
    pub fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }

    fn try_datagram(&self, msg: &Message) -> bool {
        let udp = self.udp.lock();
        let Some(link) = udp.as_ref() else {
            return false;
        };
        let Some(datagram) = encode_datagram(link.client, msg) else {
            return false;
        };
        match link.socket.send_to(&datagram, link.target) {
            Ok(_) => true,
            Err(e) => {
                debug!(target: "net::handler", "datagram to {} failed: {}", link.target, e);
                false
            }
        }
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_thread<F>(stream: TcpStream, peer: SocketAddr, mut on_message: F, signal: Arc<DropSignal>)
where
    F: FnMut(Message),
{
    let mut reader = BufReader::new(stream);
    loop {
        let mut msg = Message::new();
        match read_message_into(&mut reader, &mut msg) {
            Ok(()) => on_message(msg),
            Err(e) => {
                if !signal.is_dropped() && e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!(target: "net::handler", "read from {} failed: {}", peer, e);
                }
                break;
            }
        }
    }
    info!(target: "net::handler", "connection to {} closed", peer);
    signal.fire();
}

fn writer_thread(stream: TcpStream, rx: Receiver<Outgoing>, signal: Arc<DropSignal>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(out) = rx.recv() {
        match out {
            Outgoing::Frame(frame) => {
                if let Err(e) = write_frame(&mut writer, &frame) {
                    if !signal.is_dropped() {
                        warn!(target: "net::handler", "write failed: {}", e);
                    }
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    signal.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Duration;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn messages_flow_both_ways() {
        let (a, b) = pair();
        let (drop_tx, _drop_rx) = unbounded::<()>();
        let left = MessageHandler::new(a, move || drop(drop_tx)).unwrap();
        let right = MessageHandler::new(b, || {}).unwrap();

        let (tx, rx) = unbounded();
        right.start_receive(move |m| tx.send(m).unwrap()).unwrap();

        for i in 0..10 {
            let mut msg = Message::new();
            msg.set("seq", i).unwrap();
            left.deliver_message(&msg, false);
        }
        for i in 0..10 {
            let msg = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(msg.get::<i32>("seq").unwrap(), i);
        }
    }

    #[test]
    fn drop_callback_fires_once() {
        let (a, b) = pair();
        let (tx, rx) = unbounded();
        let handler = MessageHandler::new(a, move || tx.send(()).unwrap()).unwrap();
        handler.start_receive(|_| {}).unwrap();
        drop(b);

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(handler.is_dropped());
        handler.deliver_message(&Message::new(), false);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn garbage_drops_the_connection() {
        use std::io::Write;
        let (a, mut b) = pair();
        let (tx, rx) = unbounded();
        let handler = MessageHandler::new(a, move || tx.send(()).unwrap()).unwrap();
        handler.start_receive(|_| panic!("no message expected")).unwrap();
        b.write_all(b"0000000anot;valid;").unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn udp_falls_back_to_stream_without_link() {
        let (a, b) = pair();
        let left = MessageHandler::new(a, || {}).unwrap();
        let right = MessageHandler::new(b, || {}).unwrap();
        let (tx, rx) = unbounded();
        right.start_receive(move |m| tx.send(m).unwrap()).unwrap();

        let mut msg = Message::new();
        msg.set("x", 5).unwrap();
        left.deliver_message(&msg, true);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), msg);
    }
}
