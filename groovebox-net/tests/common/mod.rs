#![allow(dead_code)]
//! Test harness utilities for groovebox-net integration tests.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use groovebox_net::framing::{exchange_introduction, read_message, write_message};
use groovebox_net::objects::{
    GlobalControlListener, GlobalControlObject, GlobalControlReplica, MachineReplica,
    MachineStateListener, RIMachine,
};
use groovebox_net::{default_registry, Client, Message, Server, ServerOptions};
use groovebox_types::{
    Connection, EngineError, KnobDescriptor, KnobValue, LoopId, MachineDescriptor, MachineGraph,
    MachineKind, PadEvent, SequencerCommand, SequencerControl, SequencerSnapshot, Transport,
    TransportLimits, TransportState,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll `pred` until it holds or the timeout elapses.
pub fn wait_until<F: FnMut() -> bool>(mut pred: F) -> bool {
    let start = Instant::now();
    while start.elapsed() < TIMEOUT {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    pred()
}

pub fn wait_for<F: FnMut() -> bool>(what: &str, pred: F) {
    assert!(wait_until(pred), "timed out waiting for {}", what);
}

// ---- collaborators ----

pub struct FakeTransport {
    pub limits: TransportLimits,
    pub state: Mutex<TransportState>,
    pub line: Mutex<u32>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            limits: TransportLimits::default(),
            state: Mutex::new(TransportState::default()),
            line: Mutex::new(0),
        })
    }
}

impl Transport for FakeTransport {
    fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    fn current_line(&self) -> u32 {
        *self.line.lock()
    }

    fn set_bpm(&self, bpm: u32) -> Result<u32, String> {
        let bpm = self.limits.clamp_bpm(bpm);
        self.state.lock().bpm = bpm;
        Ok(bpm)
    }

    fn set_lpb(&self, lpb: u32) -> Result<u32, String> {
        let lpb = self.limits.clamp_lpb(lpb);
        self.state.lock().lpb = lpb;
        Ok(lpb)
    }

    fn set_shuffle(&self, shuffle: u32) -> Result<u32, String> {
        let shuffle = self.limits.clamp_shuffle(shuffle);
        self.state.lock().shuffle = shuffle;
        Ok(shuffle)
    }

    fn set_loop_enabled(&self, enabled: bool) -> Result<bool, String> {
        self.state.lock().loop_enabled = enabled;
        Ok(enabled)
    }

    fn set_loop_start(&self, line: u32) -> Result<u32, String> {
        self.state.lock().loop_start = line;
        Ok(line)
    }

    fn set_loop_length(&self, lines: u32) -> Result<u32, String> {
        if lines == 0 {
            return Err("loop length must be positive".into());
        }
        self.state.lock().loop_length = lines;
        Ok(lines)
    }

    fn set_playing(&self, playing: bool) -> Result<bool, String> {
        self.state.lock().playing = playing;
        Ok(playing)
    }

    fn set_recording(&self, recording: bool) -> Result<bool, String> {
        self.state.lock().recording = recording;
        Ok(recording)
    }

    fn jump(&self, line: u32) -> Result<u32, String> {
        *self.line.lock() = line;
        Ok(line)
    }
}

#[derive(Default)]
pub struct FakeGraph {
    pub connections: Mutex<Vec<Connection>>,
    pub controllers: Mutex<Vec<(String, String, KnobValue)>>,
}

impl MachineGraph for FakeGraph {
    fn connect(&self, connection: &Connection) -> Result<(), String> {
        if connection.source == "Broken" {
            return Err("graph refused".into());
        }
        self.connections.lock().push(connection.clone());
        Ok(())
    }

    fn disconnect(&self, connection: &Connection) -> Result<(), String> {
        self.connections.lock().retain(|c| c != connection);
        Ok(())
    }

    fn set_controller(
        &self,
        machine: &str,
        controller: &str,
        value: &KnobValue,
    ) -> Result<KnobValue, String> {
        self.controllers
            .lock()
            .push((machine.to_string(), controller.to_string(), value.clone()));
        Ok(value.clone())
    }
}

#[derive(Default)]
pub struct FakeSequencer {
    pub snapshot: Mutex<SequencerSnapshot>,
    pub pad_events: Mutex<Vec<PadEvent>>,
}

impl SequencerControl for FakeSequencer {
    fn pad_event(&self, event: PadEvent) -> Result<(), EngineError> {
        self.pad_events.lock().push(event);
        Ok(())
    }

    fn execute(&self, command: SequencerCommand) -> Result<SequencerCommand, EngineError> {
        let mut snapshot = self.snapshot.lock();
        let confirmed = match command {
            SequencerCommand::CreateLoop { .. } => SequencerCommand::CreateLoop {
                loop_id: Some(LoopId::new(snapshot.loops.len() as u32)),
            },
            other => other,
        };
        snapshot.apply(&confirmed)?;
        Ok(confirmed)
    }
}

// ---- fixtures ----

pub struct Fixture {
    pub server: Server,
    pub transport: Arc<FakeTransport>,
    pub graph: Arc<FakeGraph>,
    pub sequencer: Arc<FakeSequencer>,
}

impl Fixture {
    /// Server with a global control object, "Kick" -> "Sink" capable
    /// machines, a knob on "Kick" and a sequencer "Seq".
    pub fn start(udp: bool) -> Fixture {
        let server = Server::bind(&ServerOptions {
            bind: "127.0.0.1:0".into(),
            udp,
        })
        .expect("bind");
        let transport = FakeTransport::new();
        let graph = Arc::new(FakeGraph::default());
        let sequencer = Arc::new(FakeSequencer::default());

        let (t, g, s) = (transport.clone(), graph.clone(), sequencer.clone());
        server
            .invoke(move |core| {
                GlobalControlObject::create(core, t).unwrap();
                let kick = MachineDescriptor::new("Kick", MachineKind::Dynamic)
                    .with_outputs(&["Stereo"])
                    .with_knob(volume_knob());
                RIMachine::register(core, kick, g.clone(), None).unwrap();
                let sink = MachineDescriptor::new("Sink", MachineKind::Sink).with_inputs(&["Stereo"]);
                RIMachine::register(core, sink, g.clone(), None).unwrap();
                let seq = MachineDescriptor::new("Seq", MachineKind::Sequencer).with_outputs(&["Midi"]);
                RIMachine::register(core, seq, g, Some(s)).unwrap();
            })
            .unwrap();

        Fixture {
            server,
            transport,
            graph,
            sequencer,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Connect a client and wait until it has caught up with every object.
    pub fn client(&self) -> Client {
        let client = Client::connect(self.addr(), default_registry(), None).expect("connect");
        let expected = self.server.invoke(|core| core.object_count()).unwrap();
        wait_for("catch-up", || client.invoke(|c| c.object_count()).unwrap() == expected);
        client
    }
}

pub fn volume_knob() -> KnobDescriptor {
    KnobDescriptor {
        name: "volume".into(),
        title: "Volume".into(),
        group: "Amp".into(),
        min: 0.0,
        max: 1.0,
        step: 0.0,
        value: KnobValue::Float(0.5),
        enum_names: vec![],
        midi: None,
    }
}

pub fn global_control(client: &Client) -> Arc<GlobalControlReplica> {
    client
        .objects_of::<GlobalControlReplica>()
        .into_iter()
        .next()
        .expect("global control replica")
}

pub fn machine(client: &Client, name: &str) -> Arc<MachineReplica> {
    client
        .objects_of::<MachineReplica>()
        .into_iter()
        .find(|m| m.name() == name)
        .unwrap_or_else(|| panic!("no machine {}", name))
}

// ---- listeners ----

#[derive(Default)]
pub struct BpmRecorder {
    pub seen: Mutex<Vec<u32>>,
    pub rows: Mutex<Vec<u32>>,
}

impl GlobalControlListener for BpmRecorder {
    fn bpm_changed(&self, bpm: u32) {
        self.seen.lock().push(bpm);
    }

    fn row_update(&self, row: u32) {
        self.rows.lock().push(row);
    }
}

#[derive(Default)]
pub struct TopologyRecorder {
    pub attached: Mutex<Vec<(String, String, String)>>,
    pub detached: Mutex<Vec<(String, String, String)>>,
    pub moves: AtomicUsize,
    pub knobs: Mutex<Vec<(u32, KnobValue)>>,
}

impl TopologyRecorder {
    pub fn move_count(&self) -> usize {
        self.moves.load(Ordering::SeqCst)
    }
}

impl MachineStateListener for TopologyRecorder {
    fn on_move(&self, _x: f32, _y: f32) {
        self.moves.fetch_add(1, Ordering::SeqCst);
    }

    fn on_attach(&self, source: &str, output: &str, input: &str) {
        self.attached
            .lock()
            .push((source.into(), output.into(), input.into()));
    }

    fn on_detach(&self, source: &str, output: &str, input: &str) {
        self.detached
            .lock()
            .push((source.into(), output.into(), input.into()));
    }

    fn on_knob_changed(&self, knob: u32, value: &KnobValue) {
        self.knobs.lock().push((knob, value.clone()));
    }
}

// ---- raw wire client ----

/// Speaks the wire protocol directly, for handshake and error-path tests.
pub struct RawClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(TIMEOUT))?;
        exchange_introduction(&mut stream)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    pub fn send(&mut self, msg: &Message) -> std::io::Result<()> {
        write_message(&mut self.stream, msg)
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(bytes)
    }

    pub fn recv(&mut self) -> std::io::Result<Message> {
        read_message(&mut self.reader)
    }

    /// Read until a message matching `pred` arrives.
    pub fn recv_until<F: Fn(&Message) -> bool>(&mut self, pred: F) -> std::io::Result<Message> {
        loop {
            let msg = self.recv()?;
            if pred(&msg) {
                return Ok(msg);
            }
        }
    }
}
