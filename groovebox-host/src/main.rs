mod config;

use std::fs::File;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use groovebox_audio::project::{self, Project};
use groovebox_audio::{
    EngineThread, MachineSequencer, MidiEvent, OperationQueue, OperationSender, PatchBay, SequencerEngine,
    SequencerHandle, SharedTransport,
};
use groovebox_net::objects::{GlobalControlObject, RIMachine, SampleBankObject};
use groovebox_net::{ContextHandle, Server, ServerCore, ServerOptions};
use groovebox_types::{MachineGraph, MachineKind, SequencerControl, Transport};

use config::{Config, MachineSetup};

const ROW_POLL: Duration = Duration::from_millis(10);
const MIDI_BACKLOG: usize = 64;

fn init_logging(verbose: bool) {
    use simplelog::*;

    let log_level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };

    let log_path = dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("groovebox")
        .join("groovebox.log");

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let log_file = match File::create(&log_path).or_else(|_| File::create("/tmp/groovebox.log")) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("groovebox: cannot create log file: {}", e);
            return;
        }
    };

    if let Err(e) = WriteLogger::init(log_level, Config::default(), log_file) {
        eprintln!("groovebox: logger init failed: {}", e);
        return;
    }

    log::info!("groovebox starting (log level: {:?})", log_level);
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1).cloned())
}

fn other(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

fn main() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_logging(verbose);

    let config_path = arg_value(&args, "--config").map(PathBuf::from);
    let config = Config::load(config_path.as_deref());
    let bind = arg_value(&args, "--bind").unwrap_or_else(|| config.bind());
    let udp = config.udp() && !args.iter().any(|a| a == "--no-udp");
    let project_path = arg_value(&args, "--project").map(PathBuf::from);

    let project = project_path.as_deref().and_then(load_project);
    let mut transport_state = config.transport_state();
    if let Some(project) = &project {
        transport_state = project.transport.clone();
        transport_state.playing = false;
        transport_state.recording = false;
    }

    let (mut engine, transport) =
        SequencerEngine::with_clock(config.transport_limits(), transport_state, config.sample_rate());
    let (ops, queue) = OperationQueue::new();
    let mut restored = match project.as_ref().map(Project::build).transpose() {
        Ok(sequencers) => sequencers.unwrap_or_default(),
        Err(e) => {
            log::warn!("project not restored: {}", e);
            Vec::new()
        }
    };

    let bay = Arc::new(PatchBay::new());
    let mut machines = Vec::new();
    for setup in config.machines() {
        if let Err(e) = bay.add_machine(setup.descriptor.clone()) {
            log::warn!("machine skipped: {}", e);
            continue;
        }
        let control = attach_sequencer(&mut engine, &ops, &setup, &mut restored);
        machines.push((setup, control));
    }
    for orphan in &restored {
        log::warn!("project sequencer {} has no machine, dropped", orphan.name());
    }

    let midi_log = spawn_midi_log()?;
    let engine_thread = EngineThread::spawn(engine, queue, config.buffer_frames(), midi_log.sink())?;

    let server = Server::bind(&ServerOptions { bind, udp })?;
    println!("groovebox listening on {}", server.local_addr());

    let shared: Arc<dyn Transport> = Arc::new(transport.clone());
    let global = server
        .invoke(move |core| GlobalControlObject::create(core, shared))
        .map_err(other)?
        .map_err(other)?;

    for (setup, control) in machines {
        let graph: Arc<dyn MachineGraph> = bay.clone();
        let name = setup.descriptor.name.clone();
        let registered = server.invoke(move |core| RIMachine::register(core, setup.descriptor, graph, control));
        match registered {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("machine {} not registered: {}", name, e),
            Err(e) => return Err(other(e)),
        }
    }
    for bank in config.sample_banks() {
        if let Ok(Err(e)) = server.invoke(move |core| SampleBankObject::create(core, &bank).map(|_| ())) {
            log::warn!("sample bank not created: {}", e);
        }
    }

    let rows = RowStream::spawn(server.handle(), transport.clone(), global)?;

    for line in io::stdin().lock().lines() {
        match line?.trim() {
            "quit" | "exit" => break,
            "save" => match &project_path {
                Some(path) => save_project(path, &ops, &transport),
                None => println!("no project path, start with --project <path>"),
            },
            "status" => println!(
                "{} clients, line {}, {} bpm",
                server.client_count(),
                transport.current_line(),
                transport.state().bpm
            ),
            "" => {}
            unknown => println!("unknown command {:?} (save, status, quit)", unknown),
        }
    }

    if let Some(path) = &project_path {
        save_project(path, &ops, &transport);
    }
    rows.stop();
    server.shutdown();
    engine_thread.stop();
    midi_log.stop();
    log::info!("groovebox stopped");
    Ok(())
}

fn load_project(path: &Path) -> Option<Project> {
    if !path.exists() {
        return None;
    }
    match project::load(path) {
        Ok(project) => Some(project),
        Err(e) => {
            log::warn!("ignoring project {}: {}", path.display(), e);
            None
        }
    }
}

fn save_project(path: &Path, ops: &OperationSender<SequencerEngine>, transport: &SharedTransport) {
    let state = transport.state();
    let captured = ops.run_sync(move |engine| Project::capture(engine, state));
    let result = captured.map_err(other).and_then(|p| project::save(path, &p).map_err(other));
    match result {
        Ok(()) => println!("saved {}", path.display()),
        Err(e) => log::error!("saving {} failed: {}", path.display(), e),
    }
}

/// Sequencer machines get an engine sequencer, restored from the project
/// when one with the same name was saved.
fn attach_sequencer(
    engine: &mut SequencerEngine,
    ops: &OperationSender<SequencerEngine>,
    setup: &MachineSetup,
    restored: &mut Vec<MachineSequencer>,
) -> Option<Arc<dyn SequencerControl>> {
    if setup.descriptor.kind != MachineKind::Sequencer {
        return None;
    }
    let name = &setup.descriptor.name;
    let sequencer = match restored.iter().position(|s| s.name() == name) {
        Some(i) => restored.swap_remove(i),
        None => MachineSequencer::new(name, setup.channel),
    };
    let ring = engine.add_sequencer(sequencer);
    Some(Arc::new(SequencerHandle::new(name, ops.clone(), ring)))
}

/// Pushes the playing line to every client whenever it changes.
struct RowStream {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl RowStream {
    fn spawn(
        server: ContextHandle<ServerCore>,
        transport: SharedTransport,
        global: Arc<GlobalControlObject>,
    ) -> io::Result<RowStream> {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("groovebox-rows".into())
            .spawn(move || stream_rows(server, transport, global, stop_rx))?;
        Ok(RowStream { stop_tx, handle })
    }

    fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

fn stream_rows(
    server: ContextHandle<ServerCore>,
    transport: SharedTransport,
    global: Arc<GlobalControlObject>,
    stop_rx: Receiver<()>,
) {
    let mut last = transport.current_line();
    loop {
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            default(ROW_POLL) => {}
        }
        let row = transport.current_line();
        if row == last {
            continue;
        }
        last = row;
        let global = Arc::clone(&global);
        let posted = server.post_action(
            move |core| {
                if let Err(e) = global.push_row_update(core, row) {
                    log::warn!(target: "net::server", "row update failed: {}", e);
                }
            },
            false,
        );
        if posted.is_err() {
            break;
        }
    }
}

/// Receives engine output off the engine thread; the tick path never logs.
struct MidiLog {
    tx: Sender<Vec<MidiEvent>>,
    handle: JoinHandle<()>,
}

fn spawn_midi_log() -> io::Result<MidiLog> {
    let (tx, rx) = bounded::<Vec<MidiEvent>>(MIDI_BACKLOG);
    let handle = thread::Builder::new().name("groovebox-midi".into()).spawn(move || {
        for events in rx.iter() {
            for event in events {
                log::debug!(target: "audio::midi", "tick {}: {:?}", event.tick, event.message);
            }
        }
    })?;
    Ok(MidiLog { tx, handle })
}

impl MidiLog {
    fn sink(&self) -> groovebox_audio::MidiSink {
        let tx = self.tx.clone();
        Box::new(move |events: &[MidiEvent]| {
            if log::log_enabled!(target: "audio::midi", log::Level::Debug) {
                let _ = tx.try_send(events.to_vec());
            }
        })
    }

    fn stop(self) {
        drop(self.tx);
        let _ = self.handle.join();
    }
}
