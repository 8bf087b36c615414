//! Engine driver: runs every sequencer off the transport clock, one buffer at a time.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};
use parking_lot::Mutex;

use groovebox_types::{
    EngineError, PadEvent, SequencerCommand, SequencerControl, SequencerSnapshot, TransportLimits,
    TransportState,
};

use crate::clock::{SharedTransport, TransportClock};
use crate::midi::{MidiEvent, MidiEventBuilder};
use crate::ops::{OperationQueue, OperationSender};
use crate::pad_ring::PadEventRing;
use crate::sequencer::MachineSequencer;

pub struct SequencerEngine {
    clock: Arc<Mutex<TransportClock>>,
    sequencers: BTreeMap<String, MachineSequencer>,
    output: MidiEventBuilder,
    was_playing: bool,
}

impl SequencerEngine {
    /// Engine driven by the clock behind `transport`.
    pub fn new(transport: &SharedTransport) -> Self {
        Self {
            clock: transport.clock().clone(),
            sequencers: BTreeMap::new(),
            output: MidiEventBuilder::default(),
            was_playing: false,
        }
    }

    /// Engine with its own clock, returned together with the transport driving it.
    pub fn with_clock(limits: TransportLimits, state: TransportState, sample_rate: u32) -> (Self, SharedTransport) {
        let transport = SharedTransport::new(TransportClock::new(limits, state, sample_rate));
        (Self::new(&transport), transport)
    }

    pub fn sample_rate(&self) -> u32 {
        self.clock.lock().sample_rate()
    }

    /// Add a sequencer, replacing any with the same name. Returns its pad ring.
    pub fn add_sequencer(&mut self, sequencer: MachineSequencer) -> PadEventRing {
        let ring = sequencer.pad_ring();
        self.sequencers.insert(sequencer.name().to_string(), sequencer);
        ring
    }

    pub fn remove_sequencer(&mut self, name: &str) -> Option<MachineSequencer> {
        let mut sequencer = self.sequencers.remove(name)?;
        sequencer.stop(&mut self.output);
        Some(sequencer)
    }

    pub fn sequencer(&self, name: &str) -> Option<&MachineSequencer> {
        self.sequencers.get(name)
    }

    pub fn sequencer_mut(&mut self, name: &str) -> Option<&mut MachineSequencer> {
        self.sequencers.get_mut(name)
    }

    pub fn sequencers(&self) -> impl Iterator<Item = &MachineSequencer> {
        self.sequencers.values()
    }

    /// Run the sequencers for `frames` frames and return the events produced.
    pub fn process_buffer(&mut self, frames: u32) -> &[MidiEvent] {
        self.output.begin();
        let mut clock = self.clock.lock();
        let playing = clock.state().playing;
        let sequencers = &mut self.sequencers;
        let out = &mut self.output;

        if self.was_playing && !playing {
            for s in sequencers.values_mut() {
                s.stop(out);
            }
        }
        self.was_playing = playing;

        if !playing {
            let position = clock.position();
            for s in sequencers.values_mut() {
                s.idle(position, out);
            }
        } else {
            let mut index = 0;
            clock.process(frames, |position, _offset| {
                out.set_tick(index);
                for s in sequencers.values_mut() {
                    s.tick(position, out);
                }
                index += 1;
            });
        }
        self.output.events()
    }

    pub fn events(&self) -> &[MidiEvent] {
        self.output.events()
    }

    /// Events lost to a full output buffer during the last cycle.
    pub fn dropped_events(&self) -> usize {
        self.output.dropped()
    }
}

/// Called with each non-empty buffer of events.
pub type MidiSink = Box<dyn FnMut(&[MidiEvent]) + Send>;

/// Runs a `SequencerEngine` on its own thread at the buffer cadence.
pub struct EngineThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl EngineThread {
    pub fn spawn(
        engine: SequencerEngine,
        queue: OperationQueue<SequencerEngine>,
        buffer_frames: u32,
        sink: MidiSink,
    ) -> io::Result<EngineThread> {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("groovebox-engine".into())
            .spawn(move || run(engine, queue, stop_rx, buffer_frames.max(1), sink))?;
        Ok(EngineThread {
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target: "audio::engine", "engine thread panicked");
            }
        }
    }
}

impl Drop for EngineThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut engine: SequencerEngine,
    queue: OperationQueue<SequencerEngine>,
    stop_rx: Receiver<()>,
    buffer_frames: u32,
    mut sink: MidiSink,
) {
    let period = Duration::from_secs_f64(buffer_frames as f64 / engine.sample_rate() as f64);
    info!(
        target: "audio::engine",
        "engine started: {} frames per buffer, {:?} period",
        buffer_frames, period
    );
    let mut next = Instant::now();
    loop {
        let remaining = next.saturating_duration_since(Instant::now());
        crossbeam_channel::select! {
            recv(stop_rx) -> _ => break,
            default(remaining) => {}
        }
        if queue.drain(&mut engine).is_none() {
            warn!(target: "audio::engine", "operation queue closed");
            break;
        }
        let events = engine.process_buffer(buffer_frames);
        if !events.is_empty() {
            sink(events);
        }
        next += period;
        // Fell far behind (suspended, debugger): resync instead of bursting.
        if Instant::now().saturating_duration_since(next) > period * 8 {
            next = Instant::now();
        }
    }
    info!(target: "audio::engine", "engine stopped");
}

/// Server-facing control of one sequencer inside a running engine.
#[derive(Clone)]
pub struct SequencerHandle {
    name: String,
    ops: OperationSender<SequencerEngine>,
    pad: PadEventRing,
}

impl SequencerHandle {
    pub fn new(name: &str, ops: OperationSender<SequencerEngine>, pad: PadEventRing) -> Self {
        Self {
            name: name.to_string(),
            ops,
            pad,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl SequencerControl for SequencerHandle {
    fn pad_event(&self, event: PadEvent) -> Result<(), EngineError> {
        self.pad.push(event)
    }

    fn execute(&self, command: SequencerCommand) -> Result<SequencerCommand, EngineError> {
        let name = self.name.clone();
        self.ops.run_sync(move |engine| {
            engine
                .sequencer_mut(&name)
                .ok_or(EngineError::ParameterOutOfSpec("sequencer"))?
                .execute(command)
        })?
    }

    fn snapshot(&self) -> Result<SequencerSnapshot, EngineError> {
        let name = self.name.clone();
        self.ops.run_sync(move |engine| {
            engine
                .sequencer(&name)
                .map(MachineSequencer::snapshot)
                .ok_or(EngineError::ParameterOutOfSpec("sequencer"))
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::MidiMessage;
    use groovebox_types::{LoopId, NoteEntry, PadEventKind, Transport};

    fn engine() -> (SequencerEngine, SharedTransport) {
        // 120 bpm, 4 lpb at 48 kHz: 375 frames per tick.
        SequencerEngine::with_clock(TransportLimits::default(), TransportState::default(), 48_000)
    }

    fn note_ons(events: &[MidiEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e.message, MidiMessage::NoteOn { .. }))
            .count()
    }

    #[test]
    fn buffers_tick_the_sequencers() {
        let (mut engine, transport) = engine();
        let mut seq = MachineSequencer::new("Seq", 0);
        seq.execute(SequencerCommand::CreateLoop { loop_id: None }).unwrap();
        seq.execute(SequencerCommand::InsertNote { loop_id: LoopId::new(0), note: NoteEntry::new(60, 100, 1, 2) })
            .unwrap();
        seq.execute(SequencerCommand::SetLoopAt { position: 0, loop_id: Some(LoopId::new(0)) }).unwrap();
        engine.add_sequencer(seq);

        assert!(engine.process_buffer(375 * 4).is_empty());
        transport.set_playing(true).unwrap();
        let events = engine.process_buffer(375 * 4).to_vec();
        assert_eq!(note_ons(&events), 1);
        assert_eq!(events[0].tick, 1);

        transport.set_playing(false).unwrap();
        let events = engine.process_buffer(375).to_vec();
        assert!(events.is_empty() || events.iter().all(|e| matches!(e.message, MidiMessage::NoteOff { .. })));
    }

    #[test]
    fn stopping_releases_sounding_notes() {
        let (mut engine, transport) = engine();
        let mut seq = MachineSequencer::new("Seq", 0);
        seq.execute(SequencerCommand::CreateLoop { loop_id: None }).unwrap();
        seq.execute(SequencerCommand::InsertNote { loop_id: LoopId::new(0), note: NoteEntry::new(60, 100, 0, 64) })
            .unwrap();
        seq.execute(SequencerCommand::SetLoopAt { position: 0, loop_id: Some(LoopId::new(0)) }).unwrap();
        engine.add_sequencer(seq);
        transport.set_playing(true).unwrap();
        assert_eq!(note_ons(engine.process_buffer(375)), 1);
        transport.set_playing(false).unwrap();
        assert_eq!(
            engine.process_buffer(375).iter().map(|e| e.message).collect::<Vec<_>>(),
            vec![MidiMessage::NoteOff { channel: 0, note: 60 }]
        );
    }

    #[test]
    fn live_pad_plays_while_stopped() {
        let (mut engine, _transport) = engine();
        let ring = engine.add_sequencer(MachineSequencer::new("Seq", 0));
        ring.push(PadEvent { finger: 0, kind: PadEventKind::Press, x: 0, y: 0, z: 0x3fff }).unwrap();
        assert_eq!(note_ons(engine.process_buffer(64)), 1);
    }

    #[test]
    fn handle_executes_on_the_engine_thread() {
        let (engine, _transport) = engine();
        let (ops, queue) = OperationQueue::new();
        let mut engine = engine;
        let ring = engine.add_sequencer(MachineSequencer::new("Seq", 0));
        let handle = SequencerHandle::new("Seq", ops.clone(), ring);
        let missing = SequencerHandle::new("Nope", ops, PadEventRing::default());
        let thread = EngineThread::spawn(engine, queue, 64, Box::new(|_| {})).unwrap();

        assert_eq!(
            handle.execute(SequencerCommand::CreateLoop { loop_id: None }),
            Ok(SequencerCommand::CreateLoop { loop_id: Some(LoopId::new(0)) })
        );
        assert_eq!(
            handle.execute(SequencerCommand::DeleteLoop { loop_id: LoopId::new(3) }),
            Err(EngineError::NoSuchLoop(3))
        );
        assert_eq!(handle.snapshot().unwrap().loops.len(), 1);
        assert!(missing.snapshot().is_err());
        assert_eq!(
            missing.execute(SequencerCommand::ClearPad),
            Err(EngineError::ParameterOutOfSpec("sequencer"))
        );
        handle
            .pad_event(PadEvent { finger: 0, kind: PadEventKind::Press, x: 0, y: 0, z: 1 })
            .unwrap();
        thread.stop();
        assert_eq!(
            handle.execute(SequencerCommand::ClearPad),
            Err(EngineError::EngineStopped)
        );
    }
}
