//! Transport and tempo state shared by every client.

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use groovebox_types::{ObjId, Transport, TransportState};

use crate::client::{ClientCore, ServerLink};
use crate::command::{unknown_verb, Command, CommandPayload};
use crate::error::{HandlerError, MessageError, ReplyError};
use crate::message::Message;
use crate::object::{ClientObject, ObjectBase, ServerObject};
use crate::protocol::ClientId;
use crate::server::ServerCore;

use super::GLOBAL_CONTROL;

const KEY_BPM: &str = "bpm";
const KEY_LPB: &str = "lpb";
const KEY_SHUFFLE: &str = "shuffle";
const KEY_LOOP_STATE: &str = "loop_state";
const KEY_LOOP_START: &str = "loop_start";
const KEY_LOOP_LENGTH: &str = "loop_length";
const KEY_PLAYING: &str = "playing";
const KEY_RECORD: &str = "record";
const KEY_LINE: &str = "line";
const KEY_ROW: &str = "row";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    SetBpm(u32),
    SetLpb(u32),
    SetShuffle(u32),
    SetLoopState(bool),
    SetLoopStart(u32),
    SetLoopLength(u32),
    SetPlaying(bool),
    SetRecord(bool),
    Jump(u32),
    /// Playhead position. Server to client only.
    RowUpdate(u32),
}

impl CommandPayload for TransportCommand {
    fn verb(&self) -> &'static str {
        match self {
            TransportCommand::SetBpm(_) => "set_bpm",
            TransportCommand::SetLpb(_) => "set_lpb",
            TransportCommand::SetShuffle(_) => "set_shuffle",
            TransportCommand::SetLoopState(_) => "set_loop_state",
            TransportCommand::SetLoopStart(_) => "set_loop_start",
            TransportCommand::SetLoopLength(_) => "set_loop_length",
            TransportCommand::SetPlaying(_) => "set_playing",
            TransportCommand::SetRecord(_) => "set_record",
            TransportCommand::Jump(_) => "jump",
            TransportCommand::RowUpdate(_) => "row_update",
        }
    }

    fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError> {
        match *self {
            TransportCommand::SetBpm(v) => msg.set(KEY_BPM, v),
            TransportCommand::SetLpb(v) => msg.set(KEY_LPB, v),
            TransportCommand::SetShuffle(v) => msg.set(KEY_SHUFFLE, v),
            TransportCommand::SetLoopState(v) => msg.set(KEY_LOOP_STATE, v),
            TransportCommand::SetLoopStart(v) => msg.set(KEY_LOOP_START, v),
            TransportCommand::SetLoopLength(v) => msg.set(KEY_LOOP_LENGTH, v),
            TransportCommand::SetPlaying(v) => msg.set(KEY_PLAYING, v),
            TransportCommand::SetRecord(v) => msg.set(KEY_RECORD, v),
            TransportCommand::Jump(v) => msg.set(KEY_LINE, v),
            TransportCommand::RowUpdate(v) => msg.set(KEY_ROW, v),
        }
    }

    fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError> {
        Ok(match verb {
            "set_bpm" => TransportCommand::SetBpm(msg.get(KEY_BPM)?),
            "set_lpb" => TransportCommand::SetLpb(msg.get(KEY_LPB)?),
            "set_shuffle" => TransportCommand::SetShuffle(msg.get(KEY_SHUFFLE)?),
            "set_loop_state" => TransportCommand::SetLoopState(msg.get(KEY_LOOP_STATE)?),
            "set_loop_start" => TransportCommand::SetLoopStart(msg.get(KEY_LOOP_START)?),
            "set_loop_length" => TransportCommand::SetLoopLength(msg.get(KEY_LOOP_LENGTH)?),
            "set_playing" => TransportCommand::SetPlaying(msg.get(KEY_PLAYING)?),
            "set_record" => TransportCommand::SetRecord(msg.get(KEY_RECORD)?),
            "jump" => TransportCommand::Jump(msg.get(KEY_LINE)?),
            "row_update" => TransportCommand::RowUpdate(msg.get(KEY_ROW)?),
            _ => return Err(unknown_verb()),
        })
    }
}

fn write_state(state: &TransportState, row: u32, msg: &mut Message) -> Result<(), MessageError> {
    msg.set(KEY_BPM, state.bpm)?;
    msg.set(KEY_LPB, state.lpb)?;
    msg.set(KEY_SHUFFLE, state.shuffle)?;
    msg.set(KEY_LOOP_STATE, state.loop_enabled)?;
    msg.set(KEY_LOOP_START, state.loop_start)?;
    msg.set(KEY_LOOP_LENGTH, state.loop_length)?;
    msg.set(KEY_PLAYING, state.playing)?;
    msg.set(KEY_RECORD, state.recording)?;
    msg.set(KEY_ROW, row)
}

fn read_state(msg: &Message) -> Result<(TransportState, u32), MessageError> {
    let state = TransportState {
        playing: msg.get(KEY_PLAYING)?,
        recording: msg.get(KEY_RECORD)?,
        loop_enabled: msg.get(KEY_LOOP_STATE)?,
        loop_start: msg.get(KEY_LOOP_START)?,
        loop_length: msg.get(KEY_LOOP_LENGTH)?,
        bpm: msg.get(KEY_BPM)?,
        lpb: msg.get(KEY_LPB)?,
        shuffle: msg.get(KEY_SHUFFLE)?,
    };
    Ok((state, msg.get(KEY_ROW)?))
}

/// Apply a confirmed command to a cached state.
fn apply(state: &mut TransportState, row: &mut u32, command: TransportCommand) {
    match command {
        TransportCommand::SetBpm(v) => state.bpm = v,
        TransportCommand::SetLpb(v) => state.lpb = v,
        TransportCommand::SetShuffle(v) => state.shuffle = v,
        TransportCommand::SetLoopState(v) => state.loop_enabled = v,
        TransportCommand::SetLoopStart(v) => state.loop_start = v,
        TransportCommand::SetLoopLength(v) => state.loop_length = v,
        TransportCommand::SetPlaying(v) => state.playing = v,
        TransportCommand::SetRecord(v) => state.recording = v,
        TransportCommand::Jump(line) | TransportCommand::RowUpdate(line) => *row = line,
    }
}

struct Cached {
    state: TransportState,
    row: u32,
}

/// Server-side singleton. Requests go to the transport; only the value the
/// transport reports back is broadcast.
pub struct GlobalControlObject {
    base: ObjectBase,
    transport: Arc<dyn Transport>,
    cached: Mutex<Cached>,
}

impl GlobalControlObject {
    pub fn create(
        server: &mut ServerCore,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<GlobalControlObject>, HandlerError> {
        let state = transport.state();
        let row = transport.current_line();
        server.create_object(|base| GlobalControlObject {
            base,
            transport,
            cached: Mutex::new(Cached { state, row }),
        })
    }

    pub fn state(&self) -> TransportState {
        self.cached.lock().state.clone()
    }

    pub fn row(&self) -> u32 {
        self.cached.lock().row
    }

    /// Run a transport change and broadcast the confirmed value.
    pub fn execute(
        &self,
        server: &mut ServerCore,
        command: TransportCommand,
    ) -> Result<TransportCommand, HandlerError> {
        let t = &self.transport;
        let confirmed = match command {
            TransportCommand::SetBpm(v) => t.set_bpm(v).map(TransportCommand::SetBpm),
            TransportCommand::SetLpb(v) => t.set_lpb(v).map(TransportCommand::SetLpb),
            TransportCommand::SetShuffle(v) => t.set_shuffle(v).map(TransportCommand::SetShuffle),
            TransportCommand::SetLoopState(v) => {
                t.set_loop_enabled(v).map(TransportCommand::SetLoopState)
            }
            TransportCommand::SetLoopStart(v) => {
                t.set_loop_start(v).map(TransportCommand::SetLoopStart)
            }
            TransportCommand::SetLoopLength(v) => {
                t.set_loop_length(v).map(TransportCommand::SetLoopLength)
            }
            TransportCommand::SetPlaying(v) => t.set_playing(v).map(TransportCommand::SetPlaying),
            TransportCommand::SetRecord(v) => t.set_recording(v).map(TransportCommand::SetRecord),
            TransportCommand::Jump(v) => t.jump(v).map(TransportCommand::Jump),
            TransportCommand::RowUpdate(_) => {
                return Err(HandlerError::failure("row updates are server generated"))
            }
        }
        .map_err(HandlerError::Failure)?;

        {
            let mut cached = self.cached.lock();
            let Cached { state, row } = &mut *cached;
            apply(state, row, confirmed);
        }
        server.distribute_command(self.base.id(), confirmed)?;
        Ok(confirmed)
    }

    /// Stream the playhead. Only changes are sent.
    pub fn push_row_update(&self, server: &mut ServerCore, row: u32) -> Result<(), HandlerError> {
        {
            let mut cached = self.cached.lock();
            if cached.row == row {
                return Ok(());
            }
            cached.row = row;
        }
        server.distribute_command(self.base.id(), TransportCommand::RowUpdate(row))?;
        Ok(())
    }
}

impl ServerObject for GlobalControlObject {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        GLOBAL_CONTROL
    }

    fn serialize(&self, msg: &mut Message) -> Result<(), MessageError> {
        let cached = self.cached.lock();
        write_state(&cached.state, cached.row, msg)
    }

    fn process_message(
        &self,
        server: &mut ServerCore,
        client: ClientId,
        msg: &Message,
    ) -> Result<(), HandlerError> {
        match Command::<TransportCommand>::read(msg)? {
            Command::Request(command) => {
                self.execute(server, command)?;
                server.acknowledge(client, msg, |_| Ok(()))?;
                Ok(())
            }
            Command::Confirm(_) => Err(unknown_verb().into()),
        }
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Receives confirmed transport changes on a client.
pub trait GlobalControlListener: Send + Sync {
    fn bpm_changed(&self, _bpm: u32) {}
    fn lpb_changed(&self, _lpb: u32) {}
    fn shuffle_changed(&self, _shuffle: u32) {}
    fn loop_state_changed(&self, _enabled: bool) {}
    fn loop_start_changed(&self, _line: u32) {}
    fn loop_length_changed(&self, _lines: u32) {}
    fn playing_changed(&self, _playing: bool) {}
    fn record_changed(&self, _recording: bool) {}
    fn row_update(&self, _row: u32) {}
}

/// Client copy of the transport state.
pub struct GlobalControlReplica {
    base: ObjectBase,
    link: ServerLink,
    cached: Mutex<Cached>,
    listeners: Mutex<Vec<Arc<dyn GlobalControlListener>>>,
}

impl GlobalControlReplica {
    pub fn create(
        id: ObjId,
        msg: &Message,
        link: ServerLink,
    ) -> Result<Arc<dyn ClientObject>, HandlerError> {
        let (state, row) = read_state(msg)?;
        Ok(Arc::new(GlobalControlReplica {
            base: ObjectBase::new(id),
            link,
            cached: Mutex::new(Cached { state, row }),
            listeners: Mutex::new(Vec::new()),
        }))
    }

    pub fn add_listener(&self, listener: Arc<dyn GlobalControlListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn state(&self) -> TransportState {
        self.cached.lock().state.clone()
    }

    pub fn get_bpm(&self) -> u32 {
        self.cached.lock().state.bpm
    }

    pub fn get_lpb(&self) -> u32 {
        self.cached.lock().state.lpb
    }

    pub fn get_shuffle(&self) -> u32 {
        self.cached.lock().state.shuffle
    }

    pub fn is_playing(&self) -> bool {
        self.cached.lock().state.playing
    }

    pub fn is_recording(&self) -> bool {
        self.cached.lock().state.recording
    }

    pub fn is_looping(&self) -> bool {
        self.cached.lock().state.loop_enabled
    }

    pub fn get_loop_start(&self) -> u32 {
        self.cached.lock().state.loop_start
    }

    pub fn get_loop_length(&self) -> u32 {
        self.cached.lock().state.loop_length
    }

    pub fn row(&self) -> u32 {
        self.cached.lock().row
    }

    fn request(&self, command: TransportCommand) -> Result<(), ReplyError> {
        self.base.check_valid()?;
        self.link.send_command(self.base.id(), command, false)
    }

    pub fn set_bpm(&self, bpm: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetBpm(bpm))
    }

    pub fn set_lpb(&self, lpb: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetLpb(lpb))
    }

    pub fn set_shuffle(&self, shuffle: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetShuffle(shuffle))
    }

    pub fn set_loop_state(&self, enabled: bool) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetLoopState(enabled))
    }

    pub fn set_loop_start(&self, line: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetLoopStart(line))
    }

    pub fn set_loop_length(&self, lines: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetLoopLength(lines))
    }

    pub fn play(&self) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetPlaying(true))
    }

    pub fn stop(&self) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetPlaying(false))
    }

    pub fn set_record(&self, recording: bool) -> Result<(), ReplyError> {
        self.request(TransportCommand::SetRecord(recording))
    }

    pub fn jump(&self, line: u32) -> Result<(), ReplyError> {
        self.request(TransportCommand::Jump(line))
    }
}

impl ClientObject for GlobalControlReplica {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn factory(&self) -> &'static str {
        GLOBAL_CONTROL
    }

    fn process_message(&self, _client: &mut ClientCore, msg: &Message) -> Result<(), HandlerError> {
        let command = match Command::<TransportCommand>::read(msg)? {
            Command::Confirm(command) => command,
            Command::Request(_) => return Err(unknown_verb().into()),
        };
        {
            let mut cached = self.cached.lock();
            let Cached { state, row } = &mut *cached;
            apply(state, row, command);
        }
        let listeners = self.listeners.lock().clone();
        for l in &listeners {
            match command {
                TransportCommand::SetBpm(v) => l.bpm_changed(v),
                TransportCommand::SetLpb(v) => l.lpb_changed(v),
                TransportCommand::SetShuffle(v) => l.shuffle_changed(v),
                TransportCommand::SetLoopState(v) => l.loop_state_changed(v),
                TransportCommand::SetLoopStart(v) => l.loop_start_changed(v),
                TransportCommand::SetLoopLength(v) => l.loop_length_changed(v),
                TransportCommand::SetPlaying(v) => l.playing_changed(v),
                TransportCommand::SetRecord(v) => l.record_changed(v),
                TransportCommand::Jump(v) | TransportCommand::RowUpdate(v) => l.row_update(v),
            }
        }
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
