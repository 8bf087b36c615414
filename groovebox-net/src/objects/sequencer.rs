//! Wire mapping of sequencer commands and pad events.

use groovebox_types::{LoopId, PadEvent, PadEventKind, SequencerCommand};

use crate::command::{unknown_verb, CommandPayload};
use crate::error::MessageError;
use crate::message::Message;

const KEY_LOOP: &str = "loop_id";
const KEY_POSITION: &str = "position";
const KEY_ENTRY: &str = "entry";
const KEY_ON_AT: &str = "on_at";
const KEY_NOTE: &str = "note";
const KEY_CONFIG: &str = "config";
const KEY_RECORD: &str = "record";
const KEY_CONTROLLER: &str = "controller";
const KEY_TIME: &str = "time";
const KEY_VALUE: &str = "value";
const KEY_START: &str = "start";
const KEY_START_VALUE: &str = "start_value";
const KEY_STOP: &str = "stop";
const KEY_STOP_VALUE: &str = "stop_value";
const KEY_ENABLED: &str = "enabled";

const KEY_FINGER: &str = "finger";
const KEY_EVENT: &str = "event";
const KEY_X: &str = "x";
const KEY_Y: &str = "y";
const KEY_Z: &str = "z";

fn get_loop(msg: &Message) -> Result<LoopId, MessageError> {
    msg.get::<u32>(KEY_LOOP).map(LoopId::new)
}

fn get_opt_loop(msg: &Message) -> Result<Option<LoopId>, MessageError> {
    Ok(msg.get_opt::<u32>(KEY_LOOP)?.map(LoopId::new))
}

fn set_opt_loop(msg: &mut Message, loop_id: Option<LoopId>) -> Result<(), MessageError> {
    match loop_id {
        Some(id) => msg.set(KEY_LOOP, id.get()),
        None => Ok(()),
    }
}

impl CommandPayload for SequencerCommand {
    fn verb(&self) -> &'static str {
        match self {
            SequencerCommand::CreateLoop { .. } => "create_loop",
            SequencerCommand::DeleteLoop { .. } => "delete_loop",
            SequencerCommand::SetLoopAt { .. } => "set_loop_at",
            SequencerCommand::InsertNote { .. } => "insert_note",
            SequencerCommand::DeleteNote { .. } => "delete_note",
            SequencerCommand::UpdateNote { .. } => "update_note",
            SequencerCommand::SetPadConfig(_) => "set_pad_config",
            SequencerCommand::SetPadRecord(_) => "set_pad_record",
            SequencerCommand::QuantizePad => "pad_quantize",
            SequencerCommand::ClearPad => "pad_clear",
            SequencerCommand::SetEnvelopePoint { .. } => "envelope_set_point",
            SequencerCommand::DeleteEnvelopePoint { .. } => "envelope_delete_point",
            SequencerCommand::EnvelopeLine { .. } => "envelope_line",
            SequencerCommand::DeleteEnvelopeRange { .. } => "envelope_delete_range",
            SequencerCommand::EnableEnvelope { .. } => "envelope_enable",
        }
    }

    fn write_fields(&self, msg: &mut Message) -> Result<(), MessageError> {
        match self {
            SequencerCommand::CreateLoop { loop_id } => set_opt_loop(msg, *loop_id),
            SequencerCommand::DeleteLoop { loop_id } => msg.set(KEY_LOOP, loop_id.get()),
            SequencerCommand::SetLoopAt { position, loop_id } => {
                msg.set(KEY_POSITION, position)?;
                set_opt_loop(msg, *loop_id)
            }
            SequencerCommand::InsertNote { loop_id, note } => {
                msg.set(KEY_LOOP, loop_id.get())?;
                msg.set_json(KEY_ENTRY, note)
            }
            SequencerCommand::DeleteNote { loop_id, on_at, note } => {
                msg.set(KEY_LOOP, loop_id.get())?;
                msg.set(KEY_ON_AT, on_at)?;
                msg.set(KEY_NOTE, note)
            }
            SequencerCommand::UpdateNote { loop_id, on_at, note, entry } => {
                msg.set(KEY_LOOP, loop_id.get())?;
                msg.set(KEY_ON_AT, on_at)?;
                msg.set(KEY_NOTE, note)?;
                msg.set_json(KEY_ENTRY, entry)
            }
            SequencerCommand::SetPadConfig(config) => msg.set_json(KEY_CONFIG, config),
            SequencerCommand::SetPadRecord(on) => msg.set(KEY_RECORD, on),
            SequencerCommand::QuantizePad | SequencerCommand::ClearPad => Ok(()),
            SequencerCommand::SetEnvelopePoint { controller, time, value } => {
                msg.set(KEY_CONTROLLER, controller)?;
                msg.set(KEY_TIME, time)?;
                msg.set(KEY_VALUE, value)
            }
            SequencerCommand::DeleteEnvelopePoint { controller, time } => {
                msg.set(KEY_CONTROLLER, controller)?;
                msg.set(KEY_TIME, time)
            }
            SequencerCommand::EnvelopeLine { controller, start, start_value, stop, stop_value } => {
                msg.set(KEY_CONTROLLER, controller)?;
                msg.set(KEY_START, start)?;
                msg.set(KEY_START_VALUE, start_value)?;
                msg.set(KEY_STOP, stop)?;
                msg.set(KEY_STOP_VALUE, stop_value)
            }
            SequencerCommand::DeleteEnvelopeRange { controller, start, stop } => {
                msg.set(KEY_CONTROLLER, controller)?;
                msg.set(KEY_START, start)?;
                msg.set(KEY_STOP, stop)
            }
            SequencerCommand::EnableEnvelope { controller, enabled } => {
                msg.set(KEY_CONTROLLER, controller)?;
                msg.set(KEY_ENABLED, enabled)
            }
        }
    }

    fn read_fields(verb: &str, msg: &Message) -> Result<Self, MessageError> {
        Ok(match verb {
            "create_loop" => SequencerCommand::CreateLoop { loop_id: get_opt_loop(msg)? },
            "delete_loop" => SequencerCommand::DeleteLoop { loop_id: get_loop(msg)? },
            "set_loop_at" => SequencerCommand::SetLoopAt {
                position: msg.get(KEY_POSITION)?,
                loop_id: get_opt_loop(msg)?,
            },
            "insert_note" => SequencerCommand::InsertNote {
                loop_id: get_loop(msg)?,
                note: msg.get_json(KEY_ENTRY)?,
            },
            "delete_note" => SequencerCommand::DeleteNote {
                loop_id: get_loop(msg)?,
                on_at: msg.get(KEY_ON_AT)?,
                note: msg.get(KEY_NOTE)?,
            },
            "update_note" => SequencerCommand::UpdateNote {
                loop_id: get_loop(msg)?,
                on_at: msg.get(KEY_ON_AT)?,
                note: msg.get(KEY_NOTE)?,
                entry: msg.get_json(KEY_ENTRY)?,
            },
            "set_pad_config" => SequencerCommand::SetPadConfig(msg.get_json(KEY_CONFIG)?),
            "set_pad_record" => SequencerCommand::SetPadRecord(msg.get(KEY_RECORD)?),
            "pad_quantize" => SequencerCommand::QuantizePad,
            "pad_clear" => SequencerCommand::ClearPad,
            "envelope_set_point" => SequencerCommand::SetEnvelopePoint {
                controller: msg.get(KEY_CONTROLLER)?,
                time: msg.get(KEY_TIME)?,
                value: msg.get(KEY_VALUE)?,
            },
            "envelope_delete_point" => SequencerCommand::DeleteEnvelopePoint {
                controller: msg.get(KEY_CONTROLLER)?,
                time: msg.get(KEY_TIME)?,
            },
            "envelope_line" => SequencerCommand::EnvelopeLine {
                controller: msg.get(KEY_CONTROLLER)?,
                start: msg.get(KEY_START)?,
                start_value: msg.get(KEY_START_VALUE)?,
                stop: msg.get(KEY_STOP)?,
                stop_value: msg.get(KEY_STOP_VALUE)?,
            },
            "envelope_delete_range" => SequencerCommand::DeleteEnvelopeRange {
                controller: msg.get(KEY_CONTROLLER)?,
                start: msg.get(KEY_START)?,
                stop: msg.get(KEY_STOP)?,
            },
            "envelope_enable" => SequencerCommand::EnableEnvelope {
                controller: msg.get(KEY_CONTROLLER)?,
                enabled: msg.get(KEY_ENABLED)?,
            },
            _ => return Err(unknown_verb()),
        })
    }
}

pub(crate) fn write_pad_event(event: &PadEvent, msg: &mut Message) -> Result<(), MessageError> {
    msg.set(KEY_FINGER, event.finger)?;
    msg.set_value(KEY_EVENT, event.kind.name())?;
    msg.set(KEY_X, event.x)?;
    msg.set(KEY_Y, event.y)?;
    msg.set(KEY_Z, event.z)
}

pub(crate) fn read_pad_event(msg: &Message) -> Result<PadEvent, MessageError> {
    let kind = PadEventKind::from_name(msg.get_value(KEY_EVENT)?)
        .ok_or_else(|| MessageError::BadValue(KEY_EVENT.to_string()))?;
    Ok(PadEvent {
        finger: msg.get(KEY_FINGER)?,
        kind,
        x: msg.get(KEY_X)?,
        y: msg.get(KEY_Y)?,
        z: msg.get(KEY_Z)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use groovebox_types::{NoteEntry, ObjId, PadConfiguration};

    fn roundtrip(command: SequencerCommand) {
        let msg = Command::Request(command.clone()).to_message(ObjId::new(3)).unwrap();
        assert_eq!(
            Command::<SequencerCommand>::read(&msg).unwrap(),
            Command::Request(command)
        );
    }

    #[test]
    fn optional_loop_ids() {
        roundtrip(SequencerCommand::CreateLoop { loop_id: None });
        roundtrip(SequencerCommand::CreateLoop { loop_id: Some(LoopId::new(2)) });
        roundtrip(SequencerCommand::SetLoopAt { position: 7, loop_id: None });
    }

    #[test]
    fn structured_payloads() {
        let note = NoteEntry::new(62, 100, 16, 8);
        roundtrip(SequencerCommand::UpdateNote {
            loop_id: LoopId::new(0),
            on_at: 0,
            note: 60,
            entry: note,
        });
        roundtrip(SequencerCommand::SetPadConfig(PadConfiguration {
            scale: 3,
            quantize: true,
            ..Default::default()
        }));
        roundtrip(SequencerCommand::EnvelopeLine {
            controller: 7,
            start: 0,
            start_value: 0,
            stop: 64,
            stop_value: 0x3fff,
        });
    }

    #[test]
    fn pad_event_fields() {
        let event = PadEvent {
            finger: 2,
            kind: PadEventKind::Slide,
            x: 0x1234,
            y: 12,
            z: 0x3fff,
        };
        let mut msg = Message::new();
        write_pad_event(&event, &mut msg).unwrap();
        assert_eq!(msg.get_value("event").unwrap(), "slide");
        assert_eq!(read_pad_event(&msg).unwrap(), event);
    }
}
