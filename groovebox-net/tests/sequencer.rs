mod common;

use crossbeam_channel::bounded;

use common::{machine, wait_for, Fixture, TIMEOUT};
use groovebox_net::objects::RIMachine;
use groovebox_net::ReplyError;
use groovebox_types::{
    LoopId, NoteEntry, PadConfiguration, PadEvent, PadEventKind, SequencerCommand,
};

fn press(finger: u8) -> PadEvent {
    PadEvent {
        finger,
        kind: PadEventKind::Press,
        x: 0x2000,
        y: 0x1000,
        z: 0x3fff,
    }
}

#[test]
fn create_loop_reports_allocated_id() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let seq = machine(&client, "Seq");

    assert_eq!(seq.create_loop_blocking().unwrap(), LoopId::new(0));

    let (tx, rx) = bounded(1);
    seq.create_loop(move |result| {
        let _ = tx.send(result);
    })
    .unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), Ok(LoopId::new(1)));

    wait_for("loops replicated", || {
        seq.sequencer().map(|s| s.loops.len()) == Some(2)
    });
    assert_eq!(fixture.sequencer.snapshot.lock().loops.len(), 2);
}

#[test]
fn note_edits_replicate_to_every_client() {
    let fixture = Fixture::start(false);
    let a = fixture.client();
    let b = fixture.client();
    let seq_a = machine(&a, "Seq");
    let seq_b = machine(&b, "Seq");

    let loop_id = seq_a.create_loop_blocking().unwrap();
    let note = NoteEntry::new(60, 100, 32, 16);
    seq_a
        .sequencer_command_confirmed(SequencerCommand::InsertNote { loop_id, note })
        .unwrap();
    seq_a
        .sequencer_command_confirmed(SequencerCommand::SetLoopAt {
            position: 2,
            loop_id: Some(loop_id),
        })
        .unwrap();

    wait_for("note on b", || {
        seq_b.sequencer().map(|s| s.loop_at(2)) == Some(Some(loop_id))
    });
    let snapshot = seq_b.sequencer().unwrap();
    assert_eq!(snapshot.notes(loop_id).unwrap(), &[note]);
    assert_eq!(snapshot.sequence.len(), 3);

    seq_a
        .sequencer_command_confirmed(SequencerCommand::DeleteNote {
            loop_id,
            on_at: 32,
            note: 60,
        })
        .unwrap();
    wait_for("note deleted on b", || {
        seq_b
            .sequencer()
            .map(|s| s.notes(loop_id).map(|n| n.is_empty()).unwrap_or(false))
            .unwrap_or(false)
    });

    // Server-side mirror stays in step with the engine.
    let mirrored = fixture
        .server
        .invoke(|core| {
            core.objects_of::<RIMachine>()
                .into_iter()
                .find(|m| m.name() == "Seq")
                .map(|m| m.sequencer_snapshot())
        })
        .unwrap()
        .unwrap();
    assert_eq!(mirrored, *fixture.sequencer.snapshot.lock());
}

#[test]
fn engine_errors_come_back_as_failures() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let seq = machine(&client, "Seq");

    let missing = seq.sequencer_command_confirmed(SequencerCommand::DeleteLoop {
        loop_id: LoopId::new(9),
    });
    assert!(matches!(missing, Err(ReplyError::Failed(_))));

    let bad_config = PadConfiguration {
        scale: 99,
        ..Default::default()
    };
    let invalid = seq.sequencer_command_confirmed(SequencerCommand::SetPadConfig(bad_config));
    assert!(matches!(invalid, Err(ReplyError::Failed(_))));
    assert!(client.is_connected());
}

#[test]
fn sequencer_commands_need_a_sequencer() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let kick = machine(&client, "Kick");
    assert!(kick.sequencer().is_none());

    let err = kick.create_loop_blocking().unwrap_err();
    assert!(matches!(err, ReplyError::Failed(ref r) if r.contains("not a sequencer")));
}

#[test]
fn pad_settings_replicate() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let seq = machine(&client, "Seq");

    let config = PadConfiguration {
        octave: 3,
        quantize: true,
        ..Default::default()
    };
    seq.sequencer_command_confirmed(SequencerCommand::SetPadConfig(config.clone()))
        .unwrap();
    seq.sequencer_command_confirmed(SequencerCommand::SetPadRecord(true))
        .unwrap();
    seq.sequencer_command_confirmed(SequencerCommand::SetEnvelopePoint {
        controller: 7,
        time: 0,
        value: 100,
    })
    .unwrap();

    let snapshot = seq.sequencer().unwrap();
    assert_eq!(snapshot.pad, config);
    assert!(snapshot.pad_recording);
    assert_eq!(snapshot.envelopes[&7].points.get(&0), Some(&100));
}

#[test]
fn pad_events_travel_over_datagrams() {
    let fixture = Fixture::start(true);
    let client = fixture.client();
    wait_for("datagram link", || {
        client.invoke(|c| c.client_id().is_some()).unwrap()
    });
    let seq = machine(&client, "Seq");

    seq.pad_event(press(1)).unwrap();
    wait_for("pad event", || !fixture.sequencer.pad_events.lock().is_empty());
    assert_eq!(fixture.sequencer.pad_events.lock()[0], press(1));
}

#[test]
fn pad_events_fall_back_to_the_stream() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let seq = machine(&client, "Seq");

    for finger in 0..3 {
        seq.pad_event(press(finger)).unwrap();
    }
    wait_for("pad events", || fixture.sequencer.pad_events.lock().len() == 3);
    let fingers: Vec<u8> = fixture
        .sequencer
        .pad_events
        .lock()
        .iter()
        .map(|e| e.finger)
        .collect();
    assert_eq!(fingers, vec![0, 1, 2]);
}

#[test]
fn rejected_datagram_keeps_the_connection() {
    let fixture = Fixture::start(true);
    let client = fixture.client();
    let kick = machine(&client, "Kick");

    kick.pad_event(press(0)).unwrap();
    // A stream request behind it still goes through.
    let seq = machine(&client, "Seq");
    assert_eq!(seq.create_loop_blocking().unwrap(), LoopId::new(0));
    assert!(client.is_connected());
    assert_eq!(fixture.server.client_count(), 1);
}

#[test]
fn late_joiner_receives_sequencer_state() {
    let fixture = Fixture::start(false);
    let first = fixture.client();
    let seq = machine(&first, "Seq");
    let loop_id = seq.create_loop_blocking().unwrap();
    seq.sequencer_command_confirmed(SequencerCommand::InsertNote {
        loop_id,
        note: NoteEntry::new(64, 90, 0, 8),
    })
    .unwrap();

    let late = fixture.client();
    let snapshot = machine(&late, "Seq").sequencer().unwrap();
    assert_eq!(snapshot.notes(loop_id).unwrap().len(), 1);
}
