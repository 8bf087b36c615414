mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use common::{global_control, machine, wait_for, Fixture, TIMEOUT};
use groovebox_net::objects::{
    SampleBankListener, SampleBankObject, SampleBankReplica, SampleBankState, TransportCommand,
};
use groovebox_net::{
    default_registry, Client, ClientEvents, ClientObject, Command, ReplyError,
};

#[derive(Default)]
struct Lifecycle {
    registered: AtomicUsize,
    unregistered: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ClientEvents for Lifecycle {
    fn object_registered(&self, _object: &Arc<dyn ClientObject>) {
        self.registered.fetch_add(1, Ordering::SeqCst);
    }

    fn object_unregistered(&self, _object: &Arc<dyn ClientObject>) {
        self.unregistered.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

fn connect_with(fixture: &Fixture, events: Arc<Lifecycle>) -> Client {
    let client = Client::connect(
        fixture.addr(),
        default_registry(),
        Some(events.clone() as Arc<dyn ClientEvents>),
    )
    .unwrap();
    wait_for("catch-up", || events.registered.load(Ordering::SeqCst) == 4);
    client
}

#[test]
fn disconnect_cancels_pending_replies() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    let gc = global_control(&client);
    let msg = Command::Request(TransportCommand::SetBpm(130))
        .to_message(gc.obj_id())
        .unwrap();

    let (tx, rx) = bounded(1);
    client
        .invoke(move |core| {
            core.send_with_reply(
                msg,
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            );
            assert_eq!(core.pending_replies(), 1);
            core.disconnect();
            core.pending_replies()
        })
        .map(|left| assert_eq!(left, 0))
        .unwrap();

    assert_eq!(
        rx.recv_timeout(TIMEOUT).unwrap().unwrap_err(),
        ReplyError::ConnectionLost
    );
    assert!(!gc.base().is_valid());
    assert!(!client.is_connected());
    assert!(client.objects_of::<groovebox_net::objects::MachineReplica>().is_empty());

    // Requests after the fact fail immediately.
    let err = client
        .link()
        .request_command(gc.obj_id(), TransportCommand::SetBpm(90))
        .unwrap_err();
    assert_eq!(err, ReplyError::ConnectionLost);
    assert!(matches!(gc.set_bpm(90), Err(ReplyError::Object(_))));
}

#[test]
fn server_shutdown_invalidates_replicas() {
    let fixture = Fixture::start(false);
    let events = Arc::new(Lifecycle::default());
    let client = connect_with(&fixture, events.clone());
    let kick = machine(&client, "Kick");

    fixture.server.shutdown();

    wait_for("disconnect event", || events.disconnected.load(Ordering::SeqCst) == 1);
    assert_eq!(events.unregistered.load(Ordering::SeqCst), 4);
    assert!(!kick.is_valid());
    assert!(!client.is_connected());
}

#[test]
fn client_leaving_is_noticed_by_server() {
    let fixture = Fixture::start(false);
    let client = fixture.client();
    assert_eq!(fixture.server.client_count(), 1);
    client.disconnect();
    wait_for("server notices", || fixture.server.client_count() == 0);
}

#[test]
fn resync_rebuilds_every_replica() {
    let fixture = Fixture::start(false);
    let events = Arc::new(Lifecycle::default());
    let client = connect_with(&fixture, events.clone());
    let old = global_control(&client);
    old.set_bpm(133).unwrap();
    wait_for("bpm", || old.get_bpm() == 133);

    fixture.server.resync_all().unwrap();

    wait_for("rebuilt", || events.registered.load(Ordering::SeqCst) == 8);
    assert_eq!(events.unregistered.load(Ordering::SeqCst), 4);
    assert!(!old.base().is_valid());
    let fresh = global_control(&client);
    assert!(fresh.base().is_valid());
    assert_eq!(fresh.get_bpm(), 133);
    assert!(client.is_connected());
}

#[derive(Default)]
struct BankRecorder(Mutex<Vec<SampleBankState>>);

impl SampleBankListener for BankRecorder {
    fn bank_changed(&self, state: &SampleBankState) {
        self.0.lock().push(state.clone());
    }
}

#[test]
fn sample_bank_edits_replicate() {
    let fixture = Fixture::start(false);
    fixture
        .server
        .invoke(|core| SampleBankObject::create(core, "Drums").map(|_| ()))
        .unwrap()
        .unwrap();
    let a = fixture.client();
    let b = fixture.client();
    let bank_a = a.objects_of::<SampleBankReplica>().remove(0);
    let bank_b = b.objects_of::<SampleBankReplica>().remove(0);
    let recorder = Arc::new(BankRecorder::default());
    bank_b.add_listener(recorder.clone());
    assert_eq!(bank_b.name(), "Drums");

    bank_a.set_sample_name(0, "kick; 909.wav").unwrap();
    bank_a.swap_samples(0, 3).unwrap();
    bank_a.set_name("Percussion").unwrap();

    wait_for("bank on b", || recorder.0.lock().len() == 3);
    assert_eq!(bank_b.name(), "Percussion");
    assert_eq!(bank_b.sample(3).as_deref(), Some("kick; 909.wav"));
    assert_eq!(bank_b.sample(0), None);

    // Out-of-range slots are refused by the server, not applied locally.
    bank_a.clear_sample(99).unwrap();
    bank_a.clear_sample(3).unwrap();
    wait_for("clear", || recorder.0.lock().len() == 4);
    assert!(bank_b.sample(3).is_none());
    wait_for("a converges", || bank_a.state() == bank_b.state());
}
