//! Driving the contact manager state machine without threads.

use bpa_core::cla::{Cla, ClaRegistry, TxCommand, TxQueueHandle};
use bpa_core::contact_manager::{CmSignal, CmWaker, ContactManager};
use bpa_core::processor::{BpConfig, BundleProcessor};
use bpa_core::router;
use bpa_core::routing_table::RoutingTable;
use bpa_core::testing::{manual_clock, node_with_contact, small_bundle};
use bpa_proto::TimeProvider;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct ContactLog {
    started: Vec<(String, String)>,
    ended: Vec<(String, String)>,
}

struct RecordingCla {
    log: Arc<Mutex<ContactLog>>,
    sender: Sender<TxCommand>,
    link_up: Arc<Mutex<bool>>,
}

impl Cla for RecordingCla {
    fn name(&self) -> &'static str {
        "mtcp"
    }
    fn launch(&self) {}
    fn mbs(&self) -> usize {
        usize::MAX
    }
    fn get_tx_queue(&self, _eid: &str, _cla_addr: &str) -> Option<TxQueueHandle> {
        if *self.link_up.lock() {
            Some(TxQueueHandle {
                sender: self.sender.clone(),
            })
        } else {
            None
        }
    }
    fn start_scheduled_contact(&self, eid: &str, cla_addr: &str) {
        self.log
            .lock()
            .started
            .push((eid.to_string(), cla_addr.to_string()));
    }
    fn end_scheduled_contact(&self, eid: &str, cla_addr: &str) {
        self.log
            .lock()
            .ended
            .push((eid.to_string(), cla_addr.to_string()));
    }
}

struct Harness {
    manager: ContactManager,
    bp: BundleProcessor,
    routing: Arc<Mutex<RoutingTable>>,
    time: Arc<bpa_proto::time::ManualTimeProvider>,
    log: Arc<Mutex<ContactLog>>,
    tx_commands: Receiver<TxCommand>,
    link_up: Arc<Mutex<bool>>,
}

fn harness() -> Harness {
    let time = manual_clock();
    let routing = Arc::new(Mutex::new(RoutingTable::new()));
    let log = Arc::new(Mutex::new(ContactLog::default()));
    let link_up = Arc::new(Mutex::new(true));
    let (sender, tx_commands) = unbounded();
    let registry = Arc::new(ClaRegistry::new());
    registry.register(Arc::new(RecordingCla {
        log: log.clone(),
        sender,
        link_up: link_up.clone(),
    }));

    let (waker, wake_queue) = CmWaker::new();
    let bp = BundleProcessor::new(
        BpConfig::new("dtn://a/").unwrap(),
        routing.clone(),
        registry.clone(),
        waker,
        time.clone(),
    );
    let manager = ContactManager::new(
        routing.clone(),
        registry,
        bp.handle(),
        time.clone(),
        wake_queue,
    );
    Harness {
        manager,
        bp,
        routing,
        time,
        log,
        tx_commands,
        link_up,
    }
}

fn add_contact(h: &Harness, from_ms: u64, to_ms: u64) -> bpa_core::ContactId {
    let mut table = h.routing.lock();
    let node = node_with_contact("dtn://b/", "mtcp:10.0.0.2:4224", from_ms, to_ms, 10_000);
    assert!(table.add_node(node, &mut |_| {}));
    table.lookup_node("dtn://b/").unwrap().contacts[0]
}

#[test]
fn contact_starting_now_is_activated() {
    let mut h = harness();
    let now = h.time.now_dtn_ms();
    // Boundary: from == now activates on this pass.
    let id = add_contact(&h, now, now + 5_000);

    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST);
    assert!(h.routing.lock().contact(id).unwrap().active);
    let log = h.log.lock();
    assert_eq!(log.started.len(), 1);
    assert_eq!(log.started[0].0, "dtn://b/");
    assert_eq!(log.started[0].1, "mtcp:10.0.0.2:4224");
}

#[test]
fn future_contact_is_not_activated_yet() {
    let mut h = harness();
    let now = h.time.now_dtn_ms();
    let id = add_contact(&h, now + 10_000, now + 20_000);

    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST);
    assert!(!h.routing.lock().contact(id).unwrap().active);
    assert!(h.log.lock().started.is_empty());
}

#[test]
fn expired_contact_ends_and_is_finalized() {
    let mut h = harness();
    let now = h.time.now_dtn_ms();
    let id = add_contact(&h, now, now + 5_000);
    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST);
    assert!(h.routing.lock().contact(id).unwrap().active);

    h.time.advance(Duration::from_millis(6_000));
    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST);

    let log = h.log.lock();
    assert_eq!(log.ended.len(), 1);
    drop(log);
    // The end-of-contact signal travels through the processor, which
    // finalizes the contact in the routing table.
    h.bp.pump();
    assert!(h.routing.lock().contact(id).is_none());
}

#[test]
fn queued_bundles_are_handed_to_the_tx_queue() {
    let mut h = harness();
    let now = h.time.now_dtn_ms();
    let id = add_contact(&h, now, now + 60_000);
    {
        let mut table = h.routing.lock();
        let bundle = small_bundle("dtn://a/app", "dtn://b/app", b"data", now);
        router::add_bundle_to_contact(table.contact_mut(id).unwrap(), bundle);
    }

    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST | CmSignal::PROCESS_CURRENT_BUNDLES);

    match h.tx_commands.try_recv().unwrap() {
        TxCommand::Bundles { bundles, cla_addr } => {
            assert_eq!(bundles.len(), 1);
            assert_eq!(cla_addr, "mtcp:10.0.0.2:4224");
        }
        other => panic!("unexpected command {other:?}"),
    }
    // The contact's queue was taken over atomically.
    assert!(h.routing.lock().contact(id).unwrap().bundles.is_empty());
}

#[test]
fn hand_over_without_active_link_leaves_bundles_queued() {
    let mut h = harness();
    *h.link_up.lock() = false;
    let now = h.time.now_dtn_ms();
    let id = add_contact(&h, now, now + 60_000);
    {
        let mut table = h.routing.lock();
        let bundle = small_bundle("dtn://a/app", "dtn://b/app", b"data", now);
        router::add_bundle_to_contact(table.contact_mut(id).unwrap(), bundle);
    }

    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST | CmSignal::PROCESS_CURRENT_BUNDLES);

    assert!(h.tx_commands.try_recv().is_err());
    assert_eq!(h.routing.lock().contact(id).unwrap().bundles.len(), 1);
}

#[test]
fn deleted_contact_record_is_discarded_on_hand_over() {
    let mut h = harness();
    let now = h.time.now_dtn_ms();
    let id = add_contact(&h, now, now + 60_000);
    h.manager.manage(CmSignal::UPDATE_CONTACT_LIST);
    assert!(h.routing.lock().contact(id).unwrap().active);

    // The node (and its contact) vanish while the record is cached.
    {
        let mut table = h.routing.lock();
        assert!(table.delete_node_by_eid("dtn://b/", &mut |_| {}));
    }
    h.manager.manage(CmSignal::PROCESS_CURRENT_BUNDLES);
    assert!(h.tx_commands.try_recv().is_err());
}
