//! Scenario tests driving the bundle processor state machine directly.

use bpa_core::agents::Agent;
use bpa_core::cla::{Cla, ClaRegistry, TxCommand, TxQueueHandle};
use bpa_core::contact_manager::CmWaker;
use bpa_core::processor::{BpConfig, BundleProcessor, Signal};
use bpa_core::routing_table::RoutingTable;
use bpa_core::testing::{manual_clock, node_with_contact, small_bundle};
use bpa_proto::bundle::{Block, BlockType, Bundle, BundleAdu, BundleFlags, HopCount};
use bpa_proto::time::ManualTimeProvider;
use bpa_proto::TimeProvider;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

struct StubCla {
    name: &'static str,
    sender: Sender<TxCommand>,
}

impl Cla for StubCla {
    fn name(&self) -> &'static str {
        self.name
    }
    fn launch(&self) {}
    fn mbs(&self) -> usize {
        usize::MAX
    }
    fn get_tx_queue(&self, _eid: &str, _cla_addr: &str) -> Option<TxQueueHandle> {
        Some(TxQueueHandle {
            sender: self.sender.clone(),
        })
    }
    fn start_scheduled_contact(&self, _eid: &str, _cla_addr: &str) {}
    fn end_scheduled_contact(&self, _eid: &str, _cla_addr: &str) {}
}

struct Harness {
    bp: BundleProcessor,
    routing: Arc<Mutex<RoutingTable>>,
    time: Arc<ManualTimeProvider>,
    #[allow(dead_code)]
    tx_commands: Receiver<TxCommand>,
}

fn harness(local_eid: &str) -> Harness {
    let time = manual_clock();
    let routing = Arc::new(Mutex::new(RoutingTable::new()));
    let (tx, tx_commands) = unbounded();
    let registry = Arc::new(ClaRegistry::new());
    registry.register(Arc::new(StubCla {
        name: "mtcp",
        sender: tx,
    }));
    let (waker, _wake_queue) = CmWaker::new();
    let config = BpConfig::new(local_eid).unwrap();
    let bp = BundleProcessor::new(config, routing.clone(), registry, waker, time.clone());
    Harness {
        bp,
        routing,
        time,
        tx_commands,
    }
}

fn subscriber(records: &Arc<Mutex<Vec<BundleAdu>>>) -> Agent {
    let records = records.clone();
    Agent {
        sink: "app".into(),
        secret: None,
        callback: Some(Arc::new(move |adu, _bp| {
            records.lock().push(adu);
        })),
    }
}

// Scenario S1: no agent registered, delivery flag off.
#[test]
fn bundle_for_unregistered_agent_is_deleted() {
    let mut h = harness("dtn://a/");
    let now = h.time.now_dtn_ms();
    let bundle = small_bundle("dtn://remote/app", "dtn://a/app", b"hi", now);
    let id = bundle.unique_id();

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    // Recorded as known (deduplication happens before the agent
    // check), then deleted; report-to is the null endpoint so no
    // status report can be emitted.
    assert!(h.bp.known_bundles().contains(&id));
    assert!(h.bp.agents().is_empty());
}

// Scenario S2: registered subscriber receives the ADU exactly once.
#[test]
fn delivery_and_duplicate_suppression() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: None,
    });

    let now = h.time.now_dtn_ms();
    let bundle = small_bundle("dtn://remote/app", "dtn://a/app", b"hi", now);
    let duplicate = bundle.clone();

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    {
        let delivered = records.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].payload, b"hi");
        assert_eq!(delivered[0].source.as_deref(), Some("dtn://remote/app"));
        assert_eq!(delivered[0].destination.as_deref(), Some("dtn://a/app"));
    }

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(duplicate)));
    assert_eq!(records.lock().len(), 1, "duplicate must not reach the agent");
}

// Scenario S5: hop limit reached deletes the bundle and reports it.
#[test]
fn hop_limit_exceeded_deletes_and_reports() {
    let mut h = harness("dtn://a/");
    let now = h.time.now_dtn_ms();
    // Route towards the reporter must exist for the report bundle.
    {
        let mut table = h.routing.lock();
        let node = node_with_contact("dtn://rep/", "mtcp:10.0.0.9:4224", now, now + 60_000, 10_000);
        assert!(table.add_node(node, &mut |_| panic!("no rescheduling expected")));
    }

    let mut bundle = small_bundle("dtn://remote/app", "dtn://b/app", b"x", now);
    bundle.proc_flags |= BundleFlags::REPORT_DELETION;
    bundle.report_to = Some("dtn://rep/sink".into());
    let mut hop = Block::with_data(
        BlockType::HopCount,
        HopCount { limit: 1, count: 1 }.serialize(),
    );
    hop.number = 2;
    bundle.blocks.insert(0, hop);

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));

    let table = h.routing.lock();
    let contact_id = table.lookup_node("dtn://rep/").unwrap().contacts[0];
    let queued = &table.contact(contact_id).unwrap().bundles;
    assert_eq!(queued.len(), 1, "status report must be routed");
    let report = &queued[0];
    assert!(report
        .proc_flags
        .contains(BundleFlags::ADMINISTRATIVE_RECORD));
    assert_eq!(report.destination.as_deref(), Some("dtn://rep/sink"));
}

#[test]
fn hop_count_below_limit_is_incremented_and_forwarded() {
    let mut h = harness("dtn://a/");
    let now = h.time.now_dtn_ms();
    {
        let mut table = h.routing.lock();
        let node = node_with_contact("dtn://b/", "mtcp:10.0.0.2:4224", now, now + 60_000, 10_000);
        assert!(table.add_node(node, &mut |_| {}));
    }

    let mut bundle = small_bundle("dtn://remote/app", "dtn://b/app", b"x", now);
    let mut hop = Block::with_data(
        BlockType::HopCount,
        HopCount { limit: 4, count: 1 }.serialize(),
    );
    hop.number = 2;
    bundle.blocks.insert(0, hop);

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));

    let table = h.routing.lock();
    let contact_id = table.lookup_node("dtn://b/").unwrap().contacts[0];
    let queued = &table.contact(contact_id).unwrap().bundles;
    assert_eq!(queued.len(), 1);
    let hop = HopCount::parse(&queued[0].block_by_type(BlockType::HopCount).unwrap().data).unwrap();
    assert_eq!(hop.count, 2);
}

// Scenario S6: reverse-order fragments deliver exactly one ADU.
#[test]
fn fragment_reassembly_end_to_end() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: None,
    });

    let now = h.time.now_dtn_ms();
    let make_fragment = |offset: u64, fill: u8| {
        let mut b = small_bundle("dtn://remote/app", "dtn://a/app", &[fill; 50], now);
        b.proc_flags |= BundleFlags::IS_FRAGMENT;
        b.fragment_offset = offset;
        b.total_adu_length = 100;
        b
    };

    // Reverse order: second half first.
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(make_fragment(50, 2))));
    assert!(records.lock().is_empty());
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(make_fragment(0, 1))));

    let delivered = records.lock();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload.len(), 100);
    assert_eq!(&delivered[0].payload[..50], &[1u8; 50]);
    assert_eq!(&delivered[0].payload[50..], &[2u8; 50]);
    drop(delivered);

    // The synthetic known entry suppresses late duplicates.
    let mut key = make_fragment(0, 1).unique_id();
    key.payload_length = 100;
    assert!(h.bp.known_bundles().contains(&key));
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(make_fragment(50, 2))));
    assert_eq!(records.lock().len(), 1);
}

#[test]
fn expired_bundle_is_deleted_on_receive() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: None,
    });

    let now = h.time.now_dtn_ms();
    let mut bundle = small_bundle("dtn://remote/app", "dtn://a/app", b"x", now);
    bundle.creation_timestamp_ms = now - 120_000; // lifetime is 60 s
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    assert!(records.lock().is_empty());
}

#[test]
fn discardable_unknown_block_is_removed_on_receive() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: None,
    });

    let now = h.time.now_dtn_ms();
    let mut bundle = small_bundle("dtn://remote/app", "dtn://a/app", b"ok", now);
    let mut ext = Block::with_data(BlockType::Other(200), vec![1, 2, 3]);
    ext.number = 2;
    ext.flags = bpa_proto::bundle::BlockFlags::DISCARD_IF_UNPROC;
    bundle.blocks.insert(0, ext);

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    assert_eq!(records.lock().len(), 1, "bundle itself must survive");
}

#[test]
fn delete_bundle_block_flag_deletes_on_receive() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: None,
    });

    let now = h.time.now_dtn_ms();
    let mut bundle = small_bundle("dtn://remote/app", "dtn://a/app", b"bad", now);
    let mut ext = Block::with_data(BlockType::Other(200), vec![1]);
    ext.number = 2;
    ext.flags = bpa_proto::bundle::BlockFlags::DELETE_BUNDLE_IF_UNPROC;
    bundle.blocks.insert(0, ext);

    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    assert!(records.lock().is_empty());
}

#[test]
fn transmission_success_clears_constraints() {
    let mut h = harness("dtn://a/");
    let now = h.time.now_dtn_ms();
    let mut bundle = small_bundle("dtn://a/app", "dtn://b/app", b"x", now);
    bundle.ret_constraints |= bpa_proto::bundle::RetentionConstraints::FORWARD_PENDING;
    // Consumed without panicking; nothing further observable since the
    // bundle is owned and dropped by the processor.
    h.bp.handle_signal(Signal::TransmissionSuccess {
        bundle: Box::new(bundle),
        peer_cla_addr: Some("mtcp:x".into()),
    });
}

#[test]
fn agent_registry_laws() {
    let mut h = harness("dtn://a/");
    let records = Arc::new(Mutex::new(Vec::new()));
    let (fb_tx, fb_rx) = unbounded();

    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: Some(fb_tx.clone()),
    });
    assert_eq!(fb_rx.try_recv().unwrap(), Ok(()));

    // A second subscriber for the same sink is rejected.
    h.bp.handle_signal(Signal::AgentRegister {
        agent: subscriber(&records),
        is_subscriber: true,
        feedback: Some(fb_tx.clone()),
    });
    assert_eq!(
        fb_rx.try_recv().unwrap(),
        Err(bpa_core::AgentError::AlreadyRegistered)
    );

    // An RPC registration with a mismatching secret is unauthorized.
    let mut rpc = subscriber(&records);
    rpc.secret = Some("wrong".into());
    h.bp.handle_signal(Signal::AgentRegister {
        agent: rpc,
        is_subscriber: false,
        feedback: Some(fb_tx.clone()),
    });
    assert_eq!(
        fb_rx.try_recv().unwrap(),
        Err(bpa_core::AgentError::Unauthorized)
    );

    // Register/deregister leaves the registry empty again.
    h.bp.handle_signal(Signal::AgentDeregister {
        sink: "app".into(),
        is_subscriber: true,
        feedback: Some(fb_tx),
    });
    assert_eq!(fb_rx.try_recv().unwrap(), Ok(()));
    assert!(h.bp.agents().is_empty());
}

#[test]
fn config_agent_applies_commands() {
    let mut h = harness("dtn://a/");
    bpa_core::config::setup(&h.bp.handle(), false);
    h.bp.pump();
    assert!(h.bp.agents().has_subscriber("config"));

    let now = h.time.now_dtn_ms();
    let command = b"1(dtn://b/):(mtcp:10.0.0.2:4224)::[{500000,600000,1200}];".to_vec();
    let bundle = small_bundle("dtn://a/admin", "dtn://a/config", &command, now);
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    h.bp.pump();

    let table = h.routing.lock();
    let node = table.lookup_node("dtn://b/").expect("node configured");
    assert_eq!(node.cla_addr.as_deref(), Some("mtcp:10.0.0.2:4224"));
    let contact = table.contact(node.contacts[0]).unwrap();
    assert_eq!(contact.from_ms, 500_000_000);
    assert_eq!(contact.to_ms, 600_000_000);
    assert_eq!(contact.bitrate_bytes_per_s, 1200);
}

#[test]
fn config_agent_rejects_foreign_sources() {
    let mut h = harness("dtn://a/");
    bpa_core::config::setup(&h.bp.handle(), false);
    h.bp.pump();

    let now = h.time.now_dtn_ms();
    let command = b"1(dtn://b/):(mtcp:10.0.0.2:4224);".to_vec();
    let bundle = small_bundle("dtn://evil/app", "dtn://a/config", &command, now);
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(bundle)));
    h.bp.pump();

    assert!(h.routing.lock().lookup_node("dtn://b/").is_none());
}

#[test]
fn echo_agent_replies_to_source() {
    let mut h = harness("dtn://a/");
    bpa_core::echo::setup(&h.bp.handle(), 300_000);
    h.bp.pump();

    let now = h.time.now_dtn_ms();
    {
        let mut table = h.routing.lock();
        let node = node_with_contact("dtn://client/", "mtcp:10.0.0.7:4224", now, now + 60_000, 10_000);
        assert!(table.add_node(node, &mut |_| {}));
    }

    let ping = small_bundle("dtn://client/app", "dtn://a/echo", b"ping", now);
    h.bp.handle_signal(Signal::BundleIncoming(Box::new(ping)));
    h.bp.pump();

    let table = h.routing.lock();
    let contact_id = table.lookup_node("dtn://client/").unwrap().contacts[0];
    let queued = &table.contact(contact_id).unwrap().bundles;
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].destination.as_deref(), Some("dtn://client/app"));
    assert_eq!(queued[0].payload_block().unwrap().data, b"ping");
}
