use bpa_core::node::CAPACITY_INFINITE;
use bpa_core::router::{self, RouteError, RouterConfig};
use bpa_core::routing_table::RoutingTable;
use bpa_core::testing::{node_with_contact, small_bundle};
use bpa_core::NodeSpec;
use bpa_core::node::ContactSpec;
use bpa_proto::bundle::{Bundle, BundleFlags};

fn no_resched(_: bpa_proto::bundle::Bundle) {
    panic!("unexpected rescheduling");
}

fn unlimited_mbs(_: &str) -> Option<usize> {
    Some(usize::MAX)
}

fn table_with_one_contact(bitrate: u64, from_s: u64, to_s: u64) -> RoutingTable {
    let mut table = RoutingTable::new();
    let node = node_with_contact(
        "dtn://b/",
        "mtcp:10.0.0.2:4224",
        from_s * 1000,
        to_s * 1000,
        bitrate,
    );
    assert!(table.add_node(node, &mut no_resched));
    table
}

fn payload_bundle(len: usize, now_ms: u64) -> Bundle {
    small_bundle("dtn://a/app", "dtn://b/app", &vec![0u8; len], now_ms)
}

#[test]
fn single_contact_single_fragment_route() {
    let mut table = table_with_one_contact(1000, 0, 60);
    let bundle = payload_bundle(100, 1_000);
    let id = table.lookup_node("dtn://b/").unwrap().contacts[0];
    let before = table.contact(id).unwrap().remaining;

    let committed = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        1_000,
    )
    .unwrap();
    assert_eq!(committed, 1);

    let contact = table.contact(id).unwrap();
    assert_eq!(contact.bundles.len(), 1);
    let size = contact.bundles[0].serialized_size() as i64;
    // Normal priority consumes P0 and P1, not P2.
    assert_eq!(contact.remaining[0], before[0] - size);
    assert_eq!(contact.remaining[1], before[1] - size);
    assert_eq!(contact.remaining[2], before[2]);
    assert!(contact.remaining[0] >= contact.remaining[1]);
    assert!(contact.remaining[1] >= contact.remaining[2]);
}

#[test]
fn remove_restores_capacity_counters() {
    let mut table = table_with_one_contact(1000, 0, 60);
    let bundle = payload_bundle(100, 1_000);
    let uid = bundle.unique_id();
    let id = table.lookup_node("dtn://b/").unwrap().contacts[0];
    let before = table.contact(id).unwrap().remaining;

    router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        1_000,
    )
    .unwrap();
    let removed = router::remove_bundle_from_contact(table.contact_mut(id).unwrap(), &uid);
    assert!(removed.is_some());
    assert_eq!(table.contact(id).unwrap().remaining, before);
}

#[test]
fn unknown_destination_is_no_route() {
    let mut table = table_with_one_contact(1000, 0, 60);
    let bundle = small_bundle("dtn://a/app", "dtn://nowhere/app", b"x", 1_000);
    let err = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        1_000,
    )
    .unwrap_err();
    assert_eq!(err.1, RouteError::NoRoute);
}

#[test]
fn contact_in_the_past_is_no_timely_contact() {
    let mut table = table_with_one_contact(1000, 0, 10);
    let bundle = payload_bundle(10, 20_000);
    let err = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        20_000,
    )
    .unwrap_err();
    // The destination is known but the only contact already ended.
    assert!(matches!(
        err.1,
        RouteError::NoRoute | RouteError::NoTimelyContact
    ));
}

#[test]
fn expired_bundle_is_rejected_before_routing() {
    let mut table = table_with_one_contact(1000, 0, 600);
    let mut bundle = payload_bundle(10, 1_000);
    bundle.lifetime_ms = 1;
    let err = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        500_000,
    )
    .unwrap_err();
    assert_eq!(err.1, RouteError::Expired);
}

#[test]
fn oversized_bundle_without_capacity_is_no_route() {
    // 10 s * 10 B/s = 100 B capacity, far below the bundle size.
    let mut table = table_with_one_contact(10, 0, 10);
    let bundle = payload_bundle(5_000, 1_000);
    let err = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        1_000,
    )
    .unwrap_err();
    assert_eq!(err.1, RouteError::NoRoute);
}

#[test]
fn two_contacts_fragment_plan() {
    // Mirrors the two-window scenario: both contacts get one fragment
    // and both P0 counters shrink.
    let mut table = RoutingTable::new();
    let mut node = node_with_contact("dtn://b/", "mtcp:x", 0, 10_000, 100);
    node.contacts.push(ContactSpec {
        from_ms: 10_000,
        to_ms: 20_000,
        bitrate_bytes_per_s: 100,
        contact_endpoints: Vec::new(),
    });
    assert!(table.add_node(node, &mut no_resched));
    let ids: Vec<_> = table.lookup_node("dtn://b/").unwrap().contacts.clone();

    let bundle = payload_bundle(1_500, 0);
    let committed = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        0,
    )
    .unwrap();
    assert_eq!(committed, 2);

    let mut offsets = Vec::new();
    for id in &ids {
        let contact = table.contact(*id).unwrap();
        assert_eq!(contact.bundles.len(), 1);
        let frag = &contact.bundles[0];
        assert!(frag.is_fragment());
        assert!(frag.serialized_size() <= 1000);
        assert_eq!(frag.total_adu_length, 1_500);
        assert!(contact.remaining[0] < contact.total_capacity);
        offsets.push((frag.fragment_offset, frag.payload_length()));
    }
    // Fragments tile the ADU in schedule order.
    offsets.sort();
    assert_eq!(offsets[0].0, 0);
    assert_eq!(offsets[0].0 + offsets[0].1, offsets[1].0);
    assert_eq!(offsets[1].0 + offsets[1].1, 1_500);
}

#[test]
fn must_not_fragment_oversized_fails() {
    let mut table = RoutingTable::new();
    let mut node = node_with_contact("dtn://b/", "mtcp:x", 0, 10_000, 100);
    node.contacts.push(ContactSpec {
        from_ms: 10_000,
        to_ms: 20_000,
        bitrate_bytes_per_s: 100,
        contact_endpoints: Vec::new(),
    });
    assert!(table.add_node(node, &mut no_resched));

    let mut bundle = payload_bundle(1_500, 0);
    bundle.proc_flags |= BundleFlags::MUST_NOT_FRAGMENT;
    let err = router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        0,
    )
    .unwrap_err();
    assert!(matches!(
        err.1,
        RouteError::NoRoute | RouteError::NoTimelyContact
    ));
}

#[test]
fn more_fragments_than_the_limit_is_no_route() {
    // Four windows of 1000 B each; a bundle needing four fragments
    // must not yield a partial commitment when the limit is three.
    let mut table = RoutingTable::new();
    let mut node = NodeSpec {
        eid: "dtn://b/".into(),
        cla_addr: Some("mtcp:x".into()),
        ..Default::default()
    };
    for i in 0..4u64 {
        node.contacts.push(ContactSpec {
            from_ms: i * 10_000,
            to_ms: (i + 1) * 10_000,
            bitrate_bytes_per_s: 100,
            contact_endpoints: Vec::new(),
        });
    }
    assert!(table.add_node(node, &mut no_resched));
    let ids: Vec<_> = table.lookup_node("dtn://b/").unwrap().contacts.clone();

    let config = RouterConfig {
        max_fragments: 3,
        ..Default::default()
    };
    let bundle = payload_bundle(3_400, 0);
    let result = router::route_bundle(&mut table, &config, &unlimited_mbs, bundle, 0);
    assert!(result.is_err());
    for id in ids {
        let contact = table.contact(id).unwrap();
        assert!(contact.bundles.is_empty(), "no partial commitment");
        assert_eq!(contact.remaining[0], contact.total_capacity);
    }
}

#[test]
fn cla_mbs_caps_fragment_size() {
    let mut table = table_with_one_contact(100_000, 0, 600);
    let bundle = payload_bundle(1_500, 0);
    // The contact could carry everything, but the CLA caps bundles at
    // 1000 bytes, forcing fragmentation.
    let mbs = |_: &str| Some(1000usize);
    let committed =
        router::route_bundle(&mut table, &RouterConfig::default(), &mbs, bundle, 0).unwrap();
    assert!(committed >= 2);
    let id = table.lookup_node("dtn://b/").unwrap().contacts[0];
    for frag in &table.contact(id).unwrap().bundles {
        assert!(frag.serialized_size() <= 1000);
    }
}

#[test]
fn infinite_contact_capacity_is_untouched() {
    // Huge window and bitrate: capacity saturates to the sentinel.
    let mut table = table_with_one_contact(u64::MAX / 2, 0, u32::MAX as u64);
    let id = table.lookup_node("dtn://b/").unwrap().contacts[0];
    assert!(table.contact(id).unwrap().is_infinite());

    let bundle = payload_bundle(100, 0);
    router::route_bundle(
        &mut table,
        &RouterConfig::default(),
        &unlimited_mbs,
        bundle,
        0,
    )
    .unwrap();
    let contact = table.contact(id).unwrap();
    assert_eq!(contact.bundles.len(), 1);
    assert_eq!(contact.remaining, [CAPACITY_INFINITE; 3]);
}
