use bpa_proto::bundle::{
    blocks, Block, BlockFlags, BlockType, Bundle, BundleFlags, ProtocolVersion,
    RetentionConstraints, RoutingPriority,
};

fn v7_bundle(payload: &[u8]) -> Bundle {
    Bundle::new_v7(
        "dtn://src/app",
        "dtn://dst/app",
        1_000_000,
        7,
        60_000,
        BundleFlags::empty(),
        payload.to_vec(),
    )
    .unwrap()
}

#[test]
fn create_rejects_bad_eids_and_consumes_payload() {
    let payload = vec![1, 2, 3];
    let err = Bundle::new_v7(
        "nonsense",
        "dtn://dst/",
        0,
        0,
        1000,
        BundleFlags::empty(),
        payload,
    );
    assert!(err.is_err());
}

#[test]
fn payload_block_is_last_and_unique() {
    let b = v7_bundle(b"hello");
    assert!(b.verify_blocks().is_ok());
    assert_eq!(b.payload_length(), 5);
    assert_eq!(b.blocks.last().unwrap().block_type, BlockType::Payload);
}

#[test]
fn anonymous_bundle_gets_age_block() {
    let b = Bundle::new_v7(
        "dtn://src/",
        "dtn://dst/",
        0,
        0,
        60_000,
        BundleFlags::empty(),
        b"x".to_vec(),
    )
    .unwrap();
    assert!(b.block_by_type(BlockType::BundleAge).is_some());
}

#[test]
fn expiration_with_creation_time() {
    let b = v7_bundle(b"x");
    assert_eq!(b.expiration_time_ms(0), 1_060_000);
}

#[test]
fn expiration_from_age_block() {
    let mut b = Bundle::new_v7(
        "dtn://src/",
        "dtn://dst/",
        0,
        0,
        60_000,
        BundleFlags::empty(),
        b"x".to_vec(),
    )
    .unwrap();
    // Received at t=100_000 with an age of 10s already accumulated.
    b.reception_timestamp_ms = 100_000;
    b.block_by_type_mut(BlockType::BundleAge).unwrap().data =
        blocks::bundle_age_serialize(10_000);
    // At t=130_000 the residence time is 30s, total age 40s:
    // 20s of lifetime remain.
    assert_eq!(b.expiration_time_ms(130_000), 150_000);
}

#[test]
fn expiration_without_age_block_is_zero() {
    let mut b = v7_bundle(b"x");
    b.creation_timestamp_ms = 0;
    assert_eq!(b.expiration_time_ms(5000), 0);
}

#[test]
fn bundle_age_update_accumulates() {
    let mut b = Bundle::new_v7(
        "dtn://src/",
        "dtn://dst/",
        0,
        0,
        60_000,
        BundleFlags::empty(),
        b"x".to_vec(),
    )
    .unwrap();
    b.update_bundle_age(1500).unwrap();
    b.update_bundle_age(500).unwrap();
    let age =
        blocks::bundle_age_parse(&b.block_by_type(BlockType::BundleAge).unwrap().data).unwrap();
    assert_eq!(age, 2000);
}

#[test]
fn unique_id_matches_same_fragment_only() {
    let a = v7_bundle(b"hello");
    let id = a.unique_id();
    assert!(a.matches_id(&id));

    let mut frag = a.clone();
    frag.proc_flags |= BundleFlags::IS_FRAGMENT;
    frag.fragment_offset = 5;
    frag.total_adu_length = 10;
    assert!(!frag.matches_id(&id));
    assert!(frag.matches_parent_id(&id));
    assert!(frag.same_adu_as(&a));
}

#[test]
fn routing_priorities() {
    let mut b = v7_bundle(b"x");
    assert_eq!(b.routing_priority(), RoutingPriority::Normal);
    b.ret_constraints |= RetentionConstraints::OWN;
    assert_eq!(b.routing_priority(), RoutingPriority::High);

    let mut v6 = Bundle::new_v6(
        "dtn://src/",
        "dtn://dst/",
        1_000_000,
        1,
        60_000,
        BundleFlags::empty(),
        b"x".to_vec(),
    )
    .unwrap();
    assert_eq!(v6.routing_priority(), RoutingPriority::Low);
    v6.proc_flags |= BundleFlags::V6_NORMAL_PRIORITY;
    assert_eq!(v6.routing_priority(), RoutingPriority::Normal);
    v6.proc_flags |= BundleFlags::V6_EXPEDITED_PRIORITY;
    assert_eq!(v6.routing_priority(), RoutingPriority::High);
}

#[test]
fn into_adu_detaches_payload() {
    let mut b = v7_bundle(b"payload");
    b.proc_flags |= BundleFlags::IS_FRAGMENT;
    let adu = b.into_adu();
    assert_eq!(adu.payload, b"payload");
    assert!(!adu.proc_flags.contains(BundleFlags::IS_FRAGMENT));
    assert_eq!(adu.destination.as_deref(), Some("dtn://dst/app"));
}

#[test]
fn fragment_min_sizes_are_conservative() {
    let mut b = v7_bundle(&[0u8; 100]);
    b.blocks.insert(
        0,
        Block::with_data(BlockType::Other(192), vec![0; 16]),
    );
    b.blocks[0].number = 3;
    assert!(b.verify_blocks().is_ok());

    let first = b.first_fragment_min_size();
    let mid = b.mid_fragment_min_size();
    let last = b.last_fragment_min_size();
    // First fragments carry all extension blocks.
    assert!(first > mid);
    // BPv7 middle and last fragments are identical in structure.
    assert_eq!(mid, last);
    // The estimate must cover an actual fragment with empty payload.
    let mut frag = b.clone();
    frag.proc_flags |= BundleFlags::IS_FRAGMENT;
    frag.total_adu_length = 100;
    frag.payload_block_mut().unwrap().data.clear();
    assert!(first >= frag.serialized_size());
}

#[test]
fn previous_node_block_removal() {
    let mut b = v7_bundle(b"x");
    let mut pn = Block::with_data(BlockType::PreviousNode, vec![0x82, 1, 0]);
    pn.number = 4;
    b.blocks.insert(0, pn);
    b.remove_previous_node_block();
    assert!(b.block_by_type(BlockType::PreviousNode).is_none());
    assert_eq!(b.version, ProtocolVersion::V7);
}
