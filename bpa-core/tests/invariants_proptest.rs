//! Property tests for the routing-table and capacity invariants.

use bpa_core::node::{ContactSpec, NodeSpec};
use bpa_core::router;
use bpa_core::routing_table::RoutingTable;
use bpa_core::testing::small_bundle;
use proptest::prelude::*;

fn contact_spec_strategy() -> impl Strategy<Value = ContactSpec> {
    (0u64..200, 1u64..100, 1u64..2000).prop_map(|(from_s, len_s, rate)| ContactSpec {
        from_ms: from_s * 1000,
        to_ms: (from_s + len_s) * 1000,
        bitrate_bytes_per_s: rate,
        contact_endpoints: Vec::new(),
    })
}

#[derive(Debug, Clone)]
enum Op {
    Add(Vec<ContactSpec>),
    DeleteContact(ContactSpec),
    DeleteNode,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        prop::collection::vec(contact_spec_strategy(), 0..4).prop_map(Op::Add),
        contact_spec_strategy().prop_map(Op::DeleteContact),
        Just(Op::DeleteNode),
    ]
}

proptest! {
    /// Invariant: after any sequence of node mutations, the contacts
    /// of a node never overlap in time.
    #[test]
    fn node_contacts_never_overlap(ops in prop::collection::vec(op_strategy(), 1..12)) {
        let mut table = RoutingTable::new();
        let mut sink = |_b| {};
        for op in ops {
            match op {
                Op::Add(contacts) => {
                    let spec = NodeSpec {
                        eid: "dtn://b/".into(),
                        cla_addr: Some("mtcp:x".into()),
                        endpoints: Vec::new(),
                        contacts,
                    };
                    table.add_node(spec, &mut sink);
                }
                Op::DeleteContact(c) => {
                    let spec = NodeSpec {
                        eid: "dtn://b/".into(),
                        contacts: vec![c],
                        ..Default::default()
                    };
                    table.delete_node(spec, &mut sink);
                }
                Op::DeleteNode => {
                    table.delete_node_by_eid("dtn://b/", &mut sink);
                }
            }

            if let Some(node) = table.lookup_node("dtn://b/") {
                let windows: Vec<(u64, u64)> = node
                    .contacts
                    .iter()
                    .filter_map(|id| table.contact(*id))
                    .map(|c| (c.from_ms, c.to_ms))
                    .collect();
                for (i, a) in windows.iter().enumerate() {
                    prop_assert!(a.0 < a.1);
                    for b in &windows[i + 1..] {
                        prop_assert!(
                            a.1 <= b.0 || b.1 <= a.0,
                            "windows {a:?} and {b:?} overlap"
                        );
                    }
                }
            }
        }
    }

    /// Invariant: committing and removing bundles preserves
    /// `P0 >= P1 >= P2` and removal restores the pre-commit counters.
    #[test]
    fn capacity_counters_are_ordered_and_restorable(
        payload_sizes in prop::collection::vec(1usize..600, 1..6),
    ) {
        let mut table = RoutingTable::new();
        let spec = NodeSpec {
            eid: "dtn://b/".into(),
            cla_addr: Some("mtcp:x".into()),
            endpoints: Vec::new(),
            contacts: vec![ContactSpec {
                from_ms: 0,
                to_ms: 1_000_000,
                bitrate_bytes_per_s: 1_000,
                contact_endpoints: Vec::new(),
            }],
        };
        let mut sink = |_b| {};
        prop_assert!(table.add_node(spec, &mut sink));
        let id = table.lookup_node("dtn://b/").unwrap().contacts[0];
        let before = table.contact(id).unwrap().remaining;

        let mut ids = Vec::new();
        for (i, size) in payload_sizes.iter().enumerate() {
            let bundle = small_bundle(
                "dtn://a/app",
                "dtn://b/app",
                &vec![0u8; *size],
                1_000 + i as u64,
            );
            ids.push(bundle.unique_id());
            let contact = table.contact_mut(id).unwrap();
            router::add_bundle_to_contact(contact, bundle);
            prop_assert!(contact.remaining[0] >= contact.remaining[1]);
            prop_assert!(contact.remaining[1] >= contact.remaining[2]);
        }

        for uid in &ids {
            let contact = table.contact_mut(id).unwrap();
            prop_assert!(router::remove_bundle_from_contact(contact, uid).is_some());
        }
        prop_assert_eq!(table.contact(id).unwrap().remaining, before);
    }
}
