//! Builders and doubles for exercising the core without a network.

use crate::node::{ContactSpec, NodeSpec};
use bpa_proto::bundle::{Bundle, BundleFlags};
use bpa_proto::time::{DtnTime, ManualTimeProvider};
use std::sync::Arc;

/// A manual clock starting at one day past the DTN epoch, so bundle
/// lifetimes never underflow in tests.
pub fn manual_clock() -> Arc<ManualTimeProvider> {
    Arc::new(ManualTimeProvider::new(86_400_000))
}

/// A small BPv7 bundle with a 60 s lifetime.
pub fn small_bundle(source: &str, destination: &str, payload: &[u8], now_ms: DtnTime) -> Bundle {
    Bundle::new_v7(
        source,
        destination,
        now_ms,
        1,
        60_000,
        BundleFlags::empty(),
        payload.to_vec(),
    )
    .expect("valid test bundle")
}

/// A node spec with a single contact window.
pub fn node_with_contact(
    eid: &str,
    cla_addr: &str,
    from_ms: DtnTime,
    to_ms: DtnTime,
    bitrate: u64,
) -> NodeSpec {
    NodeSpec {
        eid: eid.to_string(),
        cla_addr: Some(cla_addr.to_string()),
        endpoints: Vec::new(),
        contacts: vec![ContactSpec {
            from_ms,
            to_ms,
            bitrate_bytes_per_s: bitrate,
            contact_endpoints: Vec::new(),
        }],
    }
}
