//! Delivery-side duplicate suppression: a list of bundle identifiers
//! ordered by expiration deadline, lazily garbage-collected on insert.

use bpa_proto::bundle::{Bundle, BundleUniqueId};
use bpa_proto::time::DtnTime;

#[derive(Debug)]
struct KnownEntry {
    id: BundleUniqueId,
    deadline_ms: DtnTime,
}

#[derive(Debug, Default)]
pub struct KnownBundleList {
    entries: Vec<KnownEntry>,
}

impl KnownBundleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks whether the bundle is already known and records it if
    /// not. Expired entries encountered during the scan are dropped.
    /// Bundles already past their own deadline count as known.
    ///
    /// Returns `true` iff the bundle was known before the call.
    pub fn check_and_add(&mut self, bundle: &Bundle, now_ms: DtnTime) -> bool {
        let deadline_ms = bundle.expiration_time_ms(now_ms);
        if deadline_ms < now_ms {
            return true;
        }
        let mut insert_at = None;
        let mut i = 0;
        while i < self.entries.len() {
            let e = &self.entries[i];
            // Purge before matching: a stale entry must never count as
            // a hit, or sequence-number reuse after a clock re-sync
            // would suppress fresh bundles.
            if e.deadline_ms < now_ms {
                self.entries.remove(i);
                continue;
            }
            if bundle.matches_id(&e.id) {
                return true;
            }
            if e.deadline_ms > deadline_ms {
                // The list is deadline-ordered; no match past here.
                insert_at = Some(i);
                break;
            }
            i += 1;
        }
        let pos = insert_at.unwrap_or(self.entries.len());
        self.entries.insert(
            pos,
            KnownEntry {
                id: bundle.unique_id(),
                deadline_ms,
            },
        );
        false
    }

    /// Whether the original ADU of this fragment was already delivered
    /// (recorded under the synthetic reassembled key).
    pub fn reassembled_is_known(&self, bundle: &Bundle, now_ms: DtnTime) -> bool {
        let deadline_ms = bundle.expiration_time_ms(now_ms);
        for e in &self.entries {
            if bundle.matches_parent_id(&e.id)
                && e.id.fragment_offset == 0
                && e.id.payload_length == bundle.total_adu_length
            {
                return true;
            }
            if e.deadline_ms > deadline_ms {
                break;
            }
        }
        false
    }

    /// Records a reassembled ADU under its synthetic key
    /// `{offset: 0, length: total_adu_length}`.
    pub fn add_reassembled(&mut self, bundle: &Bundle, now_ms: DtnTime) {
        let deadline_ms = bundle.expiration_time_ms(now_ms);
        let mut id = bundle.unique_id();
        id.fragment_offset = 0;
        id.payload_length = bundle.total_adu_length;
        let pos = self
            .entries
            .iter()
            .position(|e| e.deadline_ms > deadline_ms)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, KnownEntry { id, deadline_ms });
    }

    /// Whether an equal identifier is currently recorded. Test aid.
    pub fn contains(&self, id: &BundleUniqueId) -> bool {
        self.entries.iter().any(|e| e.id == *id)
    }
}
