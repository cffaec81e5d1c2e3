//! Known nodes and their scheduled contacts.

use bpa_proto::bundle::{Bundle, RoutingPriority};
use bpa_proto::time::DtnTime;

/// Arena key of a contact inside the routing table.
pub type ContactId = u64;

/// Sentinel for contacts of unbounded capacity.
pub const CAPACITY_INFINITE: i64 = i32::MAX as i64;

/// A neighboring node the agent can route through.
#[derive(Debug, Clone)]
pub struct Node {
    pub eid: String,
    /// CLA address the node is reachable at, e.g. `"mtcp:10.0.0.2:4224"`.
    pub cla_addr: Option<String>,
    /// Non-node EIDs served via this node; sorted, deduplicated.
    pub endpoints: Vec<String>,
    /// Contacts of this node, sorted by `from_ms`, non-overlapping.
    pub contacts: Vec<ContactId>,
}

/// A scheduled communication window with a node.
#[derive(Debug, Clone)]
pub struct Contact {
    pub id: ContactId,
    /// Back-reference by EID; cleared when the owning node is deleted
    /// while the contact is still active.
    pub node_eid: Option<String>,
    /// Half-open window `[from_ms, to_ms)`.
    pub from_ms: DtnTime,
    pub to_ms: DtnTime,
    pub bitrate_bytes_per_s: u64,
    pub total_capacity: i64,
    /// Remaining capacity per priority class; `P0 >= P1 >= P2`.
    pub remaining: [i64; 3],
    /// Extra endpoints reachable only during this contact.
    pub contact_endpoints: Vec<String>,
    /// Bundles committed for transmission during this contact, FIFO.
    pub bundles: Vec<Bundle>,
    pub active: bool,
}

/// A contact as submitted through the configuration interface, before
/// it is assigned an arena id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContactSpec {
    pub from_ms: DtnTime,
    pub to_ms: DtnTime,
    pub bitrate_bytes_per_s: u64,
    pub contact_endpoints: Vec<String>,
}

/// A node as submitted through the configuration interface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeSpec {
    pub eid: String,
    pub cla_addr: Option<String>,
    pub endpoints: Vec<String>,
    pub contacts: Vec<ContactSpec>,
}

pub(crate) fn windows_overlap(a_from: u64, a_to: u64, b_from: u64, b_to: u64) -> bool {
    a_from < b_to && a_to > b_from
}

impl ContactSpec {
    pub fn overlaps(&self, other: &ContactSpec) -> bool {
        windows_overlap(self.from_ms, self.to_ms, other.from_ms, other.to_ms)
    }
}

impl Contact {
    pub(crate) fn from_spec(id: ContactId, node_eid: &str, spec: ContactSpec) -> Self {
        let mut c = Self {
            id,
            node_eid: Some(node_eid.to_string()),
            from_ms: spec.from_ms,
            to_ms: spec.to_ms,
            bitrate_bytes_per_s: spec.bitrate_bytes_per_s,
            total_capacity: 0,
            remaining: [0; 3],
            contact_endpoints: spec.contact_endpoints,
            bundles: Vec::new(),
            active: false,
        };
        c.recalculate_capacity();
        c
    }

    pub fn overlaps(&self, other: &Contact) -> bool {
        windows_overlap(self.from_ms, self.to_ms, other.from_ms, other.to_ms)
    }

    /// Recomputes the total capacity from duration and bitrate and
    /// applies the difference to all remaining-capacity counters.
    /// Overflowing or out-of-range capacities become "infinite".
    pub fn recalculate_capacity(&mut self) {
        let duration_s = (self.to_ms.saturating_sub(self.from_ms) + 500) / 1000;
        let new_capacity = duration_s.checked_mul(self.bitrate_bytes_per_s);
        match new_capacity {
            Some(cap) if (cap as i64) < CAPACITY_INFINITE => {
                let difference = cap as i64 - self.total_capacity;
                self.total_capacity = cap as i64;
                for r in self.remaining.iter_mut() {
                    *r += difference;
                }
            }
            _ => {
                self.total_capacity = CAPACITY_INFINITE;
                self.remaining = [CAPACITY_INFINITE; 3];
            }
        }
    }

    /// Remaining capacity for a priority class at time `now_ms`,
    /// linearly scaled down over the remaining window.
    pub fn remaining_capacity(&self, prio: RoutingPriority, now_ms: DtnTime) -> i64 {
        if now_ms >= self.to_ms {
            return 0;
        }
        let class_remaining = self.remaining[prio as usize];
        if now_ms <= self.from_ms {
            return class_remaining;
        }
        if self.total_capacity >= CAPACITY_INFINITE {
            return CAPACITY_INFINITE;
        }
        let window = self.to_ms - self.from_ms;
        let left = self.to_ms - now_ms;
        let time_scaled = (self.total_capacity as u64 * left / window) as i64;
        time_scaled.min(class_remaining)
    }

    pub fn is_infinite(&self) -> bool {
        self.total_capacity >= CAPACITY_INFINITE
    }
}

/// Adds `eid` to a sorted endpoint list, ignoring duplicates.
pub(crate) fn endpoint_list_add(list: &mut Vec<String>, eid: String) {
    if let Err(pos) = list.binary_search(&eid) {
        list.insert(pos, eid);
    }
}

/// Removes `eid` from a sorted endpoint list.
pub(crate) fn endpoint_list_remove(list: &mut Vec<String>, eid: &str) -> bool {
    if let Ok(pos) = list.binary_search_by(|e| e.as_str().cmp(eid)) {
        list.remove(pos);
        true
    } else {
        false
    }
}

/// Sorts and deduplicates an endpoint list in place.
pub(crate) fn endpoint_list_strip_and_sort(list: &mut Vec<String>) {
    list.sort();
    list.dedup();
}

impl NodeSpec {
    /// Normalizes the spec and checks that its contacts are well-formed:
    /// sorted by start time, non-empty windows, and mutually
    /// non-overlapping.
    pub fn prepare_and_verify(&mut self) -> bool {
        if self.eid.is_empty() {
            return false;
        }
        self.contacts.sort_by_key(|c| c.from_ms);
        endpoint_list_strip_and_sort(&mut self.endpoints);
        for (i, c) in self.contacts.iter().enumerate() {
            if c.from_ms >= c.to_ms {
                return false;
            }
            if self.contacts[i + 1..].iter().any(|other| c.overlaps(other)) {
                return false;
            }
        }
        for c in self.contacts.iter_mut() {
            endpoint_list_strip_and_sort(&mut c.contact_endpoints);
        }
        true
    }
}
