//! In-memory index of known nodes, their reachable endpoints, and
//! scheduled contacts.
//!
//! The table owns all nodes and contacts. Contacts live in an arena
//! keyed by [`ContactId`]; the per-node contact lists, the global
//! start-time ordering, and the endpoint reverse index refer to them by
//! id. Queued bundles of removed or shrunken contacts are handed to an
//! injected rescheduling hook so the table stays transport-agnostic.

use crate::node::{
    endpoint_list_add, endpoint_list_remove, Contact, ContactId, Node, NodeSpec,
};
use crate::router;
use bpa_proto::bundle::Bundle;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Hook invoked for every bundle that lost its transmission slot.
pub type Rescheduler<'a> = &'a mut dyn FnMut(Bundle);

#[derive(Debug, Default)]
pub struct RoutingTable {
    nodes: HashMap<String, Node>,
    contacts: HashMap<ContactId, Contact>,
    /// Endpoint EID -> contacts serving it, sorted by `to_ms`.
    eid_index: HashMap<String, Vec<ContactId>>,
    /// All contacts, sorted by `from_ms`; walked by the contact manager.
    by_from: Vec<ContactId>,
    next_id: ContactId,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Lookup --------------------------------------------------------

    pub fn lookup_node(&self, eid: &str) -> Option<&Node> {
        self.nodes.get(eid)
    }

    /// Contacts serving the given endpoint EID, ordered by end time.
    pub fn lookup_eid(&self, eid: &str) -> Option<&[ContactId]> {
        self.eid_index.get(eid).map(|v| v.as_slice())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn contact(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    pub fn contact_mut(&mut self, id: ContactId) -> Option<&mut Contact> {
        self.contacts.get_mut(&id)
    }

    /// All contacts ordered by start time.
    pub fn contacts_by_from(&self) -> &[ContactId] {
        &self.by_from
    }

    // Index maintenance ---------------------------------------------

    fn index_add(&mut self, eid: &str, id: ContactId) {
        let to_ms = match self.contacts.get(&id) {
            Some(c) => c.to_ms,
            None => return,
        };
        let list = self.eid_index.entry(eid.to_string()).or_default();
        if list.contains(&id) {
            return;
        }
        let pos = list
            .iter()
            .position(|other| {
                self.contacts
                    .get(other)
                    .map(|c| c.to_ms > to_ms)
                    .unwrap_or(false)
            })
            .unwrap_or(list.len());
        list.insert(pos, id);
    }

    fn index_remove(&mut self, eid: &str, id: ContactId) {
        if let Some(list) = self.eid_index.get_mut(eid) {
            list.retain(|c| *c != id);
            if list.is_empty() {
                self.eid_index.remove(eid);
            }
        }
    }

    fn global_add(&mut self, id: ContactId) {
        if self.by_from.contains(&id) {
            return;
        }
        let from_ms = match self.contacts.get(&id) {
            Some(c) => c.from_ms,
            None => return,
        };
        let pos = self
            .by_from
            .iter()
            .position(|other| {
                self.contacts
                    .get(other)
                    .map(|c| c.from_ms > from_ms)
                    .unwrap_or(false)
            })
            .unwrap_or(self.by_from.len());
        self.by_from.insert(pos, id);
    }

    fn global_remove(&mut self, id: ContactId) {
        self.by_from.retain(|c| *c != id);
    }

    /// Registers one contact under every EID it serves: the node ID,
    /// the node-wide endpoints, and the contact-only endpoints.
    fn add_contact_to_tables(&mut self, node_eid: &str, id: ContactId) {
        self.index_add(node_eid, id);
        let endpoints = self
            .nodes
            .get(node_eid)
            .map(|n| n.endpoints.clone())
            .unwrap_or_default();
        for eid in endpoints {
            self.index_add(&eid, id);
        }
        let contact_endpoints = self
            .contacts
            .get(&id)
            .map(|c| c.contact_endpoints.clone())
            .unwrap_or_default();
        for eid in contact_endpoints {
            self.index_add(&eid, id);
        }
        self.global_add(id);
    }

    fn remove_contact_from_tables(&mut self, node_eid: &str, id: ContactId) {
        self.index_remove(node_eid, id);
        let endpoints = self
            .nodes
            .get(node_eid)
            .map(|n| n.endpoints.clone())
            .unwrap_or_default();
        for eid in endpoints {
            self.index_remove(&eid, id);
        }
        let contact_endpoints = self
            .contacts
            .get(&id)
            .map(|c| c.contact_endpoints.clone())
            .unwrap_or_default();
        for eid in contact_endpoints {
            self.index_remove(&eid, id);
        }
        self.global_remove(id);
    }

    fn add_node_to_tables(&mut self, eid: &str) {
        let ids = self
            .nodes
            .get(eid)
            .map(|n| n.contacts.clone())
            .unwrap_or_default();
        for id in ids {
            self.add_contact_to_tables(eid, id);
        }
    }

    fn remove_node_from_tables(&mut self, eid: &str) {
        let ids = self
            .nodes
            .get(eid)
            .map(|n| n.contacts.clone())
            .unwrap_or_default();
        for id in ids {
            self.remove_contact_from_tables(eid, id);
        }
    }

    // Rescheduling ---------------------------------------------------

    /// Empties a contact's bundle queue, restores its capacity
    /// counters, and hands every bundle to the rescheduler.
    fn reschedule_bundles(&mut self, id: ContactId, resched: Rescheduler) {
        if let Some(contact) = self.contacts.get_mut(&id) {
            for bundle in router::drain_bundles(contact) {
                resched(bundle);
            }
        }
    }

    // Mutation -------------------------------------------------------

    /// Merges every other contact of `eid` that overlaps `id` into it.
    /// Absorbed contacts lose their transmission slots; their queued
    /// bundles go back through the rescheduler.
    fn absorb_overlapping_contacts(
        &mut self,
        eid: &str,
        id: ContactId,
        capacity_modified: &mut Vec<ContactId>,
        resched: Rescheduler,
    ) {
        loop {
            let (from_ms, to_ms) = match self.contacts.get(&id) {
                Some(c) => (c.from_ms, c.to_ms),
                None => return,
            };
            let other = self
                .nodes
                .get(eid)
                .map(|n| n.contacts.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|c| *c != id)
                .find(|c| {
                    self.contacts
                        .get(c)
                        .map(|c| crate::node::windows_overlap(c.from_ms, c.to_ms, from_ms, to_ms))
                        .unwrap_or(false)
                });
            let Some(absorbed_id) = other else {
                return;
            };
            self.reschedule_bundles(absorbed_id, resched);
            self.remove_contact_from_tables(eid, absorbed_id);
            if let Some(node) = self.nodes.get_mut(eid) {
                node.contacts.retain(|c| *c != absorbed_id);
            }
            let absorbed = self.contacts.remove(&absorbed_id);
            if let (Some(absorbed), Some(contact)) = (absorbed, self.contacts.get_mut(&id)) {
                contact.from_ms = contact.from_ms.min(absorbed.from_ms);
                contact.to_ms = contact.to_ms.max(absorbed.to_ms);
                for ep in absorbed.contact_endpoints {
                    endpoint_list_add(&mut contact.contact_endpoints, ep);
                }
                contact.recalculate_capacity();
                if !capacity_modified.contains(&id) {
                    capacity_modified.push(id);
                }
            }
        }
    }

    fn insert_new_node(&mut self, mut spec: NodeSpec) -> bool {
        if spec.cla_addr.is_none() {
            warn!(eid = %spec.eid, "rejecting new node without CLA address");
            return false;
        }
        let eid = spec.eid.clone();
        let mut node = Node {
            eid: eid.clone(),
            cla_addr: spec.cla_addr.take(),
            endpoints: std::mem::take(&mut spec.endpoints),
            contacts: Vec::new(),
        };
        let mut ids = Vec::with_capacity(spec.contacts.len());
        for cs in spec.contacts {
            self.next_id += 1;
            let id = self.next_id;
            self.contacts.insert(id, Contact::from_spec(id, &eid, cs));
            ids.push(id);
        }
        node.contacts = ids;
        self.nodes.insert(eid.clone(), node);
        self.add_node_to_tables(&eid);
        true
    }

    /// Inserts a node or merges it into an existing entry with the same
    /// EID: the CLA address is replaced iff the new one is non-empty,
    /// endpoint lists are unioned, and contacts are merged pairwise
    /// (overlapping windows are combined and their capacity recomputed).
    /// Contacts whose `P0` capacity went negative through the merge have
    /// their queued bundles rescheduled.
    pub fn add_node(&mut self, mut spec: NodeSpec, resched: Rescheduler) -> bool {
        if !spec.prepare_and_verify() {
            return false;
        }
        if !self.nodes.contains_key(&spec.eid) {
            return self.insert_new_node(spec);
        }
        let eid = spec.eid.clone();
        let mut capacity_modified: Vec<ContactId> = Vec::new();

        {
            let node = self.nodes.get_mut(&eid).expect("checked above");
            match spec.cla_addr.take() {
                Some(addr) if !addr.is_empty() => node.cla_addr = Some(addr),
                _ => {}
            }
            for ep in std::mem::take(&mut spec.endpoints) {
                endpoint_list_add(&mut node.endpoints, ep);
            }
        }

        for cs in spec.contacts {
            let existing = self
                .nodes
                .get(&eid)
                .map(|n| n.contacts.clone())
                .unwrap_or_default();
            let overlap = existing.iter().copied().find(|id| {
                self.contacts
                    .get(id)
                    .map(|c| crate::node::windows_overlap(c.from_ms, c.to_ms, cs.from_ms, cs.to_ms))
                    .unwrap_or(false)
            });
            match overlap {
                Some(id) => {
                    // Window changes alter `to_ms`/`from_ms` ordering;
                    // drop the contact from the indices first.
                    self.remove_contact_from_tables(&eid, id);
                    let contact = self.contacts.get_mut(&id).expect("contact in arena");
                    let old_duration = contact.to_ms - contact.from_ms;
                    contact.from_ms = contact.from_ms.min(cs.from_ms);
                    contact.to_ms = contact.to_ms.max(cs.to_ms);
                    for ep in cs.contact_endpoints {
                        endpoint_list_add(&mut contact.contact_endpoints, ep);
                    }
                    if contact.bitrate_bytes_per_s != cs.bitrate_bytes_per_s
                        || contact.to_ms - contact.from_ms != old_duration
                    {
                        contact.bitrate_bytes_per_s = cs.bitrate_bytes_per_s;
                        contact.recalculate_capacity();
                        capacity_modified.push(id);
                    }
                    // The grown window may now reach into further
                    // stored contacts; absorb them to keep the
                    // non-overlap invariant.
                    self.absorb_overlapping_contacts(&eid, id, &mut capacity_modified, resched);
                    self.add_contact_to_tables(&eid, id);
                }
                None => {
                    self.next_id += 1;
                    let id = self.next_id;
                    self.contacts.insert(id, Contact::from_spec(id, &eid, cs));
                    if let Some(node) = self.nodes.get_mut(&eid) {
                        node.contacts.push(id);
                    }
                    self.add_contact_to_tables(&eid, id);
                }
            }
        }

        // Keep the per-node list sorted by start time after merges.
        if let Some(node) = self.nodes.get_mut(&eid) {
            let contacts = &self.contacts;
            node.contacts
                .sort_by_key(|id| contacts.get(id).map(|c| c.from_ms).unwrap_or(u64::MAX));
        }
        // New node-wide endpoints must cover the existing contacts too.
        self.add_node_to_tables(&eid);

        for id in capacity_modified {
            let negative = self
                .contacts
                .get(&id)
                .map(|c| c.remaining[0] < 0)
                .unwrap_or(false);
            if negative {
                debug!(contact = id, "contact capacity shrunk, rescheduling bundles");
                self.reschedule_bundles(id, resched);
            }
        }
        true
    }

    /// Replaces a node wholesale: the previous entry's contacts are
    /// dropped (their bundles rescheduled) before the new one is added.
    pub fn replace_node(&mut self, mut spec: NodeSpec, resched: Rescheduler) -> bool {
        if !spec.prepare_and_verify() {
            return false;
        }
        if !self.nodes.contains_key(&spec.eid) {
            return false;
        }
        self.delete_node_by_eid(&spec.eid.clone(), resched);
        self.insert_new_node(spec)
    }

    /// Removes a node and all its contacts. Active contacts are
    /// detached and survive in the arena until their end is signalled.
    pub fn delete_node_by_eid(&mut self, eid: &str, resched: Rescheduler) -> bool {
        if !self.nodes.contains_key(eid) {
            return false;
        }
        self.remove_node_from_tables(eid);
        let node = self.nodes.remove(eid).expect("checked above");
        for id in node.contacts {
            self.reschedule_bundles(id, resched);
            let active = self.contacts.get(&id).map(|c| c.active).unwrap_or(false);
            if active {
                // Must not free an active contact; it is detached and
                // reaped on contact-end.
                if let Some(c) = self.contacts.get_mut(&id) {
                    c.node_eid = None;
                }
            } else {
                self.contacts.remove(&id);
            }
        }
        true
    }

    /// Deletes a whole node (empty endpoint and contact lists) or only
    /// the listed endpoints and contacts. Contact matches are exact on
    /// `(from_ms, to_ms)`.
    pub fn delete_node(&mut self, mut spec: NodeSpec, resched: Rescheduler) -> bool {
        if !spec.prepare_and_verify() {
            return false;
        }
        if !self.nodes.contains_key(&spec.eid) {
            return false;
        }
        if spec.endpoints.is_empty() && spec.contacts.is_empty() {
            return self.delete_node_by_eid(&spec.eid.clone(), resched);
        }
        let eid = spec.eid.clone();
        self.remove_node_from_tables(&eid);
        {
            let node = self.nodes.get_mut(&eid).expect("checked above");
            for ep in &spec.endpoints {
                endpoint_list_remove(&mut node.endpoints, ep);
            }
        }
        for cs in spec.contacts {
            let matching = self
                .nodes
                .get(&eid)
                .map(|n| n.contacts.clone())
                .unwrap_or_default()
                .into_iter()
                .find(|id| {
                    self.contacts
                        .get(id)
                        .map(|c| c.from_ms == cs.from_ms && c.to_ms == cs.to_ms)
                        .unwrap_or(false)
                });
            let Some(id) = matching else {
                continue;
            };
            if cs.contact_endpoints.is_empty() {
                // Delete the whole contact.
                self.reschedule_bundles(id, resched);
                if let Some(node) = self.nodes.get_mut(&eid) {
                    node.contacts.retain(|c| *c != id);
                }
                let active = self.contacts.get(&id).map(|c| c.active).unwrap_or(false);
                if active {
                    if let Some(c) = self.contacts.get_mut(&id) {
                        c.node_eid = None;
                    }
                } else {
                    self.contacts.remove(&id);
                }
            } else {
                // Remove only the listed contact endpoints.
                if let Some(c) = self.contacts.get_mut(&id) {
                    for ep in &cs.contact_endpoints {
                        endpoint_list_remove(&mut c.contact_endpoints, ep);
                    }
                }
                self.reschedule_bundles(id, resched);
            }
        }
        self.add_node_to_tables(&eid);
        true
    }

    /// Removes a contact from every index and the arena. The contact
    /// must not hold queued bundles anymore.
    pub fn delete_contact(&mut self, id: ContactId) {
        let Some(contact) = self.contacts.get(&id) else {
            return;
        };
        debug_assert!(contact.bundles.is_empty());
        let node_eid = contact.node_eid.clone();
        if let Some(node_eid) = node_eid {
            self.remove_contact_from_tables(&node_eid, id);
            if let Some(node) = self.nodes.get_mut(&node_eid) {
                node.contacts.retain(|c| *c != id);
            }
        } else {
            // Detached contact: only contact-level entries remain.
            let eids = self
                .contacts
                .get(&id)
                .map(|c| c.contact_endpoints.clone())
                .unwrap_or_default();
            for eid in eids {
                self.index_remove(&eid, id);
            }
            self.global_remove(id);
        }
        self.contacts.remove(&id);
    }

    /// Finalizes a contact whose scheduled window has passed: queued
    /// bundles are handed to the rescheduler and the contact is
    /// removed. Ids of already-deleted contacts are ignored.
    pub fn contact_passed(&mut self, id: ContactId, resched: Rescheduler) {
        if !self.contacts.contains_key(&id) {
            return;
        }
        self.reschedule_bundles(id, resched);
        self.delete_contact(id);
    }
}
