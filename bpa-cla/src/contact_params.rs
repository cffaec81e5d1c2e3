//! Multi-link bookkeeping for CLAs that maintain one connection per
//! peer address (the TCP family).

use crate::link::ClaLink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-connection state of a multi-link CLA.
#[derive(Default)]
pub struct ContactParams {
    /// Whether a scheduled contact currently claims this connection.
    /// Connections without a contact are opportunistic and may be
    /// closed by the CLA's policy.
    pub in_contact: bool,
    /// Attempts made in the current outgoing connection cycle.
    pub connect_attempts: u32,
    /// The established link, once the connection is up.
    pub link: Option<Arc<ClaLink>>,
}

/// Table from CLA-specific address to connection state.
///
/// Creation races between concurrent `start_scheduled_contact` calls
/// are resolved by the table lock: the second caller finds the
/// existing entry and merely marks it as in-contact.
#[derive(Default)]
pub struct ContactParamTable {
    entries: Mutex<HashMap<String, Arc<Mutex<ContactParams>>>>,
}

impl ContactParamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `addr`, creating it if absent. The second
    /// element tells the caller whether it created the entry (and thus
    /// owns launching the connection task).
    pub fn get_or_create(&self, addr: &str) -> (Arc<Mutex<ContactParams>>, bool) {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(addr) {
            return (existing.clone(), false);
        }
        let entry = Arc::new(Mutex::new(ContactParams::default()));
        entries.insert(addr.to_string(), entry.clone());
        (entry, true)
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Mutex<ContactParams>>> {
        self.entries.lock().get(addr).cloned()
    }

    pub fn remove(&self, addr: &str) -> Option<Arc<Mutex<ContactParams>>> {
        self.entries.lock().remove(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
