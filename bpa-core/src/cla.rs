//! The convergence-layer adapter interface the core consumes, plus the
//! process-wide CLA registry.

use bpa_proto::bundle::Bundle;
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Commands accepted by a per-link TX task.
#[derive(Debug)]
pub enum TxCommand {
    /// Transmit the given bundles, in order, to the CLA address.
    Bundles {
        bundles: Vec<Bundle>,
        cla_addr: String,
    },
    /// Drain the queue (reporting failures) and exit the TX task.
    Finalize,
}

/// Handle for enqueueing TX commands on an active link.
///
/// Holding the handle keeps the channel alive; the CLA revokes the
/// queue by dropping its sending side, after which sends fail and the
/// caller must treat the bundles as unsent.
#[derive(Debug, Clone)]
pub struct TxQueueHandle {
    pub sender: Sender<TxCommand>,
}

/// The per-CLA vtable. Implementations are registered once at startup
/// and shared across the contact manager and the bundle processor.
pub trait Cla: Send + Sync {
    /// CLA identifier, e.g. `"mtcp"`; the first component of CLA
    /// addresses handled by this adapter.
    fn name(&self) -> &'static str;

    /// Starts the listener/connector tasks. Must not block.
    fn launch(&self);

    /// Maximum bundle size per outgoing transmission; `usize::MAX`
    /// means unlimited.
    fn mbs(&self) -> usize;

    /// Obtains the TX queue of the link serving `cla_addr`, or `None`
    /// if no such link is currently active.
    fn get_tx_queue(&self, eid: &str, cla_addr: &str) -> Option<TxQueueHandle>;

    /// Begins (or joins) a connection for a scheduled contact.
    /// Idempotent for overlapping contacts.
    fn start_scheduled_contact(&self, eid: &str, cla_addr: &str);

    /// Ends a scheduled contact; the CLA decides between keeping the
    /// link opportunistically and closing it.
    fn end_scheduled_contact(&self, eid: &str, cla_addr: &str);
}

/// Maps CLA addresses of the form `"<name>:<rest>"` to the adapter
/// registered under `<name>`.
///
/// Registration happens through a shared reference: adapters hold the
/// processor handle and the processor holds the registry, so the
/// registry must be fillable after both exist.
#[derive(Default)]
pub struct ClaRegistry {
    clas: parking_lot::RwLock<HashMap<&'static str, Arc<dyn Cla>>>,
}

impl ClaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cla: Arc<dyn Cla>) {
        self.clas.write().insert(cla.name(), cla);
    }

    /// Resolves the adapter responsible for a CLA address.
    pub fn by_addr(&self, cla_addr: &str) -> Option<Arc<dyn Cla>> {
        let name = cla_addr.split(':').next()?;
        let cla = self.clas.read().get(name).cloned();
        if cla.is_none() {
            warn!(cla_addr, "no CLA registered for address");
        }
        cla
    }

    /// Maximum bundle size of the adapter behind `cla_addr`.
    pub fn mbs_for(&self, cla_addr: &str) -> Option<usize> {
        let name = cla_addr.split(':').next()?;
        self.clas.read().get(name).map(|c| c.mbs())
    }

    pub fn launch_all(&self) {
        for cla in self.clas.read().values() {
            cla.launch();
        }
    }
}

/// Extracts the CLA-specific part of an address, checking the prefix.
pub fn connect_addr(cla_addr: &str, cla_name: &str) -> Option<String> {
    let (name, rest) = cla_addr.split_once(':')?;
    if name != cla_name {
        return None;
    }
    Some(rest.to_string())
}
