//! Per-link lifecycle: queue publication, task spawning, and the
//! disconnect fan-out.

use crate::{rx_task, tx_task, FramingParser, LinkRx, LinkTx, CONTACT_TX_TASK_QUEUE_LENGTH};
use bpa_core::cla::{TxCommand, TxQueueHandle};
use bpa_core::processor::{BpHandle, Signal};
use bpa_proto::time::TimeProvider;
use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

/// One established link of a CLA.
///
/// Owns the bounded TX command queue and the RX/TX task threads. The
/// queue handle is published under a mutex; revoking it (on
/// disconnect) makes later `get_tx_queue` calls fail so the contact
/// manager re-routes instead of enqueueing into a dying link.
pub struct ClaLink {
    /// Full CLA address of the peer, `"<cla-name>:<addr>"`.
    cla_addr: String,
    /// Published queue handle; `None` once revoked.
    published: Mutex<Option<Sender<TxCommand>>>,
    /// Private sender used to deliver the finalize command even after
    /// revocation.
    control: Sender<TxCommand>,
    shutdown: Box<dyn Fn() + Send + Sync>,
    disconnected: AtomicBool,
    bp: BpHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClaLink {
    /// Initializes the link and spawns its RX and TX tasks. The
    /// new-link signal is emitted only after the TX queue handle is
    /// published.
    pub fn spawn(
        cla_addr: String,
        rx: impl LinkRx + 'static,
        tx: impl LinkTx + 'static,
        framing: impl FramingParser + 'static,
        shutdown: impl Fn() + Send + Sync + 'static,
        bp: BpHandle,
        time: Arc<dyn TimeProvider>,
    ) -> Arc<Self> {
        let (sender, receiver) = bounded(CONTACT_TX_TASK_QUEUE_LENGTH);
        let link = Arc::new(Self {
            cla_addr: cla_addr.clone(),
            published: Mutex::new(Some(sender.clone())),
            control: sender,
            shutdown: Box::new(shutdown),
            disconnected: AtomicBool::new(false),
            bp: bp.clone(),
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let rx_handle = {
            let link = link.clone();
            std::thread::spawn(move || rx_task::run(link, rx, framing))
        };
        let tx_handle = {
            let link = link.clone();
            std::thread::spawn(move || tx_task::run(link, tx, receiver, time))
        };
        link.tasks.lock().extend([rx_handle, tx_handle]);

        info!(cla_addr = %link.cla_addr, "link established");
        bp.send(Signal::NewLinkEstablished { cla_addr });
        link
    }

    pub fn cla_addr(&self) -> &str {
        &self.cla_addr
    }

    pub(crate) fn bp(&self) -> &BpHandle {
        &self.bp
    }

    /// The published TX queue handle, or `None` after revocation.
    pub fn get_tx_queue(&self) -> Option<TxQueueHandle> {
        self.published
            .lock()
            .as_ref()
            .map(|sender| TxQueueHandle {
                sender: sender.clone(),
            })
    }

    /// The generic disconnect handler: shuts the transport down,
    /// revokes the queue, signals the processor, and asks the TX task
    /// to finalize. Idempotent; both the RX task (on read failure) and
    /// the owning CLA (on contact teardown) call it.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(cla_addr = %self.cla_addr, "link disconnecting");
        (self.shutdown)();
        *self.published.lock() = None;
        self.bp.send(Signal::LinkDown {
            cla_addr: self.cla_addr.clone(),
        });
        let _ = self.control.send(TxCommand::Finalize);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Waits for both tasks to exit. Called by the owning CLA after a
    /// disconnect to complete per-link cleanup.
    pub fn wait(&self) {
        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}
