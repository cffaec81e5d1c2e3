//! Time-driven contact activation: starts and ends contacts at their
//! scheduled boundaries and hands queued bundles to the owning CLA.

use crate::cla::{ClaRegistry, TxCommand};
use crate::node::ContactId;
use crate::processor::{BpHandle, Signal};
use crate::routing_table::RoutingTable;
use bitflags::bitflags;
use bpa_proto::time::{DtnTime, TimeProvider};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upper bound on simultaneously active contacts.
pub const MAX_CONCURRENT_CONTACTS: usize = 16;

bitflags! {
    /// What the contact manager should re-check on wake-up.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmSignal: u8 {
        const UPDATE_CONTACT_LIST = 1 << 0;
        const PROCESS_CURRENT_BUNDLES = 1 << 1;
    }
}

/// Wake-up side of the contact manager: pending signal flags plus a
/// channel that unblocks the event loop. Flags are merged, so wake-ups
/// are never lost even when the channel is full.
#[derive(Clone)]
pub struct CmWaker {
    flags: Arc<AtomicU8>,
    sender: Sender<()>,
}

/// Receive side of the wake-up mechanism, owned by the manager.
pub struct CmWakeQueue {
    flags: Arc<AtomicU8>,
    receiver: Receiver<()>,
}

impl CmWaker {
    /// Creates the wake-up pair. The waker half is cloneable and is
    /// shared with the bundle processor and the CLAs.
    pub fn new() -> (CmWaker, CmWakeQueue) {
        let (sender, receiver) = bounded(1);
        let flags = Arc::new(AtomicU8::new(0));
        (
            CmWaker {
                flags: flags.clone(),
                sender,
            },
            CmWakeQueue { flags, receiver },
        )
    }

    pub fn wake(&self, signal: CmSignal) {
        self.flags.fetch_or(signal.bits(), Ordering::Release);
        let _ = self.sender.try_send(());
    }
}

struct ActiveContact {
    id: ContactId,
    eid: String,
    cla_addr: String,
}

/// The contact manager state machine. [`ContactManager::run`] drives it
/// on a dedicated thread; tests call [`ContactManager::manage`]
/// directly.
pub struct ContactManager {
    routing: Arc<Mutex<RoutingTable>>,
    registry: Arc<ClaRegistry>,
    bp: BpHandle,
    time: Arc<dyn TimeProvider>,
    current: Vec<ActiveContact>,
    next_event_ms: DtnTime,
    wake_queue: CmWakeQueue,
}

impl ContactManager {
    pub fn new(
        routing: Arc<Mutex<RoutingTable>>,
        registry: Arc<ClaRegistry>,
        bp: BpHandle,
        time: Arc<dyn TimeProvider>,
        wake_queue: CmWakeQueue,
    ) -> Self {
        Self {
            routing,
            registry,
            bp,
            time,
            current: Vec::new(),
            next_event_ms: DtnTime::MAX,
            wake_queue,
        }
    }

    /// Removes contacts whose window has passed, deactivating them.
    fn remove_expired(&mut self, table: &mut RoutingTable, now_ms: DtnTime) -> Vec<ActiveContact> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.current.len() {
            let expired = table
                .contact(self.current[i].id)
                .map(|c| c.to_ms <= now_ms)
                // The contact vanished from the table; drop our record.
                .unwrap_or(true);
            if expired {
                let info = self.current.remove(i);
                if let Some(c) = table.contact_mut(info.id) {
                    c.active = false;
                }
                removed.push(info);
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Activates contacts whose window has begun and recomputes the
    /// next wake-up deadline.
    fn process_upcoming(
        &mut self,
        table: &mut RoutingTable,
        now_ms: DtnTime,
    ) -> Vec<(String, String)> {
        let mut started = Vec::new();
        self.next_event_ms = DtnTime::MAX;
        for id in table.contacts_by_from().to_vec() {
            let Some(contact) = table.contact(id) else {
                continue;
            };
            if contact.from_ms > now_ms {
                self.next_event_ms = self.next_event_ms.min(contact.from_ms);
                // The list is sorted by start time.
                break;
            }
            if contact.to_ms <= now_ms {
                continue;
            }
            self.next_event_ms = self.next_event_ms.min(contact.to_ms);
            if self.current.iter().any(|a| a.id == id) {
                continue;
            }
            if self.current.len() >= MAX_CONCURRENT_CONTACTS {
                warn!(contact = id, "too many active contacts, not starting another");
                continue;
            }
            let Some(node_eid) = contact.node_eid.clone() else {
                continue;
            };
            let Some(cla_addr) = table
                .lookup_node(&node_eid)
                .and_then(|n| n.cla_addr.clone())
            else {
                continue;
            };
            if let Some(c) = table.contact_mut(id) {
                c.active = true;
            }
            self.current.push(ActiveContact {
                id,
                eid: node_eid.clone(),
                cla_addr: cla_addr.clone(),
            });
            started.push((node_eid, cla_addr));
        }
        started
    }

    /// Hands the queued bundles of every active contact to the owning
    /// CLA's TX queue. Contact records are re-validated under the lock
    /// since the contact may have been deleted concurrently.
    fn hand_over_bundles(&mut self) {
        let mut i = 0;
        while i < self.current.len() {
            let (id, eid, cla_addr) = {
                let info = &self.current[i];
                (info.id, info.eid.clone(), info.cla_addr.clone())
            };

            let mut table = self.routing.lock();
            let valid = table
                .lookup_eid(&eid)
                .map(|contacts| contacts.contains(&id))
                .unwrap_or(false);
            if !valid {
                warn!(contact = id, %eid, "contact disappeared, discarding record");
                drop(table);
                self.current.remove(i);
                continue;
            }
            let has_bundles = table
                .contact(id)
                .map(|c| !c.bundles.is_empty())
                .unwrap_or(false);
            if !has_bundles {
                i += 1;
                continue;
            }
            let Some(queue) = self
                .registry
                .by_addr(&cla_addr)
                .and_then(|cla| cla.get_tx_queue(&eid, &cla_addr))
            else {
                // Re-scheduling happens after the next link signal.
                warn!(%eid, %cla_addr, "could not obtain TX queue for contact");
                i += 1;
                continue;
            };
            // Take over the bundle list while holding the lock, then
            // release it before pushing to the (bounded) TX queue.
            let bundles = table
                .contact_mut(id)
                .map(|c| std::mem::take(&mut c.bundles))
                .unwrap_or_default();
            drop(table);

            info!(%eid, count = bundles.len(), "queueing bundles for contact");
            if let Err(e) = queue.sender.send(TxCommand::Bundles {
                bundles,
                cla_addr: cla_addr.clone(),
            }) {
                // The link went down while we handed over; the bundles
                // travel back through the failure path.
                if let TxCommand::Bundles { bundles, cla_addr } = e.into_inner() {
                    for bundle in bundles {
                        self.bp.send(Signal::TransmissionFailure {
                            bundle: Box::new(bundle),
                            peer_cla_addr: Some(cla_addr.clone()),
                        });
                    }
                }
            }
            i += 1;
        }
    }

    /// One scheduling pass. Public so tests can drive the manager
    /// without a thread.
    pub fn manage(&mut self, signal: CmSignal) {
        if signal.contains(CmSignal::UPDATE_CONTACT_LIST) {
            let now_ms = self.time.now_dtn_ms();
            let routing = self.routing.clone();
            let mut table = routing.lock();
            let removed = self.remove_expired(&mut table, now_ms);
            let started = self.process_upcoming(&mut table, now_ms);
            debug_assert!(self.next_event_ms > now_ms);
            drop(table);

            // CLA interaction and processor signalling happen with the
            // routing lock released.
            for (eid, cla_addr) in started {
                info!(%eid, %cla_addr, "scheduled contact started");
                if let Some(cla) = self.registry.by_addr(&cla_addr) {
                    cla.start_scheduled_contact(&eid, &cla_addr);
                }
            }
            for info in removed {
                info!(eid = %info.eid, "scheduled contact ended");
                if let Some(cla) = self.registry.by_addr(&info.cla_addr) {
                    cla.end_scheduled_contact(&info.eid, &info.cla_addr);
                }
                self.bp.send(Signal::ContactOver(info.id));
            }
        }

        if signal.contains(CmSignal::PROCESS_CURRENT_BUNDLES) {
            self.hand_over_bundles();
        }
    }

    /// The event loop: waits on the wake-up queue with a timeout equal
    /// to the time until the next contact boundary.
    pub fn run(mut self) {
        loop {
            let signal =
                CmSignal::from_bits_truncate(self.wake_queue.flags.swap(0, Ordering::Acquire));
            if !signal.is_empty() {
                self.manage(signal);
            }

            let now_ms = self.time.now_dtn_ms();
            let timeout = if self.next_event_ms == DtnTime::MAX {
                None
            } else if self.next_event_ms <= now_ms {
                // Deadline already passed, re-check everything now.
                self.wake_queue
                    .flags
                    .fetch_or(CmSignal::all().bits(), Ordering::Release);
                continue;
            } else {
                Some(Duration::from_millis(self.next_event_ms - now_ms + 1))
            };

            let received = match timeout {
                Some(t) => self.wake_queue.receiver.recv_timeout(t),
                None => self
                    .wake_queue
                    .receiver
                    .recv()
                    .map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(()) => {}
                Err(RecvTimeoutError::Timeout) => {
                    // Timer fired: treat as "unknown", re-check both.
                    self.wake_queue
                        .flags
                        .fetch_or(CmSignal::all().bits(), Ordering::Release);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("contact manager wake-up channel closed, exiting");
                    break;
                }
            }
        }
    }
}
