//! An in-memory loopback CLA that exercises the real RX/TX task
//! scaffolding without sockets.
//!
//! Outgoing bundles are captured as serialized byte packets; inbound
//! traffic is injected as mtcp frames and travels through the framing
//! and bundle parsers like real wire data.

use crate::contact_params::ContactParamTable;
use crate::link::ClaLink;
use crate::mtcp::{encode_header, MtcpFramingParser};
use crate::{LinkRx, LinkTx, TransportError};
use bpa_core::cla::{Cla, TxQueueHandle};
use bpa_core::processor::BpHandle;
use bpa_proto::time::TimeProvider;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Read half fed by an in-memory byte pipe; EOF when the sender is
/// dropped.
struct PipeRx {
    receiver: Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl LinkRx for PipeRx {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.pending.is_empty() {
            match self.receiver.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Write half that records each packet's body bytes.
struct CaptureTx {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    current: Vec<u8>,
}

impl LinkTx for CaptureTx {
    fn begin_packet(&mut self, length: usize) -> Result<(), TransportError> {
        self.current = Vec::with_capacity(length);
        Ok(())
    }

    fn send_packet_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.current.extend_from_slice(data);
        Ok(())
    }

    fn end_packet(&mut self) -> Result<(), TransportError> {
        self.sent.lock().push(std::mem::take(&mut self.current));
        Ok(())
    }
}

/// The loopback CLA. Registered under a configurable name so tests can
/// use realistic CLA addresses such as `"mtcp:127.0.0.1:4224"`.
pub struct LoopbackCla {
    name: &'static str,
    bp: BpHandle,
    time: Arc<dyn TimeProvider>,
    params: ContactParamTable,
    inbound: Arc<Mutex<HashMap<String, Sender<Vec<u8>>>>>,
    /// Serialized bundles transmitted over any link, in TX order.
    pub sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl LoopbackCla {
    pub fn new(name: &'static str, bp: BpHandle, time: Arc<dyn TimeProvider>) -> Self {
        Self {
            name,
            bp,
            time,
            params: ContactParamTable::new(),
            inbound: Arc::new(Mutex::new(HashMap::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn link_of(&self, cla_addr: &str) -> Option<Arc<ClaLink>> {
        self.params.get(cla_addr).and_then(|p| p.lock().link.clone())
    }

    /// Injects one serialized bundle as an inbound mtcp frame.
    pub fn inject(&self, cla_addr: &str, bundle_bytes: &[u8]) -> bool {
        let inbound = self.inbound.lock();
        let Some(sender) = inbound.get(cla_addr) else {
            return false;
        };
        let mut frame = encode_header(bundle_bytes.len());
        frame.extend_from_slice(bundle_bytes);
        sender.send(frame).is_ok()
    }

    /// Waits for the link's tasks after a disconnect. Test aid.
    pub fn wait_for_link(&self, cla_addr: &str) {
        if let Some(link) = self.link_of(cla_addr) {
            link.wait();
        }
    }
}

impl Cla for LoopbackCla {
    fn name(&self) -> &'static str {
        self.name
    }

    fn launch(&self) {}

    fn mbs(&self) -> usize {
        usize::MAX
    }

    fn get_tx_queue(&self, _eid: &str, cla_addr: &str) -> Option<TxQueueHandle> {
        self.link_of(cla_addr).and_then(|link| link.get_tx_queue())
    }

    fn start_scheduled_contact(&self, _eid: &str, cla_addr: &str) {
        let (entry, _created) = self.params.get_or_create(cla_addr);
        let mut params = entry.lock();
        params.in_contact = true;
        if params.link.is_some() {
            return;
        }
        let (tx_pipe, rx_pipe) = unbounded();
        self.inbound.lock().insert(cla_addr.to_string(), tx_pipe);
        let rx = PipeRx {
            receiver: rx_pipe,
            pending: Vec::new(),
        };
        let tx = CaptureTx {
            sent: self.sent.clone(),
            current: Vec::new(),
        };
        let shutdown = {
            let inbound = self.inbound.clone();
            let addr = cla_addr.to_string();
            move || {
                inbound.lock().remove(&addr);
            }
        };
        params.link = Some(ClaLink::spawn(
            cla_addr.to_string(),
            rx,
            tx,
            MtcpFramingParser::new(),
            shutdown,
            self.bp.clone(),
            self.time.clone(),
        ));
    }

    fn end_scheduled_contact(&self, _eid: &str, cla_addr: &str) {
        let Some(entry) = self.params.get(cla_addr) else {
            return;
        };
        let link = {
            let mut params = entry.lock();
            params.in_contact = false;
            params.link.take()
        };
        if let Some(link) = link {
            link.disconnect();
            link.wait();
        }
        self.params.remove(cla_addr);
    }
}
