//! The bundle processor: a single-threaded state machine dispatching
//! every bundle through the receive/forward/deliver decision points.

pub mod known;
pub mod reassembly;

use crate::agents::{Agent, AgentError, AgentRegistry, SINK_BIBE_DTN, SINK_BIBE_IPN};
use crate::cla::ClaRegistry;
use crate::contact_manager::{CmSignal, CmWaker};
use crate::node::ContactId;
use crate::router::{self, RouteError, RouterConfig};
use crate::routing_table::RoutingTable;
use bpa_proto::bundle::{
    BlockFlags, BlockType, Bundle, BundleAdu, BundleFlags, HopCount, RetentionConstraints,
};
use bpa_proto::eid::{self, EidScheme, EID_NONE};
use bpa_proto::records::{self, ReasonCode, RecordKind, StatusFlags};
use bpa_proto::time::{DtnTime, TimeProvider};
use crossbeam_channel::{bounded, Receiver, Sender};
use known::KnownBundleList;
use parking_lot::Mutex;
use reassembly::{ReassemblyResult, ReassemblyStore};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do with a bundle whose forwarding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedForwardPolicy {
    /// Delete the bundle and report the deletion.
    Drop,
    /// Hand the bundle to the router again.
    TryReSchedule,
}

/// A node/contact mutation delivered through the configuration agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterCommand {
    pub command_type: RouterCommandType,
    pub node: crate::node::NodeSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterCommandType {
    Add,
    Update,
    Delete,
    Query,
}

/// Signals consumed by the bundle processor task.
pub enum Signal {
    /// A bundle arrived over a CLA link.
    BundleIncoming(Box<Bundle>),
    /// A locally created bundle skips reception and goes straight to
    /// dispatch.
    BundleLocalDispatch(Box<Bundle>),
    TransmissionSuccess {
        bundle: Box<Bundle>,
        peer_cla_addr: Option<String>,
    },
    TransmissionFailure {
        bundle: Box<Bundle>,
        peer_cla_addr: Option<String>,
    },
    ContactOver(ContactId),
    NewLinkEstablished {
        cla_addr: String,
    },
    LinkDown {
        cla_addr: String,
    },
    AgentRegister {
        agent: Agent,
        is_subscriber: bool,
        feedback: Option<Sender<Result<(), AgentError>>>,
    },
    AgentDeregister {
        sink: String,
        is_subscriber: bool,
        feedback: Option<Sender<Result<(), AgentError>>>,
    },
    RouterCommand(Box<RouterCommand>),
}

/// Configuration of the bundle processor.
#[derive(Debug, Clone)]
pub struct BpConfig {
    /// The local node ID (validated, normalized).
    pub local_eid: String,
    /// Whether to generate status-report bundles at all.
    pub status_reporting: bool,
    pub failed_forward_policy: FailedForwardPolicy,
    pub router: RouterConfig,
    /// Depth of the signal queue.
    pub queue_depth: usize,
}

impl BpConfig {
    pub fn new(local_eid: &str) -> bpa_proto::Result<Self> {
        let local_eid = eid::preprocess_local_eid(local_eid);
        eid::validate_local_eid(&local_eid)?;
        Ok(Self {
            local_eid,
            status_reporting: true,
            failed_forward_policy: FailedForwardPolicy::Drop,
            router: RouterConfig::default(),
            queue_depth: 1024,
        })
    }
}

/// Cloneable handle for interacting with a running bundle processor
/// from other threads or from inside agent callbacks.
#[derive(Clone)]
pub struct BpHandle {
    sender: Sender<Signal>,
    local_eid: Arc<str>,
    time: Arc<dyn TimeProvider>,
}

impl BpHandle {
    pub fn send(&self, signal: Signal) {
        let _ = self.sender.send(signal);
    }

    /// Injects a locally created bundle into the dispatch path. Safe to
    /// call from inside a delivery callback; the bundle is processed on
    /// the processor's next loop iteration.
    pub fn local_dispatch(&self, mut bundle: Bundle) {
        bundle.ret_constraints |= RetentionConstraints::DISPATCH_PENDING;
        self.send(Signal::BundleLocalDispatch(Box::new(bundle)));
    }

    pub fn local_eid(&self) -> &str {
        &self.local_eid
    }

    pub fn now_dtn_ms(&self) -> DtnTime {
        self.time.now_dtn_ms()
    }

    /// Registers or deregisters an agent, optionally blocking on the
    /// result. Must not be awaited from the processor thread itself.
    pub fn perform_agent_action(
        &self,
        signal_for: impl FnOnce(Option<Sender<Result<(), AgentError>>>) -> Signal,
        wait_for_feedback: bool,
    ) -> Option<Result<(), AgentError>> {
        if !wait_for_feedback {
            self.send(signal_for(None));
            return None;
        }
        let (tx, rx) = bounded(1);
        self.send(signal_for(Some(tx)));
        rx.recv().ok()
    }

    pub fn register_agent(&self, agent: Agent, is_subscriber: bool) {
        self.perform_agent_action(
            |feedback| Signal::AgentRegister {
                agent,
                is_subscriber,
                feedback,
            },
            false,
        );
    }
}

/// The bundle processor state machine. [`BundleProcessor::run`] drives
/// it on a dedicated thread; tests call
/// [`BundleProcessor::handle_signal`] and [`BundleProcessor::pump`]
/// directly.
pub struct BundleProcessor {
    handle: BpHandle,
    receiver: Receiver<Signal>,
    routing: Arc<Mutex<RoutingTable>>,
    registry: Arc<ClaRegistry>,
    cm_waker: CmWaker,
    time: Arc<dyn TimeProvider>,

    local_eid: String,
    /// Local EID prefix used for destination matching: the node ID
    /// without its trailing slash (`dtn`) or up to the dot (`ipn`).
    local_eid_prefix: String,
    local_scheme: EidScheme,
    status_reporting: bool,
    policy: FailedForwardPolicy,
    router_config: RouterConfig,

    known: KnownBundleList,
    reassembly: ReassemblyStore,
    agents: AgentRegistry,
    report_sequence: u64,
}

impl BundleProcessor {
    pub fn new(
        config: BpConfig,
        routing: Arc<Mutex<RoutingTable>>,
        registry: Arc<ClaRegistry>,
        cm_waker: CmWaker,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let (sender, receiver) = bounded(config.queue_depth);
        let local_scheme = eid::scheme_of(&config.local_eid).unwrap_or(EidScheme::Dtn);
        let local_eid_prefix = match local_scheme {
            EidScheme::Dtn => config.local_eid.trim_end_matches('/').to_string(),
            EidScheme::Ipn => {
                // "ipn:n.0" matches everything starting with "ipn:n.".
                let dot = config.local_eid.rfind('.').map(|p| p + 1);
                config.local_eid[..dot.unwrap_or(config.local_eid.len())].to_string()
            }
        };
        let handle = BpHandle {
            sender,
            local_eid: config.local_eid.clone().into(),
            time: time.clone(),
        };
        info!(
            local_eid = %config.local_eid,
            status_reports = config.status_reporting,
            "bundle processor initialized"
        );
        Self {
            handle,
            receiver,
            routing,
            registry,
            cm_waker,
            time,
            local_eid: config.local_eid,
            local_eid_prefix,
            local_scheme,
            status_reporting: config.status_reporting,
            policy: config.failed_forward_policy,
            router_config: config.router,
            known: KnownBundleList::new(),
            reassembly: ReassemblyStore::new(),
            agents: AgentRegistry::new(),
            report_sequence: 0,
        }
    }

    pub fn handle(&self) -> BpHandle {
        self.handle.clone()
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.agents
    }

    pub fn known_bundles(&self) -> &KnownBundleList {
        &self.known
    }

    /// The event loop: serialized processing of all signals.
    pub fn run(mut self) {
        while let Ok(signal) = self.receiver.recv() {
            self.handle_signal(signal);
        }
        debug!("bundle processor signal queue closed, exiting");
    }

    /// Processes every already-queued signal without blocking.
    pub fn pump(&mut self) {
        while let Ok(signal) = self.receiver.try_recv() {
            self.handle_signal(signal);
        }
    }

    /// Processes signals until none arrives for `window`. Lets tests
    /// wait for signals produced by CLA tasks on other threads.
    pub fn pump_for(&mut self, window: std::time::Duration) {
        while let Ok(signal) = self.receiver.recv_timeout(window) {
            self.handle_signal(signal);
        }
    }

    pub fn handle_signal(&mut self, signal: Signal) {
        match signal {
            Signal::BundleIncoming(bundle) => self.receive(*bundle),
            Signal::BundleLocalDispatch(bundle) => {
                self.dispatch(*bundle);
            }
            Signal::TransmissionSuccess { bundle, .. } => self.forwarding_success(*bundle),
            Signal::TransmissionFailure { bundle, .. } => self.bundle_dangling(*bundle),
            Signal::ContactOver(id) => self.handle_contact_over(id),
            Signal::NewLinkEstablished { cla_addr } => {
                debug!(%cla_addr, "new link established");
                self.cm_waker.wake(CmSignal::PROCESS_CURRENT_BUNDLES);
            }
            Signal::LinkDown { cla_addr } => {
                debug!(%cla_addr, "link down");
            }
            Signal::AgentRegister {
                agent,
                is_subscriber,
                feedback,
            } => {
                let result = self.agents.register(agent, is_subscriber, self.local_scheme);
                if let Some(feedback) = feedback {
                    let _ = feedback.send(result);
                }
            }
            Signal::AgentDeregister {
                sink,
                is_subscriber,
                feedback,
            } => {
                let result = self.agents.deregister(&sink, is_subscriber);
                if let Some(feedback) = feedback {
                    let _ = feedback.send(result);
                }
            }
            Signal::RouterCommand(cmd) => self.process_router_command(*cmd),
        }
    }

    // Receive path (BPv7 §5.6) --------------------------------------

    fn receive(&mut self, mut bundle: Bundle) {
        let now_ms = self.time.now_dtn_ms();
        bundle.reception_timestamp_ms = now_ms;
        bundle.ret_constraints |= RetentionConstraints::DISPATCH_PENDING;

        if bundle.proc_flags.contains(BundleFlags::REPORT_RECEPTION) {
            self.send_status_report(&bundle, StatusFlags::RECEIVED, ReasonCode::NoInfo);
        }

        if bundle.expiration_time_ms(now_ms) < now_ms {
            self.bundle_expired(bundle);
            return;
        }

        // Apply the unprocessable-block policies of every non-payload
        // block; this agent interprets none of them itself.
        let mut i = 0;
        while i < bundle.blocks.len() {
            if bundle.blocks[i].block_type == BlockType::Payload {
                i += 1;
                continue;
            }
            let flags = bundle.blocks[i].flags;
            if flags.contains(BlockFlags::REPORT_IF_UNPROC) {
                self.send_status_report(
                    &bundle,
                    StatusFlags::RECEIVED,
                    ReasonCode::BlockUnintelligible,
                );
            }
            if flags.contains(BlockFlags::DELETE_BUNDLE_IF_UNPROC) {
                info!("deleting bundle: block unintelligible");
                self.bundle_delete(bundle, ReasonCode::BlockUnintelligible);
                return;
            } else if flags.contains(BlockFlags::DISCARD_IF_UNPROC) {
                bundle.blocks.remove(i);
                continue;
            } else {
                bundle.blocks[i].flags |= BlockFlags::FWD_UNPROC;
            }
            i += 1;
        }

        // Custody is never accepted: no persistent storage.
        self.dispatch(bundle);
    }

    // Dispatch (BPv7 §5.3) ------------------------------------------

    fn dispatch(&mut self, bundle: Bundle) {
        debug!(
            source = bundle.source.as_deref().unwrap_or(EID_NONE),
            destination = bundle.destination.as_deref().unwrap_or(EID_NONE),
            "dispatching bundle"
        );
        if self.bundle_endpoint_is_local(&bundle) {
            self.deliver_local(bundle);
        } else {
            let _ = self.forward(bundle);
        }
    }

    fn endpoint_is_local(&self, eid: &str) -> bool {
        eid.starts_with(&self.local_eid_prefix)
    }

    fn bundle_endpoint_is_local(&self, bundle: &Bundle) -> bool {
        bundle
            .destination
            .as_deref()
            .map(|d| self.endpoint_is_local(d))
            .unwrap_or(false)
    }

    /// The sink identifier a local destination EID addresses.
    fn agent_id_of<'a>(&self, dest_eid: &'a str) -> Option<&'a str> {
        let local_len = self.local_eid_prefix.len();
        if dest_eid.len() <= local_len {
            return None;
        }
        match self.local_scheme {
            EidScheme::Ipn => {
                if !dest_eid[..local_len].ends_with('.') {
                    return None;
                }
                Some(&dest_eid[local_len..])
            }
            EidScheme::Dtn => {
                if dest_eid.as_bytes()[local_len] != b'/' {
                    return None;
                }
                Some(&dest_eid[local_len + 1..])
            }
        }
    }

    // Forward path (BPv7 §5.4) --------------------------------------

    fn forward(&mut self, mut bundle: Bundle) -> Result<(), ()> {
        if !self.hop_count_validation(&mut bundle) {
            info!("deleting bundle: hop limit exceeded");
            self.bundle_delete(bundle, ReasonCode::HopLimitExceeded);
            return Err(());
        }
        bundle.ret_constraints |= RetentionConstraints::FORWARD_PENDING;
        bundle.ret_constraints &= !RetentionConstraints::DISPATCH_PENDING;
        self.send_bundle(bundle)
    }

    fn send_bundle(&mut self, bundle: Bundle) -> Result<(), ()> {
        let now_ms = self.time.now_dtn_ms();
        let registry = self.registry.clone();
        let mbs_for = move |addr: &str| registry.mbs_for(addr);
        let routing = self.routing.clone();
        let result = {
            let mut table = routing.lock();
            router::route_bundle(&mut table, &self.router_config, &mbs_for, bundle, now_ms)
        };
        match result {
            Ok(_) => {
                // Custody is never accepted; only tell the contact
                // manager there is work.
                self.cm_waker.wake(CmSignal::PROCESS_CURRENT_BUNDLES);
                Ok(())
            }
            Err((bundle, RouteError::Expired)) => {
                info!("routing failed: bundle expired");
                self.bundle_expired(bundle);
                Err(())
            }
            Err((bundle, error)) => {
                info!(%error, "routing bundle failed");
                self.forwarding_contraindicated(bundle, route_error_reason(error));
                Err(())
            }
        }
    }

    /// BPv7 §5.4-6: transmission succeeded.
    fn forwarding_success(&mut self, mut bundle: Bundle) {
        if bundle.proc_flags.contains(BundleFlags::REPORT_FORWARDING) {
            self.send_status_report(&bundle, StatusFlags::FORWARDED, ReasonCode::NoInfo);
        }
        bundle.ret_constraints &=
            !(RetentionConstraints::FORWARD_PENDING | RetentionConstraints::OWN);
        // All constraints cleared: the bundle is freed on drop.
    }

    /// BPv7 §5.4.1: forwarding contraindicated; this agent always
    /// declares failure immediately.
    fn forwarding_contraindicated(&mut self, bundle: Bundle, reason: ReasonCode) {
        self.forwarding_failed(bundle, reason);
    }

    /// BPv7 §5.4.2.
    fn forwarding_failed(&mut self, bundle: Bundle, reason: ReasonCode) {
        info!("deleting bundle: forwarding failed");
        self.bundle_delete(bundle, reason);
    }

    /// Invoked when a bundle lost its transmission slot: apply the
    /// configured policy.
    fn bundle_dangling(&mut self, bundle: Bundle) {
        match self.policy {
            FailedForwardPolicy::Drop => {
                info!("deleting bundle: transmission failed and policy is to drop");
                self.bundle_delete(bundle, ReasonCode::TransmissionCanceled);
            }
            FailedForwardPolicy::TryReSchedule => {
                let _ = self.send_bundle(bundle);
            }
        }
    }

    // Local delivery (BPv7 §5.7) ------------------------------------

    fn deliver_local(&mut self, mut bundle: Bundle) {
        let now_ms = self.time.now_dtn_ms();
        bundle.ret_constraints &= !RetentionConstraints::DISPATCH_PENDING;

        if self.known.check_and_add(&bundle, now_ms) {
            info!("bundle was already delivered, dropping");
            return;
        }

        if bundle.proc_flags.contains(BundleFlags::REPORT_DELIVERY) {
            self.send_status_report(&bundle, StatusFlags::DELIVERED, ReasonCode::NoInfo);
        }

        let is_admin = bundle
            .proc_flags
            .contains(BundleFlags::ADMINISTRATIVE_RECORD);
        let has_subscriber = bundle
            .destination
            .as_deref()
            .and_then(|d| self.agent_id_of(d))
            .map(|sink| self.agents.has_subscriber(sink))
            .unwrap_or(false);
        if !is_admin && !has_subscriber {
            info!(
                destination = bundle.destination.as_deref().unwrap_or(EID_NONE),
                "bundle not destined for any registered agent, dropping"
            );
            self.bundle_delete(bundle, ReasonCode::DestEidUnintelligible);
            return;
        }

        if bundle.is_fragment() {
            bundle.ret_constraints |= RetentionConstraints::REASSEMBLY_PENDING;
            self.attempt_reassembly(bundle);
        } else {
            let adu = bundle.into_adu();
            self.deliver_adu(adu);
        }
    }

    fn attempt_reassembly(&mut self, bundle: Bundle) {
        let now_ms = self.time.now_dtn_ms();
        if self.known.reassembled_is_known(&bundle, now_ms) {
            info!("original bundle was already delivered, dropping fragment");
            return;
        }
        match self.reassembly.offer(bundle) {
            ReassemblyResult::Incomplete => {}
            ReassemblyResult::TooLarge(bundle) => {
                warn!("reassembly would exceed the configured memory bound");
                self.bundle_delete(*bundle, ReasonCode::DepletedStorage);
            }
            ReassemblyResult::Complete { adu, key } => {
                self.known.add_reassembled(&key, now_ms);
                self.deliver_adu(adu);
            }
        }
    }

    // ADU delivery --------------------------------------------------

    fn deliver_adu(&mut self, mut adu: BundleAdu) {
        if adu.proc_flags.contains(BundleFlags::ADMINISTRATIVE_RECORD) {
            match records::parse_administrative_record(adu.version, &adu.payload) {
                Ok(record) => match record.kind {
                    RecordKind::CustodySignal => {
                        // Custody is never accepted; acknowledge only.
                        debug!("received custody signal, ignoring");
                    }
                    RecordKind::Bpdu => {
                        adu.payload.drain(..record.content_offset);
                        adu.proc_flags = BundleFlags::ADMINISTRATIVE_RECORD;
                        let sink = match self.local_scheme {
                            EidScheme::Dtn => SINK_BIBE_DTN,
                            EidScheme::Ipn => SINK_BIBE_IPN,
                        };
                        info!(sink, len = adu.payload.len(), "received BIBE bundle");
                        self.agent_forward(sink, adu);
                    }
                    RecordKind::StatusReport => {
                        debug!("received status report, discarding");
                    }
                    RecordKind::Other(t) => {
                        info!(record_type = t, "unknown administrative record, discarding");
                    }
                },
                Err(_) => {
                    info!("unparseable administrative record, discarding");
                }
            }
            return;
        }

        let Some(sink) = adu
            .destination
            .as_deref()
            .and_then(|d| self.agent_id_of(d))
            .map(str::to_owned)
        else {
            warn!("cannot determine sink for delivered ADU, dropping");
            return;
        };
        info!(sink = %sink, len = adu.payload.len(), "delivering local bundle");
        self.agent_forward(&sink, adu);
    }

    fn agent_forward(&mut self, sink: &str, adu: BundleAdu) {
        match self.agents.subscriber_callback(sink) {
            Some(callback) => callback(adu, &self.handle),
            None => {
                warn!(sink, "no agent registered for sink, dropping ADU");
            }
        }
    }

    // Deletion (BPv7 §5.14) -----------------------------------------

    fn bundle_delete(&mut self, mut bundle: Bundle, reason: ReasonCode) {
        if bundle.proc_flags.contains(BundleFlags::REPORT_DELETION) {
            self.send_status_report(&bundle, StatusFlags::DELETED, reason);
        }
        bundle.ret_constraints = RetentionConstraints::empty();
        // Dropped here.
    }

    fn bundle_expired(&mut self, bundle: Bundle) {
        info!("deleting bundle: lifetime expired");
        self.bundle_delete(bundle, ReasonCode::LifetimeExpired);
    }

    // Status reports ------------------------------------------------

    fn send_status_report(&mut self, subject: &Bundle, status: StatusFlags, reason: ReasonCode) {
        if !self.status_reporting {
            return;
        }
        // No report towards the null endpoint or ourselves.
        match subject.report_to.as_deref() {
            None => return,
            Some(rt) if rt == EID_NONE || self.endpoint_is_local(rt) => return,
            Some(_) => {}
        }
        let now_ms = self.time.now_dtn_ms();
        self.report_sequence += 1;
        let report = records::generate_status_report(
            subject,
            status,
            reason,
            &self.local_eid,
            now_ms,
            self.report_sequence,
        );
        match report {
            Some(mut report) => {
                report.ret_constraints |= RetentionConstraints::DISPATCH_PENDING;
                if self.forward(report).is_err() {
                    debug!("failed sending status report");
                }
            }
            None => debug!("could not generate status report"),
        }
    }

    // Hop count (BPv7 §4.3.4) ---------------------------------------

    /// Returns `false` iff the hop count reached its limit. Otherwise
    /// the count is incremented. Missing or corrupt blocks pass.
    fn hop_count_validation(&mut self, bundle: &mut Bundle) -> bool {
        let Some(block) = bundle.block_by_type_mut(BlockType::HopCount) else {
            return true;
        };
        let Ok(mut hop_count) = HopCount::parse(&block.data) else {
            info!("could not parse hop-count block, ignoring it");
            return true;
        };
        if hop_count.count >= hop_count.limit {
            return false;
        }
        hop_count.count += 1;
        block.data = hop_count.serialize();
        true
    }

    // Contact / routing-table interaction ---------------------------

    fn handle_contact_over(&mut self, id: ContactId) {
        let mut orphans = Vec::new();
        {
            let mut table = self.routing.lock();
            table.contact_passed(id, &mut |b| orphans.push(b));
        }
        // Re-enters the processor via the failure path so the policy
        // decides between dropping and rescheduling.
        for bundle in orphans {
            self.handle.send(Signal::TransmissionFailure {
                bundle: Box::new(bundle),
                peer_cla_addr: None,
            });
        }
    }

    fn process_router_command(&mut self, cmd: RouterCommand) {
        let mut orphans = Vec::new();
        let success = {
            let mut table = self.routing.lock();
            let resched = &mut |b| orphans.push(b);
            match cmd.command_type {
                RouterCommandType::Add => table.add_node(cmd.node, resched),
                RouterCommandType::Update => table.replace_node(cmd.node, resched),
                RouterCommandType::Delete => table.delete_node(cmd.node, resched),
                RouterCommandType::Query => true,
            }
        };
        if success {
            info!(command = ?cmd.command_type, "router command processed");
            self.cm_waker.wake(CmSignal::UPDATE_CONTACT_LIST);
        } else {
            warn!(command = ?cmd.command_type, "router command failed");
        }
        for bundle in orphans {
            self.bundle_dangling(bundle);
        }
    }
}

fn route_error_reason(error: RouteError) -> ReasonCode {
    match error {
        RouteError::NoRoute => ReasonCode::NoKnownRoute,
        RouteError::NoMemory => ReasonCode::DepletedStorage,
        RouteError::Expired => ReasonCode::LifetimeExpired,
        RouteError::NoTimelyContact => ReasonCode::NoTimelyContact,
    }
}
