//! # bpa-core
//!
//! The interior engine of the Bundle Protocol Agent:
//!
//! - [`routing_table`]: known nodes, reachable endpoints, and timed
//!   contacts, with a dual index by node EID and by endpoint EID.
//! - [`router`]: per-bundle forwarding plans with fragmentation and
//!   per-priority contact capacity accounting.
//! - [`contact_manager`]: the time-driven task that activates contacts
//!   at their scheduled boundaries and hands queued bundles to CLAs.
//! - [`processor`]: the single-threaded bundle processor implementing
//!   the receive/forward/deliver state machine, duplicate suppression,
//!   reassembly, status reports, and the agent registry.
//! - [`cla`]: the abstract convergence-layer adapter interface the
//!   core consumes; concrete link handling lives in `bpa-cla`.
//!
//! The processor and contact manager are plain state machines driven
//! by crossbeam channels; tests call their handlers directly for
//! deterministic, single-threaded execution.

pub mod agents;
pub mod cla;
pub mod config;
pub mod contact_manager;
pub mod echo;
pub mod fragmenter;
pub mod node;
pub mod processor;
pub mod router;
pub mod routing_table;
pub mod testing;

pub use agents::{Agent, AgentError, AgentRegistry};
pub use cla::{Cla, ClaRegistry, TxCommand, TxQueueHandle};
pub use contact_manager::{CmSignal, CmWakeQueue, CmWaker, ContactManager};
pub use node::{Contact, ContactId, ContactSpec, Node, NodeSpec};
pub use processor::{BpConfig, BpHandle, BundleProcessor, FailedForwardPolicy, Signal};
pub use router::{RouteError, RouterConfig};
pub use routing_table::RoutingTable;
