//! Registry of application agents attached to the bundle processor.

use bpa_proto::bundle::BundleAdu;
use bpa_proto::eid::{self, EidScheme};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Well-known sink for bundle-in-bundle delivery on `dtn` nodes.
pub const SINK_BIBE_DTN: &str = "bibe";
/// Well-known sink for bundle-in-bundle delivery on `ipn` nodes.
pub const SINK_BIBE_IPN: &str = "2925";
/// Well-known sink of the configuration agent on `dtn` nodes.
pub const SINK_CONFIG_DTN: &str = "config";
/// Well-known sink of the configuration agent on `ipn` nodes.
pub const SINK_CONFIG_IPN: &str = "9000";
/// Well-known sink of the echo agent on `dtn` nodes.
pub const SINK_ECHO_DTN: &str = "echo";
/// Well-known sink of the echo agent on `ipn` nodes.
pub const SINK_ECHO_IPN: &str = "9001";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("invalid sink identifier")]
    InvalidSink,
    #[error("an agent is already registered for this sink")]
    AlreadyRegistered,
    #[error("secret does not match the existing registration")]
    Unauthorized,
    #[error("no agent registered for this sink")]
    NotRegistered,
}

/// Delivery callback: receives the ADU and a handle for same-thread
/// interaction with the bundle processor (e.g. sending a reply).
pub type AgentCallback = Arc<dyn Fn(BundleAdu, &crate::processor::BpHandle) + Send + Sync>;

/// One registered agent.
#[derive(Clone)]
pub struct Agent {
    pub sink: String,
    /// Shared secret tying subscriber and RPC registrations together.
    pub secret: Option<String>,
    /// Delivery callback; required for subscribers.
    pub callback: Option<AgentCallback>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("sink", &self.sink)
            .field("has_secret", &self.secret.is_some())
            .finish()
    }
}

/// Subscriber and RPC agent maps, keyed by sink identifier. At most one
/// agent of each class per sink; when both exist their secrets must
/// match.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    subscribers: HashMap<String, Agent>,
    rpc: HashMap<String, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        agent: Agent,
        is_subscriber: bool,
        scheme: EidScheme,
    ) -> Result<(), AgentError> {
        if eid::validate_sink_for_scheme(&agent.sink, scheme).is_err() {
            return Err(AgentError::InvalidSink);
        }
        if is_subscriber && agent.callback.is_none() {
            return Err(AgentError::InvalidSink);
        }
        let (own, other) = if is_subscriber {
            (&mut self.subscribers, &self.rpc)
        } else {
            (&mut self.rpc, &self.subscribers)
        };
        if own.contains_key(&agent.sink) {
            warn!(sink = %agent.sink, "agent already registered for sink");
            return Err(AgentError::AlreadyRegistered);
        }
        if let Some(existing) = other.get(&agent.sink) {
            if existing.secret != agent.secret {
                warn!(sink = %agent.sink, "invalid secret for sink");
                return Err(AgentError::Unauthorized);
            }
        }
        info!(sink = %agent.sink, "agent registered");
        own.insert(agent.sink.clone(), agent);
        Ok(())
    }

    pub fn deregister(&mut self, sink: &str, is_subscriber: bool) -> Result<(), AgentError> {
        let map = if is_subscriber {
            &mut self.subscribers
        } else {
            &mut self.rpc
        };
        match map.remove(sink) {
            Some(_) => Ok(()),
            None => {
                warn!(sink, "no agent registered for sink");
                Err(AgentError::NotRegistered)
            }
        }
    }

    /// Whether any subscriber is registered for the sink.
    pub fn has_subscriber(&self, sink: &str) -> bool {
        self.subscribers.contains_key(sink)
    }

    /// The delivery callback of a subscriber, if present.
    pub fn subscriber_callback(&self, sink: &str) -> Option<AgentCallback> {
        self.subscribers.get(sink).and_then(|a| a.callback.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty() && self.rpc.is_empty()
    }
}
