//! The configuration agent: receives command bundles on the well-known
//! config sink and turns them into routing-table mutations.

pub mod parser;

use crate::agents::{Agent, SINK_CONFIG_DTN, SINK_CONFIG_IPN};
use crate::processor::{BpHandle, Signal};
use bpa_proto::eid::{self, EidScheme};
use parking_lot::Mutex;
use parser::ConfigParser;
use std::sync::Arc;
use tracing::{info, warn};

/// Registers the configuration agent with the processor behind
/// `handle`. When `allow_remote_configuration` is false, command
/// bundles from foreign nodes are dropped.
pub fn setup(handle: &BpHandle, allow_remote_configuration: bool) {
    let scheme = eid::scheme_of(handle.local_eid()).unwrap_or(EidScheme::Dtn);
    let sink = match scheme {
        EidScheme::Dtn => SINK_CONFIG_DTN,
        EidScheme::Ipn => SINK_CONFIG_IPN,
    };
    let local_eid = handle.local_eid().to_string();
    let parser = Arc::new(Mutex::new(ConfigParser::new()));

    let callback = {
        let parser = parser.clone();
        move |adu: bpa_proto::bundle::BundleAdu, bp: &BpHandle| {
            if !allow_remote_configuration {
                let from_local = adu
                    .source
                    .as_deref()
                    .and_then(eid::node_id_of)
                    .map(|node_id| node_id.starts_with(local_eid.trim_end_matches('/')))
                    .unwrap_or(false);
                if !from_local {
                    warn!(
                        source = adu.source.as_deref().unwrap_or("?"),
                        "dropped config message from foreign endpoint"
                    );
                    return;
                }
            }
            let mut parser = parser.lock();
            parser.reset();
            let mut commands = Vec::new();
            match parser.read(&adu.payload, &mut commands) {
                Ok(_) => {}
                Err(offset) => {
                    warn!(offset, "malformed configuration command, parser reset");
                }
            }
            for command in commands {
                info!(command = ?command.command_type, node = %command.node.eid, "configuration command received");
                bp.send(Signal::RouterCommand(Box::new(command)));
            }
        }
    };

    handle.register_agent(
        Agent {
            sink: sink.to_string(),
            secret: None,
            callback: Some(Arc::new(callback)),
        },
        true,
    );
}
