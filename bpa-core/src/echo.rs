//! The echo agent: replies to every received ADU with its own payload.

use crate::agents::{Agent, SINK_ECHO_DTN, SINK_ECHO_IPN};
use crate::processor::BpHandle;
use bpa_proto::bundle::{Bundle, BundleFlags, ProtocolVersion};
use bpa_proto::eid::{self, EidScheme};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Default)]
struct SequenceState {
    last_timestamp_ms: u64,
    last_sequence_number: u64,
}

impl SequenceState {
    fn allocate(&mut self, time_ms: u64) -> u64 {
        if self.last_timestamp_ms == time_ms {
            self.last_sequence_number += 1;
        } else {
            self.last_timestamp_ms = time_ms;
            self.last_sequence_number = 1;
        }
        self.last_sequence_number
    }
}

/// Registers the echo agent with the processor behind `handle`.
pub fn setup(handle: &BpHandle, lifetime_ms: u64) {
    let scheme = eid::scheme_of(handle.local_eid()).unwrap_or(EidScheme::Dtn);
    let (sink, source_eid) = match scheme {
        EidScheme::Dtn => (SINK_ECHO_DTN, format!("{}{}", handle.local_eid(), SINK_ECHO_DTN)),
        EidScheme::Ipn => (SINK_ECHO_IPN, {
            let prefix = handle.local_eid().trim_end_matches(".0");
            format!("{prefix}.{SINK_ECHO_IPN}")
        }),
    };
    let state = Arc::new(Mutex::new(SequenceState::default()));

    let callback = move |adu: bpa_proto::bundle::BundleAdu, bp: &BpHandle| {
        let Some(destination) = adu.source.clone() else {
            return;
        };
        let now_ms = bp.now_dtn_ms();
        let sequence = state.lock().allocate(now_ms);
        let reply = match adu.version {
            ProtocolVersion::V7 => Bundle::new_v7(
                &source_eid,
                &destination,
                now_ms,
                sequence,
                lifetime_ms,
                BundleFlags::empty(),
                adu.payload,
            ),
            ProtocolVersion::V6 => Bundle::new_v6(
                &source_eid,
                &destination,
                now_ms,
                sequence,
                lifetime_ms,
                BundleFlags::empty(),
                adu.payload,
            ),
        };
        match reply {
            Ok(bundle) => bp.local_dispatch(bundle),
            Err(e) => warn!(error = %e, "echo agent could not create reply bundle"),
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
