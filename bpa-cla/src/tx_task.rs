//! The per-link TX task: drains the command queue, serializes bundles
//! onto the wire, and reports each outcome in enqueue order.

use crate::link::ClaLink;
use crate::{LinkTx, CLA_TX_RATE_LIMIT_DELAY_MS};
use bpa_core::cla::TxCommand;
use bpa_core::processor::Signal;
use bpa_proto::bundle::Bundle;
use bpa_proto::time::TimeProvider;
use bpa_proto::codec;
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// BPv7 §5.4-4: final per-hop updates immediately before transmission.
fn prepare_bundle_for_forwarding(bundle: &mut Bundle, now_ms: u64) {
    bundle.remove_previous_node_block();
    let dwell_time_ms = now_ms.saturating_sub(bundle.reception_timestamp_ms);
    if bundle.update_bundle_age(dwell_time_ms).is_err() {
        warn!("bundle age block update failed");
    }
}

fn transmit(tx: &mut impl LinkTx, bundle: &Bundle, cla_addr: &str) -> bool {
    let size = bundle.serialized_size();
    if tx.begin_packet(size).is_err() {
        return false;
    }
    let mut write_failed = false;
    let result = codec::serialize(bundle, &mut |chunk| {
        tx.send_packet_data(chunk).map_err(|e| {
            write_failed = true;
            std::io::Error::other(e.to_string())
        })
    });
    if result.is_err() || write_failed {
        debug!(cla_addr, "serializing bundle onto the wire failed");
        return false;
    }
    tx.end_packet().is_ok()
}

fn inform_outcome(link: &ClaLink, bundle: Bundle, cla_addr: &str, success: bool) {
    let signal = if success {
        Signal::TransmissionSuccess {
            bundle: Box::new(bundle),
            peer_cla_addr: Some(cla_addr.to_string()),
        }
    } else {
        Signal::TransmissionFailure {
            bundle: Box::new(bundle),
            peer_cla_addr: Some(cla_addr.to_string()),
        }
    };
    link.bp().send(signal);
}

/// The TX task body. Runs until a finalize command arrives, then
/// drains the rest of the queue as failures.
pub fn run(
    link: Arc<ClaLink>,
    mut tx: impl LinkTx,
    receiver: Receiver<TxCommand>,
    time: Arc<dyn TimeProvider>,
) {
    while let Ok(command) = receiver.recv() {
        let (bundles, cla_addr) = match command {
            TxCommand::Finalize => break,
            TxCommand::Bundles { bundles, cla_addr } => (bundles, cla_addr),
        };
        for mut bundle in bundles {
            let now_ms = time.now_dtn_ms();
            prepare_bundle_for_forwarding(&mut bundle, now_ms);
            debug!(cla_addr = %cla_addr, "sending bundle");
            let success = transmit(&mut tx, &bundle, &cla_addr);
            if !success {
                // Wire errors take the link down.
                link.disconnect();
            }
            inform_outcome(&link, bundle, &cla_addr, success);
            if CLA_TX_RATE_LIMIT_DELAY_MS != 0 {
                std::thread::sleep(Duration::from_millis(CLA_TX_RATE_LIMIT_DELAY_MS));
            }
        }
    }

    // Finalize: everything still queued is reported as failed, in
    // order. The queue handle was revoked before the finalize command
    // was enqueued, so no new commands race with the drain.
    while let Ok(command) = receiver.try_recv() {
        if let TxCommand::Bundles { bundles, cla_addr } = command {
            for bundle in bundles {
                inform_outcome(&link, bundle, &cla_addr, false);
            }
        }
    }
    debug!(cla_addr = link.cla_addr(), "TX task exiting");
}
