//! The per-link RX task: reads from the transport, runs the CLA's
//! framing parser, and feeds bundle bodies into the version-dispatched
//! bundle parser.

use crate::link::ClaLink;
use crate::{FramingParser, FramingStatus, LinkRx};
use bpa_core::processor::Signal;
use bpa_proto::codec::{BundleParser, ParseStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

const RX_BUFFER_SIZE: usize = 4096;

/// The RX task body. Runs until the transport reports EOF or an error,
/// then triggers the disconnect handler and exits.
pub fn run(link: Arc<ClaLink>, mut rx: impl LinkRx, mut framing: impl FramingParser) {
    let mut bundle_parser = BundleParser::new();
    let mut buf = [0u8; RX_BUFFER_SIZE];

    'io: loop {
        let n = match rx.read(&mut buf) {
            Ok(0) => {
                debug!(cla_addr = link.cla_addr(), "peer closed the connection");
                break 'io;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(cla_addr = link.cla_addr(), error = %e, "link read failed");
                break 'io;
            }
        };

        let mut offset = 0;
        while offset < n {
            let (consumed, status) = framing.parse(&buf[offset..n]);
            offset += consumed;
            match status {
                FramingStatus::Header => {}
                FramingStatus::Error => {
                    warn!(cla_addr = link.cla_addr(), "framing error, resetting parsers");
                    framing.reset();
                    bundle_parser.reset();
                }
                FramingStatus::Forward { remaining } => {
                    let end = n.min(offset + remaining);
                    let body = &buf[offset..end];
                    offset = end;
                    framing.body_consumed(body.len());
                    match bundle_parser.parse(body).status {
                        ParseStatus::NeedMore { .. } => {}
                        ParseStatus::Done(bundle) => {
                            info!(
                                cla_addr = link.cla_addr(),
                                source = bundle.source.as_deref().unwrap_or("dtn:none"),
                                "bundle received"
                            );
                            link.bp().send(Signal::BundleIncoming(bundle));
                        }
                        ParseStatus::Error => {
                            warn!(
                                cla_addr = link.cla_addr(),
                                "bundle parser error, resetting parsers"
                            );
                            framing.reset();
                            bundle_parser.reset();
                        }
                    }
                }
            }
        }
    }

    link.disconnect();
    debug!(cla_addr = link.cla_addr(), "RX task exiting");
}
