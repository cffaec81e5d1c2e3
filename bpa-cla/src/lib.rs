//! # bpa-cla
//!
//! Per-link concurrency scaffolding shared by all convergence-layer
//! adapters: an RX task feeding a streaming bundle parser, a TX task
//! draining a bounded command queue, disconnect fan-out, and the
//! multi-link parameter table used by TCP-family adapters.
//!
//! A concrete CLA supplies three things per link: a [`LinkRx`] to read
//! bytes, a [`LinkTx`] to frame and write packets, and a
//! [`FramingParser`] that isolates bundle bodies in the RX byte
//! stream. Everything else — task lifecycle, queue publication,
//! ordered success/failure signalling — lives here.

pub mod contact_params;
pub mod link;
pub mod mtcp;
pub mod rx_task;
pub mod testing;
pub mod tx_task;

pub use link::ClaLink;

use thiserror::Error;

/// Depth of each per-link TX command queue.
pub const CONTACT_TX_TASK_QUEUE_LENGTH: usize = 16;

/// Fixed interval between outgoing connection attempts.
pub const CLA_TCP_RETRY_INTERVAL_MS: u64 = 1000;

/// Maximum connection attempts per outgoing connection cycle.
pub const CLA_TCP_MAX_RETRY_ATTEMPTS: u32 = 10;

/// Optional delay between two bundle transmissions on one link, in
/// milliseconds; zero disables rate limiting.
pub const CLA_TX_RATE_LIMIT_DELAY_MS: u64 = 0;

/// Errors surfaced by link transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("link disconnected")]
    Disconnected,
}

/// Byte-oriented read half of a link. `Ok(0)` means orderly EOF; both
/// EOF and errors trigger the disconnect handler.
pub trait LinkRx: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Packet-oriented write half of a link. Errors must make the TX task
/// report transmission failure and trigger the disconnect handler.
pub trait LinkTx: Send {
    fn begin_packet(&mut self, length: usize) -> Result<(), TransportError>;
    fn send_packet_data(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn end_packet(&mut self) -> Result<(), TransportError>;
}

/// Outcome of one framing-parser step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingStatus {
    /// The consumed bytes were framing overhead; call again with the
    /// remaining input.
    Header,
    /// Up to `remaining` of the following input bytes belong to the
    /// current bundle body and must be fed to the bundle parser.
    Forward { remaining: usize },
    /// The stream is corrupt; reset framing and bundle parsers.
    Error,
}

/// The CLA-owned framing state machine of the RX path.
pub trait FramingParser: Send {
    fn reset(&mut self);

    /// Examines `input` and returns how many leading bytes it consumed
    /// as framing overhead, plus the resulting status.
    fn parse(&mut self, input: &[u8]) -> (usize, FramingStatus);

    /// Informs the parser that `n` bundle-body bytes were forwarded.
    fn body_consumed(&mut self, n: usize);
}
