//! # bpa-proto
//!
//! Data model and wire codecs for the Bundle Protocol, versions 6
//! (RFC 5050, SDNV-encoded) and 7 (RFC 9171, CBOR-encoded).
//!
//! This crate is the leaf of the workspace: it knows nothing about
//! routing, contacts, or transports. It provides:
//!
//! - The in-memory bundle entity model ([`bundle::Bundle`]) with the
//!   utility operations the agent needs (duplication, expiration,
//!   fragment sizing, unique-identifier extraction, ADU conversion).
//! - EID validation and normalization ([`eid`]).
//! - The DTN clock abstraction ([`time`]).
//! - Serializers and incremental parsers for both wire formats
//!   ([`bundle6`], [`bundle7`]), dispatched through [`codec`].
//! - Administrative records: status reports, custody signals, and
//!   bundle-in-bundle encapsulation ([`records`]).

pub mod bundle;
pub mod cbor;
pub mod codec;
pub mod eid;
pub mod records;
pub mod sdnv;
pub mod store;
pub mod time;

mod bundle6;
mod bundle7;
mod crc;

pub use bundle::{Bundle, BundleAdu, BundleFlags, BundleUniqueId, RetentionConstraints};
pub use codec::{BundleParser, ParseStatus, ReadResult};
pub use time::{DtnTime, ManualTimeProvider, SystemTimeProvider, TimeProvider};

use thiserror::Error;

/// Errors that can occur when building or (de)serializing bundles.
#[derive(Debug, Error)]
pub enum Error {
    /// A supplied EID or field value is not acceptable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Wire data could not be decoded.
    #[error("parse error: {0}")]
    Parse(&'static str),
    /// More input is required to finish decoding.
    #[error("incomplete input, at least {0} more bytes needed")]
    Incomplete(usize),
    /// The serialization sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
