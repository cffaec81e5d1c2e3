//! Extension blocks and the block-payload codecs the agent interprets
//! itself (hop count, bundle age).

use crate::cbor::{CborReader, CborWriter};
use crate::{Error, Result};
use bitflags::bitflags;

/// Canonical block type codes. BPv6 and BPv7 agree on the payload code;
/// the remaining codes follow the BPv7 registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Payload,
    PreviousNode,
    BundleAge,
    HopCount,
    Other(u8),
}

impl BlockType {
    pub fn to_u8(self) -> u8 {
        match self {
            BlockType::Payload => 1,
            BlockType::PreviousNode => 6,
            BlockType::BundleAge => 7,
            BlockType::HopCount => 10,
            BlockType::Other(t) => t,
        }
    }

    pub fn from_u8(t: u8) -> Self {
        match t {
            1 => BlockType::Payload,
            6 => BlockType::PreviousNode,
            7 => BlockType::BundleAge,
            10 => BlockType::HopCount,
            other => BlockType::Other(other),
        }
    }
}

bitflags! {
    /// Block processing flags, normalized across both protocol
    /// versions. The lower bits match the BPv7 wire encoding; the
    /// v6-only bits live above them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BlockFlags: u32 {
        /// Block must be replicated in every fragment.
        const MUST_BE_REPLICATED = 1 << 0;
        /// Transmit a status report if the block cannot be processed.
        const REPORT_IF_UNPROC = 1 << 1;
        /// Delete the bundle if the block cannot be processed.
        const DELETE_BUNDLE_IF_UNPROC = 1 << 2;
        /// Discard the block if it cannot be processed.
        const DISCARD_IF_UNPROC = 1 << 4;
        /// BPv6: block was forwarded without being processed.
        const FWD_UNPROC = 1 << 8;
        /// BPv6: block contains an EID reference list.
        const HAS_EID_REF = 1 << 9;
        /// BPv6: this is the last block of the bundle.
        const LAST_BLOCK = 1 << 10;
    }
}

/// CRC type of a block or primary block (BPv7 only; BPv6 bundles use
/// `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcType {
    #[default]
    None,
    Crc16,
    Crc32,
}

impl CrcType {
    pub fn to_u8(self) -> u8 {
        match self {
            CrcType::None => 0,
            CrcType::Crc16 => 1,
            CrcType::Crc32 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(CrcType::None),
            1 => Ok(CrcType::Crc16),
            2 => Ok(CrcType::Crc32),
            _ => Err(Error::Parse("unknown CRC type")),
        }
    }
}

/// A single extension (or payload) block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub block_type: BlockType,
    /// Block number; the payload block is number 1 on BPv7.
    pub number: u64,
    pub flags: BlockFlags,
    pub crc_type: CrcType,
    /// Opaque block-type-specific payload bytes.
    pub data: Vec<u8>,
    /// BPv6 EID reference list; always empty on BPv7.
    pub eid_refs: Vec<String>,
}

impl Block {
    pub fn new(block_type: BlockType) -> Self {
        Self {
            block_type,
            number: if block_type == BlockType::Payload { 1 } else { 0 },
            flags: BlockFlags::empty(),
            crc_type: CrcType::None,
            data: Vec::new(),
            eid_refs: Vec::new(),
        }
    }

    pub fn with_data(block_type: BlockType, data: Vec<u8>) -> Self {
        let mut b = Self::new(block_type);
        b.data = data;
        b
    }
}

/// The BPv7 hop-count block payload: a CBOR array `[limit, count]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HopCount {
    pub limit: u64,
    pub count: u64,
}

impl HopCount {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = CborReader::new(data);
        let len = r.array_header()?;
        if len != Some(2) {
            return Err(Error::Parse("hop-count block is not a 2-array"));
        }
        let limit = r.uint()?;
        let count = r.uint()?;
        Ok(Self { limit, count })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut w = CborWriter::new();
        w.array(2);
        w.uint(self.limit);
        w.uint(self.count);
        w.into_bytes()
    }
}

/// Parses a bundle-age block payload (a single CBOR uint, milliseconds).
pub fn bundle_age_parse(data: &[u8]) -> Result<u64> {
    CborReader::new(data).uint()
}

/// Serializes a bundle-age value.
pub fn bundle_age_serialize(age_ms: u64) -> Vec<u8> {
    let mut w = CborWriter::new();
    w.uint(age_ms);
    w.into_bytes()
}
