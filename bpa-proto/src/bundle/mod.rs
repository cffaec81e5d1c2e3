//! The in-memory bundle entity model shared by both protocol versions.

pub mod blocks;

pub use blocks::{Block, BlockFlags, BlockType, CrcType, HopCount};

use crate::eid;
use crate::time::DtnTime;
use crate::{Error, Result};
use bitflags::bitflags;

/// Bundle protocol version of a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    V6,
    V7,
}

impl ProtocolVersion {
    pub fn to_u8(self) -> u8 {
        match self {
            ProtocolVersion::V6 => 6,
            ProtocolVersion::V7 => 7,
        }
    }
}

bitflags! {
    /// Bundle processing flags, normalized across both versions.
    ///
    /// Bit positions follow the BPv7 wire encoding where both versions
    /// share a flag; the v6-only priority bits live above bit 20.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BundleFlags: u32 {
        const IS_FRAGMENT = 1 << 0;
        const ADMINISTRATIVE_RECORD = 1 << 1;
        const MUST_NOT_FRAGMENT = 1 << 2;
        const ACKNOWLEDGEMENT_REQUESTED = 1 << 5;
        const REPORT_STATUS_TIME = 1 << 6;
        const REPORT_RECEPTION = 1 << 14;
        const REPORT_FORWARDING = 1 << 16;
        const REPORT_DELIVERY = 1 << 17;
        const REPORT_DELETION = 1 << 18;
        /// RFC 5050 class-of-service: normal priority.
        const V6_NORMAL_PRIORITY = 1 << 21;
        /// RFC 5050 class-of-service: expedited priority.
        const V6_EXPEDITED_PRIORITY = 1 << 22;
        /// RFC 5050: custody transfer requested (parsed, never accepted).
        const V6_CUSTODY_TRANSFER = 1 << 23;
        /// RFC 5050: destination is a singleton endpoint.
        const V6_SINGLETON = 1 << 24;
    }
}

bitflags! {
    /// Reasons a bundle must not be freed yet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RetentionConstraints: u8 {
        const DISPATCH_PENDING = 1 << 0;
        const FORWARD_PENDING = 1 << 1;
        const REASSEMBLY_PENDING = 1 << 2;
        const CUSTODY_ACCEPTED = 1 << 3;
        const OWN = 1 << 4;
    }
}

/// Routing priority classes. Any bundle consumes P0 capacity, normal
/// and high also consume P1, and high-only additionally consumes P2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RoutingPriority {
    Low,
    Normal,
    High,
}

/// A bundle: primary-block fields plus the ordered extension block list.
///
/// Invariants: exactly one block has type [`BlockType::Payload`] and it
/// is the last block in wire order; block numbers are unique with the
/// payload block numbered 1 on BPv7; `fragment_offset + payload length`
/// never exceeds `total_adu_length` when [`BundleFlags::IS_FRAGMENT`]
/// is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub version: ProtocolVersion,
    pub proc_flags: BundleFlags,
    pub ret_constraints: RetentionConstraints,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub report_to: Option<String>,
    pub current_custodian: Option<String>,
    pub crc_type: CrcType,
    /// Creation time, ms since DTN epoch; 0 for anonymous sources.
    pub creation_timestamp_ms: DtnTime,
    /// Local reception time; set exactly once by the bundle processor.
    pub reception_timestamp_ms: DtnTime,
    pub sequence_number: u64,
    pub lifetime_ms: u64,
    pub fragment_offset: u64,
    pub total_adu_length: u64,
    pub blocks: Vec<Block>,
}

/// Identifies a bundle (or fragment) uniquely across the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleUniqueId {
    pub version: ProtocolVersion,
    pub source: Option<String>,
    pub creation_timestamp_ms: DtnTime,
    pub sequence_number: u64,
    pub fragment_offset: u64,
    pub payload_length: u64,
}

impl BundleUniqueId {
    /// Whether `other` belongs to the same original ADU (ignores the
    /// fragment position fields).
    pub fn same_adu(&self, other: &BundleUniqueId) -> bool {
        self.version == other.version
            && self.source == other.source
            && self.creation_timestamp_ms == other.creation_timestamp_ms
            && self.sequence_number == other.sequence_number
    }
}

/// An application data unit: the payload plus the addressing fields an
/// agent sees after local delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleAdu {
    pub version: ProtocolVersion,
    pub proc_flags: BundleFlags,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub payload: Vec<u8>,
}

impl Bundle {
    fn new_internal(version: ProtocolVersion) -> Self {
        Self {
            version,
            proc_flags: BundleFlags::empty(),
            ret_constraints: RetentionConstraints::empty(),
            source: None,
            destination: None,
            report_to: None,
            current_custodian: None,
            crc_type: CrcType::None,
            creation_timestamp_ms: 0,
            reception_timestamp_ms: 0,
            sequence_number: 0,
            lifetime_ms: 0,
            fragment_offset: 0,
            total_adu_length: 0,
            blocks: Vec::new(),
        }
    }

    /// Creates a local BPv7 bundle carrying `payload`.
    ///
    /// Takes ownership of the payload buffer regardless of outcome; on
    /// EID validation failure the buffer is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn new_v7(
        source: &str,
        destination: &str,
        creation_time_ms: DtnTime,
        sequence_number: u64,
        lifetime_ms: u64,
        proc_flags: BundleFlags,
        payload: Vec<u8>,
    ) -> Result<Self> {
        eid::validate_eid(source)?;
        eid::validate_eid(destination)?;
        let mut bundle = Self::new_internal(ProtocolVersion::V7);
        bundle.proc_flags = proc_flags;
        bundle.source = Some(source.to_string());
        bundle.destination = Some(destination.to_string());
        // `None` is the null endpoint ("dtn:none") throughout the model.
        bundle.report_to = None;
        bundle.creation_timestamp_ms = creation_time_ms;
        bundle.sequence_number = sequence_number;
        bundle.lifetime_ms = lifetime_ms;
        bundle.crc_type = CrcType::Crc16;
        if creation_time_ms == 0 {
            // Anonymous bundles carry their age explicitly.
            bundle
                .blocks
                .push(Block::with_data(BlockType::BundleAge, blocks::bundle_age_serialize(0)));
            bundle.blocks[0].number = 2;
            bundle.blocks[0].flags = BlockFlags::MUST_BE_REPLICATED;
        }
        bundle.blocks.push(Block::with_data(BlockType::Payload, payload));
        Ok(bundle)
    }

    /// Creates a local BPv6 bundle carrying `payload`.
    #[allow(clippy::too_many_arguments)]
    pub fn new_v6(
        source: &str,
        destination: &str,
        creation_time_ms: DtnTime,
        sequence_number: u64,
        lifetime_ms: u64,
        proc_flags: BundleFlags,
        payload: Vec<u8>,
    ) -> Result<Self> {
        eid::validate_eid(source)?;
        eid::validate_eid(destination)?;
        let mut bundle = Self::new_internal(ProtocolVersion::V6);
        bundle.proc_flags = proc_flags | BundleFlags::V6_SINGLETON;
        bundle.source = Some(source.to_string());
        bundle.destination = Some(destination.to_string());
        bundle.report_to = None;
        bundle.current_custodian = None;
        bundle.creation_timestamp_ms = creation_time_ms;
        bundle.sequence_number = sequence_number;
        bundle.lifetime_ms = lifetime_ms;
        let mut payload_block = Block::with_data(BlockType::Payload, payload);
        payload_block.flags = BlockFlags::LAST_BLOCK;
        bundle.blocks.push(payload_block);
        Ok(bundle)
    }

    /// The payload block. Model-conformant bundles always have one.
    pub fn payload_block(&self) -> Option<&Block> {
        self.blocks.iter().find(|b| b.block_type == BlockType::Payload)
    }

    pub fn payload_block_mut(&mut self) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.block_type == BlockType::Payload)
    }

    /// Length of the payload in bytes.
    pub fn payload_length(&self) -> u64 {
        self.payload_block().map(|b| b.data.len() as u64).unwrap_or(0)
    }

    pub fn block_by_type(&self, t: BlockType) -> Option<&Block> {
        self.blocks.iter().find(|b| b.block_type == t)
    }

    pub fn block_by_type_mut(&mut self, t: BlockType) -> Option<&mut Block> {
        self.blocks.iter_mut().find(|b| b.block_type == t)
    }

    pub fn is_fragment(&self) -> bool {
        self.proc_flags.contains(BundleFlags::IS_FRAGMENT)
    }

    pub fn must_not_fragment(&self) -> bool {
        self.proc_flags.contains(BundleFlags::MUST_NOT_FRAGMENT)
    }

    /// The routing priority class used for contact capacity accounting.
    pub fn routing_priority(&self) -> RoutingPriority {
        if self
            .ret_constraints
            .intersects(RetentionConstraints::OWN | RetentionConstraints::CUSTODY_ACCEPTED)
            || (self.version == ProtocolVersion::V6
                && self.proc_flags.contains(BundleFlags::V6_EXPEDITED_PRIORITY))
        {
            RoutingPriority::High
        } else if self.version == ProtocolVersion::V7
            || self.proc_flags.contains(BundleFlags::V6_NORMAL_PRIORITY)
        {
            RoutingPriority::Normal
        } else {
            RoutingPriority::Low
        }
    }

    /// The absolute expiration deadline in ms since the DTN epoch.
    ///
    /// Bundles with a known creation time expire `lifetime` after it.
    /// Anonymous bundles (creation time 0) derive the deadline from
    /// their bundle-age block and the local residence time; without an
    /// age block the deadline is 0, i.e. already expired.
    pub fn expiration_time_ms(&self, now_ms: DtnTime) -> DtnTime {
        if self.creation_timestamp_ms != 0 {
            return self.creation_timestamp_ms.saturating_add(self.lifetime_ms);
        }
        let Some(age_block) = self.block_by_type(BlockType::BundleAge) else {
            return 0;
        };
        let Ok(age_ms) = blocks::bundle_age_parse(&age_block.data) else {
            return 0;
        };
        let residence_ms = now_ms.saturating_sub(self.reception_timestamp_ms);
        now_ms
            .saturating_add(self.lifetime_ms)
            .saturating_sub(age_ms)
            .saturating_sub(residence_ms)
    }

    /// Increments the bundle-age block by the local dwell time. Bundles
    /// without an age block are left untouched.
    pub fn update_bundle_age(&mut self, dwell_time_ms: u64) -> Result<()> {
        let Some(block) = self.block_by_type_mut(BlockType::BundleAge) else {
            return Ok(());
        };
        let age = blocks::bundle_age_parse(&block.data)?;
        block.data = blocks::bundle_age_serialize(age + dwell_time_ms);
        Ok(())
    }

    /// Removes the previous-node block, if any, as required before
    /// forwarding.
    pub fn remove_previous_node_block(&mut self) {
        if let Some(pos) = self
            .blocks
            .iter()
            .position(|b| b.block_type == BlockType::PreviousNode)
        {
            self.blocks.remove(pos);
        }
    }

    /// Extracts the unique identifier tuple of this bundle.
    pub fn unique_id(&self) -> BundleUniqueId {
        BundleUniqueId {
            version: self.version,
            source: self.source.clone(),
            creation_timestamp_ms: self.creation_timestamp_ms,
            sequence_number: self.sequence_number,
            fragment_offset: self.fragment_offset,
            payload_length: self.payload_length(),
        }
    }

    /// Whether this bundle is exactly the fragment `id` identifies.
    pub fn matches_id(&self, id: &BundleUniqueId) -> bool {
        self.matches_parent_id(id)
            && self.fragment_offset == id.fragment_offset
            && self.payload_length() == id.payload_length
    }

    /// Whether this bundle stems from the same original ADU as `id`.
    pub fn matches_parent_id(&self, id: &BundleUniqueId) -> bool {
        self.version == id.version
            && self.source == id.source
            && self.creation_timestamp_ms == id.creation_timestamp_ms
            && self.sequence_number == id.sequence_number
    }

    /// Whether two bundles carry fragments of the same original ADU.
    pub fn same_adu_as(&self, other: &Bundle) -> bool {
        self.creation_timestamp_ms == other.creation_timestamp_ms
            && self.sequence_number == other.sequence_number
            && self.source == other.source
    }

    /// Converts the bundle into an ADU, detaching payload ownership.
    pub fn into_adu(mut self) -> BundleAdu {
        let payload = self
            .payload_block_mut()
            .map(|b| std::mem::take(&mut b.data))
            .unwrap_or_default();
        BundleAdu {
            version: self.version,
            proc_flags: self.proc_flags & !BundleFlags::IS_FRAGMENT,
            source: self.source,
            destination: self.destination,
            payload,
        }
    }

    /// Serialized size of the whole bundle in its wire format.
    pub fn serialized_size(&self) -> usize {
        crate::codec::serialized_size(self)
    }

    /// Minimum serialized size of the first fragment: the primary block,
    /// all extension blocks, and a payload block header with a
    /// conservative size placeholder.
    pub fn first_fragment_min_size(&self) -> usize {
        match self.version {
            ProtocolVersion::V6 => crate::bundle6::first_fragment_min_size(self),
            ProtocolVersion::V7 => crate::bundle7::fragment_min_size(self, true),
        }
    }

    /// Minimum serialized size of a middle fragment. On BPv7 all
    /// extension blocks travel with the first fragment, so middle and
    /// last fragments have the same minimum size.
    pub fn mid_fragment_min_size(&self) -> usize {
        match self.version {
            ProtocolVersion::V6 => crate::bundle6::mid_fragment_min_size(self),
            ProtocolVersion::V7 => crate::bundle7::fragment_min_size(self, false),
        }
    }

    /// Minimum serialized size of the last fragment.
    pub fn last_fragment_min_size(&self) -> usize {
        match self.version {
            ProtocolVersion::V6 => crate::bundle6::last_fragment_min_size(self),
            ProtocolVersion::V7 => crate::bundle7::fragment_min_size(self, false),
        }
    }

    /// Checks the structural invariants of the block list. Used by the
    /// parsers before handing a bundle to the processor.
    pub fn verify_blocks(&self) -> Result<()> {
        let payload_count = self
            .blocks
            .iter()
            .filter(|b| b.block_type == BlockType::Payload)
            .count();
        if payload_count != 1 {
            return Err(Error::Parse("bundle must contain exactly one payload block"));
        }
        if self.blocks.last().map(|b| b.block_type) != Some(BlockType::Payload) {
            return Err(Error::Parse("payload block must be the last block"));
        }
        if self.version == ProtocolVersion::V7 {
            for (i, a) in self.blocks.iter().enumerate() {
                if a.block_type == BlockType::Payload && a.number != 1 {
                    return Err(Error::Parse("payload block must have number 1"));
                }
                if self.blocks[i + 1..].iter().any(|b| b.number == a.number) {
                    return Err(Error::Parse("duplicate block number"));
                }
            }
        }
        if self.is_fragment()
            && self.fragment_offset + self.payload_length() > self.total_adu_length
        {
            return Err(Error::Parse("fragment exceeds total ADU length"));
        }
        Ok(())
    }
}
