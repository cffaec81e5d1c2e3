//! RFC 5050 (BPv6) wire format: SDNV-encoded bundles with an EID
//! dictionary in the primary block.

use crate::bundle::{Block, BlockFlags, BlockType, Bundle, BundleFlags, CrcType, ProtocolVersion};
use crate::eid::EID_NONE;
use crate::sdnv;
use crate::{Error, Result};

// RFC 5050 §4.2 bundle processing flag bits.
const V6_FLAG_IS_FRAGMENT: u64 = 1 << 0;
const V6_FLAG_ADMIN_RECORD: u64 = 1 << 1;
const V6_FLAG_MUST_NOT_FRAGMENT: u64 = 1 << 2;
const V6_FLAG_CUSTODY_TRANSFER: u64 = 1 << 3;
const V6_FLAG_SINGLETON: u64 = 1 << 4;
const V6_FLAG_ACK_REQUESTED: u64 = 1 << 5;
const V6_PRIO_SHIFT: u32 = 7;
const V6_FLAG_REPORT_RECEPTION: u64 = 1 << 14;
const V6_FLAG_REPORT_FORWARDING: u64 = 1 << 16;
const V6_FLAG_REPORT_DELIVERY: u64 = 1 << 17;
const V6_FLAG_REPORT_DELETION: u64 = 1 << 18;

// RFC 5050 §4.3 block processing flag bits.
const V6_BLOCK_MUST_BE_REPLICATED: u64 = 1 << 0;
const V6_BLOCK_REPORT_IF_UNPROC: u64 = 1 << 1;
const V6_BLOCK_DELETE_BUNDLE_IF_UNPROC: u64 = 1 << 2;
const V6_BLOCK_LAST_BLOCK: u64 = 1 << 3;
const V6_BLOCK_DISCARD_IF_UNPROC: u64 = 1 << 4;
const V6_BLOCK_FWD_UNPROC: u64 = 1 << 5;
const V6_BLOCK_HAS_EID_REF: u64 = 1 << 6;

fn flags_to_wire(bundle: &Bundle) -> u64 {
    let f = bundle.proc_flags;
    let mut wire = 0;
    let pairs = [
        (BundleFlags::IS_FRAGMENT, V6_FLAG_IS_FRAGMENT),
        (BundleFlags::ADMINISTRATIVE_RECORD, V6_FLAG_ADMIN_RECORD),
        (BundleFlags::MUST_NOT_FRAGMENT, V6_FLAG_MUST_NOT_FRAGMENT),
        (BundleFlags::V6_CUSTODY_TRANSFER, V6_FLAG_CUSTODY_TRANSFER),
        (BundleFlags::V6_SINGLETON, V6_FLAG_SINGLETON),
        (BundleFlags::ACKNOWLEDGEMENT_REQUESTED, V6_FLAG_ACK_REQUESTED),
        (BundleFlags::REPORT_RECEPTION, V6_FLAG_REPORT_RECEPTION),
        (BundleFlags::REPORT_FORWARDING, V6_FLAG_REPORT_FORWARDING),
        (BundleFlags::REPORT_DELIVERY, V6_FLAG_REPORT_DELIVERY),
        (BundleFlags::REPORT_DELETION, V6_FLAG_REPORT_DELETION),
    ];
    for (internal, wire_bit) in pairs {
        if f.contains(internal) {
            wire |= wire_bit;
        }
    }
    let prio = if f.contains(BundleFlags::V6_EXPEDITED_PRIORITY) {
        2
    } else if f.contains(BundleFlags::V6_NORMAL_PRIORITY) {
        1
    } else {
        0
    };
    wire | (prio << V6_PRIO_SHIFT)
}

fn flags_from_wire(wire: u64) -> BundleFlags {
    let mut f = BundleFlags::empty();
    let pairs = [
        (V6_FLAG_IS_FRAGMENT, BundleFlags::IS_FRAGMENT),
        (V6_FLAG_ADMIN_RECORD, BundleFlags::ADMINISTRATIVE_RECORD),
        (V6_FLAG_MUST_NOT_FRAGMENT, BundleFlags::MUST_NOT_FRAGMENT),
        (V6_FLAG_CUSTODY_TRANSFER, BundleFlags::V6_CUSTODY_TRANSFER),
        (V6_FLAG_SINGLETON, BundleFlags::V6_SINGLETON),
        (V6_FLAG_ACK_REQUESTED, BundleFlags::ACKNOWLEDGEMENT_REQUESTED),
        (V6_FLAG_REPORT_RECEPTION, BundleFlags::REPORT_RECEPTION),
        (V6_FLAG_REPORT_FORWARDING, BundleFlags::REPORT_FORWARDING),
        (V6_FLAG_REPORT_DELIVERY, BundleFlags::REPORT_DELIVERY),
        (V6_FLAG_REPORT_DELETION, BundleFlags::REPORT_DELETION),
    ];
    for (wire_bit, internal) in pairs {
        if wire & wire_bit != 0 {
            f |= internal;
        }
    }
    match (wire >> V6_PRIO_SHIFT) & 0x3 {
        1 => f |= BundleFlags::V6_NORMAL_PRIORITY,
        2 => f |= BundleFlags::V6_EXPEDITED_PRIORITY,
        _ => {}
    }
    f
}

fn block_flags_to_wire(flags: BlockFlags) -> u64 {
    let mut wire = 0;
    let pairs = [
        (BlockFlags::MUST_BE_REPLICATED, V6_BLOCK_MUST_BE_REPLICATED),
        (BlockFlags::REPORT_IF_UNPROC, V6_BLOCK_REPORT_IF_UNPROC),
        (
            BlockFlags::DELETE_BUNDLE_IF_UNPROC,
            V6_BLOCK_DELETE_BUNDLE_IF_UNPROC,
        ),
        (BlockFlags::LAST_BLOCK, V6_BLOCK_LAST_BLOCK),
        (BlockFlags::DISCARD_IF_UNPROC, V6_BLOCK_DISCARD_IF_UNPROC),
        (BlockFlags::FWD_UNPROC, V6_BLOCK_FWD_UNPROC),
        (BlockFlags::HAS_EID_REF, V6_BLOCK_HAS_EID_REF),
    ];
    for (internal, wire_bit) in pairs {
        if flags.contains(internal) {
            wire |= wire_bit;
        }
    }
    wire
}

fn block_flags_from_wire(wire: u64) -> BlockFlags {
    let mut f = BlockFlags::empty();
    let pairs = [
        (V6_BLOCK_MUST_BE_REPLICATED, BlockFlags::MUST_BE_REPLICATED),
        (V6_BLOCK_REPORT_IF_UNPROC, BlockFlags::REPORT_IF_UNPROC),
        (
            V6_BLOCK_DELETE_BUNDLE_IF_UNPROC,
            BlockFlags::DELETE_BUNDLE_IF_UNPROC,
        ),
        (V6_BLOCK_LAST_BLOCK, BlockFlags::LAST_BLOCK),
        (V6_BLOCK_DISCARD_IF_UNPROC, BlockFlags::DISCARD_IF_UNPROC),
        (V6_BLOCK_FWD_UNPROC, BlockFlags::FWD_UNPROC),
        (V6_BLOCK_HAS_EID_REF, BlockFlags::HAS_EID_REF),
    ];
    for (wire_bit, internal) in pairs {
        if wire & wire_bit != 0 {
            f |= internal;
        }
    }
    f
}

/// The EID dictionary of a BPv6 primary block: a list of NUL-terminated
/// strings, referenced by byte offset.
#[derive(Debug, Default)]
struct Dictionary {
    bytes: Vec<u8>,
}

impl Dictionary {
    fn offset_of(&mut self, s: &str) -> u64 {
        let needle = s.as_bytes();
        let mut pos = 0;
        while pos < self.bytes.len() {
            let end = self.bytes[pos..]
                .iter()
                .position(|&b| b == 0)
                .map(|i| pos + i)
                .unwrap_or(self.bytes.len());
            if &self.bytes[pos..end] == needle {
                return pos as u64;
            }
            pos = end + 1;
        }
        let offset = self.bytes.len() as u64;
        self.bytes.extend_from_slice(needle);
        self.bytes.push(0);
        offset
    }

    fn lookup(bytes: &[u8], offset: u64) -> Result<&str> {
        let start = offset as usize;
        if start >= bytes.len() {
            return Err(Error::Parse("dictionary offset out of range"));
        }
        let end = bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|i| start + i)
            .ok_or(Error::Parse("unterminated dictionary entry"))?;
        std::str::from_utf8(&bytes[start..end])
            .map_err(|_| Error::Parse("invalid UTF-8 in dictionary"))
    }
}

fn split_eid(eid: Option<&str>) -> (String, String) {
    let eid = eid.unwrap_or(EID_NONE);
    match eid.split_once(':') {
        Some((scheme, ssp)) => (scheme.to_string(), ssp.to_string()),
        None => ("dtn".to_string(), "none".to_string()),
    }
}

fn serialize_primary(bundle: &Bundle) -> Vec<u8> {
    let mut dict = Dictionary::default();
    let mut refs = Vec::with_capacity(8);
    for eid in [
        bundle.destination.as_deref(),
        bundle.source.as_deref(),
        bundle.report_to.as_deref(),
        bundle.current_custodian.as_deref(),
    ] {
        let (scheme, ssp) = split_eid(eid);
        refs.push(dict.offset_of(&scheme));
        refs.push(dict.offset_of(&ssp));
    }

    let mut body = Vec::new();
    for r in refs {
        sdnv::encode(r, &mut body);
    }
    sdnv::encode(bundle.creation_timestamp_ms / 1000, &mut body);
    sdnv::encode(bundle.sequence_number, &mut body);
    sdnv::encode(bundle.lifetime_ms / 1000, &mut body);
    sdnv::encode(dict.bytes.len() as u64, &mut body);
    body.extend_from_slice(&dict.bytes);
    if bundle.is_fragment() {
        sdnv::encode(bundle.fragment_offset, &mut body);
        sdnv::encode(bundle.total_adu_length, &mut body);
    }

    let mut out = Vec::with_capacity(body.len() + 16);
    out.push(6);
    sdnv::encode(flags_to_wire(bundle), &mut out);
    sdnv::encode(body.len() as u64, &mut out);
    out.extend_from_slice(&body);
    out
}

fn serialize_block(block: &Block, is_last: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.data.len() + 8);
    out.push(block.block_type.to_u8());
    let mut flags = block_flags_to_wire(block.flags) & !V6_BLOCK_LAST_BLOCK;
    if is_last {
        flags |= V6_BLOCK_LAST_BLOCK;
    }
    sdnv::encode(flags, &mut out);
    sdnv::encode(block.data.len() as u64, &mut out);
    out.extend_from_slice(&block.data);
    out
}

/// Serializes a BPv6 bundle through the write callback.
pub fn serialize(
    bundle: &Bundle,
    write: &mut dyn FnMut(&[u8]) -> std::io::Result<()>,
) -> Result<()> {
    write(&serialize_primary(bundle))?;
    let last = bundle.blocks.len().saturating_sub(1);
    for (i, block) in bundle.blocks.iter().enumerate() {
        write(&serialize_block(block, i == last))?;
    }
    Ok(())
}

struct SdnvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SdnvReader<'a> {
    fn sdnv(&mut self) -> Result<u64> {
        let (v, used) = sdnv::decode(&self.data[self.pos..])?;
        self.pos += used;
        Ok(v)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < n {
            return Err(Error::Incomplete(n - (self.data.len() - self.pos)));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self.data.get(self.pos).ok_or(Error::Incomplete(1))?;
        self.pos += 1;
        Ok(b)
    }
}

fn read_dict_eid(dict: &[u8], scheme_off: u64, ssp_off: u64) -> Result<Option<String>> {
    let scheme = Dictionary::lookup(dict, scheme_off)?;
    let ssp = Dictionary::lookup(dict, ssp_off)?;
    let eid = format!("{scheme}:{ssp}");
    if eid == EID_NONE {
        Ok(None)
    } else {
        Ok(Some(eid))
    }
}

/// Parses one complete BPv6 bundle from the start of `data`, returning
/// the bundle and the number of bytes consumed.
pub fn parse(data: &[u8]) -> Result<(Bundle, usize)> {
    let mut r = SdnvReader { data, pos: 0 };
    if r.byte()? != 6 {
        return Err(Error::Parse("unsupported bundle protocol version"));
    }
    let wire_flags = r.sdnv()?;
    let block_length = r.sdnv()? as usize;
    let body = r.take(block_length)?;
    let mut b = SdnvReader { data: body, pos: 0 };

    let mut refs = [0u64; 8];
    for slot in refs.iter_mut() {
        *slot = b.sdnv()?;
    }
    let creation_s = b.sdnv()?;
    let sequence_number = b.sdnv()?;
    let lifetime_s = b.sdnv()?;
    let dict_len = b.sdnv()? as usize;
    let dict = b.take(dict_len)?;

    let mut bundle = Bundle {
        version: ProtocolVersion::V6,
        proc_flags: flags_from_wire(wire_flags),
        ret_constraints: Default::default(),
        source: None,
        destination: None,
        report_to: None,
        current_custodian: None,
        crc_type: CrcType::None,
        creation_timestamp_ms: creation_s * 1000,
        reception_timestamp_ms: 0,
        sequence_number,
        lifetime_ms: lifetime_s * 1000,
        fragment_offset: 0,
        total_adu_length: 0,
        blocks: Vec::new(),
    };
    bundle.destination = read_dict_eid(dict, refs[0], refs[1])?;
    bundle.source = read_dict_eid(dict, refs[2], refs[3])?;
    bundle.report_to = read_dict_eid(dict, refs[4], refs[5])?;
    bundle.current_custodian = read_dict_eid(dict, refs[6], refs[7])?;
    if bundle.is_fragment() {
        bundle.fragment_offset = b.sdnv()?;
        bundle.total_adu_length = b.sdnv()?;
    }

    // Block list, terminated by the block flagged "last".
    loop {
        let block_type = BlockType::from_u8(r.byte()?);
        let flags = block_flags_from_wire(r.sdnv()?);
        if flags.contains(BlockFlags::HAS_EID_REF) {
            return Err(Error::Parse("EID reference lists are not supported"));
        }
        let len = r.sdnv()? as usize;
        let data = r.take(len)?.to_vec();
        let is_last = flags.contains(BlockFlags::LAST_BLOCK);
        bundle.blocks.push(Block {
            block_type,
            number: if block_type == BlockType::Payload { 1 } else { 0 },
            flags,
            crc_type: CrcType::None,
            data,
            eid_refs: Vec::new(),
        });
        if is_last {
            break;
        }
        if bundle.blocks.len() > 64 {
            return Err(Error::Parse("too many blocks"));
        }
    }
    bundle.verify_blocks()?;
    Ok((bundle, r.pos))
}

// Fragment sizing -------------------------------------------------------

fn primary_fragment_size(bundle: &Bundle) -> usize {
    let mut frag = bundle.clone();
    frag.proc_flags |= BundleFlags::IS_FRAGMENT;
    frag.fragment_offset = u64::MAX;
    frag.total_adu_length = u64::MAX;
    serialize_primary(&frag).len()
}

fn payload_header_max_size() -> usize {
    // type byte + flags SDNV + worst-case length SDNV
    1 + 1 + sdnv::MAX_SDNV_LEN
}

fn blocks_size(bundle: &Bundle, replicated_only: bool) -> usize {
    bundle
        .blocks
        .iter()
        .filter(|b| b.block_type != BlockType::Payload)
        .filter(|b| !replicated_only || b.flags.contains(BlockFlags::MUST_BE_REPLICATED))
        .map(|b| serialize_block(b, false).len())
        .sum()
}

pub fn first_fragment_min_size(bundle: &Bundle) -> usize {
    primary_fragment_size(bundle) + blocks_size(bundle, false) + payload_header_max_size()
}

pub fn mid_fragment_min_size(bundle: &Bundle) -> usize {
    primary_fragment_size(bundle) + blocks_size(bundle, true) + payload_header_max_size()
}

pub fn last_fragment_min_size(bundle: &Bundle) -> usize {
    // The payload is the last block of the model, so the last fragment
    // carries the same set of replicated blocks as a middle one.
    mid_fragment_min_size(bundle)
}

// Administrative records ------------------------------------------------

/// RFC 5050 administrative record types (high nibble of the first
/// payload byte).
pub const AR_STATUS_REPORT: u8 = 1;
pub const AR_CUSTODY_SIGNAL: u8 = 2;

/// Serializes a BPv6 status-report administrative record.
pub fn serialize_status_report(
    subject: &Bundle,
    status_flags: u8,
    reason: u8,
    time_ms: u64,
) -> Vec<u8> {
    let for_fragment = subject.is_fragment();
    let mut out = Vec::new();
    out.push((AR_STATUS_REPORT << 4) | if for_fragment { 1 } else { 0 });
    out.push(status_flags);
    out.push(reason);
    if for_fragment {
        sdnv::encode(subject.fragment_offset, &mut out);
        sdnv::encode(subject.payload_length(), &mut out);
    }
    // One time-of-status pair (seconds, nanoseconds) per asserted flag.
    for bit in 0..8 {
        if status_flags & (1 << bit) != 0 {
            sdnv::encode(time_ms / 1000, &mut out);
            sdnv::encode((time_ms % 1000) * 1_000_000, &mut out);
        }
    }
    sdnv::encode(subject.creation_timestamp_ms / 1000, &mut out);
    sdnv::encode(subject.sequence_number, &mut out);
    let source = subject.source.as_deref().unwrap_or(EID_NONE);
    sdnv::encode(source.len() as u64, &mut out);
    out.extend_from_slice(source.as_bytes());
    out
}

/// Parses the envelope of a BPv6 administrative record: the record type
/// and the offset of the type-specific content.
pub fn parse_administrative_record(payload: &[u8]) -> Result<(u8, usize)> {
    let first = *payload.first().ok_or(Error::Incomplete(1))?;
    Ok((first >> 4, 1))
}
