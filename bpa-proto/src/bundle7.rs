//! RFC 9171 (BPv7) wire format: CBOR-encoded bundles.

use crate::bundle::{
    Block, BlockFlags, BlockType, Bundle, BundleFlags, CrcType, ProtocolVersion,
};
use crate::cbor::{self, CborReader, CborWriter};
use crate::crc::{crc16_x25, crc32_castagnoli};
use crate::eid::EID_NONE;
use crate::{Error, Result};

/// Bundle processing flags that exist on the BPv7 wire.
const V7_FLAG_MASK: u32 = (1 << 21) - 1;
/// Block processing flags that exist on the BPv7 wire.
const V7_BLOCK_FLAG_MASK: u32 = 0x7f;

fn write_eid(w: &mut CborWriter, eid: Option<&str>) -> Result<()> {
    let eid = eid.unwrap_or(EID_NONE);
    if eid == EID_NONE {
        w.array(2);
        w.uint(1);
        w.uint(0);
        return Ok(());
    }
    let (scheme, ssp) = eid
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("EID lacks scheme: {eid:?}")))?;
    match scheme {
        "dtn" => {
            w.array(2);
            w.uint(1);
            w.text(ssp);
        }
        "ipn" => {
            let (node, service) = crate::eid::parse_ipn_ssp(ssp)?;
            w.array(2);
            w.uint(2);
            w.array(2);
            w.uint(node);
            w.uint(service);
        }
        _ => return Err(Error::InvalidArgument(format!("unknown EID scheme: {eid:?}"))),
    }
    Ok(())
}

fn read_eid(r: &mut CborReader) -> Result<Option<String>> {
    if r.array_header()? != Some(2) {
        return Err(Error::Parse("EID is not a 2-array"));
    }
    match r.uint()? {
        1 => {
            // dtn scheme: the SSP is either the uint 0 (the null
            // endpoint) or a text string.
            if r.peek()? >> 5 == 0 {
                if r.uint()? != 0 {
                    return Err(Error::Parse("invalid dtn EID SSP"));
                }
                Ok(None)
            } else {
                Ok(Some(format!("dtn:{}", r.text()?)))
            }
        }
        2 => {
            if r.array_header()? != Some(2) {
                return Err(Error::Parse("ipn SSP is not a 2-array"));
            }
            let node = r.uint()?;
            let service = r.uint()?;
            Ok(Some(format!("ipn:{node}.{service}")))
        }
        _ => Err(Error::Parse("unknown EID scheme code")),
    }
}

/// Serializes a block-sized CRC placeholder, computes the checksum over
/// the finished block, and patches it in.
fn finish_block_crc(block_bytes: &mut [u8], crc_type: CrcType) {
    match crc_type {
        CrcType::None => {}
        CrcType::Crc16 => {
            let crc = crc16_x25(block_bytes);
            let n = block_bytes.len();
            block_bytes[n - 2..].copy_from_slice(&crc.to_be_bytes());
        }
        CrcType::Crc32 => {
            let crc = crc32_castagnoli(block_bytes);
            let n = block_bytes.len();
            block_bytes[n - 4..].copy_from_slice(&crc.to_be_bytes());
        }
    }
}

fn write_crc_placeholder(w: &mut CborWriter, crc_type: CrcType) {
    match crc_type {
        CrcType::None => {}
        CrcType::Crc16 => w.bytes(&[0; 2]),
        CrcType::Crc32 => w.bytes(&[0; 4]),
    }
}

fn serialize_primary(bundle: &Bundle) -> Result<Vec<u8>> {
    let mut w = CborWriter::new();
    let is_fragment = bundle.is_fragment();
    let mut items = 8;
    if is_fragment {
        items += 2;
    }
    if bundle.crc_type != CrcType::None {
        items += 1;
    }
    w.array(items);
    w.uint(7);
    w.uint((bundle.proc_flags.bits() & V7_FLAG_MASK) as u64);
    w.uint(bundle.crc_type.to_u8() as u64);
    write_eid(&mut w, bundle.destination.as_deref())?;
    write_eid(&mut w, bundle.source.as_deref())?;
    write_eid(&mut w, bundle.report_to.as_deref())?;
    w.array(2);
    w.uint(bundle.creation_timestamp_ms);
    w.uint(bundle.sequence_number);
    w.uint(bundle.lifetime_ms);
    if is_fragment {
        w.uint(bundle.fragment_offset);
        w.uint(bundle.total_adu_length);
    }
    write_crc_placeholder(&mut w, bundle.crc_type);
    let mut bytes = w.into_bytes();
    finish_block_crc(&mut bytes, bundle.crc_type);
    Ok(bytes)
}

fn serialize_canonical(block: &Block) -> Vec<u8> {
    let mut w = CborWriter::new();
    let items = if block.crc_type == CrcType::None { 5 } else { 6 };
    w.array(items);
    w.uint(block.block_type.to_u8() as u64);
    w.uint(block.number);
    w.uint((block.flags.bits() & V7_BLOCK_FLAG_MASK) as u64);
    w.uint(block.crc_type.to_u8() as u64);
    w.bytes(&block.data);
    write_crc_placeholder(&mut w, block.crc_type);
    let mut bytes = w.into_bytes();
    finish_block_crc(&mut bytes, block.crc_type);
    bytes
}

/// Serializes a BPv7 bundle through the write callback.
pub fn serialize(
    bundle: &Bundle,
    write: &mut dyn FnMut(&[u8]) -> std::io::Result<()>,
) -> Result<()> {
    write(&[cbor::INDEFINITE_ARRAY])?;
    write(&serialize_primary(bundle)?)?;
    for block in &bundle.blocks {
        write(&serialize_canonical(block))?;
    }
    write(&[cbor::BREAK])?;
    Ok(())
}

fn verify_crc(block_bytes: &[u8], crc_type: CrcType) -> Result<()> {
    let ok = match crc_type {
        CrcType::None => true,
        CrcType::Crc16 => {
            let n = block_bytes.len();
            let mut zeroed = block_bytes.to_vec();
            let stored = u16::from_be_bytes([zeroed[n - 2], zeroed[n - 1]]);
            zeroed[n - 2..].fill(0);
            crc16_x25(&zeroed) == stored
        }
        CrcType::Crc32 => {
            let n = block_bytes.len();
            let mut zeroed = block_bytes.to_vec();
            let stored =
                u32::from_be_bytes([zeroed[n - 4], zeroed[n - 3], zeroed[n - 2], zeroed[n - 1]]);
            zeroed[n - 4..].fill(0);
            crc32_castagnoli(&zeroed) == stored
        }
    };
    if ok {
        Ok(())
    } else {
        Err(Error::Parse("block CRC mismatch"))
    }
}

fn parse_primary(r: &mut CborReader, bundle: &mut Bundle) -> Result<()> {
    let start = r.position();
    let Some(items) = r.array_header()? else {
        return Err(Error::Parse("primary block must be a definite array"));
    };
    if !(8..=11).contains(&items) {
        return Err(Error::Parse("unexpected primary block length"));
    }
    if r.uint()? != 7 {
        return Err(Error::Parse("unsupported bundle protocol version"));
    }
    let flags = r.uint()?;
    bundle.proc_flags = BundleFlags::from_bits_truncate((flags as u32) & V7_FLAG_MASK);
    bundle.crc_type = CrcType::from_u8(r.uint()? as u8)?;
    bundle.destination = read_eid(r)?;
    bundle.source = read_eid(r)?;
    bundle.report_to = read_eid(r)?;
    if r.array_header()? != Some(2) {
        return Err(Error::Parse("creation timestamp is not a 2-array"));
    }
    bundle.creation_timestamp_ms = r.uint()?;
    bundle.sequence_number = r.uint()?;
    bundle.lifetime_ms = r.uint()?;
    if bundle.is_fragment() {
        bundle.fragment_offset = r.uint()?;
        bundle.total_adu_length = r.uint()?;
    }
    let expected = 8
        + if bundle.is_fragment() { 2 } else { 0 }
        + if bundle.crc_type == CrcType::None { 0 } else { 1 };
    if items != expected {
        return Err(Error::Parse("primary block field count mismatch"));
    }
    if bundle.crc_type != CrcType::None {
        let crc_len = r.bytes()?.len();
        match (bundle.crc_type, crc_len) {
            (CrcType::Crc16, 2) | (CrcType::Crc32, 4) => {}
            _ => return Err(Error::Parse("primary block CRC length mismatch")),
        }
    }
    // Verify over the full encoded primary block.
    let end = r.position();
    verify_crc(&copy_range(r, start, end), bundle.crc_type)
}

fn parse_canonical(r: &mut CborReader) -> Result<Block> {
    let start = r.position();
    let Some(items) = r.array_header()? else {
        return Err(Error::Parse("canonical block must be a definite array"));
    };
    if !(5..=6).contains(&items) {
        return Err(Error::Parse("unexpected canonical block length"));
    }
    let block_type = BlockType::from_u8(r.uint()? as u8);
    let number = r.uint()?;
    let flags = BlockFlags::from_bits_truncate((r.uint()? as u32) & V7_BLOCK_FLAG_MASK);
    let crc_type = CrcType::from_u8(r.uint()? as u8)?;
    let data = r.bytes()?.to_vec();
    let expected_items = if crc_type == CrcType::None { 5 } else { 6 };
    if items != expected_items {
        return Err(Error::Parse("canonical block CRC field mismatch"));
    }
    if crc_type != CrcType::None {
        r.bytes()?;
    }
    let end = r.position();
    verify_crc(&copy_range(r, start, end), crc_type)?;
    Ok(Block {
        block_type,
        number,
        flags,
        crc_type,
        data,
        eid_refs: Vec::new(),
    })
}

fn copy_range(r: &CborReader, start: usize, end: usize) -> Vec<u8> {
    // The reader owns no buffer, so re-slice the original input.
    r.raw_input()[start..end].to_vec()
}

/// Parses one complete BPv7 bundle from the start of `data`, returning
/// the bundle and the number of bytes consumed.
pub fn parse(data: &[u8]) -> Result<(Bundle, usize)> {
    let mut r = CborReader::new(data);
    let outer = r.array_header()?;
    let mut bundle = Bundle {
        version: ProtocolVersion::V7,
        proc_flags: BundleFlags::empty(),
        ret_constraints: Default::default(),
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
    };
    parse_primary(&mut r, &mut bundle)?;
    match outer {
        None => loop {
            if r.try_stop()? {
                break;
            }
            bundle.blocks.push(parse_canonical(&mut r)?);
        },
        Some(n) => {
            for _ in 1..n {
                bundle.blocks.push(parse_canonical(&mut r)?);
            }
        }
    }
    bundle.verify_blocks()?;
    if bundle.creation_timestamp_ms == 0
        && bundle.block_by_type(BlockType::BundleAge).is_none()
    {
        return Err(Error::Parse(
            "bundle without creation time requires a bundle-age block",
        ));
    }
    Ok((bundle, r.position()))
}

/// Minimum serialized size of a fragment of this bundle.
///
/// Uses conservative (maximum-width) size estimates for the fields the
/// fragmenter fills in later, so the actual fragments never exceed the
/// estimate.
pub fn fragment_min_size(bundle: &Bundle, first: bool) -> usize {
    let primary = primary_fragment_size(bundle);
    let blocks: usize = bundle
        .blocks
        .iter()
        .filter(|b| b.block_type != BlockType::Payload)
        .filter(|b| first || b.flags.contains(BlockFlags::MUST_BE_REPLICATED))
        .map(|b| serialize_canonical(b).len())
        .sum();
    // Indefinite-array framing plus a payload block header with a
    // worst-case length field.
    1 + primary + blocks + payload_header_max_size(bundle) + 1
}

fn primary_fragment_size(bundle: &Bundle) -> usize {
    let mut frag = bundle.clone();
    frag.proc_flags |= BundleFlags::IS_FRAGMENT;
    frag.fragment_offset = u64::MAX;
    frag.total_adu_length = u64::MAX;
    serialize_primary(&frag).map(|b| b.len()).unwrap_or(0)
}

fn payload_header_max_size(bundle: &Bundle) -> usize {
    // array(6 max) + type + number + flags + crc_type + bytes header
    // (worst-case 9) + crc bytes
    let crc_bytes = match bundle
        .payload_block()
        .map(|b| b.crc_type)
        .unwrap_or(CrcType::None)
    {
        CrcType::None => 0,
        CrcType::Crc16 => 3,
        CrcType::Crc32 => 5,
    };
    1 + 1 + 1 + 1 + 1 + 9 + crc_bytes
}

// Administrative records ------------------------------------------------

/// BPv7 administrative record types.
pub const AR_STATUS_REPORT: u64 = 1;
pub const AR_BPDU: u64 = 3;
pub const AR_BPDU_COMPAT: u64 = 7;

/// Serializes a status-report administrative record (the ADU payload of
/// a report bundle).
pub fn serialize_status_report(
    subject: &Bundle,
    status_flags: u8,
    reason: u8,
    time_ms: u64,
) -> Result<Vec<u8>> {
    let mut w = CborWriter::new();
    w.array(2);
    w.uint(AR_STATUS_REPORT);
    let mut items = 4;
    if subject.is_fragment() {
        items += 2;
    }
    w.array(items);
    // Four status assertions: received, forwarded, delivered, deleted.
    w.array(4);
    for bit in 0..4 {
        let asserted = status_flags & (1 << bit) != 0;
        if asserted {
            w.array(2);
            w.bool(true);
            w.uint(time_ms);
        } else {
            w.array(1);
            w.bool(false);
        }
    }
    w.uint(reason as u64);
    write_eid(&mut w, subject.source.as_deref())?;
    w.array(2);
    w.uint(subject.creation_timestamp_ms);
    w.uint(subject.sequence_number);
    if subject.is_fragment() {
        w.uint(subject.fragment_offset);
        w.uint(subject.payload_length());
    }
    Ok(w.into_bytes())
}

/// A parsed administrative record header. `content_offset` points at the
/// record-type-specific content within the ADU payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdministrativeRecord {
    pub record_type: u64,
    pub content_offset: usize,
}

/// Parses the envelope of a BPv7 administrative record.
pub fn parse_administrative_record(payload: &[u8]) -> Result<AdministrativeRecord> {
    let mut r = CborReader::new(payload);
    let Some(2) = r.array_header()? else {
        return Err(Error::Parse("administrative record is not a 2-array"));
    };
    let record_type = r.uint()?;
    Ok(AdministrativeRecord {
        record_type,
        content_offset: r.position(),
    })
}
