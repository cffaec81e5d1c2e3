//! Administrative records: status reports, custody signals, and
//! bundle-in-bundle encapsulation (BPDU).

use crate::bundle::{Bundle, BundleFlags, ProtocolVersion};
use crate::time::DtnTime;
use crate::{bundle6, bundle7, Result};
use bitflags::bitflags;

bitflags! {
    /// Status assertion flags of a bundle status report.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatusFlags: u8 {
        const RECEIVED = 1 << 0;
        const FORWARDED = 1 << 1;
        const DELIVERED = 1 << 2;
        const DELETED = 1 << 3;
    }
}

/// Status report reason codes (RFC 9171 §9.4; BPv6 uses compatible
/// values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReasonCode {
    NoInfo = 0,
    LifetimeExpired = 1,
    ForwardedOverUnidirectionalLink = 2,
    TransmissionCanceled = 3,
    DepletedStorage = 4,
    DestEidUnintelligible = 5,
    NoKnownRoute = 6,
    NoTimelyContact = 7,
    BlockUnintelligible = 8,
    HopLimitExceeded = 9,
}

/// The kind of administrative record found in an ADU payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    StatusReport,
    CustodySignal,
    /// Bundle-in-bundle encapsulation; the encapsulated bundle starts
    /// at the carried offset.
    Bpdu,
    Other(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdministrativeRecord {
    pub kind: RecordKind,
    /// Offset of the record content within the ADU payload.
    pub content_offset: usize,
}

/// Parses the envelope of an administrative record carried in an ADU of
/// the given protocol version.
pub fn parse_administrative_record(
    version: ProtocolVersion,
    payload: &[u8],
) -> Result<AdministrativeRecord> {
    match version {
        ProtocolVersion::V7 => {
            let rec = bundle7::parse_administrative_record(payload)?;
            let kind = match rec.record_type {
                bundle7::AR_STATUS_REPORT => RecordKind::StatusReport,
                bundle7::AR_BPDU | bundle7::AR_BPDU_COMPAT => RecordKind::Bpdu,
                other => RecordKind::Other(other),
            };
            Ok(AdministrativeRecord {
                kind,
                content_offset: rec.content_offset,
            })
        }
        ProtocolVersion::V6 => {
            let (record_type, content_offset) = bundle6::parse_administrative_record(payload)?;
            let kind = match record_type {
                bundle6::AR_STATUS_REPORT => RecordKind::StatusReport,
                bundle6::AR_CUSTODY_SIGNAL => RecordKind::CustodySignal,
                other => RecordKind::Other(other as u64),
            };
            Ok(AdministrativeRecord {
                kind,
                content_offset,
            })
        }
    }
}

/// Generates a status-report bundle about `subject`, addressed to its
/// report-to EID and originating from `local_eid`.
///
/// Returns `None` when the subject carries no report-to endpoint.
pub fn generate_status_report(
    subject: &Bundle,
    status: StatusFlags,
    reason: ReasonCode,
    local_eid: &str,
    now_ms: DtnTime,
    sequence_number: u64,
) -> Option<Bundle> {
    let report_to = subject.report_to.as_deref()?;
    let payload = match subject.version {
        ProtocolVersion::V7 => {
            bundle7::serialize_status_report(subject, status.bits(), reason as u8, now_ms).ok()?
        }
        ProtocolVersion::V6 => {
            bundle6::serialize_status_report(subject, status.bits(), reason as u8, now_ms)
        }
    };
    let mut report = match subject.version {
        ProtocolVersion::V7 => Bundle::new_v7(
            local_eid,
            report_to,
            now_ms,
            sequence_number,
            subject.lifetime_ms,
            BundleFlags::ADMINISTRATIVE_RECORD,
            payload,
        ),
        ProtocolVersion::V6 => Bundle::new_v6(
            local_eid,
            report_to,
            now_ms,
            sequence_number,
            subject.lifetime_ms,
            BundleFlags::ADMINISTRATIVE_RECORD,
            payload,
        ),
    }
    .ok()?;
    report.ret_constraints |= crate::bundle::RetentionConstraints::OWN;
    Some(report)
}
