//! Endpoint identifier (EID) validation and normalization.
//!
//! Two URI schemes are supported: `dtn` (free-form SSP, node IDs end in
//! `/`) and `ipn` (`ipn:<node>.<service>`, node IDs carry service 0).

use crate::{Error, Result};

/// The null endpoint.
pub const EID_NONE: &str = "dtn:none";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EidScheme {
    Dtn,
    Ipn,
}

/// Determines the scheme of an EID string, without full validation.
pub fn scheme_of(eid: &str) -> Option<EidScheme> {
    match eid.split_once(':')?.0 {
        "dtn" => Some(EidScheme::Dtn),
        "ipn" => Some(EidScheme::Ipn),
        _ => None,
    }
}

/// Validates an EID string.
///
/// `dtn` EIDs need a non-empty SSP; `ipn` EIDs must match
/// `ipn:<u64>.<u64>`. Note that `ipn:0.0` is accepted, matching widely
/// deployed configurations that use it as a null-like local EID.
pub fn validate_eid(eid: &str) -> Result<()> {
    let (scheme, ssp) = eid
        .split_once(':')
        .ok_or_else(|| Error::InvalidArgument(format!("EID lacks scheme: {eid:?}")))?;
    match scheme {
        "dtn" if !ssp.is_empty() => Ok(()),
        "ipn" => {
            parse_ipn_ssp(ssp)?;
            Ok(())
        }
        _ => Err(Error::InvalidArgument(format!("unknown EID scheme: {eid:?}"))),
    }
}

/// Parses the `<node>.<service>` part of an `ipn` EID.
pub fn parse_ipn_ssp(ssp: &str) -> Result<(u64, u64)> {
    let (node, service) = ssp
        .split_once('.')
        .ok_or_else(|| Error::InvalidArgument(format!("malformed ipn SSP: {ssp:?}")))?;
    let node = node
        .parse::<u64>()
        .map_err(|_| Error::InvalidArgument(format!("malformed ipn node: {ssp:?}")))?;
    let service = service
        .parse::<u64>()
        .map_err(|_| Error::InvalidArgument(format!("malformed ipn service: {ssp:?}")))?;
    Ok((node, service))
}

/// Validates that an EID can serve as the local node ID.
///
/// `dtn` node IDs must end with a slash, `ipn` node IDs must use
/// service number 0. Use [`preprocess_local_eid`] first to normalize
/// user input.
pub fn validate_local_eid(eid: &str) -> Result<()> {
    validate_eid(eid)?;
    match scheme_of(eid) {
        Some(EidScheme::Dtn) => {
            if eid.ends_with('/') && eid.len() > "dtn://".len() {
                Ok(())
            } else {
                Err(Error::InvalidArgument(format!(
                    "dtn node ID must end with '/': {eid:?}"
                )))
            }
        }
        Some(EidScheme::Ipn) => {
            let (_, service) = parse_ipn_ssp(&eid[4..])?;
            if service == 0 {
                Ok(())
            } else {
                Err(Error::InvalidArgument(format!(
                    "ipn node ID must use service 0: {eid:?}"
                )))
            }
        }
        None => Err(Error::InvalidArgument(format!("unknown scheme: {eid:?}"))),
    }
}

/// Normalizes a user-specified local node ID, e.g. by appending the
/// trailing slash to `dtn` EIDs. Validation is still required afterwards.
pub fn preprocess_local_eid(eid: &str) -> String {
    if let Some(EidScheme::Dtn) = scheme_of(eid) {
        if !eid.ends_with('/') {
            return format!("{eid}/");
        }
    }
    eid.to_string()
}

/// Extracts the node ID naming the node an EID belongs to.
///
/// For `dtn://node/app` this is `dtn://node/`; for `ipn:n.s` it is
/// `ipn:n.0`. Returns `None` if no node ID can be derived.
pub fn node_id_of(eid: &str) -> Option<String> {
    match scheme_of(eid)? {
        EidScheme::Dtn => {
            let rest = eid.strip_prefix("dtn://")?;
            if rest.is_empty() {
                return None;
            }
            let node = rest.split('/').next()?;
            if node.is_empty() {
                return None;
            }
            Some(format!("dtn://{node}/"))
        }
        EidScheme::Ipn => {
            let (node, _) = parse_ipn_ssp(&eid[4..]).ok()?;
            Some(format!("ipn:{node}.0"))
        }
    }
}

/// Validates the demux (agent/sink identifier) part of a `dtn` EID.
///
/// Allowed characters follow the URI character set the configuration
/// grammar accepts.
pub fn validate_dtn_demux(demux: &str) -> Result<()> {
    let valid = demux
        .bytes()
        .all(|b| (0x21..=0x5f).contains(&b) || (0x61..=0x7a).contains(&b) || b == 0x7e);
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!("invalid demux: {demux:?}")))
    }
}

/// Validates a sink identifier relative to the local EID scheme: for
/// `ipn` nodes sinks are service numbers, for `dtn` nodes they follow
/// the demux character set.
pub fn validate_sink_for_scheme(sink: &str, scheme: EidScheme) -> Result<()> {
    match scheme {
        EidScheme::Ipn => sink
            .parse::<u64>()
            .map(|_| ())
            .map_err(|_| Error::InvalidArgument(format!("ipn sink must be numeric: {sink:?}"))),
        EidScheme::Dtn => validate_dtn_demux(sink),
    }
}
