//! Fragmentation post-step: turns a multi-fragment plan into child
//! bundles carrying payload slices.
//!
//! The router plans with conservative header-size estimates, so the
//! actual fragments may fit in fewer pieces; in that case the plan is
//! shortened and the tail commitments are dropped.

use crate::router::RouterPlan;
use bpa_proto::bundle::{Block, BlockFlags, BlockType, Bundle, BundleFlags};
use bpa_proto::Error;

/// Builds one fragment of `bundle` carrying `payload` at ADU offset
/// `offset`. The first fragment carries every extension block, later
/// ones only those flagged for replication.
fn build_fragment(bundle: &Bundle, offset: u64, payload: Vec<u8>, first: bool) -> Bundle {
    let mut fragment = bundle.clone();
    fragment.proc_flags |= BundleFlags::IS_FRAGMENT;
    fragment.fragment_offset = offset;
    fragment.blocks = bundle
        .blocks
        .iter()
        .filter(|b| b.block_type != BlockType::Payload)
        .filter(|b| first || b.flags.contains(BlockFlags::MUST_BE_REPLICATED))
        .cloned()
        .collect();
    let payload_template = bundle.payload_block().cloned().unwrap_or_else(|| {
        let mut b = Block::new(BlockType::Payload);
        b.flags = BlockFlags::LAST_BLOCK;
        b
    });
    let mut payload_block = payload_template;
    payload_block.data = payload;
    fragment.blocks.push(payload_block);
    fragment
}

/// Splits `bundle` into the fragments described by `plan`.
///
/// Returns the child bundles, at most `plan.fragments.len()` of them.
/// When the remaining payload fits into an earlier fragment than the
/// plan assumed, the output is shorter than the plan. On failure the
/// original bundle is handed back.
pub fn apply_fragmentation(mut bundle: Bundle, plan: &RouterPlan) -> Result<Vec<Bundle>, Bundle> {
    if plan.fragments.len() < 2 {
        return Err(bundle);
    }
    let total_adu = if bundle.is_fragment() {
        bundle.total_adu_length
    } else {
        bundle.payload_length()
    };
    let base_offset = if bundle.is_fragment() {
        bundle.fragment_offset
    } else {
        0
    };
    let Some(payload_block) = bundle.payload_block_mut() else {
        return Err(bundle);
    };
    let payload = std::mem::take(&mut payload_block.data);
    bundle.total_adu_length = total_adu;

    let first_min = bundle.first_fragment_min_size() as u64;
    let mid_min = bundle.mid_fragment_min_size() as u64;
    let last_min = bundle.last_fragment_min_size() as u64;

    let mut fragments = Vec::with_capacity(plan.fragments.len());
    let mut pos: usize = 0;
    for (i, route) in plan.fragments.iter().enumerate() {
        let first = i == 0;
        let last_planned = i == plan.fragments.len() - 1;
        let header_estimate = if first {
            first_min
        } else if last_planned {
            last_min
        } else {
            mid_min
        };
        let budget = header_estimate + route.payload_size;
        let remaining = payload.len() - pos;

        // The estimates are conservative; if everything left fits into
        // this fragment's budget, cut the plan short.
        let take_all = {
            let candidate = build_fragment(
                &bundle,
                base_offset + pos as u64,
                payload[pos..].to_vec(),
                first,
            );
            (candidate.serialized_size() as u64) <= budget
        };
        let chunk = if take_all || last_planned {
            remaining
        } else {
            (route.payload_size as usize).min(remaining)
        };
        if chunk == 0 {
            break;
        }
        let fragment = build_fragment(
            &bundle,
            base_offset + pos as u64,
            payload[pos..pos + chunk].to_vec(),
            first,
        );
        pos += chunk;
        fragments.push(fragment);
        if pos == payload.len() {
            break;
        }
    }

    if pos != payload.len() || fragments.is_empty() {
        // Could not distribute the whole payload; restore the original.
        if let Some(block) = bundle.payload_block_mut() {
            block.data = payload;
        }
        return Err(bundle);
    }
    debug_assert!(verify_fragments(&fragments).is_ok());
    Ok(fragments)
}

/// Validates that the produced fragments tile the payload gaplessly.
fn verify_fragments(fragments: &[Bundle]) -> Result<(), Error> {
    let mut expected_offset = fragments
        .first()
        .map(|f| f.fragment_offset)
        .unwrap_or_default();
    for f in fragments {
        if f.fragment_offset != expected_offset {
            return Err(Error::Parse("fragment offsets do not tile"));
        }
        expected_offset += f.payload_length();
    }
    Ok(())
}
