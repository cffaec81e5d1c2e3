//! Fragment reassembly: slots of same-ADU fragments ordered by offset.

use bpa_proto::bundle::{Bundle, BundleAdu, BundleFlags};
use tracing::debug;

/// Upper bound for a single reassembled ADU. Larger total-ADU claims
/// are treated as a storage-exhaustion condition.
pub const MAX_REASSEMBLY_BYTES: u64 = 1 << 30;

/// Fragments of one original ADU, ordered by fragment offset.
#[derive(Debug)]
struct ReassemblySlot {
    fragments: Vec<Bundle>,
}

impl ReassemblySlot {
    /// Whether the fragments tile `[0, total_adu_length)` without gaps.
    fn is_complete(&self) -> bool {
        let mut pos: u64 = 0;
        for b in &self.fragments {
            if b.fragment_offset > pos {
                return false;
            }
            pos = b.fragment_offset + b.payload_length();
            if pos >= b.total_adu_length {
                return true;
            }
        }
        false
    }

    /// Concatenates the fragment payload slices into the full ADU and
    /// consumes the slot.
    fn assemble(self) -> BundleAdu {
        let first = &self.fragments[0];
        let adu_length = first.total_adu_length as usize;
        let mut payload = vec![0u8; adu_length];
        let mut adu = BundleAdu {
            version: first.version,
            proc_flags: first.proc_flags & !BundleFlags::IS_FRAGMENT,
            source: first.source.clone(),
            destination: first.destination.clone(),
            payload: Vec::new(),
        };
        let mut pos: usize = 0;
        for b in &self.fragments {
            let data = b.payload_block().map(|p| p.data.as_slice()).unwrap_or(&[]);
            let offset_in_fragment = pos - b.fragment_offset as usize;
            if offset_in_fragment < data.len() {
                let chunk = (data.len() - offset_in_fragment).min(adu_length - pos);
                payload[pos..pos + chunk]
                    .copy_from_slice(&data[offset_in_fragment..offset_in_fragment + chunk]);
                pos += chunk;
            }
            if pos >= adu_length {
                break;
            }
        }
        adu.payload = payload;
        adu
    }
}

/// Outcome of offering a fragment for reassembly.
#[derive(Debug)]
pub enum ReassemblyResult {
    /// The fragment was stored; more are needed.
    Incomplete,
    /// The ADU is complete. The first bundle is returned alongside so
    /// the caller can record the synthetic known-bundle entry.
    Complete { adu: BundleAdu, key: Box<Bundle> },
    /// The claimed ADU size exceeds the configured limit.
    TooLarge(Box<Bundle>),
}

#[derive(Debug, Default)]
pub struct ReassemblyStore {
    slots: Vec<ReassemblySlot>,
}

impl ReassemblyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Inserts a fragment into its slot (creating one if needed) and
    /// attempts reassembly.
    pub fn offer(&mut self, bundle: Bundle) -> ReassemblyResult {
        if bundle.total_adu_length > MAX_REASSEMBLY_BYTES {
            return ReassemblyResult::TooLarge(Box::new(bundle));
        }
        let slot_index = self
            .slots
            .iter()
            .position(|s| s.fragments[0].same_adu_as(&bundle));
        let index = match slot_index {
            Some(i) => {
                let slot = &mut self.slots[i];
                let pos = slot
                    .fragments
                    .iter()
                    .position(|b| b.fragment_offset > bundle.fragment_offset)
                    .unwrap_or(slot.fragments.len());
                slot.fragments.insert(pos, bundle);
                i
            }
            None => {
                self.slots.push(ReassemblySlot {
                    fragments: vec![bundle],
                });
                self.slots.len() - 1
            }
        };

        if self.slots[index].is_complete() {
            debug!("reassembling bundle from {} fragments", self.slots[index].fragments.len());
            let slot = self.slots.remove(index);
            let key = Box::new(slot.fragments[0].clone());
            ReassemblyResult::Complete {
                adu: slot.assemble(),
                key,
            }
        } else {
            ReassemblyResult::Incomplete
        }
    }
}
