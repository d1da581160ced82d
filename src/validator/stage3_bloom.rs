//! Stage 3 — Bloom-filter consistency check: detects an attacker who hides a
//! block in which the current holder acted as sender, since every block's
//! Bloom filter is guaranteed to record every sender in it.

use std::collections::BTreeSet;

use crate::block_index::BlockIndexList;
use crate::error::{Error, SecurityError};
use crate::mainchain::MainChainInfo;
use crate::validator::stage2_slice::VpbSlice;

/// Derives the `(height, owner)` epoch sequence for `heights_slice`, carrying
/// forward ownership from `block_index`'s full owner history.
#[must_use]
pub fn epochs(heights_slice: &[u64], block_index: &BlockIndexList) -> Vec<(u64, String)> {
    heights_slice
        .iter()
        .filter_map(|&h| block_index.owner_at(h).map(|owner| (h, owner.to_owned())))
        .collect()
}

/// Runs stage 3 against `slice`, consulting `chain`'s Bloom filters. Returns
/// the epoch sequence on success.
///
/// # Errors
/// Returns [`SecurityError::CheckpointTampering`] if the checkpoint's
/// previous owner is absent from the first slice block's Bloom filter, or
/// [`SecurityError::MissingSenderBlocks`] if any epoch omits a block in
/// which its owner provably acted as sender.
pub fn run(slice: &VpbSlice, block_index: &BlockIndexList, chain: &dyn MainChainInfo) -> Result<Vec<(u64, String)>, Error> {
    let epoch_list = epochs(&slice.heights_slice, block_index);
    if epoch_list.is_empty() {
        return Ok(epoch_list);
    }

    let (first_height, _) = epoch_list[0];
    if first_height != 0 {
        if let Some(previous_owner) = &slice.previous_owner {
            let seen = chain
                .bloom_filter(first_height)
                .is_some_and(|bf| bf.contains(previous_owner.as_bytes()));
            if !seen {
                return Err(SecurityError::CheckpointTampering.into());
            }
        }
    }

    for window in epoch_list.windows(2) {
        let (h_i, owner_i) = &window[0];
        let (h_next, _) = &window[1];
        let epoch_end = h_next.saturating_sub(1);

        let mut expected: BTreeSet<u64> = (*h_i..=epoch_end)
            .filter(|&h| chain.bloom_filter(h).is_some_and(|bf| bf.contains(owner_i.as_bytes())))
            .collect();
        expected.insert(*h_i);
        expected.insert(*h_next);

        let provided: BTreeSet<u64> = slice.heights_slice.iter().copied().filter(|h| *h >= *h_i && *h <= *h_next).collect();
        let missing: Vec<u64> = expected.difference(&provided).copied().collect();
        if !missing.is_empty() {
            return Err(SecurityError::MissingSenderBlocks {
                owner: owner_i.clone(),
                heights: missing,
            }
            .into());
        }
    }

    Ok(epoch_list)
}
