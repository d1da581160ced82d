//! Stage 2 — slice generation: decide the verification window against an
//! optional checkpoint.

use crate::block_index::OwnerRecord;
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::error::Error;
use crate::proof::ProofUnit;
use crate::validator::VpbInput;

/// The portion of a VPB relevant to this verification run.
#[derive(Clone)]
pub struct VpbSlice {
    /// First height in the verification window.
    pub start_block_height: u64,
    /// Last height in the verification window.
    pub end_block_height: u64,
    /// Heights at or after `start_block_height`.
    pub heights_slice: Vec<u64>,
    /// Ownership changes recorded at or after `start_block_height`.
    pub owners_slice: Vec<OwnerRecord>,
    /// Proof units aligned by position with `heights_slice`.
    pub proofs_slice: Vec<ProofUnit>,
    /// The owner immediately before the slice, from the checkpoint; `None`
    /// when the slice starts at genesis.
    pub previous_owner: Option<String>,
    /// The checkpoint consulted to produce this slice, if any.
    pub checkpoint_used: Option<CheckpointRecord>,
}

/// Runs stage 2: consults `checkpoints` for a usable record, then slices
/// `input`'s heights/proofs/owners to the verification window.
///
/// # Errors
/// Returns [`Error::InvalidCheckpoint`] if a checkpoint exists at or beyond
/// the VPB's last height, or if applying it yields an empty slice.
pub fn run(input: &VpbInput<'_>, checkpoints: &CheckpointStore, account_address: &str) -> Result<VpbSlice, Error> {
    let checkpoint = checkpoints.trigger_verification(input.value, account_address)?;
    let (start, previous_owner) = match &checkpoint {
        Some(r) => (r.height + 1, Some(r.owner.clone())),
        None => (0, None),
    };

    let last = input
        .block_index
        .last_height()
        .ok_or_else(|| Error::InvalidCheckpoint("block-index list has no heights".into()))?;

    if let Some(r) = &checkpoint {
        if r.height >= last {
            return Err(Error::InvalidCheckpoint(format!(
                "checkpoint height {} is at or beyond the VPB's last height {last}",
                r.height
            )));
        }
    }

    let heights = input.block_index.heights();
    let idx = heights.iter().position(|&h| h >= start).unwrap_or(heights.len());
    let heights_slice = heights[idx..].to_vec();
    let proofs_slice = input.proof_units.get(idx..).map_or_else(Vec::new, <[ProofUnit]>::to_vec);

    if checkpoint.is_some() && heights_slice.is_empty() {
        return Err(Error::InvalidCheckpoint("checkpoint application yields an empty slice".into()));
    }

    let owners_slice: Vec<OwnerRecord> = input.block_index.owners().iter().filter(|o| o.height >= start).cloned().collect();
    let end_block_height = heights_slice.last().copied().unwrap_or(start);

    Ok(VpbSlice {
        start_block_height: start,
        end_block_height,
        heights_slice,
        owners_slice,
        proofs_slice,
        previous_owner,
        checkpoint_used: checkpoint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::BlockIndexList;
    use crate::mainchain::{MultiTxBundle, SingleTransaction};
    use crate::proof::{MerklePath, MerkleSibling, Side};
    use crate::value::{Value, ValueState};

    fn value() -> Value {
        Value::new("0x1000", 100, ValueState::Unspent).expect("value")
    }

    fn unit() -> ProofUnit {
        let bundle = MultiTxBundle {
            sender: "0xalice".into(),
            digest: Some(crate::hash::Hash::digest(&[b"tx"])),
            transactions: vec![SingleTransaction {
                sender: "0xalice".into(),
                recipient: "0xbob".into(),
                values: vec![value()],
            }],
        };
        let path = MerklePath(vec![MerkleSibling { hash: bundle.digest.unwrap(), side: Side::Left }]);
        ProofUnit::new("0xalice".into(), bundle, path)
    }

    #[test]
    fn no_checkpoint_slices_from_genesis() {
        let mut bi = BlockIndexList::new();
        bi.record_ownership_change(0, "0xalice");
        bi.append_height(8);
        let units = [unit(), unit()];
        let v = value();
        let input = VpbInput { value: &v, block_index: &bi, proof_units: &units };
        let checkpoints = CheckpointStore::open(std::path::Path::new(":memory:")).expect("open");
        let slice = run(&input, &checkpoints, "0xalice").expect("slice");
        assert_eq!(slice.start_block_height, 0);
        assert_eq!(slice.heights_slice, vec![0, 8]);
        assert!(slice.previous_owner.is_none());
    }

    #[test]
    fn checkpoint_shortens_window() {
        let mut bi = BlockIndexList::new();
        bi.record_ownership_change(0, "0xalice");
        bi.append_height(15);
        bi.append_height(27);
        let units = [unit(), unit(), unit()];
        let v = value();
        let input = VpbInput { value: &v, block_index: &bi, proof_units: &units };
        let checkpoints = CheckpointStore::open(std::path::Path::new(":memory:")).expect("open");
        checkpoints.create(&v, "0xalice", 15).expect("create checkpoint");
        let slice = run(&input, &checkpoints, "0xalice").expect("slice");
        assert_eq!(slice.start_block_height, 16);
        assert_eq!(slice.heights_slice, vec![27]);
        assert_eq!(slice.previous_owner.as_deref(), Some("0xalice"));
    }

    #[test]
    fn checkpoint_beyond_last_height_is_invalid() {
        let mut bi = BlockIndexList::new();
        bi.append_height(1);
        bi.append_height(2);
        bi.append_height(3);
        let units: [ProofUnit; 3] = [unit(), unit(), unit()];
        let v = value();
        let input = VpbInput { value: &v, block_index: &bi, proof_units: &units };
        let checkpoints = CheckpointStore::open(std::path::Path::new(":memory:")).expect("open");
        checkpoints.create(&v, "0xalice", 10).expect("create checkpoint");
        assert!(matches!(run(&input, &checkpoints, "0xalice"), Err(Error::InvalidCheckpoint(_))));
    }
}
