//! VPB validator pipeline.
//!
//! Four synchronous stages run in order: structural validation, slice
//! generation against a checkpoint, Bloom-filter consistency (hidden
//! double-spend detection), and proof-unit verification with double-spend
//! classification.

pub mod stage1_structure;
pub mod stage2_slice;
pub mod stage3_bloom;
pub mod stage4_proof;

use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::block_index::BlockIndexList;
use crate::checkpoint::{CheckpointRecord, CheckpointStore};
use crate::error::Error;
use crate::mainchain::MainChainInfo;
use crate::proof::ProofUnit;
use crate::value::Value;

pub(crate) static ADDRESS_FORMAT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9A-Fa-f]{40}$").expect("valid regex"));

/// Inputs submitted for validation: a VPB triple plus the verifying account.
pub struct VpbInput<'a> {
    /// The Value whose custody is being proven.
    pub value: &'a Value,
    /// Block-index list for `value`.
    pub block_index: &'a BlockIndexList,
    /// Proof units, parallel to `block_index.heights()` by position.
    pub proof_units: &'a [ProofUnit],
}

/// Outcome of a full validator run.
#[derive(Debug)]
pub enum VerificationResult {
    /// Every stage passed. `verified_epochs` groups consecutive same-owner
    /// heights in slice order.
    Success {
        /// `(owner, heights)` pairs, in slice order.
        verified_epochs: Vec<(String, Vec<u64>)>,
    },
    /// At least one stage failed; `errors` from stages 1 and 4 may hold more
    /// than one entry, stages 2 and 3 contribute exactly one.
    Failure {
        /// Every error discovered.
        errors: Vec<Error>,
    },
}

impl VerificationResult {
    /// Whether this run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, VerificationResult::Success { .. })
    }
}

/// A full validator report: the result, wall-clock duration, and the
/// checkpoint consulted (if any).
#[derive(Debug)]
pub struct VerificationReport {
    /// The pipeline's outcome.
    pub result: VerificationResult,
    /// Wall-clock time spent running all stages, in milliseconds.
    pub elapsed_ms: u64,
    /// The checkpoint record used by stage 2, if any.
    pub checkpoint_used: Option<CheckpointRecord>,
}

/// Runs the full four-stage pipeline against `input`, as `account_address`,
/// consulting `chain` for Merkle roots/Bloom filters and `checkpoints` for an
/// existing checkpoint to shorten the verification window. On success,
/// best-effort creates or updates the checkpoint at
/// `(value, owner_last, last_height - 1)`.
#[must_use]
pub fn validate(input: &VpbInput<'_>, account_address: &str, chain: &dyn MainChainInfo, checkpoints: &CheckpointStore) -> VerificationReport {
    let started = Instant::now();

    let structural_errors = stage1_structure::run(input);
    if !structural_errors.is_empty() {
        return finish(VerificationResult::Failure { errors: structural_errors }, None, started);
    }

    let slice = match stage2_slice::run(input, checkpoints, account_address) {
        Ok(slice) => slice,
        Err(e) => return finish(VerificationResult::Failure { errors: vec![e] }, None, started),
    };
    let checkpoint_used = slice.checkpoint_used.clone();

    let epochs = match stage3_bloom::run(&slice, input.block_index, chain) {
        Ok(epochs) => epochs,
        Err(e) => return finish(VerificationResult::Failure { errors: vec![e] }, checkpoint_used, started),
    };

    let result = stage4_proof::run(&slice, input.value, &epochs, chain);

    if let VerificationResult::Success { verified_epochs } = &result {
        if let Some((owner_last, heights)) = verified_epochs.last() {
            if let Some(&last_height) = heights.last() {
                advance_checkpoint(checkpoints, input.value, owner_last, last_height.saturating_sub(1));
            }
        }
    }

    finish(result, checkpoint_used, started)
}

fn advance_checkpoint(checkpoints: &CheckpointStore, value: &Value, owner: &str, height: u64) {
    match checkpoints.create(value, owner, height) {
        Ok(_) => debug!(owner, height, "checkpoint created after successful validation"),
        Err(Error::DuplicateCheckpoint) => {
            if let Err(e) = checkpoints.update(value, owner, height) {
                warn!(%e, "best-effort checkpoint update after validation failed");
            }
        }
        Err(e) => warn!(%e, "best-effort checkpoint create after validation failed"),
    }
}

fn finish(result: VerificationResult, checkpoint_used: Option<CheckpointRecord>, started: Instant) -> VerificationReport {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    debug!(success = result.is_success(), elapsed_ms, "validator run complete");
    VerificationReport {
        result,
        elapsed_ms,
        checkpoint_used,
    }
}
