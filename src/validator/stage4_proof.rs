//! Stage 4 — proof-unit verification and double-spend classification. Every
//! epoch is checked regardless of earlier failures; all issues are collected
//! into the final report.

use crate::error::{Error, SecurityError};
use crate::mainchain::{MultiTxBundle, SingleTransaction};
use crate::validator::stage2_slice::VpbSlice;
use crate::validator::VerificationResult;
use crate::value::Value;

fn intersecting_transactions<'a>(bundle: &'a MultiTxBundle, value: &Value) -> Vec<&'a SingleTransaction> {
    bundle.transactions.iter().filter(|tx| tx.values.iter().any(|v| v.is_overlap(value))).collect()
}

fn classify_genesis(bundle: &MultiTxBundle, owner: &str, value: &Value, errors: &mut Vec<Error>) {
    let candidates = intersecting_transactions(bundle, value);
    let matched = candidates
        .iter()
        .find(|tx| tx.sender == bundle.sender && tx.recipient == owner && tx.values.iter().any(|v| v.is_same(value)));
    match matched {
        None if candidates.is_empty() => errors.push(SecurityError::MissingGenesisValueDistribution.into()),
        None => errors.push(SecurityError::InvalidGenesisValueIntersection.into()),
        Some(m) => {
            for tx in &candidates {
                if !std::ptr::eq(*tx, *m) {
                    errors.push(SecurityError::InvalidGenesisValueIntersection.into());
                }
            }
        }
    }
}

fn classify_transfer(bundle: &MultiTxBundle, prev_owner: &str, owner: &str, height: u64, value: &Value, errors: &mut Vec<Error>) {
    let candidates = intersecting_transactions(bundle, value);
    let matched = candidates
        .iter()
        .find(|tx| tx.sender == prev_owner && tx.recipient == owner && tx.values.iter().any(|v| v.is_same(value)));
    match matched {
        None => errors.push(
            SecurityError::NoValidTargetValueTransfer {
                prev_owner: prev_owner.to_owned(),
                owner: owner.to_owned(),
                height,
            }
            .into(),
        ),
        Some(m) => {
            for tx in &candidates {
                if !std::ptr::eq(*tx, *m) {
                    errors.push(SecurityError::InvalidTargetValueIntersection { height }.into());
                }
            }
        }
    }
}

fn classify_carrier(bundle: &MultiTxBundle, height: u64, value: &Value, errors: &mut Vec<Error>) {
    if !intersecting_transactions(bundle, value).is_empty() {
        errors.push(SecurityError::DoubleSpendDetected(height).into());
    }
}

fn group_epochs(epochs: &[(u64, String)]) -> Vec<(String, Vec<u64>)> {
    let mut grouped: Vec<(String, Vec<u64>)> = Vec::new();
    for (h, owner) in epochs {
        match grouped.last_mut() {
            Some((last_owner, heights)) if last_owner == owner => heights.push(*h),
            _ => grouped.push((owner.clone(), vec![*h])),
        }
    }
    grouped
}

/// Runs stage 4: verifies each epoch's proof unit against its block's Merkle
/// root, then classifies the block as genesis, target-value transfer, or
/// carrier, flagging any improper intersection with `value` as a double
/// spend.
#[must_use]
pub fn run(slice: &VpbSlice, value: &Value, epochs: &[(u64, String)], chain: &dyn crate::mainchain::MainChainInfo) -> VerificationResult {
    let mut errors = Vec::new();

    for (i, (height, owner)) in epochs.iter().enumerate() {
        let Some(unit) = slice.proofs_slice.get(i) else {
            errors.push(Error::ProofUnitVerificationFailed {
                height: *height,
                reason: "no proof unit aligned with this height".into(),
            });
            continue;
        };

        let Some(root) = chain.merkle_root(*height) else {
            errors.push(Error::MerkleRootMissing(*height));
            continue;
        };

        if let Err(reason) = unit.verify(root) {
            errors.push(Error::ProofUnitVerificationFailed { height: *height, reason });
        }

        let prev_owner = if i == 0 {
            slice.previous_owner.clone()
        } else {
            Some(epochs[i - 1].1.clone())
        };

        if *height == 0 {
            classify_genesis(&unit.bundle, owner, value, &mut errors);
        } else {
            let prev = prev_owner.unwrap_or_default();
            if &prev != owner {
                classify_transfer(&unit.bundle, &prev, owner, *height, value, &mut errors);
            } else {
                classify_carrier(&unit.bundle, *height, value, &mut errors);
            }
        }
    }

    if errors.is_empty() {
        VerificationResult::Success {
            verified_epochs: group_epochs(epochs),
        }
    } else {
        VerificationResult::Failure { errors }
    }
}
