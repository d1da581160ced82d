//! Stage 1 — structural validation of the three VPB inputs in isolation.
//! Collects every violation found; never stops at the first.

use crate::error::Error;
use crate::validator::{VpbInput, ADDRESS_FORMAT};

/// Runs stage 1 against `input`, returning every structural violation found.
/// An empty result means the inputs are well-formed enough to proceed to
/// slice generation.
#[must_use]
pub fn run(input: &VpbInput<'_>) -> Vec<Error> {
    let mut errors = Vec::new();

    if !input.block_index.check() {
        errors.push(Error::StructureValidationFailed {
            field: "block_index",
            reason: "heights must be strictly increasing, owners sorted by strictly increasing height, every owner height present in heights, and the first height no earlier than the first owner's height".into(),
        });
    }

    for owner in input.block_index.owners() {
        if !ADDRESS_FORMAT.is_match(&owner.address) {
            errors.push(Error::StructureValidationFailed {
                field: "block_index.owners.address",
                reason: format!("{} is not a well-formed address", owner.address),
            });
        }
    }

    for (i, unit) in input.proof_units.iter().enumerate() {
        if !ADDRESS_FORMAT.is_match(&unit.owner) && unit.owner != crate::mainchain::GENESIS_SENDER_PREFIX {
            errors.push(Error::StructureValidationFailed {
                field: "proof_units.owner",
                reason: format!("proof unit {i}: owner {} is not a well-formed address", unit.owner),
            });
        }
        if unit.merkle_path.is_empty() {
            errors.push(Error::StructureValidationFailed {
                field: "proof_units.merkle_path",
                reason: format!("proof unit {i}: merkle path is empty"),
            });
        }
        if unit.ref_count == 0 {
            errors.push(Error::StructureValidationFailed {
                field: "proof_units.ref_count",
                reason: format!("proof unit {i}: ref_count must be at least 1, got {}", unit.ref_count),
            });
        }
        // Hash shape (64-hex digest/path entries) is enforced structurally by the
        // `Hash` newtype's parse path; there is no string-typed hash left to check here.
    }

    if input.proof_units.len() != input.block_index.heights().len() {
        errors.push(Error::StructureValidationFailed {
            field: "proof_units",
            reason: format!(
                "proof unit count {} does not match block-index height count {}",
                input.proof_units.len(),
                input.block_index.heights().len()
            ),
        });
    }

    errors
}
