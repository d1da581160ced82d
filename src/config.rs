//! Process-wide tunables, injected rather than read from a global.
//!
//! A plain `serde`-deserializable struct with a hand-written [`Default`]
//! impl, handed explicitly to each component's constructor.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy applied to transient storage errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryBudget {
    /// Maximum number of attempts, including the first, before giving up.
    pub max_attempts: u32,
    /// Base delay between attempts; doubled on each retry.
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(20),
        }
    }
}

/// Process-wide configuration for [`crate::vpb::VpbManager`], [`crate::proof::manager::ProofManager`]
/// and [`crate::checkpoint::CheckpointStore`].
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", default)]
pub struct Configuration {
    /// Delay `D` after which a `Verified` value becomes `Unspent`.
    #[serde(with = "duration_millis")]
    pub verified_to_unspent_delay: Duration,
    /// Target false-positive rate for the proof-manager dedup bloom filter.
    pub bloom_target_fpr: f64,
    /// Expected insertion count used to size the dedup bloom filter.
    pub bloom_expected_insertions: usize,
    /// Retry policy for transient storage failures.
    pub retry_budget: RetryBudget,
    /// Path to the per-account proof/value/block-index database, or `:memory:`.
    pub database_path: PathBuf,
    /// Path to the checkpoint store database, or `:memory:`.
    pub checkpoint_database_path: PathBuf,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            verified_to_unspent_delay: Duration::from_secs(10),
            bloom_target_fpr: 0.01,
            bloom_expected_insertions: 1024,
            retry_budget: RetryBudget::default(),
            database_path: PathBuf::from(":memory:"),
            checkpoint_database_path: PathBuf::from(":memory:"),
        }
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(de)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values_are_sane() {
        let cfg = Configuration::default();
        assert_eq!(cfg.verified_to_unspent_delay, Duration::from_secs(10));
        assert_eq!(cfg.bloom_target_fpr, 0.01);
    }

    #[test]
    fn round_trips_through_json() {
        let cfg = Configuration::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: Configuration = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(cfg, back);
    }
}
