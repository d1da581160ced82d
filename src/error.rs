//! Crate-wide error taxonomy.
//!
//! Every public operation returns a [`Result`] wrapping one of the variants
//! below; no panics or stack traces escape the core. Each enum uses
//! the two-derive idiom: [`thiserror::Error`] for the `std::error::Error` impl
//! and `#[source]`/`#[from]` wiring, [`displaydoc::Display`] for the
//! human-readable message written as the doc comment on each variant.

/// Convenience alias for this crate's fallible operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Top-level error returned by any public operation in this crate.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum Error {
    /// invalid value: {0}
    InvalidValue(#[from] ValueError),
    /// a value with this range already exists for this account
    DuplicateValue,
    /// no value found for the given node id
    ValueNotFound,
    /// a checkpoint already exists for this range
    DuplicateCheckpoint,
    /// no checkpoint found for the given range
    CheckpointNotFound,
    /// structural validation failed for field `{field}`: {reason}
    StructureValidationFailed {
        /// the field that failed validation
        field: &'static str,
        /// human-readable reason
        reason: String,
    },
    /// checkpoint is invalid for this VPB: {0}
    InvalidCheckpoint(String),
    /// no merkle root recorded for height {0}
    MerkleRootMissing(u64),
    /// proof unit at height {height} failed verification: {reason}
    ProofUnitVerificationFailed {
        /// block height of the failing proof unit
        height: u64,
        /// human-readable reason
        reason: String,
    },
    /// security threat detected during validation: {0}
    Security(#[from] SecurityError),
    /// storage error: {0}
    Storage(#[from] StorageError),
    /// integrity check failed: {0}
    IntegrityViolation(String),
}

/// Errors raised while constructing or manipulating a [`crate::value::Value`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ValueError {
    /// `begin` is not a well-formed `0x`-prefixed hex literal: {0}
    MalformedBegin(String),
    /// `num` must be positive, got {0}
    NonPositiveNum(i128),
    /// split change {change} is out of range for num {num}
    SplitOutOfRange {
        /// requested change amount
        change: u128,
        /// value's current `num`
        num: u128,
    },
    /// unknown value state tag `{0}`
    UnknownState(String),
}

/// Security-relevant validator failures (stages 3 and 4).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum SecurityError {
    /// owner `{owner}` is missing sender blocks from the provided history: {heights:?}
    MissingSenderBlocks {
        /// the owner whose sender activity was hidden
        owner: String,
        /// the block heights omitted from the submitted history
        heights: Vec<u64>,
    },
    /// the supplied checkpoint's previous owner is not attested in the chain's bloom filter
    CheckpointTampering,
    /// double spend detected: value was touched again at block {0}
    DoubleSpendDetected(u64),
    /// genesis block is missing the expected distribution for this value
    MissingGenesisValueDistribution,
    /// genesis block contains a transaction whose range improperly intersects this value
    InvalidGenesisValueIntersection,
    /// no valid transfer of this value from `{prev_owner}` to `{owner}` was found at block {height}
    NoValidTargetValueTransfer {
        /// the expected previous owner
        prev_owner: String,
        /// the expected new owner
        owner: String,
        /// the block height examined
        height: u64,
    },
    /// block {height} contains a transaction whose range improperly intersects this value
    InvalidTargetValueIntersection {
        /// the block height examined
        height: u64,
    },
}

/// Persistence-layer failures; `retryable` distinguishes transient conditions
/// (e.g. a locked database) from terminal ones.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum StorageError {
    /// underlying sqlite error: {0}
    Sqlite(#[from] rusqlite::Error),
    /// migration error: {0}
    Migration(String),
    /// serialization error: {0}
    Serde(#[from] serde_json::Error),
    /// operation exceeded its retry budget
    RetryBudgetExceeded,
    /// io error: {0}
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the caller may reasonably retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked
        )
    }
}
