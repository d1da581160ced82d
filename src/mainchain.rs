//! External collaborator contracts.
//!
//! Transaction construction, signing, P2P transport, consensus, and Merkle
//! tree construction all live outside this crate. The core only consumes
//! signed bundles and main-chain snapshots through the traits below.

use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::proof::BloomFilter;
use crate::value::Value;

/// The reserved sender prefix marking genesis-emission bundles, whose
/// digests may be null.
pub const GENESIS_SENDER_PREFIX: &str = "0xGENESIS";

/// Whether `address` is the reserved genesis sender.
#[must_use]
pub fn is_genesis_sender(address: &str) -> bool {
    address.starts_with(GENESIS_SENDER_PREFIX)
}

/// One transfer within a [`MultiTxBundle`]: `sender` gave `values` to `recipient`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleTransaction {
    /// Address that authored this transfer.
    pub sender: String,
    /// Address receiving `values`.
    pub recipient: String,
    /// Output ranges ascribed to `recipient`.
    pub values: Vec<Value>,
}

/// A signed bundle of [`SingleTransaction`]s attributed to one overall
/// `sender`, with a deterministic content `digest`. Concrete, persistable
/// representation of what the abstract `MultiTransactions` contract (trait
/// below) exposes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiTxBundle {
    /// The bundle's overall sender/payer.
    pub sender: String,
    /// 64-hex content digest over a deterministic serialization including
    /// output values; `None` only for genesis bundles.
    pub digest: Option<Hash>,
    /// The inner transfers.
    pub transactions: Vec<SingleTransaction>,
}

impl MultiTxBundle {
    /// Whether `address` is the overall sender, or a sender/recipient of at
    /// least one inner transaction.
    #[must_use]
    pub fn involves(&self, address: &str) -> bool {
        self.sender == address
            || self
                .transactions
                .iter()
                .any(|tx| tx.sender == address || tx.recipient == address)
    }

    /// Every output value ascribed to `recipient` across all inner transactions
    /// whose `sender` is `sender_filter` (when given).
    #[must_use]
    pub fn outputs_from_to<'a>(&'a self, sender_filter: Option<&str>, recipient: &str) -> Vec<&'a Value> {
        self.transactions
            .iter()
            .filter(|tx| tx.recipient == recipient && sender_filter.map_or(true, |s| tx.sender == s))
            .flat_map(|tx| tx.values.iter())
            .collect()
    }
}

/// Abstract contract for a signed multi-transaction bundle.
/// `MultiTxBundle` is this crate's own implementor; external producers may
/// implement it directly on their own wire types and convert with
/// [`ToMultiTxBundle`] before handing data to the VPB Manager.
pub trait MultiTransactions {
    /// The bundle's overall sender.
    fn sender(&self) -> &str;
    /// Deterministic content digest, or `None` for a genesis bundle.
    fn digest(&self) -> Option<Hash>;
    /// The inner single transactions.
    fn inner_transactions(&self) -> &[SingleTransaction];
}

impl MultiTransactions for MultiTxBundle {
    fn sender(&self) -> &str {
        &self.sender
    }

    fn digest(&self) -> Option<Hash> {
        self.digest
    }

    fn inner_transactions(&self) -> &[SingleTransaction] {
        &self.transactions
    }
}

/// Converts an external bundle representation into this crate's owned,
/// persistable [`MultiTxBundle`].
pub trait ToMultiTxBundle {
    /// Performs the conversion.
    fn to_bundle(&self) -> MultiTxBundle;
}

impl<T: MultiTransactions> ToMultiTxBundle for T {
    fn to_bundle(&self) -> MultiTxBundle {
        MultiTxBundle {
            sender: self.sender().to_owned(),
            digest: self.digest(),
            transactions: self.inner_transactions().to_vec(),
        }
    }
}

/// A read-only snapshot of main-chain state the validator consults: Merkle
/// roots and sender Bloom filters per block height, plus the chain's current
/// and genesis heights.
pub trait MainChainInfo {
    /// The Merkle root committed at `height`, if known.
    fn merkle_root(&self, height: u64) -> Option<Hash>;
    /// The sender Bloom filter committed at `height`, if known.
    fn bloom_filter(&self, height: u64) -> Option<&BloomFilter>;
    /// The chain's current tip height.
    fn current_height(&self) -> u64;
    /// The chain's genesis height (conventionally `0`).
    fn genesis_height(&self) -> u64;
}
