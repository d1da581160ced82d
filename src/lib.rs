//! Account-local VPB (Value / Proof / Block-index) ledger core.
//!
//! This crate implements the account-side bookkeeping for a UTXO-style chain in
//! which the atomic unit of ownership is a [`value::Value`] — a half-open range
//! of token indices. For every Value an account holds, the core maintains a
//! proof chain back to genesis (the [`proof`] module) and a block-index list
//! (the [`block_index`] module); together these form a VPB triple, coordinated
//! by the [`vpb::VpbManager`] and checked on receipt by the [`validator`]
//! pipeline.
//!
//! The crate has no network, consensus, or transaction-construction surface of
//! its own; it consumes signed `MultiTransactions` bundles and main-chain
//! snapshots through the traits in [`mainchain`].

pub mod block_index;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod hash;
pub mod mainchain;
pub mod persistence;
pub mod proof;
pub mod validator;
pub mod value;
pub mod vpb;

pub mod collection;

pub use crate::config::Configuration;
pub use crate::error::{Error, Result};
pub use crate::hash::Hash;
pub use crate::value::{Value, ValueState};
