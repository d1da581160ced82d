//! Value model: an immutable range of token indices.
//!
//! A [`Value`] is an immutable half-open range `[begin, begin+num)` drawn from
//! the flat 2²⁵⁹-wide token index space, carrying a lifecycle [`ValueState`]
//! tag.

use std::fmt;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use num_traits::{One, Zero};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;
use crate::hash::Hash;

static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9A-Fa-f]+$").expect("valid regex"));

/// Lifecycle state of a [`Value`].
///
/// Sender path: `Unspent → Pending → OnChain → Confirmed`.
/// Recipient path: `Received → Verified → Unspent` (time-based).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueState {
    /// Held by this account, free to spend.
    Unspent,
    /// Selected as an input to a transaction that has not yet been confirmed.
    Pending,
    /// Transferred away; the transaction carrying it has landed on chain but
    /// is not yet at the account's confirmation depth.
    OnChain,
    /// Spent and confirmed; terminal state on the sender path.
    Confirmed,
    /// Arrived from another account, not yet independently validated.
    Received,
    /// Independently validated by the [`crate::validator`] pipeline; will
    /// become [`ValueState::Unspent`] after the configured delay.
    Verified,
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueState::Unspent => "unspent",
            ValueState::Pending => "pending",
            ValueState::OnChain => "on_chain",
            ValueState::Confirmed => "confirmed",
            ValueState::Received => "received",
            ValueState::Verified => "verified",
        };
        f.write_str(s)
    }
}

impl ValueState {
    /// All states, in a stable order; used to build the Value Collection's
    /// secondary index skeleton up front.
    #[must_use]
    pub const fn all() -> [ValueState; 6] {
        [
            ValueState::Unspent,
            ValueState::Pending,
            ValueState::OnChain,
            ValueState::Confirmed,
            ValueState::Received,
            ValueState::Verified,
        ]
    }
}

/// An immutable half-open range `[begin, begin+num)` with a lifecycle state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    #[serde(with = "biguint_hex")]
    begin: BigUint,
    #[serde(with = "biguint_dec")]
    num: BigUint,
    state: ValueState,
    verified_at: Option<DateTime<Utc>>,
}

impl Value {
    /// Builds a new Value, validating `begin`'s hex format and that `num` is positive.
    ///
    /// # Errors
    /// Returns [`ValueError::MalformedBegin`] if `begin_hex` is not a
    /// lowercase-or-uppercase `0x`-prefixed hex literal, or
    /// [`ValueError::NonPositiveNum`] if `num` is not positive.
    pub fn new(begin_hex: &str, num: impl Into<i128>, state: ValueState) -> Result<Self, ValueError> {
        if !HEX_LITERAL.is_match(begin_hex) {
            return Err(ValueError::MalformedBegin(begin_hex.to_owned()));
        }
        let num = num.into();
        if num <= 0 {
            return Err(ValueError::NonPositiveNum(num));
        }
        let begin = BigUint::parse_bytes(begin_hex.trim_start_matches("0x").as_bytes(), 16)
            .ok_or_else(|| ValueError::MalformedBegin(begin_hex.to_owned()))?;
        Ok(Self {
            begin,
            #[allow(clippy::cast_sign_loss)]
            num: BigUint::from(num as u128),
            state,
            verified_at: None,
        })
    }

    fn from_parts(begin: BigUint, num: BigUint, state: ValueState, verified_at: Option<DateTime<Utc>>) -> Self {
        Self {
            begin,
            num,
            state,
            verified_at,
        }
    }

    /// Reconstructs a Value from durably stored parts. Unlike [`Value::new`],
    /// `num` is a decimal string of unbounded size, since a restored range's
    /// size can exceed `i128` (spec's 2²⁵⁹ address space).
    ///
    /// # Errors
    /// Returns [`ValueError::MalformedBegin`] or [`ValueError::NonPositiveNum`]
    /// on malformed input.
    pub(crate) fn from_storage(
        begin_hex: &str,
        num_dec: &str,
        state: ValueState,
        verified_at: Option<DateTime<Utc>>,
    ) -> Result<Self, ValueError> {
        if !HEX_LITERAL.is_match(begin_hex) {
            return Err(ValueError::MalformedBegin(begin_hex.to_owned()));
        }
        let begin = BigUint::parse_bytes(begin_hex.trim_start_matches("0x").as_bytes(), 16)
            .ok_or_else(|| ValueError::MalformedBegin(begin_hex.to_owned()))?;
        let num = BigUint::parse_bytes(num_dec.as_bytes(), 10).ok_or(ValueError::NonPositiveNum(0))?;
        if num.is_zero() {
            return Err(ValueError::NonPositiveNum(0));
        }
        Ok(Self::from_parts(begin, num, state, verified_at))
    }

    /// The range's inclusive start.
    #[must_use]
    pub fn begin(&self) -> &BigUint {
        &self.begin
    }

    /// The number of indices in the range.
    #[must_use]
    pub fn num(&self) -> &BigUint {
        &self.num
    }

    /// The range's inclusive end: `begin + num - 1`.
    #[must_use]
    pub fn end(&self) -> BigUint {
        &self.begin + &self.num - BigUint::one()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Timestamp at which this Value entered [`ValueState::Verified`], if it
    /// is currently in that state.
    #[must_use]
    pub fn verified_at(&self) -> Option<DateTime<Utc>> {
        self.verified_at
    }

    /// Returns a copy transitioned to `new_state`. Setting `Verified` stamps
    /// `verified_at := now`; leaving `Verified` clears it.
    #[must_use]
    pub fn with_state(&self, new_state: ValueState, now: DateTime<Utc>) -> Self {
        let verified_at = match (self.state, new_state) {
            (_, ValueState::Verified) => Some(now),
            (ValueState::Verified, _) => None,
            _ => self.verified_at,
        };
        Self::from_parts(self.begin.clone(), self.num.clone(), new_state, verified_at)
    }

    /// Content hash of the initial (begin, num) pair — the stable `node_id`
    /// used everywhere the core references this Value.
    #[must_use]
    pub fn node_id(&self) -> Hash {
        Hash::digest(&[self.begin.to_bytes_be().as_slice(), self.num.to_bytes_be().as_slice()])
    }

    /// `begin` formatted as a lowercase `0x`-prefixed hex literal.
    #[must_use]
    pub fn begin_hex(&self) -> String {
        format!("0x{}", self.begin.to_str_radix(16))
    }

    /// Splits this Value at `change`, returning `(keep, change_value)` where
    /// `keep` is the prefix `[begin, begin+num-change)` and `change_value` is
    /// the suffix `[begin+num-change, begin+num)`, both carrying `new_state`.
    ///
    /// # Errors
    /// Returns [`ValueError::SplitOutOfRange`] unless `0 < change < num`.
    pub fn split(&self, change: &BigUint, new_state: ValueState) -> Result<(Self, Self), ValueError> {
        if change.is_zero() || change >= &self.num {
            return Err(ValueError::SplitOutOfRange {
                change: to_u128_lossy(change),
                num: to_u128_lossy(&self.num),
            });
        }
        let keep_num = &self.num - change;
        let keep = Self::from_parts(self.begin.clone(), keep_num.clone(), new_state, None);
        let change_begin = &self.begin + &keep_num;
        let change_value = Self::from_parts(change_begin, change.clone(), new_state, None);
        Ok((keep, change_value))
    }

    /// Structural equality over `(begin, num)`, ignoring state.
    #[must_use]
    pub fn is_same(&self, other: &Value) -> bool {
        self.begin == other.begin && self.num == other.num
    }

    /// Whether `self`'s range is fully enclosed by `other`'s range.
    #[must_use]
    pub fn is_subrange(&self, other: &Value) -> bool {
        self.begin >= other.begin && self.end() <= other.end()
    }

    /// Whether the two ranges share at least one index.
    #[must_use]
    pub fn is_overlap(&self, other: &Value) -> bool {
        self.begin <= other.end() && other.begin <= self.end()
    }

    /// Intersects `self` with `other`. Returns `None` if disjoint; otherwise
    /// `(overlap, remainders)` where `remainders` holds the up-to-two disjoint
    /// parts of `self` lying outside `other`, both inheriting `self`'s state.
    #[must_use]
    pub fn intersect(&self, other: &Value) -> Option<(Value, Vec<Value>)> {
        if !self.is_overlap(other) {
            return None;
        }
        let overlap_begin = self.begin.clone().max(other.begin.clone());
        let overlap_end = self.end().min(other.end());
        let overlap_num = &overlap_end - &overlap_begin + BigUint::one();
        let overlap = Self::from_parts(overlap_begin.clone(), overlap_num, self.state, None);

        let mut remainders = Vec::with_capacity(2);
        if overlap_begin > self.begin {
            let num = &overlap_begin - &self.begin;
            remainders.push(Self::from_parts(self.begin.clone(), num, self.state, None));
        }
        if overlap_end < self.end() {
            let begin = &overlap_end + BigUint::one();
            let num = &self.end() - &overlap_end;
            remainders.push(Self::from_parts(begin, num, self.state, None));
        }
        Some((overlap, remainders))
    }
}

fn to_u128_lossy(n: &BigUint) -> u128 {
    let bytes = n.to_bytes_be();
    let mut buf = [0u8; 16];
    let start = bytes.len().saturating_sub(16);
    let slice = &bytes[start..];
    buf[16 - slice.len()..].copy_from_slice(slice);
    u128::from_be_bytes(buf)
}

mod biguint_hex {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, ser: S) -> Result<S::Ok, S::Error> {
        format!("0x{}", value.to_str_radix(16)).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(de)?;
        BigUint::parse_bytes(s.trim_start_matches("0x").as_bytes(), 16)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid hex literal: {s}")))
    }
}

mod biguint_dec {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, ser: S) -> Result<S::Ok, S::Error> {
        value.to_str_radix(10).serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(de)?;
        BigUint::parse_bytes(s.as_bytes(), 10).ok_or_else(|| serde::de::Error::custom(format!("invalid decimal: {s}")))
    }
}
