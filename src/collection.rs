//! Value collection: owns the durable set of Values for one account.
//!
//! Serves lookups by state and by `node_id`; maintains a `state →
//! {node_id}` secondary index as the sole fast path for balance queries.

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use num_bigint::BigUint;
use num_traits::Zero;
use parking_lot::Mutex;

use crate::error::Error;
use crate::hash::Hash;
use crate::value::{Value, ValueState};

/// Per-account collection of Values, indexed by `node_id` and by state.
#[derive(Debug)]
pub struct ValueCollection {
    primary: DashMap<Hash, Value>,
    by_state: DashMap<ValueState, DashSet<Hash>>,
    write_lock: Mutex<()>,
}

impl Default for ValueCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueCollection {
    /// An empty collection with every state's secondary-index bucket
    /// pre-populated (so `find_by_state`/`balance_by_state` never need to
    /// special-case an absent bucket).
    #[must_use]
    pub fn new() -> Self {
        let by_state = DashMap::new();
        for state in ValueState::all() {
            by_state.insert(state, DashSet::new());
        }
        Self {
            primary: DashMap::new(),
            by_state,
            write_lock: Mutex::new(()),
        }
    }

    /// Inserts `value`, returning its `node_id`.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateValue`] if a Value with the same `(begin,
    /// num)` range is already present for this account.
    pub fn add(&self, value: Value) -> Result<Hash, Error> {
        let _guard = self.write_lock.lock();
        let node_id = value.node_id();
        if self.primary.contains_key(&node_id) {
            return Err(Error::DuplicateValue);
        }
        let state = value.state();
        self.primary.insert(node_id, value);
        self.by_state
            .get(&state)
            .expect("every state has a pre-populated bucket")
            .insert(node_id);
        Ok(node_id)
    }

    /// Atomically moves `node_id` to `new_state`, updating both the primary
    /// table and the secondary index. Stamps/clears `verified_at` per
    /// [`Value::with_state`].
    ///
    /// # Errors
    /// Returns [`Error::ValueNotFound`] if `node_id` is unknown.
    pub fn update_state(&self, node_id: Hash, new_state: ValueState, now: DateTime<Utc>) -> Result<(), Error> {
        let _guard = self.write_lock.lock();
        let mut entry = self.primary.get_mut(&node_id).ok_or(Error::ValueNotFound)?;
        let old_state = entry.state();
        *entry = entry.with_state(new_state, now);
        drop(entry);

        if old_state != new_state {
            if let Some(bucket) = self.by_state.get(&old_state) {
                bucket.remove(&node_id);
            }
            self.by_state
                .get(&new_state)
                .expect("every state has a pre-populated bucket")
                .insert(node_id);
        }
        Ok(())
    }

    /// Looks up a Value by its `node_id`.
    #[must_use]
    pub fn get(&self, node_id: Hash) -> Option<Value> {
        self.primary.get(&node_id).map(|v| v.clone())
    }

    /// Every Value currently in `state`, read through the secondary index.
    #[must_use]
    pub fn find_by_state(&self, state: ValueState) -> Vec<Value> {
        let Some(bucket) = self.by_state.get(&state) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter_map(|node_id| self.primary.get(&node_id).map(|v| v.clone()))
            .collect()
    }

    /// Sum of `num` over every Value in `state`, via the secondary index.
    #[must_use]
    pub fn balance_by_state(&self, state: ValueState) -> BigUint {
        self.find_by_state(state)
            .iter()
            .fold(BigUint::zero(), |acc, v| acc + v.num())
    }

    /// Total number of Values held, across all states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.primary.len()
    }

    /// Whether the collection holds no Values.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty()
    }

    /// Verifies that the secondary index exactly partitions the primary
    /// table's rows by their recorded state. Returns `false` on any
    /// divergence; does not repair it (repair is an explicit, separate
    /// operation a caller can build from `rebuild_index`).
    #[must_use]
    pub fn validate_integrity(&self) -> bool {
        let mut indexed_count = 0usize;
        for entry in &self.by_state {
            for node_id in entry.value() {
                indexed_count += 1;
                match self.primary.get(&node_id) {
                    Some(value) if value.state() == *entry.key() => {}
                    _ => return false,
                }
            }
        }
        indexed_count == self.primary.len()
    }

    /// Rebuilds the secondary index from the primary table, discarding any
    /// stale entries. Used to repair divergence detected by
    /// [`ValueCollection::validate_integrity`].
    pub fn rebuild_index(&self) {
        let _guard = self.write_lock.lock();
        for state in ValueState::all() {
            self.by_state.insert(state, DashSet::new());
        }
        for entry in &self.primary {
            self.by_state
                .get(&entry.value().state())
                .expect("every state has a pre-populated bucket")
                .insert(*entry.key());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(begin: &str, num: u32, state: ValueState) -> Value {
        Value::new(begin, num as i128, state).expect("valid value")
    }

    #[test]
    fn add_then_get_round_trips() {
        let coll = ValueCollection::new();
        let v = value("0x1000", 100, ValueState::Unspent);
        let id = coll.add(v.clone()).expect("insert");
        assert_eq!(coll.get(id), Some(v));
    }

    #[test]
    fn add_duplicate_range_rejected() {
        let coll = ValueCollection::new();
        coll.add(value("0x1000", 100, ValueState::Unspent)).expect("insert");
        let err = coll.add(value("0x1000", 100, ValueState::Received)).unwrap_err();
        assert!(matches!(err, Error::DuplicateValue));
    }

    #[test]
    fn update_state_moves_between_index_buckets() {
        let coll = ValueCollection::new();
        let id = coll.add(value("0x1000", 100, ValueState::Unspent)).expect("insert");
        coll.update_state(id, ValueState::Pending, Utc::now()).expect("update");
        assert_eq!(coll.find_by_state(ValueState::Unspent).len(), 0);
        assert_eq!(coll.find_by_state(ValueState::Pending).len(), 1);
        assert!(coll.validate_integrity());
    }

    #[test]
    fn update_state_unknown_node_errors() {
        let coll = ValueCollection::new();
        let err = coll.update_state(Hash::digest(&[b"nope"]), ValueState::Pending, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::ValueNotFound));
    }

    #[test]
    fn balance_by_state_sums_num() {
        let coll = ValueCollection::new();
        coll.add(value("0x1000", 100, ValueState::Unspent)).expect("insert");
        coll.add(value("0x2000", 50, ValueState::Unspent)).expect("insert");
        coll.add(value("0x3000", 9, ValueState::Pending)).expect("insert");
        assert_eq!(coll.balance_by_state(ValueState::Unspent), BigUint::from(150u32));
        assert_eq!(coll.balance_by_state(ValueState::Pending), BigUint::from(9u32));
    }

    #[test]
    fn verified_state_stamps_timestamp_through_collection() {
        let coll = ValueCollection::new();
        let id = coll.add(value("0x1000", 10, ValueState::Received)).expect("insert");
        let now = Utc::now();
        coll.update_state(id, ValueState::Verified, now).expect("update");
        assert_eq!(coll.get(id).unwrap().verified_at(), Some(now));
        coll.update_state(id, ValueState::Unspent, now).expect("update");
        assert_eq!(coll.get(id).unwrap().verified_at(), None);
    }

    #[test]
    fn validate_integrity_detects_manual_divergence() {
        let coll = ValueCollection::new();
        let id = coll.add(value("0x1000", 10, ValueState::Unspent)).expect("insert");
        // simulate divergence: index says Pending but primary still says Unspent
        coll.by_state.get(&ValueState::Unspent).unwrap().remove(&id);
        coll.by_state.get(&ValueState::Pending).unwrap().insert(id);
        assert!(!coll.validate_integrity());
        coll.rebuild_index();
        assert!(coll.validate_integrity());
        assert_eq!(coll.find_by_state(ValueState::Unspent).len(), 1);
    }
}
