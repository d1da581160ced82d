//! Proof manager.
//!
//! Per-account mapping Value → ordered list of Proof Units, deduplicated via
//! a Bloom filter and a durable `UNIQUE` constraint, with reference
//! counting.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, StorageError};
use crate::hash::Hash;
use crate::mainchain::MultiTxBundle;
use crate::proof::bloom::BloomFilter;
use crate::proof::unit::{MerklePath, ProofUnit};

/// Outcome of [`ProofManager::add_unit`]: the three storage-path outcomes
/// plus the no-op retry case — a retried call must not double-increment
/// `ref_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// The unit did not exist; it was stored fresh.
    New,
    /// The Bloom filter claimed possible presence but the durable table
    /// disagreed; stored fresh (a benign Bloom false positive).
    NewBloomFalsePositive,
    /// The unit already existed and this mapping is new; `ref_count` was incremented.
    Existing,
    /// This exact `(account, value_node_id, unit_id)` mapping already existed; no-op.
    AlreadyMapped,
}

/// Per-account store of Proof Units and their mapping to Values.
pub struct ProofManager {
    conn: Arc<Mutex<Connection>>,
    units: DashMap<Hash, ProofUnit>,
    mappings: DashMap<(String, Hash), Vec<Hash>>,
    bloom: Mutex<BloomFilter>,
    write_lock: Mutex<()>,
}

impl ProofManager {
    /// Opens a manager over `conn`, loading the existing unit cache, mapping
    /// cache, and rebuilding the Bloom filter from the durable table.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the preload queries fail.
    pub fn load(conn: Arc<Mutex<Connection>>, bloom_expected_insertions: usize, bloom_target_fpr: f64) -> Result<Self, StorageError> {
        let manager = Self {
            conn,
            units: DashMap::new(),
            mappings: DashMap::new(),
            bloom: Mutex::new(BloomFilter::new(bloom_expected_insertions, bloom_target_fpr)),
            write_lock: Mutex::new(()),
        };
        manager.reload_cache()?;
        Ok(manager)
    }

    fn reload_cache(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT unit_id, owner, multi_tx_blob, merkle_path_blob, ref_count FROM proof_units")?;
        let rows = stmt.query_map([], |row| {
            let unit_id: String = row.get(0)?;
            let owner: String = row.get(1)?;
            let bundle_json: String = row.get(2)?;
            let path_json: String = row.get(3)?;
            let ref_count: i64 = row.get(4)?;
            Ok((unit_id, owner, bundle_json, path_json, ref_count))
        })?;
        for row in rows {
            let (unit_id, owner, bundle_json, path_json, ref_count) = row?;
            let bundle: MultiTxBundle = serde_json::from_str(&bundle_json).map_err(StorageError::from)?;
            let merkle_path: MerklePath = serde_json::from_str(&path_json).map_err(StorageError::from)?;
            let mut unit = ProofUnit::new(owner, bundle, merkle_path);
            unit.ref_count = ref_count.max(0) as u64;
            let id = Hash::from_hex(&unit_id).map_err(|e| StorageError::Migration(e.to_string()))?;
            self.bloom.lock().insert(id.as_bytes());
            self.units.insert(id, unit);
        }
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT account, value_node_id, unit_id FROM value_proof_map ORDER BY account, value_node_id, sequence ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let account: String = row.get(0)?;
            let value_node_id: String = row.get(1)?;
            let unit_id: String = row.get(2)?;
            Ok((account, value_node_id, unit_id))
        })?;
        for row in rows {
            let (account, value_node_id, unit_id) = row?;
            let value_node_id = Hash::from_hex(&value_node_id).map_err(|e| StorageError::Migration(e.to_string()))?;
            let unit_id = Hash::from_hex(&unit_id).map_err(|e| StorageError::Migration(e.to_string()))?;
            self.mappings.entry((account, value_node_id)).or_default().push(unit_id);
        }
        Ok(())
    }

    /// Adds `(owner, bundle, merkle_path)` as a unit mapped to
    /// `(account, value_node_id)`, deduplicating against existing units.
    ///
    /// # Errors
    /// Returns [`StorageError`] on durable I/O failure.
    pub fn add_unit(
        &self,
        account: &str,
        value_node_id: Hash,
        owner: String,
        bundle: MultiTxBundle,
        merkle_path: MerklePath,
    ) -> Result<AddOutcome, Error> {
        let candidate = ProofUnit::new(owner, bundle, merkle_path);
        let unit_id = candidate.unit_id();

        let _guard = self.write_lock.lock();
        let key = (account.to_owned(), value_node_id);
        let already_mapped = self.mappings.get(&key).is_some_and(|v| v.contains(&unit_id));
        if already_mapped {
            return Ok(AddOutcome::AlreadyMapped);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StorageError::from)?;

        let maybe_possible = self.bloom.lock().contains(unit_id.as_bytes());
        let existing_ref_count: Option<i64> = if maybe_possible {
            tx.query_row("SELECT ref_count FROM proof_units WHERE unit_id = ?1", params![unit_id.to_hex()], |row| row.get(0))
                .optional()
                .map_err(StorageError::from)?
        } else {
            None
        };

        let outcome = match existing_ref_count {
            Some(ref_count) => {
                tx.execute(
                    "UPDATE proof_units SET ref_count = ?1 WHERE unit_id = ?2",
                    params![ref_count + 1, unit_id.to_hex()],
                )
                .map_err(StorageError::from)?;
                if let Some(mut cached) = self.units.get_mut(&unit_id) {
                    cached.ref_count = (ref_count + 1) as u64;
                }
                AddOutcome::Existing
            }
            None => {
                let bundle_json = serde_json::to_string(&candidate.bundle).map_err(StorageError::from)?;
                let path_json = serde_json::to_string(&candidate.merkle_path).map_err(StorageError::from)?;
                tx.execute(
                    "INSERT INTO proof_units (unit_id, owner, multi_tx_blob, merkle_path_blob, ref_count, created_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                    params![unit_id.to_hex(), candidate.owner, bundle_json, path_json, Utc::now().to_rfc3339()],
                )
                .map_err(StorageError::from)?;
                self.units.insert(unit_id, candidate.clone());
                self.bloom.lock().insert(unit_id.as_bytes());
                if maybe_possible {
                    AddOutcome::NewBloomFalsePositive
                } else {
                    AddOutcome::New
                }
            }
        };

        let next_sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM value_proof_map WHERE account = ?1 AND value_node_id = ?2",
                params![account, value_node_id.to_hex()],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        tx.execute(
            "INSERT OR IGNORE INTO value_proof_map (account, value_node_id, unit_id, sequence) VALUES (?1, ?2, ?3, ?4)",
            params![account, value_node_id.to_hex(), unit_id.to_hex(), next_sequence],
        )
        .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;

        self.mappings.entry(key).or_default().push(unit_id);
        Ok(outcome)
    }

    /// The ordered list of `unit_id`s mapped to `(account, value_node_id)`,
    /// in first-successful-insertion order.
    #[must_use]
    pub fn get_units(&self, account: &str, value_node_id: Hash) -> Vec<Hash> {
        self.mappings.get(&(account.to_owned(), value_node_id)).map(|v| v.clone()).unwrap_or_default()
    }

    /// Resolves a `unit_id` to its cached [`ProofUnit`], if known.
    #[must_use]
    pub fn get_unit(&self, unit_id: Hash) -> Option<ProofUnit> {
        self.units.get(&unit_id).map(|u| u.clone())
    }

    /// Removes the `(account, value_node_id, unit_id)` mapping, decrementing
    /// `ref_count`; deletes the unit row and purges the cache when it
    /// reaches zero. The Bloom filter is left untouched.
    ///
    /// # Errors
    /// Returns [`StorageError`] on durable I/O failure.
    pub fn remove_mapping(&self, account: &str, value_node_id: Hash, unit_id: Hash) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM value_proof_map WHERE account = ?1 AND value_node_id = ?2 AND unit_id = ?3",
            params![account, value_node_id.to_hex(), unit_id.to_hex()],
        )?;
        let remaining_ref_count: i64 = tx
            .query_row(
                "UPDATE proof_units SET ref_count = ref_count - 1 WHERE unit_id = ?1 RETURNING ref_count",
                params![unit_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if remaining_ref_count <= 0 {
            tx.execute("DELETE FROM proof_units WHERE unit_id = ?1", params![unit_id.to_hex()])?;
            self.units.remove(&unit_id);
        } else if let Some(mut cached) = self.units.get_mut(&unit_id) {
            cached.ref_count = remaining_ref_count as u64;
        }
        tx.commit()?;

        if let Some(mut mapped) = self.mappings.get_mut(&(account.to_owned(), value_node_id)) {
            mapped.retain(|id| id != &unit_id);
        }
        Ok(())
    }

    /// Rebuilds the Bloom filter from the current `proof_units` table,
    /// discarding any residual membership from deleted units.
    pub fn reset_bloom_filter(&self, expected_insertions: usize, target_fpr: f64) {
        let mut bloom = BloomFilter::new(expected_insertions, target_fpr);
        for entry in &self.units {
            bloom.insert(entry.key().as_bytes());
        }
        *self.bloom.lock() = bloom;
    }

    /// Total distinct units cached.
    #[must_use]
    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mainchain::SingleTransaction;
    use crate::proof::unit::{MerkleSibling, Side};
    use crate::value::{Value, ValueState};

    fn manager() -> ProofManager {
        let conn = Arc::new(Mutex::new(crate::persistence::open_and_migrate(std::path::Path::new(":memory:")).expect("migrate")));
        ProofManager::load(conn, 64, 0.01).expect("load")
    }

    fn bundle(sender: &str, digest_seed: &[u8]) -> (MultiTxBundle, MerklePath) {
        let digest = Hash::digest(&[digest_seed]);
        let bundle = MultiTxBundle {
            sender: sender.to_owned(),
            digest: Some(digest),
            transactions: vec![SingleTransaction {
                sender: sender.to_owned(),
                recipient: "0xbob".into(),
                values: vec![Value::new("0x1000", 10, ValueState::Unspent).expect("value")],
            }],
        };
        let path = MerklePath(vec![MerkleSibling { hash: digest, side: Side::Left }]);
        (bundle, path)
    }

    #[test]
    fn first_insertion_is_new() {
        let mgr = manager();
        let value_node_id = Hash::digest(&[b"value"]);
        let (bundle, path) = bundle("0xalice", b"tx1");
        let outcome = mgr.add_unit("0xalice", value_node_id, "0xalice".into(), bundle, path).expect("add");
        assert_eq!(outcome, AddOutcome::New);
        assert_eq!(mgr.get_units("0xalice", value_node_id).len(), 1);
    }

    #[test]
    fn repeated_mapping_is_idempotent_and_does_not_inflate_ref_count() {
        let mgr = manager();
        let value_node_id = Hash::digest(&[b"value"]);
        let (bundle, path) = bundle("0xalice", b"tx1");
        mgr.add_unit("0xalice", value_node_id, "0xalice".into(), bundle.clone(), path.clone()).expect("add");
        let outcome = mgr.add_unit("0xalice", value_node_id, "0xalice".into(), bundle, path).expect("add again");
        assert_eq!(outcome, AddOutcome::AlreadyMapped);
        assert_eq!(mgr.get_units("0xalice", value_node_id).len(), 1);
    }

    #[test]
    fn same_unit_mapped_to_second_value_increments_ref_count() {
        let mgr = manager();
        let value_a = Hash::digest(&[b"value-a"]);
        let value_b = Hash::digest(&[b"value-b"]);
        let (bundle, path) = bundle("0xalice", b"tx1");
        mgr.add_unit("0xalice", value_a, "0xalice".into(), bundle.clone(), path.clone()).expect("add a");
        let outcome = mgr.add_unit("0xalice", value_b, "0xalice".into(), bundle, path).expect("add b");
        assert_eq!(outcome, AddOutcome::Existing);
        let unit_id = mgr.get_units("0xalice", value_a)[0];
        assert_eq!(mgr.get_unit(unit_id).unwrap().ref_count, 2);
    }

    #[test]
    fn remove_mapping_decrements_and_deletes_at_zero() {
        let mgr = manager();
        let value_node_id = Hash::digest(&[b"value"]);
        let (bundle, path) = bundle("0xalice", b"tx1");
        mgr.add_unit("0xalice", value_node_id, "0xalice".into(), bundle, path).expect("add");
        let unit_id = mgr.get_units("0xalice", value_node_id)[0];
        mgr.remove_mapping("0xalice", value_node_id, unit_id).expect("remove");
        assert!(mgr.get_unit(unit_id).is_none());
        assert!(mgr.get_units("0xalice", value_node_id).is_empty());
    }

    #[test]
    fn ordering_is_preserved_across_insertions() {
        let mgr = manager();
        let value_node_id = Hash::digest(&[b"value"]);
        let (b1, p1) = bundle("0xalice", b"tx1");
        let (b2, p2) = bundle("0xalice", b"tx2");
        let (b3, p3) = bundle("0xalice", b"tx3");
        mgr.add_unit("0xalice", value_node_id, "0xalice".into(), b1, p1).expect("add1");
        mgr.add_unit("0xalice", value_node_id, "0xalice".into(), b2, p2).expect("add2");
        mgr.add_unit("0xalice", value_node_id, "0xalice".into(), b3, p3).expect("add3");
        let units = mgr.get_units("0xalice", value_node_id);
        assert_eq!(units.len(), 3);
    }
}
