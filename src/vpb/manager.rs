//! Coordinator exposing the four VPB lifecycle operations: genesis
//! initialization, outgoing-send bookkeeping, incoming-receive bookkeeping,
//! and the verified-to-unspent sweep. Each operation is serialized by a
//! per-account reentrant lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::{params, Connection};
use tracing::{debug, info, warn};

use crate::block_index::BlockIndexList;
use crate::checkpoint::CheckpointStore;
use crate::collection::ValueCollection;
use crate::config::Configuration;
use crate::error::{Error, StorageError};
use crate::hash::Hash;
use crate::mainchain::MultiTxBundle;
use crate::proof::unit::MerklePath;
use crate::proof::{AddOutcome, ProofManager};
use crate::value::{Value, ValueState};

/// Seam allowing tests to control "now" deterministically.
pub trait Clock: Send + Sync {
    /// The current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// One freshly produced proof unit input: the owner, the signed bundle, and
/// its Merkle inclusion path.
pub struct ProofUnitInput {
    /// Address that authored `bundle`.
    pub owner: String,
    /// The signed multi-transaction bundle.
    pub bundle: MultiTxBundle,
    /// Merkle inclusion path for `bundle.digest`.
    pub merkle_path: MerklePath,
}

/// Coordinates the Value Collection, Block-Index Lists, and Proof Manager
/// for one account, enforcing cross-component consistency.
pub struct VpbManager {
    account: String,
    lock: ReentrantMutex<()>,
    collection: ValueCollection,
    block_indices: DashMap<Hash, Mutex<BlockIndexList>>,
    proofs: ProofManager,
    checkpoints: Arc<CheckpointStore>,
    conn: Arc<Mutex<Connection>>,
    config: Configuration,
    clock: Arc<dyn Clock>,
}

impl VpbManager {
    /// Opens a manager for `account`, loading its durable Values, block
    /// indices, and proof mappings from `conn`.
    ///
    /// # Errors
    /// Returns [`StorageError`] if the preload queries fail.
    pub fn open(
        account: impl Into<String>,
        config: Configuration,
        conn: Arc<Mutex<Connection>>,
        checkpoints: Arc<CheckpointStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let proofs = ProofManager::load(conn.clone(), config.bloom_expected_insertions, config.bloom_target_fpr)?;
        let manager = Self {
            account: account.into(),
            lock: ReentrantMutex::new(()),
            collection: ValueCollection::new(),
            block_indices: DashMap::new(),
            proofs,
            checkpoints,
            conn,
            config,
            clock,
        };
        manager.reload_values_and_indices()?;
        Ok(manager)
    }

    fn reload_values_and_indices(&self) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT node_id, begin_hex, num, state, verified_at FROM ledger_values")?;
        let rows = stmt.query_map([], |row| {
            let node_id: String = row.get(0)?;
            let begin_hex: String = row.get(1)?;
            let num: String = row.get(2)?;
            let state: String = row.get(3)?;
            let verified_at: Option<String> = row.get(4)?;
            Ok((node_id, begin_hex, num, state, verified_at))
        })?;
        for row in rows {
            let (_node_id, begin_hex, num, state_str, verified_at) = row?;
            let state = parse_state(&state_str).ok_or_else(|| StorageError::Migration(format!("unknown state {state_str}")))?;
            let verified_at = verified_at
                .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                .transpose()
                .map_err(|e| StorageError::Migration(e.to_string()))?;
            let value = Value::from_storage(&begin_hex, &num, state, verified_at).map_err(|e| StorageError::Migration(e.to_string()))?;
            self.collection.add(value).ok();
        }
        drop(stmt);

        let mut stmt = conn.prepare("SELECT value_node_id, heights_json, owners_json FROM block_indices WHERE account = ?1")?;
        let rows = stmt.query_map(params![self.account], |row| {
            let node_id: String = row.get(0)?;
            let heights_json: String = row.get(1)?;
            let owners_json: String = row.get(2)?;
            Ok((node_id, heights_json, owners_json))
        })?;
        for row in rows {
            let (node_id, heights_json, owners_json) = row?;
            let node_id = Hash::from_hex(&node_id).map_err(|e| StorageError::Migration(e.to_string()))?;
            let heights: Vec<u64> = serde_json::from_str(&heights_json)?;
            let owners = serde_json::from_str(&owners_json)?;
            if let Some(list) = BlockIndexList::from_parts(heights, owners) {
                self.block_indices.insert(node_id, Mutex::new(list));
            }
        }
        Ok(())
    }

    fn persist_value(&self, value: &Value) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO ledger_values (node_id, begin_hex, num, state, verified_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(node_id) DO UPDATE SET state = excluded.state, verified_at = excluded.verified_at",
            params![
                value.node_id().to_hex(),
                value.begin_hex(),
                value.num().to_string(),
                value.state().to_string(),
                value.verified_at().map(|t| t.to_rfc3339())
            ],
        )?;
        Ok(())
    }

    fn persist_block_index(&self, node_id: Hash, list: &BlockIndexList) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO block_indices (account, value_node_id, heights_json, owners_json)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(account, value_node_id) DO UPDATE SET heights_json = excluded.heights_json, owners_json = excluded.owners_json",
            params![
                self.account,
                node_id.to_hex(),
                serde_json::to_string(list.heights())?,
                serde_json::to_string(list.owners())?
            ],
        )?;
        Ok(())
    }

    fn add_proof_unit(&self, node_id: Hash, input: &ProofUnitInput) -> Result<AddOutcome, Error> {
        self.proofs.add_unit(
            &self.account,
            node_id,
            input.owner.clone(),
            input.bundle.clone(),
            input.merkle_path.clone(),
        )
    }

    /// Installs a freshly emitted Value with its genesis proof units and
    /// block index. Precondition: no record for this Value exists yet for
    /// this account.
    ///
    /// # Errors
    /// Returns [`Error::DuplicateValue`] if the Value is already known.
    pub fn initialize_from_genesis(
        &self,
        value: Value,
        proof_units: Vec<ProofUnitInput>,
        block_index: BlockIndexList,
    ) -> Result<Hash, Error> {
        let _guard = self.lock.lock();
        let value = value.with_state(ValueState::Unspent, self.clock.now());
        let node_id = self.collection.add(value.clone())?;
        self.persist_value(&value).map_err(Error::from)?;

        self.block_indices.insert(node_id, Mutex::new(block_index.clone()));
        self.persist_block_index(node_id, &block_index).map_err(Error::from)?;

        for input in &proof_units {
            self.add_proof_unit(node_id, input)?;
        }
        info!(account = %self.account, node_id = %node_id, "initialized value from genesis");
        Ok(node_id)
    }

    /// Applies the four steps of a confirmed outgoing send: appends the new
    /// proof unit to every transferred and still-held Value, records the
    /// block height, advances transferred Values to `OnChain`, and
    /// best-effort checkpoints each transferred Value at `height - 1`.
    ///
    /// # Errors
    /// Returns an error if any Value is unknown or a durable write fails;
    /// checkpoint creation failures are logged, not propagated.
    pub fn update_after_transaction_sent(
        &self,
        account: &str,
        bundle: MultiTxBundle,
        merkle_proof: MerklePath,
        height: u64,
        recipient: &str,
        transferred_node_ids: &[Hash],
    ) -> Result<(), Error> {
        let _guard = self.lock.lock();
        let input = ProofUnitInput {
            owner: account.to_owned(),
            bundle,
            merkle_path: merkle_proof,
        };

        for &node_id in transferred_node_ids {
            let mut value = self.collection.get(node_id).ok_or(Error::ValueNotFound)?;
            {
                let entry = self.block_indices.entry(node_id).or_insert_with(|| Mutex::new(BlockIndexList::new()));
                let mut list = entry.lock();
                list.append_height(height);
                list.record_ownership_change(height, recipient);
                self.persist_block_index(node_id, &list).map_err(Error::from)?;
            }
            self.add_proof_unit(node_id, &input)?;
            self.collection.update_state(node_id, ValueState::OnChain, self.clock.now())?;
            value = self.collection.get(node_id).unwrap_or(value);
            self.persist_value(&value).map_err(Error::from)?;

            if height > 0 {
                match self.checkpoints.create(&value, account, height - 1) {
                    Ok(_) => debug!(node_id = %node_id, height, "checkpoint created after send"),
                    Err(Error::DuplicateCheckpoint) => {
                        if let Err(e) = self.checkpoints.update(&value, account, height - 1) {
                            warn!(%e, "best-effort checkpoint update failed");
                        }
                    }
                    Err(e) => warn!(%e, "best-effort checkpoint create failed"),
                }
            }
        }

        for value in self.collection.find_by_state(ValueState::Unspent) {
            let node_id = value.node_id();
            if transferred_node_ids.contains(&node_id) {
                continue;
            }
            let entry = self.block_indices.entry(node_id).or_insert_with(|| Mutex::new(BlockIndexList::new()));
            {
                let mut list = entry.lock();
                list.append_height(height);
                self.persist_block_index(node_id, &list).map_err(Error::from)?;
            }
            self.add_proof_unit(node_id, &input)?;
        }

        Ok(())
    }

    /// Installs an incoming VPB triple: merges into an existing record if
    /// one exists for this range, else inserts a fresh `Received` Value
    /// awaiting validator advancement.
    ///
    /// # Errors
    /// Returns an error on a durable write failure.
    pub fn receive_vpb_from_others(
        &self,
        value: Value,
        proof_units: Vec<ProofUnitInput>,
        block_index: BlockIndexList,
    ) -> Result<Hash, Error> {
        let _guard = self.lock.lock();
        let node_id = value.node_id();

        if let Some(existing) = self.collection.get(node_id) {
            let entry = self.block_indices.entry(node_id).or_insert_with(|| Mutex::new(BlockIndexList::new()));
            {
                let mut list = entry.lock();
                list.merge(&block_index);
                self.persist_block_index(node_id, &list).map_err(Error::from)?;
            }
            for input in &proof_units {
                self.add_proof_unit(node_id, input)?;
            }
            self.collection.update_state(node_id, ValueState::Unspent, self.clock.now())?;
            let updated = self.collection.get(node_id).unwrap_or(existing);
            self.persist_value(&updated).map_err(Error::from)?;
        } else {
            let received = value.with_state(ValueState::Received, self.clock.now());
            self.collection.add(received.clone())?;
            self.persist_value(&received).map_err(Error::from)?;
            self.block_indices.insert(node_id, Mutex::new(block_index.clone()));
            self.persist_block_index(node_id, &block_index).map_err(Error::from)?;
            for input in &proof_units {
                self.add_proof_unit(node_id, input)?;
            }
        }
        info!(account = %self.account, node_id = %node_id, "received vpb triple");
        Ok(node_id)
    }

    /// Transitions every Value with `state = Verified` whose `verified_at`
    /// is at least [`Configuration::verified_to_unspent_delay`] in the past
    /// to `Unspent`. Returns the number transitioned.
    ///
    /// # Errors
    /// Returns an error on a durable write failure.
    pub fn sweep_verified_to_unspent(&self) -> Result<usize, Error> {
        let _guard = self.lock.lock();
        let now = self.clock.now();
        let mut swept = 0;
        for value in self.collection.find_by_state(ValueState::Verified) {
            let Some(verified_at) = value.verified_at() else { continue };
            let elapsed = now.signed_duration_since(verified_at);
            let threshold = chrono::Duration::from_std(self.config.verified_to_unspent_delay).unwrap_or(chrono::Duration::zero());
            if elapsed >= threshold {
                let node_id = value.node_id();
                self.collection.update_state(node_id, ValueState::Unspent, now)?;
                let updated = self.collection.get(node_id).expect("just updated");
                self.persist_value(&updated).map_err(Error::from)?;
                swept += 1;
            }
        }
        if swept > 0 {
            debug!(account = %self.account, swept, "swept verified values to unspent");
        }
        Ok(swept)
    }

    /// Cross-checks cross-component consistency: every Value has a
    /// block-index entry; every proof-manager value count matches the
    /// collection's total.
    #[must_use]
    pub fn validate_vpb_integrity(&self) -> bool {
        if !self.collection.validate_integrity() {
            return false;
        }
        let mut all_values: HashMap<Hash, ()> = HashMap::new();
        for state in ValueState::all() {
            for value in self.collection.find_by_state(state) {
                all_values.insert(value.node_id(), ());
            }
        }
        for node_id in all_values.keys() {
            if !self.block_indices.contains_key(node_id) {
                return false;
            }
        }
        true
    }

    /// Read-only access to this account's Value Collection.
    #[must_use]
    pub fn collection(&self) -> &ValueCollection {
        &self.collection
    }

    /// Read-only access to this account's Proof Manager.
    #[must_use]
    pub fn proofs(&self) -> &ProofManager {
        &self.proofs
    }

    /// Read-only access to this account's Checkpoint Store.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// The block-index list currently recorded for `node_id`, if any.
    #[must_use]
    pub fn block_index(&self, node_id: Hash) -> Option<BlockIndexList> {
        self.block_indices.get(&node_id).map(|l| l.lock().clone())
    }
}

fn parse_state(s: &str) -> Option<ValueState> {
    Some(match s {
        "unspent" => ValueState::Unspent,
        "pending" => ValueState::Pending,
        "on_chain" => ValueState::OnChain,
        "confirmed" => ValueState::Confirmed,
        "received" => ValueState::Received,
        "verified" => ValueState::Verified,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_index::OwnerRecord;
    use crate::mainchain::SingleTransaction;
    use crate::proof::unit::{MerkleSibling, Side};
    use crate::value::ValueState;

    struct MockClock(Mutex<DateTime<Utc>>);

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock()
        }
    }

    impl MockClock {
        fn advance(&self, duration: chrono::Duration) {
            *self.0.lock() += duration;
        }
    }

    fn manager_with_clock() -> (VpbManager, Arc<MockClock>) {
        let conn = Arc::new(Mutex::new(crate::persistence::open_and_migrate(std::path::Path::new(":memory:")).expect("migrate")));
        let checkpoints = Arc::new(CheckpointStore::open(std::path::Path::new(":memory:")).expect("open"));
        let clock = Arc::new(MockClock(Mutex::new(Utc::now())));
        let manager = VpbManager::open("0xalice", Configuration::default(), conn, checkpoints, clock.clone()).expect("open");
        (manager, clock)
    }

    fn bundle(sender: &str, seed: &[u8]) -> (MultiTxBundle, MerklePath) {
        let digest = Hash::digest(&[seed]);
        let bundle = MultiTxBundle {
            sender: sender.to_owned(),
            digest: Some(digest),
            transactions: vec![SingleTransaction {
                sender: sender.to_owned(),
                recipient: "0xbob".into(),
                values: vec![Value::new("0x1000", 10, ValueState::Unspent).expect("value")],
            }],
        };
        (bundle, MerklePath(vec![MerkleSibling { hash: digest, side: Side::Left }]))
    }

    #[test]
    fn initialize_from_genesis_installs_value_and_index() {
        let (mgr, _clock) = manager_with_clock();
        let value = Value::new("0x1000", 100, ValueState::Unspent).expect("value");
        let mut block_index = BlockIndexList::new();
        block_index.record_ownership_change(0, "0xGENESIS");
        let node_id = mgr.initialize_from_genesis(value, vec![], block_index).expect("init");
        assert_eq!(mgr.collection().get(node_id).unwrap().state(), ValueState::Unspent);
        assert!(mgr.block_index(node_id).is_some());
    }

    #[test]
    fn duplicate_genesis_rejected() {
        let (mgr, _clock) = manager_with_clock();
        let value = Value::new("0x1000", 100, ValueState::Unspent).expect("value");
        mgr.initialize_from_genesis(value.clone(), vec![], BlockIndexList::new()).expect("init");
        let err = mgr.initialize_from_genesis(value, vec![], BlockIndexList::new()).unwrap_err();
        assert!(matches!(err, Error::DuplicateValue));
    }

    #[test]
    fn update_after_send_advances_transferred_and_tags_unspent() {
        let (mgr, _clock) = manager_with_clock();
        let transferred = Value::new("0x1000", 100, ValueState::Unspent).expect("value");
        let held = Value::new("0x2000", 50, ValueState::Unspent).expect("value");
        let t_id = mgr.initialize_from_genesis(transferred, vec![], BlockIndexList::new()).expect("init");
        mgr.initialize_from_genesis(held, vec![], BlockIndexList::new()).expect("init");

        let (b, p) = bundle("0xalice", b"send1");
        mgr.update_after_transaction_sent("0xalice", b, p, 8, "0xbob", &[t_id]).expect("send");

        assert_eq!(mgr.collection().get(t_id).unwrap().state(), ValueState::OnChain);
        assert_eq!(mgr.block_index(t_id).unwrap().owner_at(8), Some("0xbob"));
        let checkpoint = mgr.checkpoints().get(&mgr.collection().get(t_id).unwrap()).expect("query");
        assert!(checkpoint.is_some());
    }

    #[test]
    fn receive_inserts_as_received_then_validator_advances() {
        let (mgr, _clock) = manager_with_clock();
        let value = Value::new("0x1000", 10, ValueState::Received).expect("value");
        let node_id = mgr.receive_vpb_from_others(value, vec![], BlockIndexList::new()).expect("receive");
        assert_eq!(mgr.collection().get(node_id).unwrap().state(), ValueState::Received);
    }

    #[test]
    fn receive_merges_when_already_known() {
        let (mgr, _clock) = manager_with_clock();
        let value = Value::new("0x1000", 10, ValueState::Unspent).expect("value");
        mgr.initialize_from_genesis(value.clone(), vec![], BlockIndexList::new()).expect("init");

        let mut incoming_index = BlockIndexList::new();
        incoming_index.record_ownership_change(5, "0xalice");
        let node_id = mgr.receive_vpb_from_others(value, vec![], incoming_index).expect("receive merge");
        assert_eq!(mgr.collection().get(node_id).unwrap().state(), ValueState::Unspent);
        assert_eq!(mgr.block_index(node_id).unwrap().owner_at(5), Some("0xalice"));
    }

    #[test]
    fn sweep_transitions_only_after_delay() {
        let (mgr, clock) = manager_with_clock();
        let value = Value::new("0x1000", 10, ValueState::Received).expect("value");
        let node_id = mgr.receive_vpb_from_others(value, vec![], BlockIndexList::new()).expect("receive");
        mgr.collection().update_state(node_id, ValueState::Verified, clock.now()).expect("mark verified");

        assert_eq!(mgr.sweep_verified_to_unspent().expect("sweep"), 0);
        clock.advance(chrono::Duration::from_std(mgr.config.verified_to_unspent_delay).unwrap());
        assert_eq!(mgr.sweep_verified_to_unspent().expect("sweep"), 1);
        assert_eq!(mgr.collection().get(node_id).unwrap().state(), ValueState::Unspent);
    }

    #[test]
    fn integrity_check_flags_missing_block_index() {
        let (mgr, _clock) = manager_with_clock();
        let value = Value::new("0x1000", 10, ValueState::Unspent).expect("value");
        mgr.collection().add(value).expect("add directly, bypassing block index bookkeeping");
        assert!(!mgr.validate_vpb_integrity());
    }

    #[test]
    fn owner_record_round_trips_through_block_index_merge() {
        let mut a = BlockIndexList::new();
        a.record_ownership_change(0, "0xalice");
        let mut b = BlockIndexList::new();
        b.record_ownership_change(15, "0xbob");
        a.merge(&b);
        assert_eq!(a.owners().len(), 2);
        assert_eq!(a.owners()[0], OwnerRecord { height: 0, address: "0xalice".into() });
    }
}
