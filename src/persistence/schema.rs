//! SQL schema and migrations for one account's durable database.
//!
//! Holds `ledger_values`, `block_indices`, `proof_units`, `accounts`, and
//! `value_proof_map`, one file per account process. Migrations are
//! registered with `schemerz`/`schemerz-rusqlite` as an ordered, dependency-
//! linked sequence, each applied inside its own transaction.

use std::collections::HashSet;

use rusqlite::{Connection, Transaction};
use schemerz::Migration;
use schemerz_rusqlite::{RusqliteMigration, RusqliteMigratorExt};
use uuid::Uuid;

use crate::error::StorageError;

#[derive(Debug)]
struct InitialSchema;

impl Migration for InitialSchema {
    fn id(&self) -> Uuid {
        Uuid::parse_str("8e6e2f0a-8f0a-4c8a-9a9e-3b4f5a2d0001").expect("valid uuid literal")
    }

    fn dependencies(&self) -> HashSet<Uuid> {
        HashSet::new()
    }

    fn description(&self) -> &'static str {
        "create values, block_indices, proof_units, accounts, value_proof_map"
    }
}

impl RusqliteMigration for InitialSchema {
    type Error = StorageError;

    fn up(&self, tx: &Transaction<'_>) -> Result<(), Self::Error> {
        tx.execute_batch(
            "
            CREATE TABLE ledger_values (
                node_id TEXT PRIMARY KEY,
                begin_hex TEXT NOT NULL,
                num TEXT NOT NULL,
                state TEXT NOT NULL,
                verified_at TEXT
            );
            CREATE INDEX idx_values_state ON ledger_values(state);

            CREATE TABLE block_indices (
                account TEXT NOT NULL,
                value_node_id TEXT NOT NULL,
                heights_json TEXT NOT NULL,
                owners_json TEXT NOT NULL,
                PRIMARY KEY (account, value_node_id)
            );

            CREATE TABLE proof_units (
                unit_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                multi_tx_blob TEXT NOT NULL,
                merkle_path_blob TEXT NOT NULL,
                ref_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE accounts (
                address TEXT PRIMARY KEY
            );

            CREATE TABLE value_proof_map (
                account TEXT NOT NULL,
                value_node_id TEXT NOT NULL,
                unit_id TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                UNIQUE(account, value_node_id, unit_id)
            );
            CREATE INDEX idx_value_proof_map_pair ON value_proof_map(account, value_node_id, sequence);
            ",
        )?;
        Ok(())
    }

    fn down(&self, tx: &Transaction<'_>) -> Result<(), Self::Error> {
        tx.execute_batch(
            "DROP TABLE value_proof_map;
             DROP TABLE accounts;
             DROP TABLE proof_units;
             DROP TABLE block_indices;
             DROP TABLE ledger_values;",
        )?;
        Ok(())
    }
}

/// Migration 2: backfill the `sequence` column for databases created before
/// it existed, ordering by `created_at`. On a fresh database (already
/// created with `sequence` by [`InitialSchema`]) this is a no-op.
#[derive(Debug)]
struct BackfillSequenceColumn;

impl Migration for BackfillSequenceColumn {
    fn id(&self) -> Uuid {
        Uuid::parse_str("8e6e2f0a-8f0a-4c8a-9a9e-3b4f5a2d0002").expect("valid uuid literal")
    }

    fn dependencies(&self) -> HashSet<Uuid> {
        let mut deps = HashSet::new();
        deps.insert(InitialSchema.id());
        deps
    }

    fn description(&self) -> &'static str {
        "backfill value_proof_map.sequence from created_at ordering, if missing"
    }
}

impl RusqliteMigration for BackfillSequenceColumn {
    type Error = StorageError;

    fn up(&self, tx: &Transaction<'_>) -> Result<(), Self::Error> {
        let has_sequence: bool = tx
            .prepare("SELECT COUNT(*) FROM pragma_table_info('value_proof_map') WHERE name = 'sequence'")?
            .query_row([], |row| row.get::<_, i64>(0))?
            > 0;
        if !has_sequence {
            tx.execute_batch(
                "ALTER TABLE value_proof_map ADD COLUMN sequence INTEGER;
                 ALTER TABLE value_proof_map ADD COLUMN created_at TEXT;",
            )?;
            tx.execute_batch(
                "UPDATE value_proof_map
                 SET sequence = (
                     SELECT COUNT(*) FROM value_proof_map AS earlier
                     WHERE earlier.account = value_proof_map.account
                       AND earlier.value_node_id = value_proof_map.value_node_id
                       AND earlier.created_at <= value_proof_map.created_at
                 ) - 1;",
            )?;
        }
        Ok(())
    }

    fn down(&self, _tx: &Transaction<'_>) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Opens (creating if absent) the database at `path` and applies every
/// migration up to the latest, each one fully applied or fully rolled back.
///
/// # Errors
/// Returns [`StorageError`] if the connection cannot be opened or a
/// migration fails.
pub fn open_and_migrate(path: &std::path::Path) -> Result<Connection, StorageError> {
    let mut conn = Connection::open(path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    let mut migrator = schemerz::Migrator::default();
    migrator
        .register(Box::new(InitialSchema))
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    migrator
        .register(Box::new(BackfillSequenceColumn))
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    migrator
        .up_rusqlite(None, &mut conn)
        .map_err(|e| StorageError::Migration(e.to_string()))?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrating_in_memory_database_creates_expected_tables() {
        let conn = open_and_migrate(std::path::Path::new(":memory:")).expect("migrate");
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .expect("prepare");
        let names: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<Result<_, _>>()
            .expect("rows");
        for expected in ["accounts", "block_indices", "proof_units", "value_proof_map", "ledger_values"] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }

    #[test]
    fn migrating_twice_is_idempotent() {
        let path = std::path::Path::new(":memory:");
        open_and_migrate(path).expect("first migrate");
        open_and_migrate(path).expect("second migrate against fresh :memory: connection");
    }
}
