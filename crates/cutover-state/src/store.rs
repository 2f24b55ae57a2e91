//! redb-backed state persistence for Cutover.
//!
//! Typed CRUD over group records, archived shifts, and pipeline runs.
//! Values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.open_table(SHIFTS).map_err(map_err!(Table))?;
        txn.open_table(RUNS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put<T: Serialize>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix` (every value for `""`).
    fn scan<T: DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    fn delete(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Groups ─────────────────────────────────────────────────────

    /// Insert or update a deployment group record.
    pub fn put_group(&self, record: &GroupRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(GROUPS, &key, record)?;
        debug!(
            group = %key,
            state = record.state.label(),
            weights = %record.pair.weights,
            "group record stored"
        );
        Ok(())
    }

    pub fn get_group(&self, group_id: &str) -> StateResult<Option<GroupRecord>> {
        self.get(GROUPS, group_id)
    }

    pub fn list_groups(&self) -> StateResult<Vec<GroupRecord>> {
        self.scan(GROUPS, "")
    }

    /// Delete a group record. Returns true if it existed.
    pub fn delete_group(&self, group_id: &str) -> StateResult<bool> {
        self.delete(GROUPS, group_id)
    }

    // ── Shifts ─────────────────────────────────────────────────────

    /// Archive a finished shift.
    pub fn put_shift(&self, record: &ShiftRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put(SHIFTS, &key, record)?;
        debug!(%key, outcome = record.outcome.label(), "shift archived");
        Ok(())
    }

    pub fn get_shift(&self, group_id: &str, shift_id: &str) -> StateResult<Option<ShiftRecord>> {
        self.get(SHIFTS, &format!("{group_id}:{shift_id}"))
    }

    /// Archived shifts for a group, oldest first.
    pub fn list_shifts_for_group(&self, group_id: &str) -> StateResult<Vec<ShiftRecord>> {
        let mut shifts: Vec<ShiftRecord> = self.scan(SHIFTS, &format!("{group_id}:"))?;
        shifts.sort_by_key(|s| (s.started_at, s.finished_at));
        Ok(shifts)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Insert or update a pipeline run.
    pub fn put_run(&self, run: &PipelineRunRecord) -> StateResult<()> {
        let key = run.table_key();
        self.put(RUNS, &key, run)?;
        debug!(run = %key, stage = run.current_stage_index, "pipeline run stored");
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> StateResult<Option<PipelineRunRecord>> {
        self.get(RUNS, run_id)
    }

    /// All runs, oldest first.
    pub fn list_runs(&self) -> StateResult<Vec<PipelineRunRecord>> {
        let mut runs: Vec<PipelineRunRecord> = self.scan(RUNS, "")?;
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    /// Runs that have not reached a terminal status.
    pub fn list_unfinished_runs(&self) -> StateResult<Vec<PipelineRunRecord>> {
        Ok(self
            .list_runs()?
            .into_iter()
            .filter(|r| !r.is_finished())
            .collect())
    }
}
