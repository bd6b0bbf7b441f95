//! In-memory ledger backend
//!
//! A [`Ledger`] implementation with real transaction semantics: sessions
//! buffer schema statements and ledger writes, publish them on commit, and
//! discard them on rollback. Used by the test suite and useful for
//! development tools that want engine behavior without a database server.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, StratumResult};
use crate::ledger::{Ledger, MigrationSession};

#[derive(Debug, Default)]
struct MemoryState {
    store_created: bool,
    /// How many times `ensure_store` actually created the store.
    creations: u64,
    entries: Vec<LedgerEntry>,
    /// Journal of successfully committed schema statements, in commit order.
    statements: Vec<String>,
}

/// Shared in-memory ledger. Cloning yields handles onto the same state.
#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the backing store was actually created; stays at one
    /// no matter how often `ensure_store` runs.
    pub fn creation_count(&self) -> u64 {
        self.lock().creations
    }

    /// Every schema statement that reached a successful commit, in order.
    pub fn committed_statements(&self) -> Vec<String> {
        self.lock().statements.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // Recover the state on poison; tests assert on it afterwards.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn ensure_store(&self) -> StratumResult<()> {
        let mut state = self.lock();
        if !state.store_created {
            state.store_created = true;
            state.creations += 1;
        }
        Ok(())
    }

    async fn list_executed(&self) -> StratumResult<Vec<LedgerEntry>> {
        self.ensure_store().await?;
        let mut entries = self.lock().entries.clone();
        // Stable: insertion order is preserved for identical timestamps.
        entries.sort_by_key(|e| e.executed_at);
        Ok(entries)
    }

    async fn begin(&self) -> StratumResult<Box<dyn MigrationSession>> {
        self.ensure_store().await?;
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            statements: Vec::new(),
            records: Vec::new(),
            removals: Vec::new(),
        }))
    }

    async fn reset(&self) -> StratumResult<u64> {
        self.ensure_store().await?;
        let mut state = self.lock();
        let removed = state.entries.len() as u64;
        state.entries.clear();
        Ok(removed)
    }
}

/// Buffered transaction over a [`MemoryLedger`].
struct MemorySession {
    state: Arc<Mutex<MemoryState>>,
    statements: Vec<String>,
    records: Vec<LedgerEntry>,
    removals: Vec<String>,
}

#[async_trait::async_trait]
impl MigrationSession for MemorySession {
    async fn execute(&mut self, sql: &str) -> StratumResult<u64> {
        self.statements.push(sql.to_string());
        Ok(0)
    }

    async fn query_scalar(&mut self, _sql: &str) -> StratumResult<Option<String>> {
        Ok(None)
    }

    async fn record(&mut self, entry: &LedgerEntry) -> StratumResult<()> {
        self.records.push(entry.clone());
        Ok(())
    }

    async fn remove(&mut self, migration_id: &str) -> StratumResult<()> {
        self.removals.push(migration_id.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StratumResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // Validate before touching anything so a failed commit changes nothing.
        for entry in &self.records {
            let survives = state
                .entries
                .iter()
                .any(|e| e.id == entry.id && !self.removals.contains(&e.id));
            if survives {
                return Err(MigrationError::Database(format!(
                    "duplicate ledger entry '{}'",
                    entry.id
                )));
            }
        }
        for id in &self.removals {
            state.entries.retain(|e| &e.id != id);
        }
        state.entries.extend(self.records);
        state.statements.extend(self.statements);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StratumResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            version: "1".to_string(),
            executed_at: Utc::now(),
            execution_time_ms: 1,
            revert_available: true,
            checksum: "abc".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ensure_store_is_idempotent() {
        let ledger = MemoryLedger::new();
        for _ in 0..5 {
            ledger.ensure_store().await.unwrap();
        }
        assert_eq!(ledger.creation_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_publishes_and_rollback_discards() {
        let ledger = MemoryLedger::new();

        let mut session = ledger.begin().await.unwrap();
        session.execute("CREATE TABLE a (id INT)").await.unwrap();
        session.record(&entry("m1")).await.unwrap();
        session.commit().await.unwrap();

        let mut session = ledger.begin().await.unwrap();
        session.execute("CREATE TABLE b (id INT)").await.unwrap();
        session.record(&entry("m2")).await.unwrap();
        session.rollback().await.unwrap();

        assert_eq!(ledger.list_executed().await.unwrap().len(), 1);
        assert_eq!(ledger.committed_statements().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_and_reset() {
        let ledger = MemoryLedger::new();
        for id in ["m1", "m2"] {
            let mut session = ledger.begin().await.unwrap();
            session.record(&entry(id)).await.unwrap();
            session.commit().await.unwrap();
        }

        let mut session = ledger.begin().await.unwrap();
        session.remove("m2").await.unwrap();
        session.commit().await.unwrap();
        let left = ledger.list_executed().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "m1");

        assert_eq!(ledger.reset().await.unwrap(), 1);
        assert!(ledger.list_executed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_entry_fails_commit() {
        let ledger = MemoryLedger::new();
        let mut session = ledger.begin().await.unwrap();
        session.record(&entry("m1")).await.unwrap();
        session.commit().await.unwrap();

        let mut session = ledger.begin().await.unwrap();
        session.record(&entry("m1")).await.unwrap();
        assert!(session.commit().await.is_err());
    }
}
