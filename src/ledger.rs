//! Execution Ledger - durable record of what has already run
//!
//! The ledger lives inside the target database itself, so the record of a
//! migration and the migration's own schema changes commit or roll back as
//! one unit. Backends implement [`Ledger`] for bootstrap, reads, and resets,
//! and hand out transaction-scoped [`MigrationSession`]s for everything that
//! must be atomic with a migration.

use crate::definitions::LedgerEntry;
use crate::error::StratumResult;

/// Durable source of truth for which migrations have executed.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Idempotently create the ledger's own storage if absent.
    ///
    /// Must succeed on a brand-new, completely empty database; calling it
    /// again is a no-op.
    async fn ensure_store(&self) -> StratumResult<()>;

    /// All executed entries, ordered by `executed_at` ascending.
    ///
    /// Bootstraps the store first, so reads never fail on a fresh database.
    async fn list_executed(&self) -> StratumResult<Vec<LedgerEntry>>;

    /// Open one transaction-scoped session for a single migration.
    async fn begin(&self) -> StratumResult<Box<dyn MigrationSession>>;

    /// Destructive: drop all entries (never the user schema).
    ///
    /// Returns the number of removed entries. Callers gate this behind the
    /// engine's confirmation token; the ledger itself does not ask questions.
    async fn reset(&self) -> StratumResult<u64>;
}

/// One database transaction scoped to a single migration.
///
/// A session carries both the migration's own statements and the ledger
/// write/delete for that migration, so the pair commits atomically. Dropping
/// a session without calling [`commit`](MigrationSession::commit) discards
/// its work.
#[async_trait::async_trait]
pub trait MigrationSession: Send {
    /// Execute one SQL statement; returns rows affected.
    async fn execute(&mut self, sql: &str) -> StratumResult<u64>;

    /// Fetch the first column of the first row as text, if any.
    ///
    /// Prechecks use this for existence probes without needing typed rows.
    async fn query_scalar(&mut self, sql: &str) -> StratumResult<Option<String>>;

    /// Append one ledger entry inside this transaction.
    async fn record(&mut self, entry: &LedgerEntry) -> StratumResult<()>;

    /// Delete one ledger entry inside this transaction. Revert only.
    async fn remove(&mut self, migration_id: &str) -> StratumResult<()>;

    /// Commit the transaction, publishing schema changes and ledger writes together.
    async fn commit(self: Box<Self>) -> StratumResult<()>;

    /// Roll the transaction back, discarding schema changes and ledger writes together.
    async fn rollback(self: Box<Self>) -> StratumResult<()>;
}
