//! PostgreSQL ledger backend
//!
//! Stores the execution ledger in a table inside the target database and
//! hands out sqlx transactions as migration sessions, so a migration's
//! schema changes and its ledger row commit as one unit.
//!
//! The ledger table's schema is stable across engine versions: reads name
//! their columns explicitly and every column added later carries a default,
//! so old rows keep loading.

use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::definitions::LedgerEntry;
use crate::error::{MigrationError, StratumResult};
use crate::ledger::{Ledger, MigrationSession};

/// Default name of the ledger table inside the target database.
pub const DEFAULT_LEDGER_TABLE: &str = "stratum_ledger";

/// [`Ledger`] backed by a PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresLedger {
    pool: PgPool,
    table: String,
}

impl PostgresLedger {
    /// Create a ledger on an existing pool with the default table name.
    pub fn new(pool: PgPool) -> Self {
        Self::with_table(pool, DEFAULT_LEDGER_TABLE)
    }

    pub fn with_table(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Connect to `database_url` and create a ledger with the default table name.
    pub async fn connect(database_url: &str) -> StratumResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to connect: {}", e)))?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// DDL for the ledger's own storage.
    ///
    /// `seq` disambiguates ordering between entries that share a timestamp;
    /// it is bookkeeping, not part of [`LedgerEntry`].
    fn create_store_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
                id VARCHAR(255) PRIMARY KEY,\n    \
                version VARCHAR(64) NOT NULL,\n    \
                executed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),\n    \
                execution_time_ms BIGINT NOT NULL DEFAULT 0,\n    \
                revert_available BOOLEAN NOT NULL DEFAULT FALSE,\n    \
                checksum VARCHAR(64) NOT NULL DEFAULT '',\n    \
                seq BIGSERIAL\n\
            );",
            self.table
        )
    }

    fn list_sql(&self) -> String {
        format!(
            "SELECT id, version, executed_at, execution_time_ms, revert_available, checksum \
             FROM {} ORDER BY executed_at ASC, seq ASC",
            self.table
        )
    }
}

#[async_trait::async_trait]
impl Ledger for PostgresLedger {
    async fn ensure_store(&self) -> StratumResult<()> {
        sqlx::query(&self.create_store_sql())
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MigrationError::Database(format!("Failed to create ledger table: {}", e))
            })?;
        Ok(())
    }

    async fn list_executed(&self) -> StratumResult<Vec<LedgerEntry>> {
        self.ensure_store().await?;

        let rows = sqlx::query(&self.list_sql())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to read ledger: {}", e)))?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(LedgerEntry {
                id: row.try_get("id")?,
                version: row.try_get("version")?,
                executed_at: row.try_get("executed_at")?,
                execution_time_ms: row.try_get::<i64, _>("execution_time_ms")? as u64,
                revert_available: row.try_get("revert_available")?,
                checksum: row.try_get("checksum")?,
            });
        }
        Ok(entries)
    }

    async fn begin(&self) -> StratumResult<Box<dyn MigrationSession>> {
        self.ensure_store().await?;
        let tx = self.pool.begin().await.map_err(|e| {
            MigrationError::Database(format!("Failed to start transaction: {}", e))
        })?;
        Ok(Box::new(PostgresSession {
            tx,
            table: self.table.clone(),
        }))
    }

    async fn reset(&self) -> StratumResult<u64> {
        self.ensure_store().await?;
        let result = sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to reset ledger: {}", e)))?;
        Ok(result.rows_affected())
    }
}

/// One sqlx transaction scoped to a single migration.
struct PostgresSession {
    tx: Transaction<'static, Postgres>,
    table: String,
}

#[async_trait::async_trait]
impl MigrationSession for PostgresSession {
    async fn execute(&mut self, sql: &str) -> StratumResult<u64> {
        let result = sqlx::query(sql).execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn query_scalar(&mut self, sql: &str) -> StratumResult<Option<String>> {
        let row = sqlx::query(sql).fetch_optional(&mut *self.tx).await?;
        Ok(row.and_then(|r| r.try_get::<String, _>(0).ok()))
    }

    async fn record(&mut self, entry: &LedgerEntry) -> StratumResult<()> {
        let sql = format!(
            "INSERT INTO {} (id, version, executed_at, execution_time_ms, revert_available, checksum) \
             VALUES ($1, $2, $3, $4, $5, $6)",
            self.table
        );
        sqlx::query(&sql)
            .bind(&entry.id)
            .bind(&entry.version)
            .bind(entry.executed_at)
            .bind(entry.execution_time_ms as i64)
            .bind(entry.revert_available)
            .bind(&entry.checksum)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to record migration: {}", e)))?;
        Ok(())
    }

    async fn remove(&mut self, migration_id: &str) -> StratumResult<()> {
        let sql = format!("DELETE FROM {} WHERE id = $1", self.table);
        sqlx::query(&sql)
            .bind(migration_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                MigrationError::Database(format!("Failed to remove ledger entry: {}", e))
            })?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StratumResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to commit: {}", e)))
    }

    async fn rollback(self: Box<Self>) -> StratumResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to roll back: {}", e)))
    }
}
