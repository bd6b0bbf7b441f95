//! Migration Definitions - Core types and contracts for migrations
//!
//! Defines the `Migration` trait every definition implements, the SQL-backed
//! `SqlMigration`, the ledger entry shape, and the result/report types the
//! engine hands back to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

use crate::error::{MigrationError, StratumResult};
use crate::ledger::MigrationSession;

/// A single unit of schema change.
///
/// Definitions are immutable: once authored (and especially once applied),
/// a migration's forward logic must never change. The engine detects edits
/// after execution through [`Migration::checksum`] and reports them as drift.
///
/// Implementations that provide a [`revert`](Migration::revert) must also
/// override [`supports_revert`](Migration::supports_revert) to return `true`;
/// the default declares the migration forward-only.
#[async_trait::async_trait]
pub trait Migration: Send + Sync {
    /// Globally unique, stable identifier. Never reused.
    fn id(&self) -> &str;

    /// Monotonically sortable ordering token, typically timestamp-based.
    fn version(&self) -> &str;

    /// Human-readable name. Not authoritative.
    fn name(&self) -> &str;

    /// Longer human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Ids of migrations that must be recorded as executed before this one runs.
    fn dependencies(&self) -> &[String] {
        &[]
    }

    /// Whether this migration declares a revert operation.
    fn supports_revert(&self) -> bool {
        false
    }

    /// Fingerprint of the forward logic, recorded in the ledger at apply time.
    ///
    /// The default hashes id, version, and name. Implementations whose forward
    /// logic lives in data (SQL text, scripts) should hash that content instead
    /// so edits after execution are detectable.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id().as_bytes());
        hasher.update(self.version().as_bytes());
        hasher.update(self.name().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Guard evaluated immediately before `apply`, inside the same transaction.
    ///
    /// Returning `false` marks the migration as blocked for this run; it is
    /// not an error and the run continues with unaffected migrations.
    async fn precheck(&self, _session: &mut dyn MigrationSession) -> StratumResult<bool> {
        Ok(true)
    }

    /// Forward operation. Runs inside a transaction managed by the engine;
    /// do not commit or roll back from here.
    async fn apply(&self, session: &mut dyn MigrationSession) -> StratumResult<()>;

    /// Inverse of `apply`. Only invoked when [`supports_revert`] is `true`.
    async fn revert(&self, _session: &mut dyn MigrationSession) -> StratumResult<()> {
        Err(MigrationError::RevertUnavailable {
            id: self.id().to_string(),
        })
    }
}

/// A migration whose forward and backward logic are SQL payloads.
///
/// This is the shape file-based migrations load into. The SQL text is opaque
/// to the engine; statements are split and executed in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlMigration {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub dependencies: Vec<String>,
    /// SQL statements to apply the migration
    pub up_sql: String,
    /// SQL statements to roll the migration back; empty means revert-unavailable
    pub down_sql: String,
}

impl SqlMigration {
    /// Create a definition with id `<version>_<name-slug>` and empty bodies.
    pub fn new(version: impl Into<String>, name: impl Into<String>) -> Self {
        let version = version.into();
        let name = name.into();
        let id = format!("{}_{}", version, slugify(&name));
        Self {
            id,
            version,
            name,
            description: String::new(),
            dependencies: Vec::new(),
            up_sql: String::new(),
            down_sql: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Declare a dependency on another migration's id.
    pub fn requires(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    pub fn with_up_sql(mut self, sql: impl Into<String>) -> Self {
        self.up_sql = sql.into();
        self
    }

    pub fn with_down_sql(mut self, sql: impl Into<String>) -> Self {
        self.down_sql = sql.into();
        self
    }
}

#[async_trait::async_trait]
impl Migration for SqlMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn supports_revert(&self) -> bool {
        !self.down_sql.trim().is_empty()
    }

    /// Hash of the forward SQL text, so edits after execution surface as drift.
    fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.up_sql.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn apply(&self, session: &mut dyn MigrationSession) -> StratumResult<()> {
        execute_sql_batch(session, &self.up_sql).await
    }

    async fn revert(&self, session: &mut dyn MigrationSession) -> StratumResult<()> {
        if !self.supports_revert() {
            return Err(MigrationError::RevertUnavailable {
                id: self.id.clone(),
            });
        }
        execute_sql_batch(session, &self.down_sql).await
    }
}

async fn execute_sql_batch(session: &mut dyn MigrationSession, sql: &str) -> StratumResult<()> {
    for statement in split_sql_statements(sql) {
        if !statement.trim().is_empty() {
            session.execute(&statement).await?;
        }
    }
    Ok(())
}

/// Split a SQL payload into individual statements using proper SQL parsing.
///
/// Falls back to naive semicolon splitting when the payload does not parse,
/// since migration bodies are arbitrary and may use dialect features the
/// parser does not know.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    if sql.trim().is_empty() {
        return Vec::new();
    }
    let dialect = sqlparser::dialect::GenericDialect {};
    match sqlparser::parser::Parser::parse_sql(&dialect, sql) {
        Ok(parsed) => parsed.into_iter().map(|stmt| format!("{};", stmt)).collect(),
        Err(e) => {
            tracing::warn!("SQL parsing failed, using naive semicolon splitting: {}", e);
            sql.split(';')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| format!("{};", s))
                .collect()
        }
    }
}

fn slugify(name: &str) -> String {
    name.trim().replace(' ', "_").to_lowercase()
}

/// One row of the execution ledger, persisted in the target database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Matches [`Migration::id`]
    pub id: String,
    pub version: String,
    /// When the migration was applied
    pub executed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
    /// Whether the definition declared a revert at apply time
    pub revert_available: bool,
    /// Fingerprint of the forward logic that actually ran
    pub checksum: String,
}

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where SQL migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for the execution ledger
    pub ledger_table: String,
    /// Token callers must echo exactly to reset the ledger
    pub reset_confirmation: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            ledger_table: "stratum_ledger".to_string(),
            reset_confirmation: "RESET_MIGRATION_LEDGER".to_string(),
        }
    }
}

/// Terminal state of one migration within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MigrationOutcome {
    /// Applied and recorded in the ledger
    Applied,
    /// Skipped: precheck returned false, or a dependency was blocked this run
    Blocked { reason: String },
    /// Apply (or its ledger write) failed; the transaction was rolled back
    Failed { error: String },
}

/// Result of one migration within a [`run_migrations`](crate::MigrationEngine::run_migrations) pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationResult {
    pub id: String,
    pub name: String,
    pub outcome: MigrationOutcome,
    pub execution_time_ms: u64,
    pub revert_available: bool,
}

impl MigrationResult {
    /// True when the migration was applied and recorded.
    pub fn succeeded(&self) -> bool {
        self.outcome == MigrationOutcome::Applied
    }
}

/// Result of rolling back the most recently executed migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub id: String,
    pub name: String,
    pub success: bool,
    pub execution_time_ms: u64,
    /// True when the revert ran and the ledger entry was removed
    pub rollback_performed: bool,
    pub error: Option<String>,
}

/// A registered migration that has not run yet and is ready to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMigration {
    pub id: String,
    pub version: String,
    pub name: String,
}

/// A registered migration whose dependencies cannot currently be satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedMigration {
    pub id: String,
    pub version: String,
    pub name: String,
    pub reason: String,
}

/// Point-in-time view of the whole system. Pure read; advisory during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub total_migrations: usize,
    pub executed_count: usize,
    pub pending_count: usize,
    pub last_executed: Option<LedgerEntry>,
    pub pending: Vec<PendingMigration>,
    pub executed: Vec<LedgerEntry>,
    pub blocked: Vec<BlockedMigration>,
}

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    /// The system cannot make progress until this is fixed
    Error,
    /// Advisory; the engine keeps operating
    Warning,
}

/// Kind of a validation finding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Cycle,
    DanglingDependency,
    /// A definition's checksum no longer matches what the ledger recorded
    ChecksumDrift,
    /// The ledger records an id that no longer exists in the registry
    OrphanedHistory,
    /// A dependency was added to a migration after it had already executed
    LateDependency,
}

/// One finding from [`validate_migrations`](crate::MigrationEngine::validate_migrations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub migration_id: Option<String>,
    pub severity: IssueSeverity,
    pub detail: String,
}

/// Health-check summary. Data-quality problems are findings, never errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// True when no error-severity issue was found
    pub valid: bool,
    pub issues: Vec<ValidationIssue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_migration_checksum_tracks_up_sql() {
        let a = SqlMigration::new("20240101_120000", "create users")
            .with_up_sql("CREATE TABLE users (id SERIAL PRIMARY KEY);");
        let b = a.clone().with_up_sql("CREATE TABLE users (id BIGSERIAL PRIMARY KEY);");

        assert_eq!(a.checksum(), a.clone().checksum());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_sql_migration_id_and_revert_flag() {
        let m = SqlMigration::new("20240101_120000", "Create Users");
        assert_eq!(m.id, "20240101_120000_create_users");
        assert!(!m.supports_revert());

        let m = m.with_down_sql("DROP TABLE users;");
        assert!(m.supports_revert());
    }

    #[test]
    fn test_split_sql_statements() {
        let statements =
            split_sql_statements("CREATE TABLE a (id INT); CREATE TABLE b (id INT);");
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE a"));
        assert!(statements[1].contains("CREATE TABLE b"));

        assert!(split_sql_statements("   ").is_empty());
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let result = MigrationResult {
            id: "20240101_120000_create_users".into(),
            name: "create users".into(),
            outcome: MigrationOutcome::Blocked {
                reason: "precheck returned false".into(),
            },
            execution_time_ms: 3,
            revert_available: false,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["outcome"]["status"], "blocked");
        assert_eq!(json["outcome"]["reason"], "precheck returned false");
    }
}
