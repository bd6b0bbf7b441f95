//! Migration Engine - the public-facing orchestrator
//!
//! Composes the registry, ledger, and resolver to answer status queries and
//! to perform apply/revert/validate/reset operations with transactional
//! safety. Constructed explicitly and passed to callers; there is no global
//! instance.
//!
//! Mutating operations (`run_migrations`, `rollback_last_migration`,
//! `reset_migrations`) share one process-local lock for their whole
//! duration and reject concurrent entry immediately. Read operations take
//! no lock; a status report taken during an in-flight run is advisory.

use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::definitions::{
    IssueKind, IssueSeverity, LedgerEntry, Migration, MigrationConfig, MigrationOutcome,
    MigrationResult, PendingMigration, RollbackResult, StatusReport, ValidationIssue,
    ValidationReport,
};
use crate::error::{MigrationError, StratumResult};
use crate::ledger::Ledger;
use crate::registry::MigrationRegistry;
use crate::resolver::DependencyResolver;

pub struct MigrationEngine {
    registry: MigrationRegistry,
    ledger: Arc<dyn Ledger>,
    resolver: DependencyResolver,
    config: MigrationConfig,
    run_lock: tokio::sync::Mutex<()>,
}

impl MigrationEngine {
    pub fn new(registry: MigrationRegistry, ledger: Arc<dyn Ledger>) -> Self {
        Self::with_config(registry, ledger, MigrationConfig::default())
    }

    pub fn with_config(
        registry: MigrationRegistry,
        ledger: Arc<dyn Ledger>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            registry,
            ledger,
            resolver: DependencyResolver::new(),
            config,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Point-in-time view of executed, pending, and blocked migrations.
    ///
    /// Pure read; safe to call concurrently and often.
    pub async fn status_report(&self) -> StratumResult<StatusReport> {
        let executed = self.ledger.list_executed().await?;
        let executed_ids: HashSet<String> = executed.iter().map(|e| e.id.clone()).collect();
        let plan = self.resolver.plan(self.registry.migrations(), &executed_ids);

        let pending: Vec<PendingMigration> = plan
            .pending
            .iter()
            .map(|m| PendingMigration {
                id: m.id().to_string(),
                version: m.version().to_string(),
                name: m.name().to_string(),
            })
            .collect();

        Ok(StatusReport {
            total_migrations: self.registry.len(),
            executed_count: executed.len(),
            pending_count: pending.len(),
            last_executed: executed.last().cloned(),
            pending,
            executed,
            blocked: plan.blocked,
        })
    }

    /// Migrations that would run right now, in execution order.
    pub async fn pending_migrations(&self) -> StratumResult<Vec<PendingMigration>> {
        Ok(self.status_report().await?.pending)
    }

    /// Ledger entries ordered by execution time.
    pub async fn executed_migrations(&self) -> StratumResult<Vec<LedgerEntry>> {
        self.ledger.list_executed().await
    }

    /// Apply every pending migration in resolved order.
    ///
    /// Each migration runs in its own transaction together with its ledger
    /// entry. A precheck returning false records a blocked outcome and the
    /// run continues past it (dependents of the blocked migration block
    /// too); any failure rolls the current transaction back and halts the
    /// run, leaving earlier migrations durably applied. The returned list
    /// covers everything attempted, the failed migration last.
    pub async fn run_migrations(&self) -> StratumResult<Vec<MigrationResult>> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| MigrationError::LockContention)?;

        self.ledger.ensure_store().await?;
        let executed = self.ledger.list_executed().await?;
        let executed_ids: HashSet<String> = executed.iter().map(|e| e.id.clone()).collect();

        let plan = self.resolver.plan(self.registry.migrations(), &executed_ids);
        if let Some(cycle) = plan.cycle {
            return Err(MigrationError::CycleDetected { cycle });
        }

        let mut blocked_ids: HashSet<String> =
            plan.blocked.iter().map(|b| b.id.clone()).collect();
        let mut results = Vec::new();

        for migration in &plan.pending {
            // A migration blocked earlier in this run blocks its dependents;
            // the pending list is topologically ordered, so a direct check
            // is enough for the whole cascade.
            if let Some(dep) = migration
                .dependencies()
                .iter()
                .find(|d| blocked_ids.contains(d.as_str()))
            {
                debug!(
                    "Skipping migration {}: dependency {} was blocked",
                    migration.id(),
                    dep
                );
                blocked_ids.insert(migration.id().to_string());
                results.push(MigrationResult {
                    id: migration.id().to_string(),
                    name: migration.name().to_string(),
                    outcome: MigrationOutcome::Blocked {
                        reason: format!("dependency '{}' was blocked in this run", dep),
                    },
                    execution_time_ms: 0,
                    revert_available: migration.supports_revert(),
                });
                continue;
            }

            info!("Applying migration: {} - {}", migration.id(), migration.name());
            let started = Instant::now();

            let mut session = match self.ledger.begin().await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Migration {} failed to open a transaction: {}", migration.id(), e);
                    results.push(failed_result(migration.as_ref(), &started, &e));
                    break;
                }
            };

            match migration.precheck(session.as_mut()).await {
                Ok(true) => {}
                Ok(false) => {
                    let _ = session.rollback().await;
                    info!("Migration {} blocked by precheck", migration.id());
                    blocked_ids.insert(migration.id().to_string());
                    results.push(MigrationResult {
                        id: migration.id().to_string(),
                        name: migration.name().to_string(),
                        outcome: MigrationOutcome::Blocked {
                            reason: "precheck returned false".to_string(),
                        },
                        execution_time_ms: started.elapsed().as_millis() as u64,
                        revert_available: migration.supports_revert(),
                    });
                    continue;
                }
                Err(e) => {
                    let _ = session.rollback().await;
                    warn!("Migration {} precheck failed: {}", migration.id(), e);
                    results.push(failed_result(migration.as_ref(), &started, &e));
                    break;
                }
            }

            if let Err(e) = migration.apply(session.as_mut()).await {
                let _ = session.rollback().await;
                warn!("Migration {} failed, halting run: {}", migration.id(), e);
                results.push(failed_result(migration.as_ref(), &started, &e));
                break;
            }

            let entry = LedgerEntry {
                id: migration.id().to_string(),
                version: migration.version().to_string(),
                executed_at: Utc::now(),
                execution_time_ms: started.elapsed().as_millis() as u64,
                revert_available: migration.supports_revert(),
                checksum: migration.checksum(),
            };
            if let Err(e) = session.record(&entry).await {
                let _ = session.rollback().await;
                warn!("Migration {} could not be recorded, halting run: {}", migration.id(), e);
                results.push(failed_result(migration.as_ref(), &started, &e));
                break;
            }
            if let Err(e) = session.commit().await {
                warn!("Migration {} failed to commit, halting run: {}", migration.id(), e);
                results.push(failed_result(migration.as_ref(), &started, &e));
                break;
            }

            info!(
                "Migration {} applied in {}ms",
                migration.id(),
                entry.execution_time_ms
            );
            results.push(MigrationResult {
                id: entry.id.clone(),
                name: migration.name().to_string(),
                outcome: MigrationOutcome::Applied,
                execution_time_ms: entry.execution_time_ms,
                revert_available: entry.revert_available,
            });
        }

        Ok(results)
    }

    /// Undo the single most recently executed migration.
    ///
    /// Rollback is strictly last-in-first-out: the target is chosen by
    /// `executed_at`, never by registry order. Refuses when the ledger is
    /// empty, when the entry's definition is gone from the registry, or
    /// when no revert was declared. The revert and the ledger removal share
    /// one transaction; a failed revert leaves both untouched.
    pub async fn rollback_last_migration(&self) -> StratumResult<RollbackResult> {
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| MigrationError::LockContention)?;

        let executed = self.ledger.list_executed().await?;
        let last = executed
            .last()
            .cloned()
            .ok_or(MigrationError::NothingToRevert)?;
        let migration = self
            .registry
            .get(&last.id)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownMigration {
                id: last.id.clone(),
            })?;
        if !last.revert_available || !migration.supports_revert() {
            return Err(MigrationError::RevertUnavailable { id: last.id });
        }

        info!("Rolling back migration: {} - {}", last.id, migration.name());
        let started = Instant::now();
        let mut session = self.ledger.begin().await?;

        if let Err(e) = migration.revert(session.as_mut()).await {
            let _ = session.rollback().await;
            warn!("Rollback of {} failed: {}", last.id, e);
            return Ok(RollbackResult {
                id: last.id,
                name: migration.name().to_string(),
                success: false,
                execution_time_ms: started.elapsed().as_millis() as u64,
                rollback_performed: false,
                error: Some(e.to_string()),
            });
        }
        if let Err(e) = session.remove(&last.id).await {
            let _ = session.rollback().await;
            return Ok(RollbackResult {
                id: last.id,
                name: migration.name().to_string(),
                success: false,
                execution_time_ms: started.elapsed().as_millis() as u64,
                rollback_performed: false,
                error: Some(e.to_string()),
            });
        }
        if let Err(e) = session.commit().await {
            return Ok(RollbackResult {
                id: last.id,
                name: migration.name().to_string(),
                success: false,
                execution_time_ms: started.elapsed().as_millis() as u64,
                rollback_performed: false,
                error: Some(e.to_string()),
            });
        }

        info!("Rolled back migration: {}", last.id);
        Ok(RollbackResult {
            id: last.id,
            name: migration.name().to_string(),
            success: true,
            execution_time_ms: started.elapsed().as_millis() as u64,
            rollback_performed: true,
            error: None,
        })
    }

    /// Non-mutating health check.
    ///
    /// Data-quality problems are returned as findings instead of errors so
    /// dashboards stay usable in degraded states: a cycle or dangling
    /// dependency is error-severity, while checksum drift, orphaned
    /// history, and late dependency edges are advisory warnings.
    pub async fn validate_migrations(&self) -> StratumResult<ValidationReport> {
        let executed = self.ledger.list_executed().await?;
        let executed_ids: HashSet<String> = executed.iter().map(|e| e.id.clone()).collect();
        let mut issues = Vec::new();

        let plan = self.resolver.plan(self.registry.migrations(), &executed_ids);
        if let Some(cycle) = &plan.cycle {
            issues.push(ValidationIssue {
                kind: IssueKind::Cycle,
                migration_id: None,
                severity: IssueSeverity::Error,
                detail: format!("dependency cycle: {}", cycle.join(" -> ")),
            });
        }

        for m in self.registry.migrations() {
            for dep in m.dependencies() {
                if !self.registry.contains(dep) && !executed_ids.contains(dep) {
                    issues.push(ValidationIssue {
                        kind: IssueKind::DanglingDependency,
                        migration_id: Some(m.id().to_string()),
                        severity: IssueSeverity::Error,
                        detail: format!("depends on unknown migration '{}'", dep),
                    });
                }
            }
        }

        for entry in &executed {
            let Some(definition) = self.registry.get(&entry.id) else {
                issues.push(ValidationIssue {
                    kind: IssueKind::OrphanedHistory,
                    migration_id: Some(entry.id.clone()),
                    severity: IssueSeverity::Warning,
                    detail: "recorded as executed but no longer registered".to_string(),
                });
                continue;
            };

            let current = definition.checksum();
            if current != entry.checksum {
                issues.push(ValidationIssue {
                    kind: IssueKind::ChecksumDrift,
                    migration_id: Some(entry.id.clone()),
                    severity: IssueSeverity::Warning,
                    detail: format!(
                        "migration modified after execution: ledger recorded {}, definition now hashes to {}",
                        entry.checksum, current
                    ),
                });
            }
            for dep in definition.dependencies() {
                if !executed_ids.contains(dep) {
                    issues.push(ValidationIssue {
                        kind: IssueKind::LateDependency,
                        migration_id: Some(entry.id.clone()),
                        severity: IssueSeverity::Warning,
                        detail: format!(
                            "dependency '{}' was added after execution and cannot be retroactively enforced",
                            dep
                        ),
                    });
                }
            }
        }

        let valid = issues.iter().all(|i| i.severity != IssueSeverity::Error);
        Ok(ValidationReport { valid, issues })
    }

    /// Scaffold a new migration file. Never touches the ledger.
    pub fn create_migration(&self, name: &str, description: &str) -> StratumResult<PathBuf> {
        self.registry.create_template(name, description)
    }

    /// Drop every ledger entry without touching the user schema.
    ///
    /// Destructive escape hatch for development databases: afterwards the
    /// ledger no longer describes the physical schema. The caller must echo
    /// the configured confirmation token exactly.
    pub async fn reset_migrations(&self, confirmation: &str) -> StratumResult<u64> {
        if confirmation != self.config.reset_confirmation {
            return Err(MigrationError::ConfirmationRejected);
        }
        let _guard = self
            .run_lock
            .try_lock()
            .map_err(|_| MigrationError::LockContention)?;

        let removed = self.ledger.reset().await?;
        warn!(
            "Migration ledger reset: {} entries dropped; ledger is now desynchronized from schema state",
            removed
        );
        Ok(removed)
    }
}

fn failed_result(
    migration: &dyn Migration,
    started: &Instant,
    error: &MigrationError,
) -> MigrationResult {
    MigrationResult {
        id: migration.id().to_string(),
        name: migration.name().to_string(),
        outcome: MigrationOutcome::Failed {
            error: error.to_string(),
        },
        execution_time_ms: started.elapsed().as_millis() as u64,
        revert_available: migration.supports_revert(),
    }
}
