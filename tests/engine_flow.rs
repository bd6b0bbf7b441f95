//! End-to-end engine behavior over the in-memory ledger backend.

use std::sync::Arc;

use stratum::{
    Ledger, MemoryLedger, Migration, MigrationEngine, MigrationError, MigrationOutcome,
    MigrationRegistry, MigrationSession, SqlMigration, StratumResult,
};
use tokio::sync::Notify;

/// Scriptable migration for exercising failure and precheck paths.
struct TestMigration {
    id: String,
    version: String,
    name: String,
    dependencies: Vec<String>,
    fail_apply: bool,
    precheck_result: bool,
}

impl TestMigration {
    fn new(version: &str, name: &str) -> Self {
        Self {
            id: format!("{}_{}", version, name),
            version: version.to_string(),
            name: name.to_string(),
            dependencies: Vec::new(),
            fail_apply: false,
            precheck_result: true,
        }
    }

    fn requires(mut self, dependency: &str) -> Self {
        self.dependencies.push(dependency.to_string());
        self
    }

    fn failing(mut self) -> Self {
        self.fail_apply = true;
        self
    }

    fn blocked_by_precheck(mut self) -> Self {
        self.precheck_result = false;
        self
    }
}

#[async_trait::async_trait]
impl Migration for TestMigration {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    fn supports_revert(&self) -> bool {
        true
    }

    async fn precheck(&self, _session: &mut dyn MigrationSession) -> StratumResult<bool> {
        Ok(self.precheck_result)
    }

    async fn apply(&self, session: &mut dyn MigrationSession) -> StratumResult<()> {
        // A failing migration still leaves a statement in the transaction
        // buffer, so atomicity tests can assert nothing of it survives.
        session.execute(&format!("APPLY {}", self.id)).await?;
        if self.fail_apply {
            return Err(MigrationError::Execution {
                id: self.id.clone(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    async fn revert(&self, session: &mut dyn MigrationSession) -> StratumResult<()> {
        session.execute(&format!("REVERT {}", self.id)).await?;
        Ok(())
    }
}

fn sql_pair_registry() -> MigrationRegistry {
    // Two migrations where M2 depends on M1.
    MigrationRegistry::builder()
        .register(
            SqlMigration::new("20240101_000000", "m1")
                .with_up_sql("CREATE TABLE m1 (id INT);")
                .with_down_sql("DROP TABLE m1;"),
        )
        .register(
            SqlMigration::new("20240102_000000", "m2")
                .requires("20240101_000000_m1")
                .with_up_sql("CREATE TABLE m2 (id INT);")
                .with_down_sql("DROP TABLE m2;"),
        )
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_apply_then_rollback_scenario() {
    let ledger = MemoryLedger::new();
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(ledger.clone()));

    let results = engine.run_migrations().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.succeeded()));
    assert_eq!(results[0].id, "20240101_000000_m1");
    assert_eq!(results[1].id, "20240102_000000_m2");

    let executed = engine.executed_migrations().await.unwrap();
    assert_eq!(executed.len(), 2);
    assert!(engine.pending_migrations().await.unwrap().is_empty());

    // LIFO: only M2 comes back off.
    let rollback = engine.rollback_last_migration().await.unwrap();
    assert!(rollback.success && rollback.rollback_performed);
    assert_eq!(rollback.id, "20240102_000000_m2");

    let executed = engine.executed_migrations().await.unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, "20240101_000000_m1");

    let pending = engine.pending_migrations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "20240102_000000_m2");
}

#[tokio::test]
async fn test_no_double_apply_across_registry_reload() {
    let ledger = MemoryLedger::new();
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(ledger.clone()));
    assert_eq!(engine.run_migrations().await.unwrap().len(), 2);

    // A fresh engine over the same ledger simulates a process restart with
    // reloaded definitions.
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(ledger));
    assert!(engine.run_migrations().await.unwrap().is_empty());
    assert_eq!(engine.executed_migrations().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failure_halts_run_and_keeps_prior_migrations() {
    let ledger = MemoryLedger::new();
    let registry = MigrationRegistry::builder()
        .register(TestMigration::new("001", "first"))
        .register(TestMigration::new("002", "second").failing())
        .register(TestMigration::new("003", "third"))
        .build()
        .unwrap();
    let engine = MigrationEngine::new(registry, Arc::new(ledger.clone()));

    let results = engine.run_migrations().await.unwrap();
    assert_eq!(results.len(), 2, "run halts at the failure");
    assert!(results[0].succeeded());
    assert!(matches!(results[1].outcome, MigrationOutcome::Failed { .. }));

    // Exactly k-1 entries persisted, and nothing of the failed transaction
    // survives in the committed statement journal.
    let executed = engine.executed_migrations().await.unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, "001_first");
    let statements = ledger.committed_statements();
    assert_eq!(statements, vec!["APPLY 001_first".to_string()]);
}

#[tokio::test]
async fn test_rollback_is_lifo_twice() {
    let ledger = MemoryLedger::new();
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(ledger));
    engine.run_migrations().await.unwrap();

    let first = engine.rollback_last_migration().await.unwrap();
    assert_eq!(first.id, "20240102_000000_m2");
    let second = engine.rollback_last_migration().await.unwrap();
    assert_eq!(second.id, "20240101_000000_m1");

    assert!(engine.executed_migrations().await.unwrap().is_empty());
    let err = engine.rollback_last_migration().await.unwrap_err();
    assert!(matches!(err, MigrationError::NothingToRevert));
}

#[tokio::test]
async fn test_ledger_bootstrap_is_idempotent() {
    let ledger = MemoryLedger::new();
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(ledger.clone()));

    for _ in 0..3 {
        engine.status_report().await.unwrap();
    }
    engine.run_migrations().await.unwrap();
    engine.validate_migrations().await.unwrap();

    assert_eq!(ledger.creation_count(), 1);
}

#[tokio::test]
async fn test_cycle_is_terminal_for_run_but_reported_by_validate() {
    let registry = MigrationRegistry::builder()
        .register(TestMigration::new("001", "a").requires("002_b"))
        .register(TestMigration::new("002", "b").requires("001_a"))
        .build()
        .unwrap();
    let engine = MigrationEngine::new(registry, Arc::new(MemoryLedger::new()));

    let err = engine.run_migrations().await.unwrap_err();
    let MigrationError::CycleDetected { cycle } = err else {
        panic!("expected cycle error");
    };
    assert!(cycle.contains(&"001_a".to_string()));
    assert!(cycle.contains(&"002_b".to_string()));

    let report = engine.validate_migrations().await.unwrap();
    assert!(!report.valid);

    // Nothing was silently executed in some arbitrary order.
    assert!(engine.executed_migrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_precheck_blocks_without_failing_and_cascades() {
    let ledger = MemoryLedger::new();
    let registry = MigrationRegistry::builder()
        .register(TestMigration::new("001", "gated").blocked_by_precheck())
        .register(TestMigration::new("002", "dependent").requires("001_gated"))
        .register(TestMigration::new("003", "independent"))
        .build()
        .unwrap();
    let engine = MigrationEngine::new(registry, Arc::new(ledger));

    let results = engine.run_migrations().await.unwrap();
    assert_eq!(results.len(), 3, "a blocked migration does not halt the run");
    assert!(matches!(
        results[0].outcome,
        MigrationOutcome::Blocked { .. }
    ));
    assert!(matches!(
        results[1].outcome,
        MigrationOutcome::Blocked { .. }
    ));
    assert!(results[2].succeeded());

    let executed = engine.executed_migrations().await.unwrap();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].id, "003_independent");

    // Blocked is re-attemptable: nothing was recorded for 001/002.
    let pending = engine.pending_migrations().await.unwrap();
    assert_eq!(pending.len(), 2);
}

/// Migration that parks inside `apply` until released, so a run can be
/// observed mid-flight.
struct GatedMigration {
    inner: TestMigration,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait::async_trait]
impl Migration for GatedMigration {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn version(&self) -> &str {
        self.inner.version()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn apply(&self, _session: &mut dyn MigrationSession) -> StratumResult<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_concurrent_run_is_rejected_not_queued() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let registry = MigrationRegistry::builder()
        .register(GatedMigration {
            inner: TestMigration::new("001", "slow"),
            entered: Arc::clone(&entered),
            release: Arc::clone(&release),
        })
        .build()
        .unwrap();
    let engine = Arc::new(MigrationEngine::new(registry, Arc::new(MemoryLedger::new())));

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.run_migrations().await })
    };
    entered.notified().await;

    let err = engine.run_migrations().await.unwrap_err();
    assert!(matches!(err, MigrationError::LockContention));
    let err = engine.rollback_last_migration().await.unwrap_err();
    assert!(matches!(err, MigrationError::LockContention));

    // Reads stay available while the run is in flight.
    engine.status_report().await.unwrap();

    release.notify_one();
    let results = running.await.unwrap().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].succeeded());
}

#[tokio::test]
async fn test_reports_serialize_for_transport() {
    let engine = MigrationEngine::new(sql_pair_registry(), Arc::new(MemoryLedger::new()));
    engine.run_migrations().await.unwrap();

    let report = engine.status_report().await.unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["total_migrations"], 2);
    assert_eq!(json["executed_count"], 2);
    assert_eq!(json["pending_count"], 0);
    assert!(json["last_executed"]["executed_at"].is_string());

    let validation = engine.validate_migrations().await.unwrap();
    let json = serde_json::to_value(&validation).unwrap();
    assert_eq!(json["valid"], true);
}

#[tokio::test]
async fn test_ensure_store_direct_calls_are_no_ops_after_first() {
    let ledger = MemoryLedger::new();
    for _ in 0..4 {
        ledger.ensure_store().await.unwrap();
    }
    assert_eq!(ledger.creation_count(), 1);
    assert!(ledger.list_executed().await.unwrap().is_empty());
}
