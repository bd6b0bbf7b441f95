//! # stratum: Schema Migration Engine
//!
//! Tracks, orders, applies, validates, and reverses incremental changes to
//! a relational database's schema. Migrations apply in an order consistent
//! with their declared dependencies, never re-apply, revert strictly
//! last-in-first-out, and each one commits atomically with its entry in an
//! execution ledger stored in the target database itself.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use stratum::{MigrationEngine, MigrationRegistry, PostgresLedger};
//!
//! let registry = MigrationRegistry::from_sql_dir("migrations")?;
//! let ledger = Arc::new(PostgresLedger::connect("postgres://...").await?);
//! let engine = MigrationEngine::new(registry, ledger);
//!
//! for result in engine.run_migrations().await? {
//!     println!("{} -> {:?}", result.id, result.outcome);
//! }
//! ```

pub mod definitions;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod resolver;

// Re-export core traits and types
pub use definitions::*;
pub use engine::MigrationEngine;
pub use error::{MigrationError, StratumResult};
pub use ledger::{Ledger, MigrationSession};
pub use memory::MemoryLedger;
pub use postgres::PostgresLedger;
pub use registry::{MigrationRegistry, RegistryBuilder};
pub use resolver::{DependencyResolver, MigrationPlan};
