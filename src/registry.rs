//! Migration Registry - validated set of migration definitions
//!
//! Definitions are registered explicitly (or loaded from a directory of SQL
//! files) and validated against the migration contract before any database
//! is touched: duplicate ids, malformed identifiers, and dangling
//! dependencies all fail the build. The registry also owns template
//! scaffolding for authoring new migration files.

use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::definitions::{Migration, MigrationConfig, SqlMigration};
use crate::error::{MigrationError, StratumResult};

/// A deterministic, validated set of migration definitions.
///
/// Migrations are held pre-sorted by `(version, id)`; the resolver applies
/// dependency constraints on top of that order.
pub struct MigrationRegistry {
    migrations: Vec<Arc<dyn Migration>>,
    migrations_dir: PathBuf,
}

impl MigrationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// An empty registry with the default migrations directory.
    pub fn empty() -> Self {
        Self {
            migrations: Vec::new(),
            migrations_dir: MigrationConfig::default().migrations_dir,
        }
    }

    /// Load all `.sql` migration files from a directory.
    ///
    /// Files follow `<version>_<name>.sql` with `-- Up migration` /
    /// `-- Down migration` section markers; `-- description:` and
    /// `-- requires:` header directives carry the optional fields.
    /// A missing directory yields an empty registry so a fresh project can
    /// ask for status before authoring anything.
    pub fn from_sql_dir(dir: impl Into<PathBuf>) -> StratumResult<Self> {
        let dir = dir.into();
        let mut builder = RegistryBuilder::new().migrations_dir(&dir);

        if dir.exists() {
            let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "sql"))
                .collect();
            paths.sort();

            for path in paths {
                builder = builder.register(parse_sql_file(&path)?);
            }
        } else {
            tracing::debug!(dir = %dir.display(), "migrations directory missing, loading nothing");
        }

        builder.build()
    }

    /// All definitions, sorted by `(version, id)`.
    pub fn migrations(&self) -> &[Arc<dyn Migration>] {
        &self.migrations
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Migration>> {
        self.migrations.iter().find(|m| m.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Scaffold a new empty migration file and return where it was written.
    ///
    /// Convenience for authoring tools; never used by the execution path.
    pub fn create_template(&self, name: &str, description: &str) -> StratumResult<PathBuf> {
        fs::create_dir_all(&self.migrations_dir)?;

        let version = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let migration_id = format!("{}_{}", version, name.trim().replace(' ', "_").to_lowercase());
        let filepath = self.migrations_dir.join(format!("{}.sql", migration_id));

        let template = format!(
            "-- Migration: {}\n\
             -- ID: {}\n\
             -- Created: {}\n\
             -- description: {}\n\
             -- requires:\n\n\
             -- Up migration\n\
             -- Add your schema changes here\n\n\n\
             -- Down migration\n\
             -- Add rollback statements here\n",
            name,
            migration_id,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            description,
        );
        fs::write(&filepath, template)?;

        tracing::info!(path = %filepath.display(), "created migration template");
        Ok(filepath)
    }
}

/// Collects definitions and validates the set as a whole on `build`.
#[derive(Default)]
pub struct RegistryBuilder {
    migrations: Vec<Arc<dyn Migration>>,
    migrations_dir: Option<PathBuf>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory used by [`MigrationRegistry::create_template`].
    pub fn migrations_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.migrations_dir = Some(dir.into());
        self
    }

    pub fn register(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Arc::new(migration));
        self
    }

    pub fn register_arc(mut self, migration: Arc<dyn Migration>) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Validate the collected set and produce the registry.
    ///
    /// Fails fast on duplicate ids, malformed identifiers, missing required
    /// fields, and dependencies on ids that are not registered.
    pub fn build(self) -> StratumResult<MigrationRegistry> {
        let mut seen: HashSet<&str> = HashSet::new();
        for m in &self.migrations {
            validate_definition(m.as_ref())?;
            if !seen.insert(m.id()) {
                return Err(MigrationError::DuplicateId {
                    id: m.id().to_string(),
                });
            }
        }
        for m in &self.migrations {
            for dep in m.dependencies() {
                if !seen.contains(dep.as_str()) {
                    return Err(MigrationError::DanglingDependency {
                        id: m.id().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut migrations = self.migrations;
        migrations.sort_by(|a, b| {
            (a.version(), a.id()).cmp(&(b.version(), b.id()))
        });

        Ok(MigrationRegistry {
            migrations,
            migrations_dir: self
                .migrations_dir
                .unwrap_or_else(|| MigrationConfig::default().migrations_dir),
        })
    }
}

fn validate_definition(m: &dyn Migration) -> StratumResult<()> {
    let id = m.id();
    if id.trim().is_empty() {
        return Err(MigrationError::MalformedDefinition {
            id: "<empty>".to_string(),
            reason: "id must not be empty".to_string(),
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MigrationError::MalformedDefinition {
            id: id.to_string(),
            reason: "id may only contain alphanumerics, '_' and '-'".to_string(),
        });
    }
    if m.version().trim().is_empty() {
        return Err(MigrationError::MalformedDefinition {
            id: id.to_string(),
            reason: "version must not be empty".to_string(),
        });
    }
    if m.version().chars().any(char::is_whitespace) {
        return Err(MigrationError::MalformedDefinition {
            id: id.to_string(),
            reason: "version must not contain whitespace".to_string(),
        });
    }
    if m.name().trim().is_empty() {
        return Err(MigrationError::MalformedDefinition {
            id: id.to_string(),
            reason: "name must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Parse one migration file into a [`SqlMigration`].
fn parse_sql_file(path: &Path) -> StratumResult<SqlMigration> {
    let content = fs::read_to_string(path)?;

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| MigrationError::MalformedDefinition {
            id: path.display().to_string(),
            reason: "invalid migration filename".to_string(),
        })?;

    // Filename formats: YYYYMMDD_HHMMSS_name or <version>_name.
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 2 {
        return Err(MigrationError::MalformedDefinition {
            id: stem.to_string(),
            reason: "filename must follow <version>_<name>.sql".to_string(),
        });
    }
    let (version, name) = if parts.len() >= 3 && parts[0].len() == 8 && parts[1].len() == 6 {
        (parts[..2].join("_"), parts[2..].join(" "))
    } else {
        (parts[0].to_string(), parts[1..].join(" "))
    };

    let parsed = parse_migration_content(&content);

    Ok(SqlMigration {
        id: stem.to_string(),
        version,
        name,
        description: parsed.description,
        dependencies: parsed.dependencies,
        up_sql: parsed.up_sql,
        down_sql: parsed.down_sql,
    })
}

struct ParsedContent {
    description: String,
    dependencies: Vec<String>,
    up_sql: String,
    down_sql: String,
}

/// Extract header directives and the Up/Down SQL sections.
fn parse_migration_content(content: &str) -> ParsedContent {
    let mut description = String::new();
    let mut dependencies = Vec::new();
    let mut up_sql: Vec<&str> = Vec::new();
    let mut down_sql: Vec<&str> = Vec::new();
    let mut current_section = "";

    for line in content.lines() {
        let trimmed = line.trim().to_lowercase();

        if trimmed.starts_with("-- up") || trimmed.contains("up migration") {
            current_section = "up";
            continue;
        } else if trimmed.starts_with("-- down") || trimmed.contains("down migration") {
            current_section = "down";
            continue;
        }

        if let Some(rest) = strip_directive(line, "description") {
            description = rest.to_string();
            continue;
        }
        if let Some(rest) = strip_directive(line, "requires") {
            dependencies.extend(
                rest.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            );
            continue;
        }

        // Skip remaining comment lines and blanks.
        if line.trim().is_empty() || line.trim().starts_with("--") {
            continue;
        }

        match current_section {
            "up" => up_sql.push(line),
            "down" => down_sql.push(line),
            _ => {}
        }
    }

    ParsedContent {
        description,
        dependencies,
        up_sql: up_sql.join("\n").trim().to_string(),
        down_sql: down_sql.join("\n").trim().to_string(),
    }
}

fn strip_directive<'a>(line: &'a str, directive: &str) -> Option<&'a str> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix("--")?.trim_start();
    let rest = rest
        .strip_prefix(directive)
        .or_else(|| rest.strip_prefix(&capitalize(directive)))?;
    rest.strip_prefix(':').map(str::trim)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_build_rejects_duplicate_ids() {
        let result = MigrationRegistry::builder()
            .register(SqlMigration::new("20240101_000000", "a"))
            .register(SqlMigration::new("20240101_000000", "a"))
            .build();
        assert!(matches!(result, Err(MigrationError::DuplicateId { .. })));
    }

    #[test]
    fn test_build_rejects_dangling_dependency() {
        let result = MigrationRegistry::builder()
            .register(SqlMigration::new("20240101_000000", "a").requires("nowhere_to_be_found"))
            .build();
        assert!(matches!(
            result,
            Err(MigrationError::DanglingDependency { .. })
        ));
    }

    #[test]
    fn test_build_rejects_malformed_identifiers() {
        let mut bad_id = SqlMigration::new("20240101_000000", "a");
        bad_id.id = "has spaces".to_string();
        let result = MigrationRegistry::builder().register(bad_id).build();
        assert!(matches!(
            result,
            Err(MigrationError::MalformedDefinition { .. })
        ));

        let mut bad_version = SqlMigration::new("20240101_000000", "a");
        bad_version.version = " ".to_string();
        let result = MigrationRegistry::builder().register(bad_version).build();
        assert!(matches!(
            result,
            Err(MigrationError::MalformedDefinition { .. })
        ));
    }

    #[test]
    fn test_registry_is_version_sorted() {
        let registry = MigrationRegistry::builder()
            .register(SqlMigration::new("20240102_000000", "b"))
            .register(SqlMigration::new("20240101_000000", "a"))
            .build()
            .unwrap();
        let ids: Vec<&str> = registry.migrations().iter().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["20240101_000000_a", "20240102_000000_b"]);
    }

    #[test]
    fn test_create_template_then_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let registry = MigrationRegistry::builder()
            .migrations_dir(temp_dir.path())
            .build()
            .unwrap();

        let path = registry
            .create_template("create users table", "Adds the users table")
            .unwrap();
        assert!(path.exists());
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("-- Up migration"));
        assert!(content.contains("-- Down migration"));
        assert!(content.contains("create users table"));

        let loaded = MigrationRegistry::from_sql_dir(temp_dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        let m = &loaded.migrations()[0];
        assert_eq!(m.name(), "create users table");
        assert_eq!(m.description(), "Adds the users table");
        assert!(m.dependencies().is_empty());
    }

    #[test]
    fn test_load_migrations_from_dir() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("20240101_120000_create_users.sql"),
            "-- Migration: create users\n\
             -- requires: 20240101_110000_create_schema\n\
             -- Up migration\n\
             CREATE TABLE users (id SERIAL PRIMARY KEY);\n\
             -- Down migration\n\
             DROP TABLE users;\n",
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("20240101_110000_create_schema.sql"),
            "-- Up migration\nCREATE SCHEMA app;\n-- Down migration\nDROP SCHEMA app;\n",
        )
        .unwrap();

        let registry = MigrationRegistry::from_sql_dir(temp_dir.path()).unwrap();
        assert_eq!(registry.len(), 2);

        let users = registry.get("20240101_120000_create_users").unwrap();
        assert_eq!(users.name(), "create users");
        assert_eq!(users.dependencies(), ["20240101_110000_create_schema"]);
        assert!(users.supports_revert());

        let schema = registry.get("20240101_110000_create_schema").unwrap();
        assert_eq!(schema.version(), "20240101_110000");
    }

    #[test]
    fn test_missing_dir_loads_empty_registry() {
        let temp_dir = TempDir::new().unwrap();
        let registry =
            MigrationRegistry::from_sql_dir(temp_dir.path().join("does_not_exist")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_parse_content_sections() {
        let parsed = parse_migration_content(
            "-- Migration: t\n\
             -- description: does things\n\
             -- Up migration\n\
             CREATE TABLE t (id INT);\n\
             -- a stray comment\n\
             -- Down migration\n\
             DROP TABLE t;\n",
        );
        assert_eq!(parsed.description, "does things");
        assert_eq!(parsed.up_sql, "CREATE TABLE t (id INT);");
        assert_eq!(parsed.down_sql, "DROP TABLE t;");
    }
}
