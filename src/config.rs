//! Engine configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::sql::{ModifySql, DEFAULT_COMMAND_SEPARATOR};
use crate::store::ConnectionSpec;

/// Configuration consumed by the engine. Mirrors the recognized keys a
/// caller (CLI, build-tool plugin, or config-file loader) would set before
/// handing control to the core.
pub struct MigrationConfig {
    /// How to reach the target database.
    pub db: ConnectionSpec,
    /// Directory name to search for migrations. Default `migrations`.
    pub migration_dir: String,
    /// Filesystem parent directory to try first. Default `resources/`.
    pub parent_migration_dir: PathBuf,
    /// Name of the bookkeeping table. Default `schema_migrations`.
    pub migration_table_name: String,
    /// Filename of the one-off init script. Default `init.sql`.
    pub init_script: String,
    /// Whether the init script runs inside a transaction.
    pub init_in_transaction: bool,
    /// Filenames to skip during discovery (always includes `init_script`).
    pub exclude_scripts: Vec<String>,
    /// Hook applied to every statement before execution.
    pub modify_sql_fn: Option<Arc<dyn ModifySql>>,
    /// Statement separator line. Default `--;;`.
    pub command_separator: String,
}

impl MigrationConfig {
    /// Start building a configuration targeting `db`.
    pub fn new(db: ConnectionSpec) -> Self {
        Self {
            db,
            migration_dir: "migrations".to_string(),
            parent_migration_dir: PathBuf::from("resources/"),
            migration_table_name: "schema_migrations".to_string(),
            init_script: "init.sql".to_string(),
            init_in_transaction: true,
            exclude_scripts: Vec::new(),
            modify_sql_fn: None,
            command_separator: DEFAULT_COMMAND_SEPARATOR.to_string(),
        }
    }

    /// Override the migration directory name.
    pub fn migration_dir(mut self, dir: impl Into<String>) -> Self {
        self.migration_dir = dir.into();
        self
    }

    /// Override the filesystem parent directory.
    pub fn parent_migration_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.parent_migration_dir = dir.into();
        self
    }

    /// Override the bookkeeping table name.
    pub fn migration_table_name(mut self, name: impl Into<String>) -> Self {
        self.migration_table_name = name.into();
        self
    }

    /// Override the init script filename.
    pub fn init_script(mut self, name: impl Into<String>) -> Self {
        self.init_script = name.into();
        self
    }

    /// Set whether the init script runs inside a transaction.
    pub fn init_in_transaction(mut self, in_transaction: bool) -> Self {
        self.init_in_transaction = in_transaction;
        self
    }

    /// Add a filename to skip during discovery.
    pub fn exclude(mut self, filename: impl Into<String>) -> Self {
        self.exclude_scripts.push(filename.into());
        self
    }

    /// Attach a statement-rewriting hook.
    pub fn modify_sql_fn(mut self, hook: Arc<dyn ModifySql>) -> Self {
        self.modify_sql_fn = Some(hook);
        self
    }

    /// Override the statement separator (`--;;` by default).
    pub fn command_separator(mut self, separator: impl Into<String>) -> Self {
        self.command_separator = separator.into();
        self
    }

    /// Filenames discovery should ignore: the configured exclusions plus the
    /// init script itself.
    pub fn all_excluded(&self) -> Vec<String> {
        let mut excluded = self.exclude_scripts.clone();
        excluded.push(self.init_script.clone());
        excluded
    }
}
