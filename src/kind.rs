//! Polymorphic migration kinds.
//!
//! A [`MigrationKind`] knows how to run its own `up` and `down` side effects
//! given a connection. Two kinds ship with this crate: [`SqlMigration`] for
//! plain SQL scripts, and [`CodeMigration`] for migrations whose side effects
//! are arbitrary callbacks. Both obey the same transactional discipline,
//! decided by [`MigrationKind::transactional`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_postgres::{Client, Transaction};

use crate::error::{MigrateResult, MigrationError};
use crate::sql::{split_statements, ModifySql, DEFAULT_COMMAND_SEPARATOR};

/// A connection lent to a migration kind for the duration of one call.
///
/// Wraps either a plain client (non-transactional execution) or a live
/// transaction, exposing the one operation kinds need: running a batch of
/// statements. Ownership never passes to the kind; the handle only borrows.
pub enum Conn<'c> {
    Plain(&'c Client),
    Txn(&'c Transaction<'c>),
}

impl<'c> Conn<'c> {
    /// Execute one statement as a single round trip.
    pub async fn execute_batch(&self, sql: &str) -> Result<(), tokio_postgres::Error> {
        match self {
            Conn::Plain(client) => client.batch_execute(sql).await,
            Conn::Txn(txn) => txn.batch_execute(sql).await,
        }
    }
}

/// A migration's polymorphic behavior: how to identify itself and how to run
/// each direction.
#[async_trait]
pub trait MigrationKind: Send + Sync {
    /// The migration's numeric id.
    fn id(&self) -> i64;

    /// Human-readable name, taken from the filename.
    fn name(&self) -> &str;

    /// Whether this migration's statements run inside a transaction.
    /// Defaults to `true`; SQL migrations flip this off for the `.no-tx.sql`
    /// suffix.
    fn transactional(&self) -> bool {
        true
    }

    /// Run the forward side effect. `cancelled` is polled before each
    /// statement dispatch.
    async fn up(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()>;

    /// Run the reverse side effect, or report that none exists.
    async fn down(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()>;

    /// Whether a `down` side is available at all.
    fn has_down(&self) -> bool;
}

/// A migration whose payload is raw SQL text.
pub struct SqlMigration {
    id: i64,
    name: String,
    up_sql: Option<String>,
    down_sql: Option<String>,
    transactional: bool,
    modify_sql: Option<Arc<dyn ModifySql>>,
    separator: String,
}

impl SqlMigration {
    /// Build a SQL migration from discovered file contents.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        up_sql: Option<String>,
        down_sql: Option<String>,
        transactional: bool,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            up_sql,
            down_sql,
            transactional,
            modify_sql: None,
            separator: DEFAULT_COMMAND_SEPARATOR.to_string(),
        }
    }

    /// Attach a statement-rewriting hook applied before each fragment runs.
    pub fn with_modify_sql(mut self, hook: Arc<dyn ModifySql>) -> Self {
        self.modify_sql = Some(hook);
        self
    }

    /// Override the statement separator (`--;;` by default).
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    async fn run(
        &self,
        sql: Option<&str>,
        conn: &Conn<'_>,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<()> {
        let Some(sql) = sql else {
            return Ok(());
        };
        let statements = split_statements(sql, &self.separator, self.modify_sql.as_deref());
        for statement in statements {
            if cancelled() {
                return Err(MigrationError::Cancelled);
            }
            conn.execute_batch(&statement)
                .await
                .map_err(MigrationError::Database)?;
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationKind for SqlMigration {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn transactional(&self) -> bool {
        self.transactional
    }

    fn has_down(&self) -> bool {
        self.down_sql.is_some()
    }

    async fn up(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()> {
        self.run(self.up_sql.as_deref(), conn, cancelled).await
    }

    async fn down(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()> {
        self.run(self.down_sql.as_deref(), conn, cancelled).await
    }
}

/// Signature of a [`CodeMigration`]'s `up`/`down` callback.
pub type CodeFn = dyn for<'c> Fn(&'c Conn<'c>) -> BoxFuture<'c, MigrateResult<()>> + Send + Sync;

/// A migration whose payload is user-supplied code rather than SQL text.
pub struct CodeMigration {
    id: i64,
    name: String,
    transactional: bool,
    up_fn: Arc<CodeFn>,
    down_fn: Option<Arc<CodeFn>>,
}

impl CodeMigration {
    /// Build a code migration from an `up` callback and an optional `down`.
    pub fn new(
        id: i64,
        name: impl Into<String>,
        transactional: bool,
        up_fn: Arc<CodeFn>,
        down_fn: Option<Arc<CodeFn>>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            transactional,
            up_fn,
            down_fn,
        }
    }
}

#[async_trait]
impl MigrationKind for CodeMigration {
    fn id(&self) -> i64 {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn transactional(&self) -> bool {
        self.transactional
    }

    fn has_down(&self) -> bool {
        self.down_fn.is_some()
    }

    async fn up(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()> {
        if cancelled() {
            return Err(MigrationError::Cancelled);
        }
        (self.up_fn)(conn).await
    }

    async fn down(&self, conn: &Conn<'_>, cancelled: &(dyn Fn() -> bool + Sync)) -> MigrateResult<()> {
        if cancelled() {
            return Err(MigrationError::Cancelled);
        }
        match &self.down_fn {
            Some(f) => f(conn).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_migration_reports_down_availability() {
        let with_down = SqlMigration::new(1, "a", Some("SELECT 1".into()), Some("SELECT 2".into()), true);
        assert!(with_down.has_down());

        let without_down = SqlMigration::new(2, "b", Some("SELECT 1".into()), None, true);
        assert!(!without_down.has_down());
    }

    #[test]
    fn non_transactional_suffix_is_respected() {
        let m = SqlMigration::new(1, "a", Some("SELECT 1".into()), None, false);
        assert!(!m.transactional());
    }
}
