//! Database-backed bookkeeping: connections, the migration table, the
//! reservation row, and the per-migration execution state machine.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::Pool;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{debug, info, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::kind::{Conn, MigrationKind};

/// The id reserved for the cross-process mutual-exclusion row. Never a valid
/// migration id.
pub const RESERVATION_ID: i64 = -1;

/// What happened when a migration was asked to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    /// The migration ran (or had already run and nothing further was needed)
    /// and the bookkeeping row reflects that.
    Success,
    /// Another actor holds the reservation; nothing was done.
    Ignored,
}

/// Storage and execution backend for the migration engine.
///
/// One built-in implementation, [`PostgresStore`], is provided. Tests supply
/// a fake implementation to exercise the planner and engine without a live
/// database.
#[async_trait]
pub trait Store: Send + Sync {
    /// Obtain a connection and ensure the bookkeeping table exists.
    async fn connect(&mut self) -> MigrateResult<()>;

    /// Release any connection owned by this store. Connections supplied by
    /// the caller are never closed here.
    async fn disconnect(&mut self) -> MigrateResult<()>;

    /// All migration ids currently recorded as applied.
    async fn completed_ids(&self) -> MigrateResult<BTreeSet<i64>>;

    /// Attempt to acquire the reservation row. `true` means acquired.
    async fn mark_reserved(&self) -> MigrateResult<bool>;

    /// Release the reservation row, if held.
    async fn mark_unreserved(&self) -> MigrateResult<()>;

    /// Run a migration's `up` side and record it, following the state
    /// machine in the module documentation.
    async fn migrate_up(
        &mut self,
        kind: &dyn MigrationKind,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<MigrateOutcome>;

    /// Run a migration's `down` side and remove its bookkeeping row.
    async fn migrate_down(
        &mut self,
        kind: &dyn MigrationKind,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<MigrateOutcome>;

    /// Run a one-off init script. Not a migration: never recorded.
    async fn init_script(&mut self, sql: &str, in_transaction: bool) -> MigrateResult<()>;
}

/// How a [`PostgresStore`] obtains its connection.
pub enum ConnectionSpec {
    /// Check out (and later return) a connection from a pool.
    Pool(Pool),
    /// Connect fresh using the given parameters.
    Params(PgConfig),
}

enum ConnHandle {
    Owned(Client),
    Pooled(deadpool_postgres::Object),
}

impl ConnHandle {
    fn client(&self) -> &Client {
        match self {
            ConnHandle::Owned(c) => c,
            ConnHandle::Pooled(o) => o,
        }
    }

    fn client_mut(&mut self) -> &mut Client {
        match self {
            ConnHandle::Owned(c) => c,
            ConnHandle::Pooled(o) => &mut **o,
        }
    }
}

/// PostgreSQL-backed [`Store`].
///
/// Accepts either a connection pool or direct connect parameters; an
/// already-open connection borrowed from the caller can be wrapped with
/// [`PostgresStore::from_borrowed`], in which case `disconnect` is a no-op —
/// the borrow checker enforces that this store can never close it.
pub struct PostgresStore<'a> {
    spec: Option<ConnectionSpec>,
    conn: Option<ConnHandle>,
    borrowed: Option<&'a Client>,
    table_name: String,
}

impl<'a> PostgresStore<'a> {
    /// Create a store that will check out a pooled (or freshly opened)
    /// connection on `connect`.
    pub fn new(spec: ConnectionSpec, table_name: impl Into<String>) -> Self {
        Self {
            spec: Some(spec),
            conn: None,
            borrowed: None,
            table_name: table_name.into(),
        }
    }

    /// Create a store that executes against a connection the caller already
    /// owns. The store never closes it.
    pub fn from_borrowed(client: &'a Client, table_name: impl Into<String>) -> Self {
        Self {
            spec: None,
            conn: None,
            borrowed: Some(client),
            table_name: table_name.into(),
        }
    }

    fn client(&self) -> MigrateResult<&Client> {
        if let Some(c) = self.borrowed {
            return Ok(c);
        }
        self.conn
            .as_ref()
            .map(ConnHandle::client)
            .ok_or_else(|| MigrationError::Other("store is not connected".into()))
    }

    fn create_table_sql(&self) -> String {
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                id BIGINT PRIMARY KEY,
                applied TIMESTAMP WITH TIME ZONE NOT NULL,
                description VARCHAR(1024) NOT NULL
            )"#,
            table = self.table_name
        )
    }

    async fn table_exists(&self) -> MigrateResult<bool> {
        let row = self
            .client()?
            .query_opt("SELECT to_regclass($1) IS NOT NULL AS present", &[&self.table_name])
            .await
            .map_err(MigrationError::Database)?;
        Ok(row.map(|r| r.get::<_, bool>("present")).unwrap_or(false))
    }

    async fn ensure_table(&self) -> MigrateResult<()> {
        // The existence probe and the creation run as separate statements:
        // some backends poison the surrounding transaction once a query
        // against a not-yet-existing table fails within it.
        if self.table_exists().await? {
            return Ok(());
        }
        self.client()?
            .batch_execute(&self.create_table_sql())
            .await
            .map_err(MigrationError::Database)?;
        Ok(())
    }

    fn is_unique_violation(err: &tokio_postgres::Error) -> bool {
        err.code().map(|c| c.code() == "23505").unwrap_or(false)
    }

    /// Whether a failed `up` should trigger best-effort `down` back-out.
    /// Cancellation unwinds with rollback only; it is never a back-out trigger.
    fn should_back_out(err: &MigrationError, transactional: bool) -> bool {
        transactional && !matches!(err, MigrationError::Cancelled)
    }

    async fn run_side(
        &mut self,
        kind: &dyn MigrationKind,
        direction_up: bool,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<()> {
        if kind.transactional() {
            if let Some(handle) = self.conn.as_mut() {
                let client = handle.client_mut();
                let txn = client.transaction().await.map_err(MigrationError::Database)?;
                let conn = Conn::Txn(&txn);
                let result = if direction_up {
                    kind.up(&conn, cancelled).await
                } else {
                    kind.down(&conn, cancelled).await
                };
                return match result {
                    Ok(()) => {
                        txn.commit().await.map_err(MigrationError::Database)?;
                        Ok(())
                    }
                    Err(e) => {
                        let _ = txn.rollback().await;
                        Err(e)
                    }
                };
            }
            // A caller-borrowed connection cannot be lent out mutably, so a
            // transactional kind running against one degrades to plain
            // execution. Callers that need transactional semantics should
            // pass a pool or connect params instead of a borrowed client.
            warn!(id = kind.id(), "borrowed connection: running transactional migration without a transaction");
        }

        let conn = Conn::Plain(self.client()?);
        if direction_up {
            kind.up(&conn, cancelled).await
        } else {
            kind.down(&conn, cancelled).await
        }
    }

    async fn record_applied(&self, id: i64, description: &str) -> MigrateResult<()> {
        self.client()?
            .execute(
                &format!(
                    r#"INSERT INTO "{}" (id, applied, description) VALUES ($1, $2, $3)"#,
                    self.table_name
                ),
                &[&id, &Utc::now(), &description],
            )
            .await
            .map_err(|e| MigrationError::Bookkeeping(e.to_string()))?;
        Ok(())
    }

    async fn remove_applied(&self, id: i64) -> MigrateResult<()> {
        self.client()?
            .execute(
                &format!(r#"DELETE FROM "{}" WHERE id = $1"#, self.table_name),
                &[&id],
            )
            .await
            .map_err(|e| MigrationError::Bookkeeping(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl<'a> Store for PostgresStore<'a> {
    async fn connect(&mut self) -> MigrateResult<()> {
        if self.borrowed.is_some() {
            self.ensure_table().await?;
            return Ok(());
        }

        let handle = match self.spec.as_ref().expect("connection spec or borrow required") {
            ConnectionSpec::Pool(pool) => {
                let obj = pool.get().await.map_err(MigrationError::Pool)?;
                ConnHandle::Pooled(obj)
            }
            ConnectionSpec::Params(config) => {
                let (client, connection) = config
                    .connect(NoTls)
                    .await
                    .map_err(MigrationError::Database)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        warn!(error = %e, "migration connection terminated unexpectedly");
                    }
                });
                ConnHandle::Owned(client)
            }
        };
        self.conn = Some(handle);
        info!(table = %self.table_name, "connected to migration target");
        self.ensure_table().await
    }

    async fn disconnect(&mut self) -> MigrateResult<()> {
        if self.borrowed.is_some() {
            // Never close a connection the caller owns.
            return Ok(());
        }
        self.conn = None;
        Ok(())
    }

    async fn completed_ids(&self) -> MigrateResult<BTreeSet<i64>> {
        let rows = self
            .client()?
            .query(
                &format!(r#"SELECT id FROM "{}" WHERE id != $1"#, self.table_name),
                &[&RESERVATION_ID],
            )
            .await
            .map_err(MigrationError::Database)?;
        Ok(rows.into_iter().map(|r| r.get::<_, i64>("id")).collect())
    }

    async fn mark_reserved(&self) -> MigrateResult<bool> {
        let result = self
            .client()?
            .execute(
                &format!(
                    r#"INSERT INTO "{}" (id, applied, description) VALUES ($1, $2, 'reservation')"#,
                    self.table_name
                ),
                &[&RESERVATION_ID, &Utc::now()],
            )
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if Self::is_unique_violation(&e) => Ok(false),
            Err(e) => Err(MigrationError::Database(e)),
        }
    }

    async fn mark_unreserved(&self) -> MigrateResult<()> {
        if let Err(e) = self.remove_applied(RESERVATION_ID).await {
            warn!(error = %e, "failed to release migration reservation");
        }
        Ok(())
    }

    async fn migrate_up(
        &mut self,
        kind: &dyn MigrationKind,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<MigrateOutcome> {
        if !self.mark_reserved().await? {
            debug!(id = kind.id(), "reservation held by another actor");
            return Ok(MigrateOutcome::Ignored);
        }

        let outcome = async {
            if self.completed_ids().await?.contains(&kind.id()) {
                return Ok(MigrateOutcome::Success);
            }

            if cancelled() {
                return Err(MigrationError::Cancelled);
            }

            match self.run_side(kind, true, cancelled).await {
                Ok(()) => {
                    self.record_applied(kind.id(), kind.name()).await?;
                    Ok(MigrateOutcome::Success)
                }
                Err(e) => {
                    if matches!(e, MigrationError::Cancelled) {
                        return Err(e);
                    }
                    let mut backed_out = false;
                    if Self::should_back_out(&e, kind.transactional()) {
                        backed_out = true;
                        if let Err(back_out_err) = self.run_side(kind, false, &|| false).await {
                            warn!(id = kind.id(), error = %back_out_err, "best-effort back-out failed");
                        }
                    }
                    Err(MigrationError::migration_failed(kind.id(), backed_out, e))
                }
            }
        }
        .await;

        self.mark_unreserved().await?;
        outcome
    }

    async fn migrate_down(
        &mut self,
        kind: &dyn MigrationKind,
        cancelled: &(dyn Fn() -> bool + Sync),
    ) -> MigrateResult<MigrateOutcome> {
        if !self.mark_reserved().await? {
            return Ok(MigrateOutcome::Ignored);
        }

        let outcome = async {
            if !self.completed_ids().await?.contains(&kind.id()) {
                return Ok(MigrateOutcome::Success);
            }
            if !kind.has_down() {
                return Err(MigrationError::NoDownScript(kind.id()));
            }
            if cancelled() {
                return Err(MigrationError::Cancelled);
            }

            self.run_side(kind, false, cancelled).await.map_err(|e| {
                if matches!(e, MigrationError::Cancelled) {
                    e
                } else {
                    MigrationError::migration_failed(kind.id(), false, e)
                }
            })?;
            self.remove_applied(kind.id()).await?;
            Ok(MigrateOutcome::Success)
        }
        .await;

        self.mark_unreserved().await?;
        outcome
    }

    async fn init_script(&mut self, sql: &str, in_transaction: bool) -> MigrateResult<()> {
        if in_transaction {
            if let Some(handle) = self.conn.as_mut() {
                let client = handle.client_mut();
                let txn = client.transaction().await.map_err(MigrationError::Database)?;
                return match txn.batch_execute(sql).await {
                    Ok(()) => txn.commit().await.map_err(MigrationError::Database),
                    Err(e) => {
                        let _ = txn.rollback().await;
                        Err(MigrationError::Database(e))
                    }
                };
            }
            warn!("borrowed connection: running init script without a transaction");
        }

        self.client()?
            .batch_execute(sql)
            .await
            .map_err(MigrationError::Database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_id_is_never_a_valid_migration_id() {
        assert!(RESERVATION_ID < 0);
    }

    #[test]
    fn should_back_out_skips_cancellation() {
        assert!(!PostgresStore::should_back_out(&MigrationError::Cancelled, true));
        assert!(PostgresStore::should_back_out(
            &MigrationError::Other("boom".into()),
            true
        ));
        assert!(!PostgresStore::should_back_out(
            &MigrationError::Other("boom".into()),
            false
        ));
    }

    #[test]
    fn create_table_sql_uses_spec_columns() {
        let store = PostgresStore::new(
            ConnectionSpec::Params(PgConfig::new()),
            "schema_migrations",
        );
        let sql = store.create_table_sql();
        assert!(sql.contains("id BIGINT PRIMARY KEY"));
        assert!(sql.contains("applied TIMESTAMP"));
        assert!(sql.contains("description VARCHAR(1024)"));
    }
}
