//! Orchestration: discover migrations, plan a command, and drive the store
//! through them one at a time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::MigrationConfig;
use crate::discovery::{
    self, resolve_migration_dir, resolve_migration_source, DescriptorKind, MigrationDescriptor,
};
use crate::error::{MigrateResult, MigrationError};
use crate::kind::{CodeMigration, MigrationKind, SqlMigration};
use crate::planner::{self, Command, Direction};
use crate::store::{MigrateOutcome, Store};

/// A cooperative cancellation signal checked between migrations and before
/// each statement. Cheap to clone; all clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create a token that starts un-cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The unified result of driving a batch of migrations, collapsing the
/// historical success/ignore/failure sentinels into one type.
#[derive(Debug)]
pub enum EngineOutcome {
    /// The batch ran to completion (it may have applied zero migrations).
    Applied(Vec<i64>),
    /// Another actor held the reservation; no migrations ran.
    Ignored,
    /// A migration failed; the batch stopped at that point.
    Failed(MigrationError),
}

impl EngineOutcome {
    /// True if the batch made forward progress.
    pub fn has_changes(&self) -> bool {
        matches!(self, Self::Applied(ids) if !ids.is_empty())
    }

    /// One-line human summary, in the teacher's `summary()` style.
    pub fn summary(&self) -> String {
        match self {
            Self::Applied(ids) if ids.is_empty() => "no migrations applied".to_string(),
            Self::Applied(ids) => format!("{} migration(s) applied", ids.len()),
            Self::Ignored => "ignored: another actor holds the migration lock".to_string(),
            Self::Failed(err) => format!("failed: {err}"),
        }
    }
}

/// Migration status snapshot, for reporting without running anything.
#[derive(Debug)]
pub struct MigrationStatus {
    /// Ids currently recorded as applied.
    pub applied: Vec<i64>,
    /// Ids discovered but not yet applied, ascending.
    pub pending: Vec<i64>,
}

/// Turn free text into the `<kebab-name>` segment `create` writes into a
/// filename.
fn kebab_case(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_whitespace() || c == '_' { '-' } else { c })
        .collect()
}

/// Drives a [`Store`] through the commands in [`Command`].
///
/// Generic over `Store` so tests can drive the planner and state machine
/// against an in-memory fake rather than a live database.
pub struct Engine<S: Store> {
    config: MigrationConfig,
    store: S,
    /// Code-kind migrations registered by the embedding application, keyed
    /// by id. Discovery only ever produces SQL descriptors; a code migration
    /// must be registered before it shows up in a plan.
    code_migrations: BTreeMap<i64, Arc<CodeMigration>>,
}

impl<S: Store> Engine<S> {
    /// Build an engine over an already-constructed store.
    pub fn new(config: MigrationConfig, store: S) -> Self {
        Self {
            config,
            store,
            code_migrations: BTreeMap::new(),
        }
    }

    /// Register a code-kind migration so it participates in planning
    /// alongside filesystem-discovered SQL migrations.
    pub fn register_code_migration(mut self, migration: CodeMigration) -> Self {
        self.code_migrations.insert(migration.id(), Arc::new(migration));
        self
    }

    async fn discover(&self) -> MigrateResult<BTreeMap<i64, MigrationDescriptor>> {
        let source = resolve_migration_source(&self.config.parent_migration_dir, &self.config.migration_dir)
            .ok_or_else(|| MigrationError::DirectoryNotFound(self.config.migration_dir.clone()))?;
        let mut descriptors = discovery::discover(&source, &self.config.all_excluded()).await?;

        for (id, code) in &self.code_migrations {
            descriptors.entry(*id).or_insert_with(|| MigrationDescriptor {
                id: *id,
                name: code.name().to_string(),
                up_sql: None,
                down_sql: None,
                transactional: code.transactional(),
                kind: DescriptorKind::Code,
            });
        }

        Ok(descriptors)
    }

    fn build_kind(&self, descriptor: &MigrationDescriptor) -> Arc<dyn MigrationKind> {
        if descriptor.kind == DescriptorKind::Code {
            if let Some(code) = self.code_migrations.get(&descriptor.id) {
                return code.clone();
            }
        }

        let mut kind = SqlMigration::new(
            descriptor.id,
            descriptor.name.clone(),
            descriptor.up_sql.clone(),
            descriptor.down_sql.clone(),
            descriptor.transactional,
        )
        .with_separator(self.config.command_separator.clone());
        if let Some(hook) = self.config.modify_sql_fn.clone() {
            kind = kind.with_modify_sql(hook);
        }
        Arc::new(kind)
    }

    /// Write empty `<id>-<kebab-name>.up.sql` and `.down.sql` files into the
    /// migration directory, creating it if it doesn't exist yet. `id` is a
    /// UTC `yyyyMMddHHmmss` timestamp.
    pub async fn create(&self, name: &str) -> MigrateResult<i64> {
        let dir = match resolve_migration_dir(&self.config.parent_migration_dir, &self.config.migration_dir) {
            Some(dir) => dir,
            None => {
                let dir = self.config.parent_migration_dir.join(&self.config.migration_dir);
                tokio::fs::create_dir_all(&dir).await.map_err(MigrationError::Io)?;
                dir
            }
        };

        let id: i64 = Utc::now()
            .format("%Y%m%d%H%M%S")
            .to_string()
            .parse()
            .expect("UTC timestamp digits always parse as i64");
        let kebab = kebab_case(name);

        tokio::fs::write(dir.join(format!("{id}-{kebab}.up.sql")), b"")
            .await
            .map_err(MigrationError::Io)?;
        tokio::fs::write(dir.join(format!("{id}-{kebab}.down.sql")), b"")
            .await
            .map_err(MigrationError::Io)?;

        Ok(id)
    }

    /// Run the init script, if present, exactly once. Not recorded as a
    /// migration.
    pub async fn init(&mut self) -> MigrateResult<()> {
        let dir = resolve_migration_dir(&self.config.parent_migration_dir, &self.config.migration_dir)
            .ok_or_else(|| MigrationError::DirectoryNotFound(self.config.migration_dir.clone()))?;
        let init_path = dir.join(&self.config.init_script);
        if !init_path.exists() {
            return Ok(());
        }
        let sql = tokio::fs::read_to_string(&init_path).await.map_err(MigrationError::Io)?;
        self.store.connect().await?;
        let result = self.store.init_script(&sql, self.config.init_in_transaction).await;
        self.store.disconnect().await?;
        result
    }

    /// Status snapshot: applied vs. pending ids, without running anything.
    pub async fn status(&mut self) -> MigrateResult<MigrationStatus> {
        let descriptors = self.discover().await?;
        self.store.connect().await?;
        let completed = self.store.completed_ids().await?;
        self.store.disconnect().await?;

        let pending = planner::plan(&descriptors, &completed, &Command::PendingList)
            .into_iter()
            .map(|item| item.id)
            .collect();

        Ok(MigrationStatus {
            applied: completed.into_iter().collect(),
            pending,
        })
    }

    /// Run `command` to completion, checking `cancel` between migrations and
    /// before each statement.
    pub async fn run(&mut self, command: Command, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        let descriptors = self.discover().await?;

        self.store.connect().await?;
        let result = self.run_connected(&descriptors, command, cancel).await;
        self.store.disconnect().await?;
        result
    }

    async fn run_connected(
        &mut self,
        descriptors: &BTreeMap<i64, MigrationDescriptor>,
        command: Command,
        cancel: &CancellationToken,
    ) -> MigrateResult<EngineOutcome> {
        let completed = self.store.completed_ids().await?;
        let items = planner::plan(descriptors, &completed, &command);

        let mut applied = Vec::new();
        let cancelled = || cancel.is_cancelled();

        for item in items {
            if cancel.is_cancelled() {
                return Ok(EngineOutcome::Failed(MigrationError::Cancelled));
            }

            let Some(descriptor) = descriptors.get(&item.id) else {
                warn!(id = item.id, "planned id has no descriptor; skipping");
                continue;
            };
            let kind = self.build_kind(descriptor);

            let outcome = match item.direction {
                Direction::Up => self.store.migrate_up(kind.as_ref(), &cancelled).await,
                Direction::Down => self.store.migrate_down(kind.as_ref(), &cancelled).await,
            };

            match outcome {
                Ok(MigrateOutcome::Success) => {
                    info!(id = item.id, direction = ?item.direction, "migration applied");
                    applied.push(item.id);
                }
                Ok(MigrateOutcome::Ignored) => return Ok(EngineOutcome::Ignored),
                Err(e) => return Ok(EngineOutcome::Failed(e)),
            }
        }

        Ok(EngineOutcome::Applied(applied))
    }

    /// Apply all pending migrations.
    pub async fn migrate(&mut self, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        self.run(Command::Migrate, cancel).await
    }

    /// Apply pending migrations strictly below `target`.
    pub async fn migrate_until_just_before(
        &mut self,
        target: i64,
        cancel: &CancellationToken,
    ) -> MigrateResult<EngineOutcome> {
        self.run(Command::MigrateUntilJustBefore(target), cancel).await
    }

    /// Apply the listed ids, skipping any already applied.
    pub async fn up(&mut self, ids: Vec<i64>, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        self.run(Command::Up(ids), cancel).await
    }

    /// Roll back the listed ids, skipping any not applied.
    pub async fn down(&mut self, ids: Vec<i64>, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        self.run(Command::Down(ids), cancel).await
    }

    /// Roll back the single most recently applied migration.
    pub async fn rollback(&mut self, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        self.run(Command::Rollback, cancel).await
    }

    /// Roll back every applied migration above `target`.
    pub async fn rollback_until_just_after(
        &mut self,
        target: i64,
        cancel: &CancellationToken,
    ) -> MigrateResult<EngineOutcome> {
        self.run(Command::RollbackUntilJustAfter(target), cancel).await
    }

    /// Roll back everything applied, then reapply everything pending.
    pub async fn reset(&mut self, cancel: &CancellationToken) -> MigrateResult<EngineOutcome> {
        self.run(Command::Reset, cancel).await
    }

    /// Names of pending migrations, without running anything.
    pub async fn pending_list(&mut self) -> MigrateResult<Vec<i64>> {
        let descriptors = self.discover().await?;
        self.store.connect().await?;
        let completed = self.store.completed_ids().await?;
        self.store.disconnect().await?;

        Ok(planner::plan(&descriptors, &completed, &Command::PendingList)
            .into_iter()
            .map(|item| item.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::{Conn, MigrationKind};
    use crate::store::ConnectionSpec;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// An in-memory [`Store`] for exercising the engine and planner without
    /// a live database.
    #[derive(Default)]
    struct FakeStore {
        completed: Mutex<BTreeSet<i64>>,
        reserved: Mutex<bool>,
        fail_ids: BTreeSet<i64>,
    }

    #[async_trait]
    impl Store for FakeStore {
        async fn connect(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn disconnect(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn completed_ids(&self) -> MigrateResult<BTreeSet<i64>> {
            Ok(self.completed.lock().unwrap().clone())
        }

        async fn mark_reserved(&self) -> MigrateResult<bool> {
            let mut reserved = self.reserved.lock().unwrap();
            if *reserved {
                return Ok(false);
            }
            *reserved = true;
            Ok(true)
        }

        async fn mark_unreserved(&self) -> MigrateResult<()> {
            *self.reserved.lock().unwrap() = false;
            Ok(())
        }

        async fn migrate_up(
            &mut self,
            kind: &dyn MigrationKind,
            cancelled: &(dyn Fn() -> bool + Sync),
        ) -> MigrateResult<MigrateOutcome> {
            if !self.mark_reserved().await? {
                return Ok(MigrateOutcome::Ignored);
            }
            let outcome = async {
                if self.completed.lock().unwrap().contains(&kind.id()) {
                    return Ok(MigrateOutcome::Success);
                }
                if self.fail_ids.contains(&kind.id()) {
                    return Err(MigrationError::migration_failed(
                        kind.id(),
                        false,
                        MigrationError::Other("simulated failure".into()),
                    ));
                }
                if cancelled() {
                    return Err(MigrationError::Cancelled);
                }
                self.completed.lock().unwrap().insert(kind.id());
                Ok(MigrateOutcome::Success)
            }
            .await;
            self.mark_unreserved().await?;
            outcome
        }

        async fn migrate_down(
            &mut self,
            kind: &dyn MigrationKind,
            _cancelled: &(dyn Fn() -> bool + Sync),
        ) -> MigrateResult<MigrateOutcome> {
            if !self.mark_reserved().await? {
                return Ok(MigrateOutcome::Ignored);
            }
            self.completed.lock().unwrap().remove(&kind.id());
            self.mark_unreserved().await?;
            Ok(MigrateOutcome::Success)
        }

        async fn init_script(&mut self, _sql: &str, _in_transaction: bool) -> MigrateResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn migrate_applies_discovered_pending_migrations() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("1-create-a.up.sql"), "SELECT 1;").unwrap();
        std::fs::write(tmp.path().join("2-create-b.up.sql"), "SELECT 1;").unwrap();

        let config = MigrationConfig::new(ConnectionSpec::Params(tokio_postgres::Config::new()))
            .parent_migration_dir(tmp.path().parent().unwrap().to_path_buf())
            .migration_dir(tmp.path().file_name().unwrap().to_str().unwrap());

        let mut engine = Engine::new(config, FakeStore::default());
        let outcome = engine.migrate(&CancellationToken::new()).await.unwrap();
        match outcome {
            EngineOutcome::Applied(ids) => assert_eq!(ids, vec![1, 2]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_before_the_batch_starts_stops_everything() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("1-a.up.sql"), "SELECT 1;").unwrap();

        let config = MigrationConfig::new(ConnectionSpec::Params(tokio_postgres::Config::new()))
            .parent_migration_dir(tmp.path().parent().unwrap().to_path_buf())
            .migration_dir(tmp.path().file_name().unwrap().to_str().unwrap());

        let token = CancellationToken::new();
        token.cancel();

        let mut engine = Engine::new(config, FakeStore::default());
        let outcome = engine.migrate(&token).await.unwrap();
        assert!(matches!(outcome, EngineOutcome::Failed(MigrationError::Cancelled)));
    }

    #[test]
    fn engine_outcome_summary_reflects_state() {
        assert_eq!(EngineOutcome::Applied(vec![]).summary(), "no migrations applied");
        assert_eq!(EngineOutcome::Applied(vec![1, 2]).summary(), "2 migration(s) applied");
        assert!(!EngineOutcome::Applied(vec![]).has_changes());
        assert!(EngineOutcome::Applied(vec![1]).has_changes());
    }

    #[tokio::test]
    async fn registered_code_migration_runs_through_up() {
        use crate::kind::{CodeFn, Conn};
        use futures::future::BoxFuture;
        use std::sync::atomic::{AtomicBool, Ordering};

        let called = Arc::new(AtomicBool::new(false));
        let called_in_up = called.clone();
        let up_fn: Arc<CodeFn> = Arc::new(move |_conn: &Conn<'_>| {
            let called = called_in_up.clone();
            Box::pin(async move {
                called.store(true, Ordering::SeqCst);
                Ok(())
            }) as BoxFuture<'_, MigrateResult<()>>
        });
        let code = CodeMigration::new(1, "seed-reference-data", true, up_fn, None);

        let tmp = tempfile::TempDir::new().unwrap();
        let config = MigrationConfig::new(ConnectionSpec::Params(tokio_postgres::Config::new()))
            .parent_migration_dir(tmp.path().parent().unwrap().to_path_buf())
            .migration_dir(tmp.path().file_name().unwrap().to_str().unwrap());

        let mut engine = Engine::new(config, FakeStore::default()).register_code_migration(code);
        let outcome = engine.migrate(&CancellationToken::new()).await.unwrap();

        assert!(called.load(Ordering::SeqCst));
        match outcome {
            EngineOutcome::Applied(ids) => assert_eq!(ids, vec![1]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_writes_empty_up_and_down_files_with_a_utc_id() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = MigrationConfig::new(ConnectionSpec::Params(tokio_postgres::Config::new()))
            .parent_migration_dir(tmp.path().parent().unwrap().to_path_buf())
            .migration_dir(tmp.path().file_name().unwrap().to_str().unwrap());

        let engine = Engine::new(config, FakeStore::default());
        let id = engine.create("Add Widgets").await.unwrap();

        assert!(id > 0);
        let up_path = tmp.path().join(format!("{id}-add-widgets.up.sql"));
        let down_path = tmp.path().join(format!("{id}-add-widgets.down.sql"));
        assert_eq!(std::fs::read_to_string(&up_path).unwrap(), "");
        assert_eq!(std::fs::read_to_string(&down_path).unwrap(), "");
    }
}
