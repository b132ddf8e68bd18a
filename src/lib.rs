//! # stratum-migrate
//!
//! A database schema migration engine: discovers ordered SQL (or code)
//! migration scripts on the filesystem or inside an archive, tracks which
//! have been applied in a bookkeeping table, and drives the database forward
//! or backward while guaranteeing at most one actor in a cluster mutates
//! schema at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌────────┐     ┌─────────┐     ┌────────┐
//! │ Discovery │────▶│  Kind  │     │ Planner │────▶│ Engine │
//! └───────────┘     └────────┘     └─────────┘     └────────┘
//!       │                │               ▲              │
//!       ▼                ▼               │              ▼
//!   descriptors      up/down        completed_ids    ┌───────┐
//!                                                     │ Store │
//!                                                     └───────┘
//! ```
//!
//! Discovery enumerates `<id>-<name>.(up|down)[.no-tx].sql` files into
//! [`discovery::MigrationDescriptor`]s. The engine turns each descriptor into
//! a [`kind::MigrationKind`], asks the [`store::Store`] which ids are already
//! applied, asks the [`planner`] for an ordered work list for the requested
//! [`planner::Command`], then drives the store through that list one
//! migration at a time.
//!
//! Cross-process mutual exclusion is a single row (`id = -1`) in the
//! bookkeeping table, enforced by a unique-key violation — not an
//! application-level mutex. See [`store`] for the full per-migration state
//! machine.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stratum_migrate::config::MigrationConfig;
//! use stratum_migrate::engine::{CancellationToken, Engine};
//! use stratum_migrate::store::{ConnectionSpec, PostgresStore};
//!
//! async fn run() -> stratum_migrate::error::MigrateResult<()> {
//!     let config = MigrationConfig::new(ConnectionSpec::Params("host=localhost".parse()?))
//!         .migration_dir("migrations");
//!
//!     let store = PostgresStore::new(
//!         ConnectionSpec::Params("host=localhost".parse()?),
//!         config.migration_table_name.clone(),
//!     );
//!     let mut engine = Engine::new(config, store);
//!
//!     let outcome = engine.migrate(&CancellationToken::new()).await?;
//!     println!("{}", outcome.summary());
//!     Ok(())
//! }
//! ```
//!
//! ## Migration files
//!
//! ```text
//! migrations/
//! ├── 20240101120000-create-users.up.sql
//! ├── 20240101120000-create-users.down.sql
//! ├── 20240102090000-add-index.up.no-tx.sql
//! └── init.sql
//! ```
//!
//! Statements within one file are separated by a `--;;` line; line comments
//! and blank lines are stripped before execution. See [`sql::split_statements`].

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod kind;
pub mod planner;
pub mod sql;
pub mod store;

// Re-exports
pub use config::MigrationConfig;
pub use discovery::{DescriptorKind, MigrationDescriptor, MigrationSource};
pub use engine::{CancellationToken, Engine, EngineOutcome, MigrationStatus};
pub use error::{MigrateResult, MigrationError};
pub use kind::{CodeFn, CodeMigration, Conn, MigrationKind, SqlMigration};
pub use planner::{Command, Direction, PlanItem};
pub use store::{ConnectionSpec, MigrateOutcome, PostgresStore, Store};
