//! Error types for the migration engine.

use thiserror::Error;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error encountered while discovering or reading migration scripts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database connection or protocol error.
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    /// Failed to check out a connection from the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    /// A migration filename did not match the expected grammar, or an archive
    /// entry could not be parsed as a migration. The file is skipped, not fatal.
    #[error("malformed migration file '{0}': {1}")]
    Discovery(String, String),

    /// The migration directory itself could not be located.
    #[error("migration directory not found: {0}")]
    DirectoryNotFound(String),

    /// A migration id could not be parsed from a filename.
    #[error("invalid migration id in '{0}'")]
    InvalidId(String),

    /// A migration script or code callback failed while running. Carries the id
    /// of the migration and whether a best-effort back-out was attempted.
    #[error("migration {id} failed: {source}")]
    MigrationFailed {
        /// The migration that failed.
        id: i64,
        /// Whether a best-effort reverse execution was attempted after failure.
        backed_out: bool,
        /// Underlying cause.
        #[source]
        source: Box<MigrationError>,
    },

    /// Requested migration id does not exist in the discovered set.
    #[error("migration {0} not found")]
    NotFound(i64),

    /// A `down` was requested for a migration with no down side.
    #[error("migration {0} has no down script")]
    NoDownScript(i64),

    /// The batch was cancelled via the cancellation token.
    #[error("migration run cancelled")]
    Cancelled,

    /// Could not record or remove a bookkeeping row after a migration ran.
    #[error("bookkeeping failure: {0}")]
    Bookkeeping(String),

    /// An archive (zip/jar) could not be opened or read.
    #[error("archive error: {0}")]
    Archive(String),

    /// Catch-all for conditions not covered above.
    #[error("{0}")]
    Other(String),
}

impl MigrationError {
    /// Wrap an underlying failure as a migration failure, noting whether
    /// a reverse side was attempted.
    pub fn migration_failed(id: i64, backed_out: bool, source: MigrationError) -> Self {
        Self::MigrationFailed {
            id,
            backed_out,
            source: Box::new(source),
        }
    }

    /// True if the run should simply be treated as "nothing to do" rather
    /// than surfaced as an operational failure.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
