//! Error types for pgshift.

use thiserror::Error;

/// Boxed error returned by user-supplied hooks and transformers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for pgshift operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing migrations.
#[derive(Debug, Error)]
pub enum Error {
    /// Database driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The caller cancelled the operation while it was waiting to retry.
    #[error("operation cancelled")]
    Cancelled,

    /// Another migration is already in progress on the schema.
    #[error("a migration is already in progress on schema {schema}: {name}")]
    MigrationAlreadyActive {
        /// The schema the migration targets.
        schema: String,
        /// Name of the active migration.
        name: String,
    },

    /// Complete or rollback was requested with no migration in progress.
    #[error("no active migration on schema {schema}")]
    NoActiveMigration {
        /// The schema that was inspected.
        schema: String,
    },

    /// A migration with this name has already been recorded.
    #[error("migration {name} already exists in schema {schema}")]
    DuplicateMigration {
        /// The schema the migration targets.
        schema: String,
        /// The duplicated name.
        name: String,
    },

    /// A named migration does not exist in the history.
    #[error("migration {name} not found in schema {schema}")]
    MigrationNotFound {
        /// The schema that was inspected.
        schema: String,
        /// The missing migration.
        name: String,
    },

    /// The migration is not valid against the current schema.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// DDL failed during start; carries the outcome of the compensating rollback.
    #[error("migration start failed: {source}{}", rollback_suffix(.rollback))]
    StartFailed {
        /// The error that interrupted the start phase.
        source: Box<Error>,
        /// The error raised by the automatic rollback, if it also failed.
        rollback: Option<Box<Error>>,
    },

    /// Backfill of a table failed.
    #[error("backfill failed for table {table}: {reason}")]
    Backfill {
        /// The table being backfilled.
        table: String,
        /// The reason for failure.
        reason: String,
    },

    /// Local migrations and the applied history disagree on order.
    #[error("local migration {local} does not match applied migration {remote}")]
    MismatchedMigration {
        /// Name of the local migration at the diverging position.
        local: String,
        /// Name of the applied migration at the diverging position.
        remote: String,
    },

    /// A lifecycle hook failed and aborted its phase.
    #[error("{phase} hook failed: {source}")]
    Hook {
        /// The phase the hook was registered for.
        phase: &'static str,
        /// The error returned by the hook.
        source: BoxError,
    },

    /// A user supplied expression was rejected by the SQL transformer.
    #[error("sql transform failed: {0}")]
    Transform(BoxError),

    /// A name cannot be used as a PostgreSQL identifier.
    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The state schema holds data pgshift cannot interpret.
    #[error("migration state corrupted: {0}")]
    StateCorrupted(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn rollback_suffix(rollback: &Option<Box<Error>>) -> String {
    match rollback {
        Some(err) => format!(" (rollback also failed: {err})"),
        None => String::new(),
    }
}

impl Error {
    /// Whether this error is PostgreSQL's `lock_not_available` (SQLSTATE 55P03).
    pub fn is_lock_not_available(&self) -> bool {
        match self {
            Error::Database(err) => crate::db::is_lock_not_available(err),
            _ => false,
        }
    }

    /// Whether this error is a conflict with another migration's lifecycle.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::MigrationAlreadyActive { .. }
                | Error::NoActiveMigration { .. }
                | Error::DuplicateMigration { .. }
        )
    }
}

/// Reasons a migration is rejected before any DDL runs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The migration has no operations.
    #[error("migration {0} has no operations")]
    EmptyMigration(String),

    /// The referenced table does not exist.
    #[error("table {0} does not exist")]
    TableDoesNotExist(String),

    /// A table with this name already exists.
    #[error("table {0} already exists")]
    TableAlreadyExists(String),

    /// The referenced column does not exist.
    #[error("column {column} does not exist on table {table}")]
    ColumnDoesNotExist {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A column with this name already exists.
    #[error("column {column} already exists on table {table}")]
    ColumnAlreadyExists {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// The referenced index does not exist.
    #[error("index {0} does not exist")]
    IndexDoesNotExist(String),

    /// An index with this name already exists.
    #[error("index {0} already exists")]
    IndexAlreadyExists(String),

    /// The table needs a primary key for backfilling.
    #[error("table {0} has no primary key and cannot be backfilled")]
    NoPrimaryKey(String),

    /// A required field is missing or empty.
    #[error("{operation}: field {field} is required")]
    FieldRequired {
        /// The operation kind.
        operation: &'static str,
        /// The missing field.
        field: &'static str,
    },

    /// An operation that must run alone was combined with others.
    #[error("{0} operations must be the only operation in a migration")]
    NotIsolated(&'static str),

    /// An operation's fields are inconsistent.
    #[error("{operation}: {reason}")]
    InvalidOperation {
        /// The operation kind.
        operation: &'static str,
        /// What is wrong.
        reason: &'static str,
    },

    /// A name is not a valid identifier.
    #[error("invalid name {name:?}: {reason}")]
    InvalidName {
        /// The offending name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },
}
