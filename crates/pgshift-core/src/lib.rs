//! pgshift core - the pieces behind zero-downtime PostgreSQL migrations.
//!
//! - [`db`]: execution layer that retries on lock contention
//! - [`state`]: the migration ledger and its invariants
//! - [`schema`]: schema snapshots, also used to accumulate virtual changes
//! - [`migrations`]: migrations and the operation contract
//! - [`backfill`]: batched rewriting of existing rows
//!
//! The orchestrator driving these lives in the `pgshift` crate.

pub mod backfill;
pub mod db;
pub mod error;
pub mod migrations;
pub mod schema;
pub mod sql;
pub mod state;
pub mod transform;

pub use backfill::{Backfill, BackfillConfig, BackfillProgress, ProgressCallback};
pub use db::{Backoff, Db, DbConfig};
pub use error::{BoxError, Error, Result, ValidationError};
pub use migrations::{ColumnDef, Migration, MigrationOperation, OpContext, Operation};
pub use schema::{Column, Index, Schema, Table};
pub use state::{HistoryEntry, MigrationStatus, MigrationType, State, Status};
pub use transform::{NoopTransformer, SqlTransformer};
