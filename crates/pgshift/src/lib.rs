//! pgshift - zero-downtime, reversible schema migrations for PostgreSQL.
//!
//! A migration is applied in two steps. [`Roll::start`] expands the schema
//! without breaking existing clients and publishes the new shape as a
//! version schema of views; old and new application versions then run side
//! by side. [`Roll::complete`] contracts the schema and retires the previous
//! version, while [`Roll::rollback`] undoes the start.
//!
//! # Example
//!
//! ```no_run
//! use pgshift::{ColumnDef, Migration, Operation, Roll, RollConfig};
//! use pgshift::migrations::CreateTable;
//!
//! # async fn run() -> pgshift::Result<()> {
//! let roll = Roll::new(RollConfig::new("postgres://localhost/app")).await?;
//! roll.init().await?;
//!
//! let migration = Migration::new("01_create_users").with_operation(Operation::CreateTable(
//!     CreateTable::new(
//!         "users",
//!         vec![
//!             ColumnDef::new("id", "serial").with_pk(true),
//!             ColumnDef::new("name", "text").with_nullable(true),
//!         ],
//!     ),
//! ));
//! roll.start(&migration).await?;
//! roll.complete().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod history;
pub mod hooks;
pub mod roll;
mod views;

pub use config::RollConfig;
pub use hooks::{HookPhase, Hooks, MigrationHook};
pub use roll::Roll;

pub use pgshift_core::{
    backfill, db, migrations, schema, sql, state, transform, Backfill, BackfillConfig,
    BackfillProgress, Backoff, BoxError, Column, ColumnDef, Db, DbConfig, Error, HistoryEntry,
    Index, Migration, MigrationOperation, MigrationStatus, MigrationType, NoopTransformer,
    OpContext, Operation, ProgressCallback, Result, Schema, SqlTransformer, State, Status, Table,
    ValidationError,
};
