//! Migration state tracker.
//!
//! The ledger lives in a dedicated state schema (default `pgshift`) inside
//! the target database. Its invariants (one active migration per schema, a
//! single root, linear history) are unique indexes, so several processes can
//! share one database without coordinating in-process.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::db::{is_unique_violation, Db};
use crate::error::{Error, Result};
use crate::migrations::Migration;
use crate::schema::Schema;
use crate::sql::{quote_ident, quote_literal, MAX_IDENTIFIER_LENGTH};

/// Default name of the state schema.
pub const DEFAULT_STATE_SCHEMA: &str = "pgshift";

const INIT_SQL: &str = include_str!("sql/init.sql");

/// Build the initialisation script for `state_schema`.
pub fn init_script(state_schema: &str) -> String {
    let ddl_trigger = event_trigger_name("ddl", state_schema);
    let drop_trigger = event_trigger_name("drop", state_schema);
    INIT_SQL
        .replace("{{ddl_trigger_literal}}", &quote_literal(&ddl_trigger))
        .replace("{{ddl_trigger}}", &quote_ident(&ddl_trigger))
        .replace("{{drop_trigger_literal}}", &quote_literal(&drop_trigger))
        .replace("{{drop_trigger}}", &quote_ident(&drop_trigger))
        .replace("{{state_schema_literal}}", &quote_literal(state_schema))
        .replace("{{state_schema}}", &quote_ident(state_schema))
}

/// `pgshift_handle_<event>_<state_schema>`, cut to what PostgreSQL keeps of
/// an identifier so the existence check sees the stored name.
pub fn event_trigger_name(event: &str, state_schema: &str) -> String {
    let mut name = format!("pgshift_handle_{event}_{state_schema}");
    if name.len() > MAX_IDENTIFIER_LENGTH {
        let mut end = MAX_IDENTIFIER_LENGTH;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
    }
    name
}

/// How a history entry came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Issued through pgshift. Stored as `pgroll`, the ledger's historical
    /// name for engine-issued migrations.
    #[serde(rename = "pgroll")]
    Pgshift,
    /// DDL captured after it bypassed pgshift.
    Inferred,
    /// Start of history for a database that predates pgshift.
    Baseline,
}

impl MigrationType {
    /// The value stored in the `migration_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Pgshift => "pgroll",
            MigrationType::Inferred => "inferred",
            MigrationType::Baseline => "baseline",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pgroll" => Ok(MigrationType::Pgshift),
            "inferred" => Ok(MigrationType::Inferred),
            "baseline" => Ok(MigrationType::Baseline),
            other => Err(Error::StateCorrupted(format!(
                "unknown migration type {other:?}"
            ))),
        }
    }
}

/// One row of the migration ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    /// Schema the migration applies to.
    pub schema: String,
    /// Migration name.
    pub name: String,
    /// The stored migration definition.
    pub migration: Migration,
    /// Name of the preceding entry.
    pub parent: Option<String>,
    /// Whether the migration has completed.
    pub done: bool,
    /// How the entry came to exist.
    pub migration_type: MigrationType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Migration status of a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// No migration has been applied.
    None,
    /// A migration is in progress.
    InProgress,
    /// The latest migration is complete.
    Complete,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStatus::None => write!(f, "No migrations"),
            MigrationStatus::InProgress => write!(f, "In progress"),
            MigrationStatus::Complete => write!(f, "Complete"),
        }
    }
}

/// Summary returned by [`State::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Schema name.
    pub schema: String,
    /// Latest version, if any.
    pub version: Option<String>,
    /// Current status.
    pub status: MigrationStatus,
}

impl Status {
    /// Derive the status from the latest version and whether a migration is active.
    pub fn from_parts(schema: impl Into<String>, version: Option<String>, active: bool) -> Self {
        let status = match (&version, active) {
            (None, _) => MigrationStatus::None,
            (Some(_), true) => MigrationStatus::InProgress,
            (Some(_), false) => MigrationStatus::Complete,
        };
        Self {
            schema: schema.into(),
            version,
            status,
        }
    }
}

/// The migration ledger.
#[derive(Debug, Clone)]
pub struct State {
    db: Db,
    schema: String,
    table: String,
}

impl State {
    /// Create a tracker storing its ledger in `state_schema`.
    pub fn new(db: Db, state_schema: impl Into<String>) -> Self {
        let schema = state_schema.into();
        let table = format!("{}.migrations", quote_ident(&schema));
        Self { db, schema, table }
    }

    /// Name of the state schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// The execution layer used by the tracker.
    pub fn db(&self) -> &Db {
        &self.db
    }

    fn func(&self, name: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), name)
    }

    /// Create the state schema, ledger table, helper functions and the
    /// event triggers that capture DDL run outside pgshift.
    ///
    /// Idempotent; concurrent callers serialise on an advisory lock.
    #[instrument(skip(self), fields(state_schema = %self.schema))]
    pub async fn init(&self) -> Result<()> {
        let script = init_script(&self.schema);
        let lock_key = self.schema.clone();

        self.db
            .with_transaction(move |conn| {
                let script = script.clone();
                let lock_key = lock_key.clone();
                Box::pin(async move {
                    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                        .bind(&lock_key)
                        .execute(&mut *conn)
                        .await?;
                    sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&script)).await?;
                    Ok(())
                })
            })
            .await?;

        info!("state schema initialized");
        Ok(())
    }

    /// Whether [`State::init`] has run against this database.
    pub async fn is_initialized(&self) -> Result<bool> {
        let row = self
            .db
            .fetch_optional(|| {
                sqlx::query(
                    "SELECT 1 FROM pg_catalog.pg_tables WHERE schemaname = $1 AND tablename = 'migrations'",
                )
                .bind(&self.schema)
            })
            .await?;
        Ok(row.is_some())
    }

    /// Whether a migration is in progress on `schema`.
    pub async fn is_active_migration_period(&self, schema: &str) -> Result<bool> {
        let sql = format!("SELECT {}($1)", self.func("is_active_migration_period"));
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema))
            .await?;
        Ok(match row {
            Some(row) => row.try_get::<Option<bool>, _>(0)?.unwrap_or(false),
            None => false,
        })
    }

    /// The in-progress migration on `schema`.
    pub async fn get_active_migration(&self, schema: &str) -> Result<Migration> {
        let sql = format!(
            "SELECT migration FROM {} WHERE schema = $1 AND name = {}($1) AND done = false",
            self.table,
            self.func("latest_migration"),
        );
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema))
            .await?
            .ok_or_else(|| Error::NoActiveMigration {
                schema: schema.to_string(),
            })?;
        let raw: serde_json::Value = row.try_get("migration")?;
        Ok(serde_json::from_value(raw)?)
    }

    /// A migration by name.
    pub async fn get_migration(&self, schema: &str, name: &str) -> Result<Migration> {
        let sql = format!(
            "SELECT migration FROM {} WHERE schema = $1 AND name = $2",
            self.table
        );
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema).bind(name))
            .await?
            .ok_or_else(|| Error::MigrationNotFound {
                schema: schema.to_string(),
                name: name.to_string(),
            })?;
        let raw: serde_json::Value = row.try_get("migration")?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Record the start of `migration` on `schema`.
    ///
    /// The parent is resolved inside the INSERT. Returns the schema as it
    /// stood before the migration: the parent's cached snapshot, or a fresh
    /// read when there is no parent.
    #[instrument(skip(self, migration), fields(migration = %migration.name))]
    pub async fn start(&self, schema: &str, migration: &Migration) -> Result<Schema> {
        let raw = serde_json::to_value(migration)?;
        let sql = format!(
            "INSERT INTO {table} (schema, name, parent, migration, migration_type) \
             VALUES ($1, $2, {latest}($1), $3, 'pgroll') RETURNING parent",
            table = self.table,
            latest = self.func("latest_migration"),
        );

        let inserted = self
            .db
            .fetch_optional(|| {
                sqlx::query(&sql)
                    .bind(schema)
                    .bind(&migration.name)
                    .bind(&raw)
            })
            .await;

        let row = match inserted {
            Ok(Some(row)) => row,
            Ok(None) => {
                return Err(Error::StateCorrupted(
                    "insert into migrations returned no row".to_string(),
                ))
            }
            Err(Error::Database(err)) if is_unique_violation(&err) => {
                return Err(self.start_conflict(schema, &migration.name).await);
            }
            Err(err) => return Err(err),
        };
        let parent: Option<String> = row.try_get("parent")?;
        debug!(parent = ?parent, "migration registered");

        let snapshot = match &parent {
            Some(parent) => self.resulting_schema(schema, parent).await?,
            None => None,
        };
        match snapshot {
            Some(snapshot) => Ok(snapshot),
            None => self.read_schema(schema).await,
        }
    }

    async fn start_conflict(&self, schema: &str, name: &str) -> Error {
        match self.get_active_migration(schema).await {
            Ok(active) => Error::MigrationAlreadyActive {
                schema: schema.to_string(),
                name: active.name,
            },
            Err(Error::NoActiveMigration { .. }) => Error::DuplicateMigration {
                schema: schema.to_string(),
                name: name.to_string(),
            },
            Err(err) => err,
        }
    }

    async fn resulting_schema(&self, schema: &str, name: &str) -> Result<Option<Schema>> {
        let sql = format!(
            "SELECT NULLIF(resulting_schema, '{{}}'::jsonb) AS resulting_schema FROM {} \
             WHERE schema = $1 AND name = $2",
            self.table
        );
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema).bind(name))
            .await?;
        let raw: Option<serde_json::Value> = match row {
            Some(row) => row.try_get("resulting_schema")?,
            None => None,
        };
        raw.map(serde_json::from_value)
            .transpose()
            .map_err(Error::from)
    }

    /// Mark the in-progress migration `name` as done and cache the resulting schema.
    #[instrument(skip(self))]
    pub async fn complete(&self, schema: &str, name: &str) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET done = true, updated_at = current_timestamp, \
             resulting_schema = {read}($1) \
             WHERE schema = $1 AND name = $2 AND done = false RETURNING name",
            table = self.table,
            read = self.func("read_schema"),
        );
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema).bind(name))
            .await?;
        if row.is_none() {
            return Err(Error::NoActiveMigration {
                schema: schema.to_string(),
            });
        }
        info!("migration marked complete");
        Ok(())
    }

    /// Erase the in-progress migration `name`. Completed migrations cannot be erased.
    #[instrument(skip(self))]
    pub async fn rollback(&self, schema: &str, name: &str) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} WHERE schema = $1 AND name = $2 AND done = false RETURNING name",
            self.table
        );
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema).bind(name))
            .await?;
        if row.is_none() {
            return Err(Error::NoActiveMigration {
                schema: schema.to_string(),
            });
        }
        info!("migration erased");
        Ok(())
    }

    async fn scalar_name(&self, sql: &str, schema: &str) -> Result<Option<String>> {
        let row = self
            .db
            .fetch_optional(|| sqlx::query(sql).bind(schema))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>(0)?),
            None => Ok(None),
        }
    }

    /// The newest migration issued through pgshift.
    pub async fn latest_version(&self, schema: &str) -> Result<Option<String>> {
        let sql = format!("SELECT {}($1)", self.func("latest_version"));
        self.scalar_name(&sql, schema).await
    }

    /// The version before [`State::latest_version`].
    ///
    /// Inferred entries are skipped unless `include_inferred` is set; baselines
    /// are always skipped, as neither has a version schema.
    pub async fn previous_version(
        &self,
        schema: &str,
        include_inferred: bool,
    ) -> Result<Option<String>> {
        let sql = format!("SELECT {}($1, $2)", self.func("previous_version"));
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema).bind(include_inferred))
            .await?;
        match row {
            Some(row) => Ok(row.try_get::<Option<String>, _>(0)?),
            None => Ok(None),
        }
    }

    /// The newest entry of any type.
    pub async fn latest_migration(&self, schema: &str) -> Result<Option<String>> {
        let sql = format!("SELECT {}($1)", self.func("latest_migration"));
        self.scalar_name(&sql, schema).await
    }

    /// The parent of [`State::latest_migration`], of any type.
    pub async fn previous_migration(&self, schema: &str) -> Result<Option<String>> {
        let sql = format!("SELECT {}($1)", self.func("previous_migration"));
        self.scalar_name(&sql, schema).await
    }

    /// Entries recorded after the most recent baseline, oldest first.
    pub async fn schema_history(&self, schema: &str) -> Result<Vec<HistoryEntry>> {
        let sql = format!(
            "WITH baseline AS ( \
                 SELECT max(created_at) AS created_at FROM {table} \
                 WHERE schema = $1 AND migration_type = 'baseline' \
             ) \
             SELECT m.schema::text AS schema, m.name, m.migration, m.parent, m.done, \
                    m.migration_type::text AS migration_type, m.created_at, m.updated_at \
             FROM {table} m, baseline b \
             WHERE m.schema = $1 AND (b.created_at IS NULL OR m.created_at > b.created_at) \
             ORDER BY m.created_at ASC",
            table = self.table
        );
        let rows = self
            .db
            .fetch_all(|| sqlx::query(&sql).bind(schema))
            .await?;

        rows.into_iter()
            .map(|row| {
                let raw: serde_json::Value = row.try_get("migration")?;
                let migration_type: String = row.try_get("migration_type")?;
                Ok(HistoryEntry {
                    schema: row.try_get("schema")?,
                    name: row.try_get("name")?,
                    migration: serde_json::from_value(raw)?,
                    parent: row.try_get("parent")?,
                    done: row.try_get("done")?,
                    migration_type: migration_type.parse()?,
                    created_at: row.try_get("created_at")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    /// Record a baseline: the current schema becomes the start of history.
    #[instrument(skip(self))]
    pub async fn create_baseline(&self, schema: &str, name: &str) -> Result<()> {
        if self.is_active_migration_period(schema).await? {
            let active = self.get_active_migration(schema).await?;
            return Err(Error::MigrationAlreadyActive {
                schema: schema.to_string(),
                name: active.name,
            });
        }

        let raw = serde_json::to_value(Migration::new(name))?;
        let sql = format!(
            "INSERT INTO {table} (schema, name, migration, parent, done, resulting_schema, migration_type) \
             VALUES ($1, $2, $3, {latest}($1), true, {read}($1), 'baseline')",
            table = self.table,
            latest = self.func("latest_migration"),
            read = self.func("read_schema"),
        );
        let result = self
            .db
            .exec(|| sqlx::query(&sql).bind(schema).bind(name).bind(&raw))
            .await;

        match result {
            Ok(_) => {
                info!("baseline recorded");
                Ok(())
            }
            Err(Error::Database(err)) if is_unique_violation(&err) => {
                Err(Error::DuplicateMigration {
                    schema: schema.to_string(),
                    name: name.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Read a fresh snapshot of `schema` from the catalog.
    pub async fn read_schema(&self, schema: &str) -> Result<Schema> {
        let sql = format!("SELECT {}($1)", self.func("read_schema"));
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql).bind(schema))
            .await?
            .ok_or_else(|| Error::StateCorrupted("read_schema returned no row".to_string()))?;
        let raw: serde_json::Value = row.try_get(0)?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Status of `schema`, from its latest version and whether a migration is active.
    pub async fn status(&self, schema: &str) -> Result<Status> {
        let version = self.latest_version(schema).await?;
        let active = self.is_active_migration_period(schema).await?;
        Ok(Status::from_parts(schema, version, active))
    }
}
