//! The migration lifecycle.
//!
//! ```text
//! Idle ──start──▶ Active(ddl) ──▶ Active(backfilling) ──complete──▶ Complete
//!                     │                    │
//!                     └──────rollback──────┴──▶ RolledBack ──▶ Idle
//! ```
//!
//! Exclusion between processes comes from the ledger's constraints, so a
//! [`Roll`] holds no locks of its own.

use pgshift_core::{
    Backfill, BackfillProgress, Db, Error, HistoryEntry, Migration, OpContext, Result, Schema,
    State, Status, Table,
};
use tracing::{info, instrument, warn};

use crate::config::{RollConfig, SECURITY_INVOKER_MIN_VERSION};
use crate::history;
use crate::hooks::HookPhase;
use crate::views::{create_version_schema_sql, drop_version_schema_sql};

/// Drives migrations of one schema through start, complete and rollback.
pub struct Roll {
    config: RollConfig,
    db: Db,
    state: State,
    server_version: i32,
}

impl Roll {
    /// Connect and prepare a migration session.
    pub async fn new(config: RollConfig) -> Result<Self> {
        let db = Db::connect(&config.db_config())
            .await?
            .with_cancellation(config.cancel.clone());
        Self::with_db(config, db).await
    }

    /// Build a session on an existing execution layer.
    pub async fn with_db(config: RollConfig, db: Db) -> Result<Self> {
        let server_version = db.server_version_num().await?;
        let state = State::new(db.clone(), config.state_schema.clone());
        info!(
            schema = %config.schema,
            state_schema = %config.state_schema,
            server_version,
            "migration session ready"
        );
        Ok(Self {
            config,
            db,
            state,
            server_version,
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &RollConfig {
        &self.config
    }

    /// The schema being migrated.
    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    /// The execution layer.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// The state tracker.
    pub fn state(&self) -> &State {
        &self.state
    }

    /// Whether version schema views are created with `security_invoker`.
    pub fn uses_security_invoker(&self) -> bool {
        self.server_version >= SECURITY_INVOKER_MIN_VERSION
    }

    /// Create the state schema if it does not exist yet.
    pub async fn init(&self) -> Result<()> {
        self.state.init().await
    }

    /// Start `migration` and backfill the tables it reports.
    ///
    /// A failed backfill rolls the whole migration back.
    #[instrument(skip(self, migration), fields(schema = %self.config.schema, migration = %migration.name))]
    pub async fn start(&self, migration: &Migration) -> Result<Vec<BackfillProgress>> {
        let tables = self.start_ddl_operations(migration).await?;

        let backfill = Backfill::new(self.db.clone(), self.config.backfill.clone());
        let mut progress = Vec::with_capacity(tables.len());
        for table in &tables {
            match backfill.run(&self.config.schema, table).await {
                Ok(done) => progress.push(done),
                Err(err) => {
                    warn!(table = %table.name, error = %err, "backfill failed, rolling back");
                    return Err(self.fail_start(err).await);
                }
            }
        }

        info!("migration started");
        Ok(progress)
    }

    /// Run the start phase of `migration`, returning the tables whose rows
    /// must be backfilled.
    pub async fn start_ddl_operations(&self, migration: &Migration) -> Result<Vec<Table>> {
        let schema_name = self.config.schema.as_str();

        if self.state.is_active_migration_period(schema_name).await? {
            let active = self.state.get_active_migration(schema_name).await?;
            return Err(Error::MigrationAlreadyActive {
                schema: schema_name.to_string(),
                name: active.name,
            });
        }

        let mut schema = self.state.start(schema_name, migration).await?;

        if !self.config.skip_validation {
            if let Err(err) = migration.validate(&schema) {
                info!(error = %err, "migration is invalid");
                return match self.state.rollback(schema_name, &migration.name).await {
                    Ok(()) => Err(err.into()),
                    Err(rollback) => Err(Error::StartFailed {
                        source: Box::new(err.into()),
                        rollback: Some(Box::new(rollback)),
                    }),
                };
            }
        }

        match self.run_start_ddl(migration, &mut schema).await {
            Ok(tables) => Ok(tables),
            Err(err) => Err(self.fail_start(err).await),
        }
    }

    async fn run_start_ddl(&self, migration: &Migration, schema: &mut Schema) -> Result<Vec<Table>> {
        let version_schema = migration.version_schema_name(&self.config.schema);
        let ctx = self.op_context(&version_schema);

        self.config.hooks.run(HookPhase::BeforeStartDdl, self).await?;

        let mut tables = Vec::new();
        for op in &migration.operations {
            let op = op.as_operation();
            info!(operation = op.kind(), "starting operation");
            if let Some(table) = op.start(&ctx, schema).await? {
                tables.push(table);
            }
            if op.requires_schema_refresh() && op.is_isolated() {
                *schema = self.state.read_schema(&self.config.schema).await?;
            }
        }

        self.config.hooks.run(HookPhase::AfterStartDdl, self).await?;

        if self.manages_version_schema(migration) {
            self.create_version_schema(schema, &version_schema).await?;
        }
        Ok(tables)
    }

    async fn fail_start(&self, source: Error) -> Error {
        let rollback = self.rollback().await.err().map(Box::new);
        if let Some(err) = &rollback {
            warn!(error = %err, "rollback after failed start also failed");
        }
        Error::StartFailed {
            source: Box::new(source),
            rollback,
        }
    }

    /// Complete the active migration, making it irreversible.
    ///
    /// Constraints the migration enforces are validated first. If that
    /// fails nothing has changed and the migration can still be rolled back.
    #[instrument(skip(self), fields(schema = %self.config.schema))]
    pub async fn complete(&self) -> Result<()> {
        let schema_name = self.config.schema.as_str();
        let migration = self.state.get_active_migration(schema_name).await?;
        let version_schema = migration.version_schema_name(schema_name);
        let ctx = self.op_context(&version_schema);

        for op in &migration.operations {
            op.as_operation().prepare_complete(&ctx).await?;
        }

        if !self.config.disable_version_schemas {
            if let Some(previous) = self.state.previous_version(schema_name, false).await? {
                let previous = self.state.get_migration(schema_name, &previous).await?;
                let previous_schema = previous.version_schema_name(schema_name);
                self.db.execute(&drop_version_schema_sql(&previous_schema)).await?;
                info!(version_schema = %previous_schema, "dropped previous version schema");
            }
        }

        let schema = self.state.read_schema(schema_name).await?;

        self.config.hooks.run(HookPhase::BeforeCompleteDdl, self).await?;

        for op in &migration.operations {
            let op = op.as_operation();
            info!(operation = op.kind(), "completing operation");
            op.complete(&ctx, &schema).await?;
        }

        if migration.requires_schema_refresh() && self.manages_version_schema(&migration) {
            let refreshed = self.state.read_schema(schema_name).await?;
            self.create_version_schema(&refreshed, &version_schema).await?;
        }

        self.config.hooks.run(HookPhase::AfterCompleteDdl, self).await?;

        self.state.complete(schema_name, &migration.name).await?;
        info!(migration = %migration.name, "migration complete");
        Ok(())
    }

    /// Undo the active migration.
    ///
    /// A completion that failed part way may have dropped the previous
    /// version schema already; it is rebuilt from the restored tables.
    #[instrument(skip(self), fields(schema = %self.config.schema))]
    pub async fn rollback(&self) -> Result<()> {
        let schema_name = self.config.schema.as_str();
        let migration = self.state.get_active_migration(schema_name).await?;
        let version_schema = migration.version_schema_name(schema_name);

        if self.manages_version_schema(&migration) {
            self.db.execute(&drop_version_schema_sql(&version_schema)).await?;
        }

        let ctx = self.op_context(&version_schema);
        for op in &migration.operations {
            let op = op.as_operation();
            info!(operation = op.kind(), "rolling back operation");
            op.rollback(&ctx).await?;
        }

        self.restore_previous_version_schema().await?;

        self.state.rollback(schema_name, &migration.name).await?;
        info!(migration = %migration.name, "migration rolled back");
        Ok(())
    }

    /// Status of the schema.
    pub async fn status(&self) -> Result<Status> {
        self.state.status(&self.config.schema).await
    }

    /// The latest version applied through pgshift.
    pub async fn latest_version(&self) -> Result<Option<String>> {
        self.state.latest_version(&self.config.schema).await
    }

    /// Record the current schema as the start of history.
    pub async fn create_baseline(&self, name: &str) -> Result<()> {
        self.state.create_baseline(&self.config.schema, name).await
    }

    /// Entries since the latest baseline, oldest first.
    pub async fn schema_history(&self) -> Result<Vec<HistoryEntry>> {
        self.state.schema_history(&self.config.schema).await
    }

    /// Local migrations that have not been applied yet.
    pub async fn unapplied_migrations(&self, local: &[Migration]) -> Result<Vec<Migration>> {
        let history = self.schema_history().await?;
        let (unapplied, _) = history::compare(local, &history)?;
        Ok(unapplied.to_vec())
    }

    /// Applied migrations with no local counterpart.
    pub async fn missing_migrations(&self, local: &[Migration]) -> Result<Vec<HistoryEntry>> {
        let history = self.schema_history().await?;
        let (_, missing) = history::compare(local, &history)?;
        Ok(missing.into_iter().cloned().collect())
    }

    /// Close the connection pool.
    pub async fn close(&self) {
        self.db.close().await;
    }

    fn op_context<'a>(&'a self, version_schema: &'a str) -> OpContext<'a> {
        OpContext {
            db: &self.db,
            schema: &self.config.schema,
            version_schema,
            transformer: self.config.transformer.as_ref(),
        }
    }

    fn manages_version_schema(&self, migration: &Migration) -> bool {
        if self.config.disable_version_schemas {
            return false;
        }
        !(self.config.no_version_schema_for_raw_sql && migration.contains_only_raw_sql())
    }

    async fn restore_previous_version_schema(&self) -> Result<()> {
        if self.config.disable_version_schemas {
            return Ok(());
        }
        let schema_name = self.config.schema.as_str();
        let Some(previous) = self.state.previous_version(schema_name, false).await? else {
            return Ok(());
        };
        let previous = self.state.get_migration(schema_name, &previous).await?;
        let previous_schema = previous.version_schema_name(schema_name);
        if !self.manages_version_schema(&previous) || self.db.schema_exists(&previous_schema).await? {
            return Ok(());
        }

        warn!(version_schema = %previous_schema, "previous version schema missing, recreating");
        let live = self.state.read_schema(schema_name).await?;
        self.create_version_schema(&live, &previous_schema).await
    }

    async fn create_version_schema(&self, schema: &Schema, version_schema: &str) -> Result<()> {
        let sql = create_version_schema_sql(schema, version_schema, self.uses_security_invoker());
        self.db.execute(&sql).await?;
        info!(version_schema = %version_schema, "version schema created");
        Ok(())
    }
}
