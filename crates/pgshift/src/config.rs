//! Orchestrator configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use pgshift_core::db::{DEFAULT_LOCK_TIMEOUT, DEFAULT_MAX_CONNECTIONS};
use pgshift_core::state::DEFAULT_STATE_SCHEMA;
use pgshift_core::{Backoff, BackfillConfig, DbConfig, NoopTransformer, SqlTransformer};
use tokio_util::sync::CancellationToken;

use crate::hooks::{HookPhase, Hooks, MigrationHook};

/// Default schema migrations apply to.
pub const DEFAULT_SCHEMA: &str = "public";

/// First server version (`server_version_num`) supporting `security_invoker` views.
pub const SECURITY_INVOKER_MIN_VERSION: i32 = 150000;

/// Configuration for a [`Roll`](crate::Roll).
#[derive(Clone)]
pub struct RollConfig {
    /// PostgreSQL connection URL.
    pub url: String,

    /// Schema migrations apply to.
    pub schema: String,

    /// Schema holding the migration ledger.
    pub state_schema: String,

    /// Maximum pooled connections.
    pub max_connections: u32,

    /// `lock_timeout` for every statement pgshift runs.
    pub lock_timeout: Duration,

    /// Role assumed after connecting.
    pub role: Option<String>,

    /// Schemas appended to the search path after the target schema.
    pub search_path: Vec<String>,

    /// Retry policy for lock contention.
    pub backoff: Backoff,

    /// Skip creating version schemas.
    pub disable_version_schemas: bool,

    /// Skip the version schema for migrations made only of raw SQL.
    pub no_version_schema_for_raw_sql: bool,

    /// Skip validation before starting a migration.
    pub skip_validation: bool,

    /// Backfill batching.
    pub backfill: BackfillConfig,

    /// Lifecycle hooks.
    pub hooks: Hooks,

    /// Rewrites user-supplied SQL.
    pub transformer: Arc<dyn SqlTransformer>,

    /// Cancels pending retries and backfill delays.
    pub cancel: CancellationToken,
}

impl RollConfig {
    /// Create a configuration for the given connection URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            schema: DEFAULT_SCHEMA.to_string(),
            state_schema: DEFAULT_STATE_SCHEMA.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            role: None,
            search_path: Vec::new(),
            backoff: Backoff::default(),
            disable_version_schemas: false,
            no_version_schema_for_raw_sql: false,
            skip_validation: false,
            backfill: BackfillConfig::default(),
            hooks: Hooks::default(),
            transformer: Arc::new(NoopTransformer),
            cancel: CancellationToken::new(),
        }
    }

    /// Set the target schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Set the state schema.
    pub fn with_state_schema(mut self, state_schema: impl Into<String>) -> Self {
        self.state_schema = state_schema.into();
        self
    }

    /// Set the maximum pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the role to assume.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Append schemas to the search path.
    pub fn with_search_path<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_path.extend(schemas.into_iter().map(Into::into));
        self
    }

    /// Set the retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Disable version schemas.
    pub fn without_version_schemas(mut self) -> Self {
        self.disable_version_schemas = true;
        self
    }

    /// Skip version schemas for raw SQL only migrations.
    pub fn without_version_schema_for_raw_sql(mut self) -> Self {
        self.no_version_schema_for_raw_sql = true;
        self
    }

    /// Skip validation.
    pub fn without_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    /// Set the backfill configuration.
    pub fn with_backfill(mut self, backfill: BackfillConfig) -> Self {
        self.backfill = backfill;
        self
    }

    /// Register a hook.
    pub fn with_hook(mut self, phase: HookPhase, hook: Arc<dyn MigrationHook>) -> Self {
        self.hooks.register(phase, hook);
        self
    }

    /// Set the SQL transformer.
    pub fn with_transformer(mut self, transformer: Arc<dyn SqlTransformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Set the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Whether a role is configured.
    pub fn has_role(&self) -> bool {
        self.role.is_some()
    }

    /// Connection settings: the target schema first on the search path.
    pub fn db_config(&self) -> DbConfig {
        let mut config = DbConfig::new(self.url.clone())
            .with_max_connections(self.max_connections)
            .with_lock_timeout(self.lock_timeout)
            .with_search_path(
                std::iter::once(self.schema.clone()).chain(self.search_path.iter().cloned()),
            )
            .with_backoff(self.backoff);
        if let Some(role) = &self.role {
            config = config.with_role(role.clone());
        }
        config
    }
}

impl fmt::Debug for RollConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollConfig")
            .field("schema", &self.schema)
            .field("state_schema", &self.state_schema)
            .field("max_connections", &self.max_connections)
            .field("lock_timeout", &self.lock_timeout)
            .field("role", &self.role)
            .field("search_path", &self.search_path)
            .field("backoff", &self.backoff)
            .field("disable_version_schemas", &self.disable_version_schemas)
            .field("no_version_schema_for_raw_sql", &self.no_version_schema_for_raw_sql)
            .field("skip_validation", &self.skip_validation)
            .field("backfill", &self.backfill)
            .field("hooks", &self.hooks)
            .finish_non_exhaustive()
    }
}
