//! Retry-aware execution layer.
//!
//! Every statement issued by pgshift goes through [`Db`]. When PostgreSQL
//! reports `lock_not_available` (the session's `lock_timeout` expired while
//! waiting for a lock) the statement, or the whole transaction body, is
//! retried after an exponentially growing, jittered delay. Any other error is
//! returned immediately. Waiting can be interrupted with the cancellation
//! token held by the [`Db`].

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::{PgConnection, PgPool, Postgres};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::sql::{quote_ident, quote_list};

/// SQLSTATE raised when a lock could not be acquired within `lock_timeout`.
pub const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Default `lock_timeout` for migration sessions.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Default first retry delay.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Default ceiling for the retry delay.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Default fraction of each delay that is randomised.
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.25;

/// Session variable that marks connections owned by pgshift. DDL issued with
/// it set is not captured as an inferred migration.
pub const INTERNAL_SETTING: &str = "pgshift.internal";

/// Exponential backoff policy for lock contention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Fraction (0.0 to 1.0) of the delay subtracted at random.
    pub jitter: f64,
}

impl Backoff {
    /// Create a policy with the given bounds and the default jitter.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }

    /// Set the jitter fraction. Values are clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (zero based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Delay before retry number `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let spread = base.mul_f64(self.jitter);
        let cut = rand::thread_rng().gen_range(Duration::ZERO..=spread);
        base - cut
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX)
    }
}

/// Connection settings for a migration session.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// PostgreSQL connection URL.
    pub url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
    /// `lock_timeout` applied to every connection.
    pub lock_timeout: Duration,
    /// Role assumed with `SET ROLE` after connecting.
    pub role: Option<String>,
    /// Schemas placed on the `search_path`, in order.
    pub search_path: Vec<String>,
    /// Retry policy for lock contention.
    pub backoff: Backoff,
}

impl DbConfig {
    /// Create a configuration for the given connection URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            role: None,
            search_path: Vec::new(),
            backoff: Backoff::default(),
        }
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

    /// Set the search path.
    pub fn with_search_path<I, S>(mut self, schemas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_path = schemas.into_iter().map(Into::into).collect();
        self
    }

    /// Set the retry policy.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Statements run on every new connection.
    pub fn session_statements(&self) -> Vec<String> {
        let mut stmts = vec![
            format!("SET lock_timeout TO '{}ms'", self.lock_timeout.as_millis()),
            format!("SET {INTERNAL_SETTING} TO 'TRUE'"),
        ];
        if let Some(role) = &self.role {
            stmts.push(format!("SET ROLE {}", quote_ident(role)));
        }
        if !self.search_path.is_empty() {
            stmts.push(format!("SET search_path TO {}", quote_list(&self.search_path)));
        }
        stmts
    }
}

/// Whether a driver error is PostgreSQL's `lock_not_available`.
pub fn is_lock_not_available(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_err| db_err.code())
        .is_some_and(|code| code == LOCK_NOT_AVAILABLE)
}

/// Whether a driver error is a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .is_some_and(|db_err| db_err.is_unique_violation())
}

/// Sleep for the backoff delay of `attempt`, or fail if `cancel` fires first.
async fn wait(backoff: &Backoff, cancel: &CancellationToken, attempt: u32) -> Result<()> {
    let delay = backoff.delay(attempt);
    warn!(
        attempt = attempt + 1,
        delay_ms = delay.as_millis() as u64,
        "lock not available, backing off"
    );
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` until it succeeds or fails with an error `should_retry` rejects.
pub async fn retry_with<T, E, F, Fut, P>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<Error>,
    P: Fn(&Error) -> bool,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    let mut attempt = 0u32;
    loop {
        match op().await.map_err(Into::into) {
            Err(err) if should_retry(&err) => {
                debug!(error = %err, "retryable error");
                wait(backoff, cancel, attempt).await?;
                attempt = attempt.saturating_add(1);
            }
            result => return result,
        }
    }
}

/// A connection pool whose calls retry on lock contention.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
    backoff: Backoff,
    cancel: CancellationToken,
}

impl Db {
    /// Connect using `config`, preparing every pooled session for migrations.
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let session = config.session_statements().join("; ");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .after_connect(move |conn, _meta| {
                let session = session.clone();
                Box::pin(async move {
                    sqlx::Executor::execute(conn, sqlx::raw_sql(&session)).await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        info!(
            max_connections = config.max_connections,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            role = ?config.role,
            "connected to database"
        );

        Ok(Self::from_pool(pool, config.backoff))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, backoff: Backoff) -> Self {
        Self {
            pool,
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts pending retries when cancelled.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// The retry policy.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Run `op`, retrying while it fails with `lock_not_available`.
    pub async fn retry<T, E, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<Error>,
    {
        retry_with(&self.backoff, &self.cancel, Error::is_lock_not_available, op).await
    }

    /// Execute one or more SQL statements without parameters.
    pub async fn execute(&self, sql: &str) -> Result<PgQueryResult> {
        debug!(sql, "execute");
        self.retry(|| sqlx::raw_sql(sql).execute(&self.pool)).await
    }

    /// Execute a parameterised statement. `build` is called on every attempt.
    pub async fn exec<'q, F>(&self, mut build: F) -> Result<PgQueryResult>
    where
        F: FnMut() -> sqlx::query::Query<'q, Postgres, PgArguments>,
    {
        self.retry(|| build().execute(&self.pool)).await
    }

    /// Run a parameterised query and collect all rows.
    pub async fn fetch_all<'q, F>(&self, mut build: F) -> Result<Vec<PgRow>>
    where
        F: FnMut() -> sqlx::query::Query<'q, Postgres, PgArguments>,
    {
        self.retry(|| build().fetch_all(&self.pool)).await
    }

    /// Run a parameterised query returning at most one row.
    pub async fn fetch_optional<'q, F>(&self, mut build: F) -> Result<Option<PgRow>>
    where
        F: FnMut() -> sqlx::query::Query<'q, Postgres, PgArguments>,
    {
        self.retry(|| build().fetch_optional(&self.pool)).await
    }

    /// Run `body` in a transaction.
    ///
    /// On `lock_not_available` the transaction is rolled back and `body` runs
    /// again from scratch in a new one. Any other error rolls back and is
    /// returned.
    pub async fn with_transaction<T, F>(&self, mut body: F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut attempt = 0u32;
        loop {
            let result = self.run_transaction(&mut body).await;
            match result {
                Err(err) if err.is_lock_not_available() => {
                    wait(&self.backoff, &self.cancel, attempt).await?;
                    attempt = attempt.saturating_add(1);
                }
                result => return result,
            }
        }
    }

    async fn run_transaction<T, F>(&self, body: &mut F) -> Result<T>
    where
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut tx = self.pool.begin().await?;
        match body(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "transaction rollback failed");
                }
                Err(err)
            }
        }
    }

    /// `server_version_num` of the connected server (e.g. 150004).
    pub async fn server_version_num(&self) -> Result<i32> {
        self.retry(|| {
            sqlx::query_scalar::<_, i32>("SELECT current_setting('server_version_num')::int")
                .fetch_one(&self.pool)
        })
        .await
    }

    /// Whether a namespace called `name` exists.
    pub async fn schema_exists(&self, name: &str) -> Result<bool> {
        self.retry(|| {
            sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1)",
            )
            .bind(name)
            .fetch_one(&self.pool)
        })
        .await
    }

    /// Close the pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
