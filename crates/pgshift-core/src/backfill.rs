//! Batched backfill.
//!
//! Existing rows are touched in primary-key order with a no-op `UPDATE`,
//! which fires the triggers installed at start and so computes new column
//! values. Each batch is its own transaction: an interrupted backfill keeps
//! the batches already committed, and only one batch of rows is locked at a
//! time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info, instrument};

use crate::db::Db;
use crate::error::{Error, Result};
use crate::schema::Table;
use crate::sql::{qualified, quote_ident};

/// Default number of rows per batch.
pub const DEFAULT_BATCH_SIZE: u32 = 1000;

/// Default pause between batches.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::ZERO;

/// Progress callback, called with `(rows_done, rows_total)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Configuration for backfill execution.
#[derive(Clone)]
pub struct BackfillConfig {
    /// Rows per batch.
    pub batch_size: u32,
    /// Pause between batches, to yield to application writes.
    pub batch_delay: Duration,
    callbacks: Vec<ProgressCallback>,
}

impl BackfillConfig {
    /// Create a configuration with default batch settings.
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            callbacks: Vec::new(),
        }
    }

    /// Set the number of rows per batch.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the pause between batches.
    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    /// Register a progress callback.
    pub fn with_progress_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(u64, u64) + Send + Sync + 'static,
    {
        self.callbacks.push(Arc::new(callback));
        self
    }

    fn notify(&self, done: u64, total: u64) {
        for callback in &self.callbacks {
            callback(done, total);
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BackfillConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackfillConfig")
            .field("batch_size", &self.batch_size)
            .field("batch_delay", &self.batch_delay)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

/// Outcome of a backfill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillProgress {
    /// Table that was backfilled.
    pub table: String,
    /// Rows updated.
    pub rows_done: u64,
    /// Estimated rows in the table when the backfill started.
    pub rows_total: u64,
    /// Non-empty batches processed.
    pub batches: u64,
}

/// Runs backfills over the tables reported by a migration's start phase.
#[derive(Debug, Clone)]
pub struct Backfill {
    db: Db,
    config: BackfillConfig,
}

impl Backfill {
    /// Create a backfill runner.
    pub fn new(db: Db, config: BackfillConfig) -> Self {
        Self { db, config }
    }

    /// Backfill every row of `table` in `schema`.
    #[instrument(skip(self, table), fields(table = %table.name))]
    pub async fn run(&self, schema: &str, table: &Table) -> Result<BackfillProgress> {
        let batch = BatchStatement::for_table(schema, table)?;
        let total = self.estimate_rows(schema, &table.name).await?;
        let mut progress = BackfillProgress {
            table: table.name.clone(),
            rows_total: total,
            ..Default::default()
        };

        info!(estimated_rows = total, batch_size = self.config.batch_size, "starting backfill");

        let mut cursor: Option<Vec<String>> = None;
        loop {
            let (count, last) = self.run_batch(&batch, cursor.as_deref()).await?;
            if count > 0 {
                progress.rows_done += count;
                progress.batches += 1;
                progress.rows_total = progress.rows_total.max(progress.rows_done);
                self.config.notify(progress.rows_done, progress.rows_total);
                debug!(batch = progress.batches, rows = count, "batch complete");
            }

            if count < u64::from(self.config.batch_size) {
                break;
            }
            cursor = last;

            if !self.config.batch_delay.is_zero() {
                tokio::select! {
                    _ = self.db.cancellation_token().cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                }
            }
        }

        info!(rows = progress.rows_done, batches = progress.batches, "backfill complete");
        Ok(progress)
    }

    async fn estimate_rows(&self, schema: &str, table: &str) -> Result<u64> {
        let relation = qualified(schema, table);
        let row = self
            .db
            .fetch_optional(|| {
                sqlx::query("SELECT reltuples::bigint FROM pg_catalog.pg_class WHERE oid = to_regclass($1)")
                    .bind(&relation)
            })
            .await?;
        let estimate = match row {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => -1,
        };
        if estimate > 0 {
            return Ok(estimate as u64);
        }

        // Never analyzed; count instead.
        let sql = format!("SELECT count(*) FROM {relation}");
        let row = self
            .db
            .fetch_optional(|| sqlx::query(&sql))
            .await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn run_batch(
        &self,
        batch: &BatchStatement,
        cursor: Option<&[String]>,
    ) -> Result<(u64, Option<Vec<String>>)> {
        let sql = batch.sql(cursor.is_some());
        let cursor = cursor.map(<[String]>::to_vec).unwrap_or_default();
        let limit = i64::from(self.config.batch_size);

        self.db
            .with_transaction(move |conn| {
                let sql = sql.clone();
                let cursor = cursor.clone();
                Box::pin(async move {
                    let mut query = sqlx::query(&sql).bind(limit);
                    for value in &cursor {
                        query = query.bind(value);
                    }
                    let row: PgRow = query.fetch_one(&mut *conn).await?;
                    let count: i64 = row.try_get("updated")?;
                    let last: Option<Vec<String>> = row.try_get("last_key")?;
                    Ok((count.max(0) as u64, last))
                })
            })
            .await
    }
}

/// The batch `UPDATE` for one table.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchStatement {
    table: String,
    key_columns: Vec<String>,
    key_types: Vec<String>,
}

impl BatchStatement {
    fn for_table(schema: &str, table: &Table) -> Result<Self> {
        if table.primary_key.is_empty() {
            return Err(Error::Backfill {
                table: table.name.clone(),
                reason: "table has no primary key".to_string(),
            });
        }
        let key_types = table.primary_key_types().ok_or_else(|| Error::Backfill {
            table: table.name.clone(),
            reason: "primary key column missing from schema".to_string(),
        })?;
        Ok(Self {
            table: qualified(schema, &table.name),
            key_columns: table.primary_key.iter().map(|c| quote_ident(c)).collect(),
            key_types: key_types.into_iter().map(str::to_string).collect(),
        })
    }

    /// `$1` is the batch size; with a cursor, `$2..` are the last key's
    /// columns as text.
    fn sql(&self, with_cursor: bool) -> String {
        let keys = self.key_columns.join(", ");
        let qualified_keys = |alias: &str| {
            self.key_columns
                .iter()
                .map(|c| format!("{alias}.{c}"))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let filter = if with_cursor {
            let params = self
                .key_types
                .iter()
                .enumerate()
                .map(|(i, ty)| format!("${}::{}", i + 2, ty))
                .collect::<Vec<_>>()
                .join(", ");
            format!("WHERE ({keys}) > ({params}) ")
        } else {
            String::new()
        };
        let descending = self
            .key_columns
            .iter()
            .map(|c| format!("{c} DESC"))
            .collect::<Vec<_>>()
            .join(", ");
        let last_key = self
            .key_columns
            .iter()
            .map(|c| format!("{c}::text"))
            .collect::<Vec<_>>()
            .join(", ");
        let set = self
            .key_columns
            .iter()
            .map(|c| format!("{c} = t.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "WITH batch AS ( \
                 SELECT {keys} FROM {table} {filter}ORDER BY {keys} LIMIT $1 FOR NO KEY UPDATE \
             ), updated AS ( \
                 UPDATE {table} AS t SET {set} FROM batch \
                 WHERE ({t_keys}) = ({b_keys}) RETURNING {t_keys} \
             ) \
             SELECT (SELECT count(*) FROM updated) AS updated, \
                    (SELECT ARRAY[{last_key}] FROM updated ORDER BY {descending} LIMIT 1) AS last_key",
            table = self.table,
            t_keys = qualified_keys("t"),
            b_keys = qualified_keys("batch"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn table() -> Table {
        Table::new("users")
            .with_column(Column::new("id", "integer").with_nullable(false))
            .with_column(Column::new("name", "text"))
            .with_primary_key(["id"])
    }

    #[test]
    fn test_config_builder() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let config = BackfillConfig::new()
            .with_batch_size(0)
            .with_batch_delay(Duration::from_millis(5))
            .with_progress_callback(move |done, _| seen_cb.store(done, Ordering::SeqCst));

        assert_eq!(config.batch_size, 1);
        assert_eq!(config.batch_delay, Duration::from_millis(5));
        config.notify(42, 100);
        assert_eq!(seen.load(Ordering::SeqCst), 42);

        let config = BackfillConfig::default();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert!(config.batch_delay.is_zero());
    }

    #[test]
    fn test_requires_primary_key() {
        let table = Table::new("logs").with_column(Column::new("line", "text"));
        assert!(matches!(
            BatchStatement::for_table("public", &table),
            Err(Error::Backfill { .. })
        ));
    }

    #[test]
    fn test_batch_sql_without_cursor() {
        let stmt = BatchStatement::for_table("public", &table()).unwrap();
        let sql = stmt.sql(false);
        assert!(sql.contains("SELECT \"id\" FROM \"public\".\"users\" ORDER BY \"id\" LIMIT $1 FOR NO KEY UPDATE"));
        assert!(sql.contains("SET \"id\" = t.\"id\""));
        assert!(!sql.contains("$2"));
    }

    #[test]
    fn test_batch_sql_with_composite_cursor() {
        let table = Table::new("events")
            .with_column(Column::new("tenant", "uuid"))
            .with_column(Column::new("seq", "bigint"))
            .with_primary_key(["tenant", "seq"]);
        let stmt = BatchStatement::for_table("app", &table).unwrap();
        let sql = stmt.sql(true);
        assert!(sql.contains("WHERE (\"tenant\", \"seq\") > ($2::uuid, $3::bigint)"));
        assert!(sql.contains("ORDER BY \"tenant\" DESC, \"seq\" DESC LIMIT 1"));
        assert_eq!(stmt.key_types, vec!["uuid".to_string(), "bigint".to_string()]);
    }
}
