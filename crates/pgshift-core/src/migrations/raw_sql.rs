//! Raw SQL escape hatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{require_field, MigrationOperation, OpContext};
use crate::error::{Result, ValidationError};
use crate::schema::{Schema, Table};

/// Run arbitrary SQL.
///
/// Its effect on the schema is unknown, so the live schema is read again
/// after it runs. Unless deferred to completion it must be the only
/// operation in its migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSql {
    /// SQL run at start, or at completion with `on_complete`.
    pub up: String,
    /// SQL undoing `up`, run on rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
    /// Run `up` at completion instead of start.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub on_complete: bool,
}

impl RawSql {
    /// Run `up` at start.
    pub fn new(up: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: None,
            on_complete: false,
        }
    }

    /// Set the rollback SQL.
    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }

    /// Defer `up` to completion.
    pub fn with_on_complete(mut self, on_complete: bool) -> Self {
        self.on_complete = on_complete;
        self
    }
}

#[async_trait]
impl MigrationOperation for RawSql {
    fn kind(&self) -> &'static str {
        "sql"
    }

    fn validate(&self, _schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_field(self.kind(), "up", &self.up)?;
        if self.on_complete && self.down.is_some() {
            return Err(ValidationError::InvalidOperation {
                operation: self.kind(),
                reason: "down cannot be combined with on_complete",
            });
        }
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, _schema: &mut Schema) -> Result<Option<Table>> {
        if !self.on_complete {
            ctx.db.execute(&ctx.transform(&self.up)?).await?;
        }
        Ok(None)
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        if self.on_complete {
            ctx.db.execute(&ctx.transform(&self.up)?).await?;
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        if let Some(down) = &self.down {
            ctx.db.execute(&ctx.transform(down)?).await?;
        }
        Ok(())
    }

    fn requires_schema_refresh(&self) -> bool {
        true
    }

    fn is_isolated(&self) -> bool {
        !self.on_complete
    }
}
