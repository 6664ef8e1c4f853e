//! Column operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    physical_column, require_field, require_table, ColumnDef, MigrationOperation, OpContext,
};
use crate::error::{Result, ValidationError};
use crate::schema::{Schema, Table};
use crate::sql::{
    check_constraint_name, drop_sync_trigger_sql, new_column_name, not_null_constraint_name,
    qualified, quote_ident, rewrite_column_references, sync_trigger_sql,
};

/// Add a column.
///
/// At start the column is created under a temporary name, invisible to the
/// previous version. Rows written through the previous version get the
/// column computed from `up` by a trigger, and existing rows are backfilled
/// the same way. `NOT NULL` and the check are enforced on new writes through
/// `NOT VALID` constraints on the temporary column. Completion validates
/// them, renames the column into place and turns the not-null check into a
/// real `NOT NULL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddColumn {
    /// Table to alter.
    pub table: String,
    /// The new column.
    pub column: ColumnDef,
    /// Expression computing the column from the rest of the row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<String>,
}

impl AddColumn {
    /// Add `column` to `table`.
    pub fn new(table: impl Into<String>, column: ColumnDef) -> Self {
        Self {
            table: table.into(),
            column,
            up: None,
        }
    }

    /// Set the expression used to fill the column.
    pub fn with_up(mut self, up: impl Into<String>) -> Self {
        self.up = Some(up.into());
        self
    }

    fn shadow_name(&self) -> String {
        new_column_name(&self.column.name)
    }

    /// `ADD CONSTRAINT` clauses enforcing the column's constraints on new
    /// writes only.
    fn pending_constraints(&self, ctx: &OpContext<'_>) -> Result<Vec<String>> {
        let shadow = self.shadow_name();
        let mut clauses = Vec::new();
        if !self.column.nullable {
            clauses.push(format!(
                "ADD CONSTRAINT {} CHECK ({} IS NOT NULL) NOT VALID",
                quote_ident(&not_null_constraint_name(&self.column.name)),
                quote_ident(&shadow)
            ));
        }
        if let Some(check) = &self.column.check {
            let check = ctx.transform(check)?;
            clauses.push(format!(
                "ADD CONSTRAINT {} CHECK ({}) NOT VALID",
                quote_ident(&check_constraint_name(&self.column.name)),
                rewrite_column_references(&check, &self.column.name, &shadow)
            ));
        }
        Ok(clauses)
    }
}

#[async_trait]
impl MigrationOperation for AddColumn {
    fn kind(&self) -> &'static str {
        "add_column"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_field(self.kind(), "column name", &self.column.name)?;
        require_field(self.kind(), "column type", &self.column.data_type)?;
        let table = require_table(schema, &self.table)?;
        if table.get_column(&self.column.name).is_some() {
            return Err(ValidationError::ColumnAlreadyExists {
                table: self.table.clone(),
                column: self.column.name.clone(),
            });
        }
        if self.column.pk {
            return Err(ValidationError::InvalidOperation {
                operation: self.kind(),
                reason: "a new column cannot join the primary key",
            });
        }
        if !self.column.nullable && self.column.default.is_none() && self.up.is_none() {
            return Err(ValidationError::FieldRequired {
                operation: self.kind(),
                field: "up",
            });
        }
        if self.up.is_some() && table.primary_key.is_empty() {
            return Err(ValidationError::NoPrimaryKey(self.table.clone()));
        }
        table.add_column(&self.column.name, self.column.to_column(&self.shadow_name()));
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        let shadow = self.shadow_name();
        let mut clauses = vec![format!("ADD COLUMN {}", self.column.to_sql(ctx, &shadow, true)?)];
        clauses.extend(self.pending_constraints(ctx)?);
        ctx.db
            .execute(&format!(
                "ALTER TABLE {} {}",
                qualified(ctx.schema, &self.table),
                clauses.join(", ")
            ))
            .await?;

        if let Some(up) = &self.up {
            let up = ctx.transform(up)?;
            ctx.db
                .execute(&sync_trigger_sql(
                    ctx.schema,
                    &self.table,
                    &shadow,
                    &shadow,
                    &up,
                    ctx.version_schema,
                    false,
                ))
                .await?;
        }

        let Some(table) = schema.get_table_mut(&self.table) else {
            return Ok(None);
        };
        table.add_column(&self.column.name, self.column.to_column(&shadow));
        info!(table = %self.table, column = %self.column.name, "column added");

        Ok(self.up.as_ref().map(|_| table.clone()))
    }

    async fn prepare_complete(&self, ctx: &OpContext<'_>) -> Result<()> {
        let table = qualified(ctx.schema, &self.table);
        let mut constraints = Vec::new();
        if !self.column.nullable {
            constraints.push(not_null_constraint_name(&self.column.name));
        }
        if self.column.check.is_some() {
            constraints.push(check_constraint_name(&self.column.name));
        }
        for constraint in constraints {
            ctx.db
                .execute(&format!(
                    "ALTER TABLE {table} VALIDATE CONSTRAINT {}",
                    quote_ident(&constraint)
                ))
                .await?;
        }
        Ok(())
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        let table = qualified(ctx.schema, &self.table);
        let column = quote_ident(&self.column.name);
        if self.up.is_some() {
            ctx.db
                .execute(&drop_sync_trigger_sql(ctx.schema, &self.table, &self.shadow_name()))
                .await?;
        }
        ctx.db
            .execute(&format!(
                "ALTER TABLE {table} RENAME COLUMN {} TO {column}",
                quote_ident(&self.shadow_name())
            ))
            .await?;
        if !self.column.nullable {
            // The validated check lets SET NOT NULL skip the table scan.
            ctx.db
                .execute(&format!(
                    "ALTER TABLE {table} ALTER COLUMN {column} SET NOT NULL, DROP CONSTRAINT IF EXISTS {}",
                    quote_ident(&not_null_constraint_name(&self.column.name))
                ))
                .await?;
        }
        if self.column.check.is_some() {
            ctx.db
                .execute(&format!(
                    "ALTER TABLE {table} RENAME CONSTRAINT {} TO {}",
                    quote_ident(&check_constraint_name(&self.column.name)),
                    quote_ident(&format!("{}_{}_check", self.table, self.column.name))
                ))
                .await?;
        }
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        ctx.db
            .execute(&drop_sync_trigger_sql(ctx.schema, &self.table, &self.shadow_name()))
            .await?;
        // A failed completion may already have renamed the column into place.
        // Its constraints go with it.
        ctx.db
            .execute(&format!(
                "ALTER TABLE IF EXISTS {} DROP COLUMN IF EXISTS {}, DROP COLUMN IF EXISTS {}",
                qualified(ctx.schema, &self.table),
                quote_ident(&self.shadow_name()),
                quote_ident(&self.column.name)
            ))
            .await?;
        Ok(())
    }
}

/// Drop a column.
///
/// The column disappears from the new version at start and is dropped at
/// completion. With `down`, rows written through the new version still get
/// the column filled for readers of the previous version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropColumn {
    /// Table to alter.
    pub table: String,
    /// Column to drop.
    pub column: String,
    /// Expression computing the dropped column for rows written by the new version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<String>,
}

impl DropColumn {
    /// Drop `column` from `table`.
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            down: None,
        }
    }

    /// Set the expression used to fill the column for the previous version.
    pub fn with_down(mut self, down: impl Into<String>) -> Self {
        self.down = Some(down.into());
        self
    }
}

#[async_trait]
impl MigrationOperation for DropColumn {
    fn kind(&self) -> &'static str {
        "drop_column"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        let table = require_table(schema, &self.table)?;
        if table.remove_column(&self.column).is_none() {
            return Err(ValidationError::ColumnDoesNotExist {
                table: self.table.clone(),
                column: self.column.clone(),
            });
        }
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        // An earlier rename in the same migration means the physical column
        // still has its old name.
        let physical = physical_column(schema, &self.table, &self.column).to_string();
        if let Some(down) = &self.down {
            let down = ctx.transform(down)?;
            ctx.db
                .execute(&sync_trigger_sql(
                    ctx.schema,
                    &self.table,
                    &self.column,
                    &physical,
                    &down,
                    ctx.version_schema,
                    true,
                ))
                .await?;
        }
        if let Some(table) = schema.get_table_mut(&self.table) {
            table.remove_column(&self.column);
        }
        Ok(None)
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        if self.down.is_some() {
            ctx.db
                .execute(&drop_sync_trigger_sql(ctx.schema, &self.table, &self.column))
                .await?;
        }
        // Earlier operations have completed by now, so the column carries
        // the name this operation knows it by.
        ctx.db
            .execute(&format!(
                "ALTER TABLE {} DROP COLUMN IF EXISTS {}",
                qualified(ctx.schema, &self.table),
                quote_ident(&self.column)
            ))
            .await?;
        info!(table = %self.table, column = %self.column, "column dropped");
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        if self.down.is_some() {
            ctx.db
                .execute(&drop_sync_trigger_sql(ctx.schema, &self.table, &self.column))
                .await?;
        }
        Ok(())
    }
}

/// Rename a column.
///
/// Only the new version sees the new name until completion renames the
/// physical column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameColumn {
    /// Table to alter.
    pub table: String,
    /// Current column name.
    pub from: String,
    /// New column name.
    pub to: String,
}

impl RenameColumn {
    /// Rename `from` to `to` on `table`.
    pub fn new(table: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    fn rename(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        let table = require_table(schema, &self.table)?;
        if table.get_column(&self.to).is_some() {
            return Err(ValidationError::ColumnAlreadyExists {
                table: self.table.clone(),
                column: self.to.clone(),
            });
        }
        if !table.rename_column(&self.from, &self.to) {
            return Err(ValidationError::ColumnDoesNotExist {
                table: self.table.clone(),
                column: self.from.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MigrationOperation for RenameColumn {
    fn kind(&self) -> &'static str {
        "rename_column"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_field(self.kind(), "to", &self.to)?;
        self.rename(schema)
    }

    async fn start(&self, _ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        self.rename(schema)?;
        Ok(None)
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        ctx.db
            .execute(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                qualified(ctx.schema, &self.table),
                quote_ident(&self.from),
                quote_ident(&self.to)
            ))
            .await?;
        Ok(())
    }

    async fn rollback(&self, _ctx: &OpContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::with_test_context as with_ctx;
    use crate::schema::Column;
    use pretty_assertions::assert_eq;

    fn users() -> Schema {
        Schema::new("public").with_table(
            "users",
            Table::new("users")
                .with_column(Column::new("id", "integer").with_nullable(false))
                .with_column(Column::new("name", "text"))
                .with_primary_key(["id"]),
        )
    }

    #[test]
    fn test_add_column_exposes_shadow_column() {
        let mut schema = users();
        AddColumn::new("users", ColumnDef::new("email", "text"))
            .with_up("name || '@example.com'")
            .validate(&mut schema)
            .unwrap();
        let column = schema.get_table("users").unwrap().get_column("email").unwrap();
        assert_eq!(column.name, "_pgshift_new_email");
    }

    #[test]
    fn test_add_not_null_column_requires_up_or_default() {
        let mut schema = users();
        assert_eq!(
            AddColumn::new("users", ColumnDef::new("email", "text"))
                .validate(&mut schema)
                .unwrap_err(),
            ValidationError::FieldRequired {
                operation: "add_column",
                field: "up"
            }
        );
        assert!(AddColumn::new("users", ColumnDef::new("email", "text").with_default("''"))
            .validate(&mut schema)
            .is_ok());
    }

    #[test]
    fn test_add_column_backfill_needs_primary_key() {
        let mut schema = Schema::new("public")
            .with_table("logs", Table::new("logs").with_column(Column::new("line", "text")));
        assert_eq!(
            AddColumn::new("logs", ColumnDef::new("level", "text").with_nullable(true))
                .with_up("'info'")
                .validate(&mut schema)
                .unwrap_err(),
            ValidationError::NoPrimaryKey("logs".to_string())
        );
    }

    #[test]
    fn test_add_existing_column_fails() {
        let mut schema = users();
        assert!(matches!(
            AddColumn::new("users", ColumnDef::new("name", "text").with_nullable(true))
                .validate(&mut schema),
            Err(ValidationError::ColumnAlreadyExists { .. })
        ));
        assert_eq!(
            AddColumn::new("missing", ColumnDef::new("x", "text").with_nullable(true))
                .validate(&mut schema)
                .unwrap_err(),
            ValidationError::TableDoesNotExist("missing".to_string())
        );
    }

    #[tokio::test]
    async fn test_add_column_constraints_target_shadow_column() {
        let op = AddColumn::new(
            "users",
            ColumnDef::new("email", "text").with_check("email <> ''"),
        )
        .with_up("name || '@example.com'");
        let (column_sql, constraints) = with_ctx(|ctx| {
            (
                op.column.to_sql(ctx, &op.shadow_name(), true).unwrap(),
                op.pending_constraints(ctx).unwrap(),
            )
        });

        assert_eq!(column_sql, "\"_pgshift_new_email\" text");
        assert_eq!(
            constraints,
            vec![
                "ADD CONSTRAINT \"_pgshift_not_null_email\" \
                 CHECK (\"_pgshift_new_email\" IS NOT NULL) NOT VALID"
                    .to_string(),
                "ADD CONSTRAINT \"_pgshift_check_email\" \
                 CHECK (\"_pgshift_new_email\" <> '') NOT VALID"
                    .to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_nullable_add_column_has_no_pending_constraints() {
        let op = AddColumn::new("users", ColumnDef::new("email", "text").with_nullable(true));
        assert!(with_ctx(|ctx| op.pending_constraints(ctx).unwrap()).is_empty());
    }

    #[test]
    fn test_drop_column_hides_column() {
        let mut schema = users();
        DropColumn::new("users", "name").validate(&mut schema).unwrap();
        assert!(schema.get_table("users").unwrap().get_column("name").is_none());
        assert!(DropColumn::new("users", "name").validate(&mut schema).is_err());
    }

    #[test]
    fn test_rename_column() {
        let mut schema = users();
        RenameColumn::new("users", "name", "full_name")
            .validate(&mut schema)
            .unwrap();
        let table = schema.get_table("users").unwrap();
        assert_eq!(table.get_column("full_name").unwrap().name, "name");

        assert!(matches!(
            RenameColumn::new("users", "id", "full_name").validate(&mut schema),
            Err(ValidationError::ColumnAlreadyExists { .. })
        ));
    }

    #[test]
    fn test_serde_shape() {
        let op = AddColumn::new("users", ColumnDef::new("email", "text").with_nullable(true))
            .with_up("'x'");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "table": "users",
                "column": {"name": "email", "type": "text", "nullable": true, "pk": false, "unique": false},
                "up": "'x'"
            })
        );
    }
}
