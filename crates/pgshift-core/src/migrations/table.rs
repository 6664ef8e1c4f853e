//! Table operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{require_field, require_table, ColumnDef, MigrationOperation, OpContext};
use crate::error::{Result, ValidationError};
use crate::schema::{Schema, Table};
use crate::sql::{deleted_name, qualified, quote_ident, quote_list, quote_literal};

/// Create a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTable {
    /// Table name.
    pub name: String,
    /// Columns, in order.
    pub columns: Vec<ColumnDef>,
    /// Table comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CreateTable {
    /// Create a table with the given columns.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
            comment: None,
        }
    }

    fn to_table(&self) -> Table {
        let mut table = Table::new(&self.name);
        for column in &self.columns {
            table.add_column(&column.name, column.to_column(&column.name));
        }
        table.primary_key = self
            .columns
            .iter()
            .filter(|c| c.pk)
            .map(|c| c.name.clone())
            .collect();
        table.comment = self.comment.clone();
        table
    }

    fn create_sql(&self, ctx: &OpContext<'_>) -> Result<String> {
        let mut defs = Vec::with_capacity(self.columns.len() + 1);
        for column in &self.columns {
            defs.push(column.to_sql(ctx, &column.name, false)?);
        }
        let pk: Vec<&str> = self
            .columns
            .iter()
            .filter(|c| c.pk)
            .map(|c| c.name.as_str())
            .collect();
        if !pk.is_empty() {
            defs.push(format!("PRIMARY KEY ({})", quote_list(&pk)));
        }

        let mut sql = format!(
            "CREATE TABLE {} ({})",
            qualified(ctx.schema, &self.name),
            defs.join(", ")
        );
        if let Some(comment) = &self.comment {
            sql.push_str(&format!(
                "; COMMENT ON TABLE {} IS {}",
                qualified(ctx.schema, &self.name),
                quote_literal(comment)
            ));
        }
        for column in &self.columns {
            if let Some(comment) = &column.comment {
                sql.push_str(&format!(
                    "; COMMENT ON COLUMN {}.{} IS {}",
                    qualified(ctx.schema, &self.name),
                    quote_ident(&column.name),
                    quote_literal(comment)
                ));
            }
        }
        Ok(sql)
    }
}

#[async_trait]
impl MigrationOperation for CreateTable {
    fn kind(&self) -> &'static str {
        "create_table"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_field(self.kind(), "name", &self.name)?;
        if schema.get_table(&self.name).is_some() {
            return Err(ValidationError::TableAlreadyExists(self.name.clone()));
        }
        if self.columns.is_empty() {
            return Err(ValidationError::FieldRequired {
                operation: self.kind(),
                field: "columns",
            });
        }
        let mut seen = std::collections::HashSet::new();
        for column in &self.columns {
            require_field(self.kind(), "column name", &column.name)?;
            require_field(self.kind(), "column type", &column.data_type)?;
            if !seen.insert(column.name.as_str()) {
                return Err(ValidationError::ColumnAlreadyExists {
                    table: self.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
        schema.add_table(&self.name, self.to_table());
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        let sql = self.create_sql(ctx)?;
        ctx.db.execute(&sql).await?;
        schema.add_table(&self.name, self.to_table());
        info!(table = %self.name, "table created");
        Ok(None)
    }

    async fn complete(&self, _ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        ctx.db
            .execute(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(ctx.schema, &self.name)
            ))
            .await?;
        Ok(())
    }
}

/// Drop a table.
///
/// The table is renamed aside at start, so the previous version keeps
/// working, and dropped at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropTable {
    /// Table name.
    pub name: String,
}

impl DropTable {
    /// Drop `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl MigrationOperation for DropTable {
    fn kind(&self) -> &'static str {
        "drop_table"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_table(schema, &self.name)?;
        schema.remove_table(&self.name);
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        ctx.db
            .execute(&format!(
                "ALTER TABLE {} RENAME TO {}",
                qualified(ctx.schema, &self.name),
                quote_ident(&deleted_name(&self.name))
            ))
            .await?;
        schema.remove_table(&self.name);
        Ok(None)
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        ctx.db
            .execute(&format!(
                "DROP TABLE IF EXISTS {}",
                qualified(ctx.schema, &deleted_name(&self.name))
            ))
            .await?;
        info!(table = %self.name, "table dropped");
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        ctx.db
            .execute(&format!(
                "ALTER TABLE IF EXISTS {} RENAME TO {}",
                qualified(ctx.schema, &deleted_name(&self.name)),
                quote_ident(&self.name)
            ))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::with_test_context as with_ctx;
    use pretty_assertions::assert_eq;

    fn users() -> CreateTable {
        CreateTable::new(
            "users",
            vec![
                ColumnDef::new("id", "serial").with_pk(true),
                ColumnDef::new("name", "varchar(255)").with_unique(true),
                ColumnDef::new("bio", "text").with_nullable(true),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_table_sql() {
        let sql = with_ctx(|ctx| users().create_sql(ctx).unwrap());
        assert_eq!(
            sql,
            "CREATE TABLE \"public\".\"users\" (\"id\" serial NOT NULL, \
             \"name\" varchar(255) NOT NULL UNIQUE, \"bio\" text, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_create_table_validation() {
        let mut schema = Schema::new("public");
        users().validate(&mut schema).unwrap();
        let table = schema.get_table("users").unwrap();
        assert_eq!(table.primary_key, vec!["id".to_string()]);
        assert_eq!(table.columns.len(), 3);

        assert_eq!(
            users().validate(&mut schema).unwrap_err(),
            ValidationError::TableAlreadyExists("users".to_string())
        );

        let empty = CreateTable::new("empty", vec![]);
        assert!(matches!(
            empty.validate(&mut Schema::new("public")),
            Err(ValidationError::FieldRequired { field: "columns", .. })
        ));
    }

    #[test]
    fn test_drop_table_validation() {
        let mut schema = Schema::new("public").with_table("users", Table::new("users"));
        DropTable::new("users").validate(&mut schema).unwrap();
        assert!(schema.get_table("users").is_none());
        assert_eq!(
            DropTable::new("users").validate(&mut schema).unwrap_err(),
            ValidationError::TableDoesNotExist("users".to_string())
        );
    }
}
