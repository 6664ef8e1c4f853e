//! Index operations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{require_field, require_table, MigrationOperation, OpContext};
use crate::error::{Result, ValidationError};
use crate::schema::{Index, Schema, Table};
use crate::sql::{qualified, quote_ident, quote_list};

/// Create an index without blocking writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateIndex {
    /// Index name.
    pub name: String,
    /// Table to index.
    pub table: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Enforce uniqueness.
    #[serde(default)]
    pub unique: bool,
}

impl CreateIndex {
    /// Index `columns` of `table`.
    pub fn new<I, S>(name: impl Into<String>, table: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            table: table.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Make the index unique.
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Physical names of the indexed columns.
    fn physical_columns(&self, table: &Table) -> std::result::Result<Vec<String>, ValidationError> {
        self.columns
            .iter()
            .map(|column| {
                table
                    .get_column(column)
                    .map(|c| c.name.clone())
                    .ok_or_else(|| ValidationError::ColumnDoesNotExist {
                        table: self.table.clone(),
                        column: column.clone(),
                    })
            })
            .collect()
    }

    fn to_index(&self, columns: Vec<String>) -> Index {
        Index {
            name: self.name.clone(),
            unique: self.unique,
            columns,
        }
    }
}

#[async_trait]
impl MigrationOperation for CreateIndex {
    fn kind(&self) -> &'static str {
        "create_index"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        require_field(self.kind(), "name", &self.name)?;
        if self.columns.is_empty() {
            return Err(ValidationError::FieldRequired {
                operation: self.kind(),
                field: "columns",
            });
        }
        if schema.find_index(&self.name).is_some() {
            return Err(ValidationError::IndexAlreadyExists(self.name.clone()));
        }
        let table = require_table(schema, &self.table)?;
        let columns = self.physical_columns(table)?;
        table.indexes.insert(self.name.clone(), self.to_index(columns));
        Ok(())
    }

    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        let columns = match schema.get_table(&self.table) {
            Some(table) => self.physical_columns(table)?,
            None => self.columns.clone(),
        };
        ctx.db
            .execute(&format!(
                "CREATE {}INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({})",
                if self.unique { "UNIQUE " } else { "" },
                quote_ident(&self.name),
                qualified(ctx.schema, &self.table),
                quote_list(&columns)
            ))
            .await?;
        if let Some(table) = schema.get_table_mut(&self.table) {
            table.indexes.insert(self.name.clone(), self.to_index(columns));
        }
        info!(index = %self.name, table = %self.table, "index created");
        Ok(None)
    }

    async fn complete(&self, _ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()> {
        ctx.db
            .execute(&format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {}",
                qualified(ctx.schema, &self.name)
            ))
            .await?;
        Ok(())
    }
}

/// Drop an index at completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIndex {
    /// Index name.
    pub name: String,
}

impl DropIndex {
    /// Drop `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn remove(&self, schema: &mut Schema) -> bool {
        let owner = schema
            .find_index(&self.name)
            .map(|(table, _)| table.to_string());
        match owner.and_then(|table| schema.get_table_mut(&table)) {
            Some(table) => table.indexes.remove(&self.name).is_some(),
            None => false,
        }
    }
}

#[async_trait]
impl MigrationOperation for DropIndex {
    fn kind(&self) -> &'static str {
        "drop_index"
    }

    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError> {
        if !self.remove(schema) {
            return Err(ValidationError::IndexDoesNotExist(self.name.clone()));
        }
        Ok(())
    }

    async fn start(&self, _ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>> {
        self.remove(schema);
        Ok(None)
    }

    async fn complete(&self, ctx: &OpContext<'_>, _schema: &Schema) -> Result<()> {
        ctx.db
            .execute(&format!(
                "DROP INDEX CONCURRENTLY IF EXISTS {}",
                qualified(ctx.schema, &self.name)
            ))
            .await?;
        info!(index = %self.name, "index dropped");
        Ok(())
    }

    async fn rollback(&self, _ctx: &OpContext<'_>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use pretty_assertions::assert_eq;

    fn users() -> Schema {
        let mut table = Table::new("users")
            .with_column(Column::new("id", "integer"))
            .with_column(Column::new("name", "text"))
            .with_primary_key(["id"]);
        table.add_column("email", Column::new("_pgshift_new_email", "text"));
        Schema::new("public").with_table("users", table)
    }

    #[test]
    fn test_create_index_uses_physical_columns() {
        let mut schema = users();
        CreateIndex::new("idx_users_email", "users", ["email"])
            .validate(&mut schema)
            .unwrap();
        let (table, index) = schema.find_index("idx_users_email").unwrap();
        assert_eq!(table, "users");
        assert_eq!(index.columns, vec!["_pgshift_new_email".to_string()]);
    }

    #[test]
    fn test_create_index_validation() {
        let mut schema = users();
        assert_eq!(
            CreateIndex::new("idx", "users", ["missing"])
                .validate(&mut schema)
                .unwrap_err(),
            ValidationError::ColumnDoesNotExist {
                table: "users".to_string(),
                column: "missing".to_string(),
            }
        );
        CreateIndex::new("idx", "users", ["name"]).validate(&mut schema).unwrap();
        assert_eq!(
            CreateIndex::new("idx", "users", ["id"])
                .validate(&mut schema)
                .unwrap_err(),
            ValidationError::IndexAlreadyExists("idx".to_string())
        );
    }

    #[test]
    fn test_drop_index_validation() {
        let mut schema = users();
        CreateIndex::new("idx", "users", ["name"]).validate(&mut schema).unwrap();
        DropIndex::new("idx").validate(&mut schema).unwrap();
        assert!(schema.find_index("idx").is_none());
        assert_eq!(
            DropIndex::new("idx").validate(&mut schema).unwrap_err(),
            ValidationError::IndexDoesNotExist("idx".to_string())
        );
    }
}
