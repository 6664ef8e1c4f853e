//! Migrations and the operations they are made of.
//!
//! A [`Migration`] is an ordered list of [`Operation`]s. Every operation runs
//! in three phases:
//!
//! | Phase | Purpose |
//! |-------|---------|
//! | **start** | Expand: create new structures next to the old ones, report tables that need backfilling |
//! | **complete** | Contract: remove what only the old version needed |
//! | **rollback** | Undo whatever start did |
//!
//! Between start and complete both the previous and the new version schema
//! serve traffic, so start must never break the previous version.
//!
//! # Example
//!
//! ```ignore
//! use pgshift_core::migrations::{AddColumn, ColumnDef, Migration, Operation};
//!
//! let migration = Migration::new("02_add_email").with_operation(Operation::AddColumn(
//!     AddColumn::new("users", ColumnDef::new("email", "text").with_nullable(true))
//!         .with_up("lower(name) || '@example.com'"),
//! ));
//! ```

pub mod column;
pub mod index;
pub mod raw_sql;
pub mod table;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::error::{Result, ValidationError};
use crate::schema::{Column, Schema, Table};
use crate::sql::{quote_ident, validate_identifier};
use crate::transform::SqlTransformer;

pub use column::{AddColumn, DropColumn, RenameColumn};
pub use index::{CreateIndex, DropIndex};
pub use raw_sql::RawSql;
pub use table::{CreateTable, DropTable};

/// What an operation needs to run its phases.
pub struct OpContext<'a> {
    /// Execution layer.
    pub db: &'a Db,
    /// The schema being migrated.
    pub schema: &'a str,
    /// Name of the version schema the migration creates.
    pub version_schema: &'a str,
    /// Rewrites user-supplied SQL before it runs.
    pub transformer: &'a dyn SqlTransformer,
}

impl OpContext<'_> {
    /// Apply the SQL transformer to a user-supplied expression.
    pub fn transform(&self, sql: &str) -> Result<String> {
        self.transformer
            .transform_sql(sql)
            .map_err(crate::error::Error::Transform)
    }
}

/// The start/complete/rollback contract every schema change implements.
#[async_trait]
pub trait MigrationOperation: Send + Sync {
    /// Short name of the operation kind, used in errors.
    fn kind(&self) -> &'static str;

    /// Check the operation against `schema` and apply its virtual effect, so
    /// that later operations of the same migration validate against it.
    fn validate(&self, schema: &mut Schema) -> std::result::Result<(), ValidationError>;

    /// Expand phase. Updates `schema` with the operation's effect and returns
    /// the table whose existing rows must be backfilled, if any.
    async fn start(&self, ctx: &OpContext<'_>, schema: &mut Schema) -> Result<Option<Table>>;

    /// Checks that must hold before completion changes anything it cannot
    /// undo. A failure here leaves the migration active and rollback-able.
    async fn prepare_complete(&self, _ctx: &OpContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Contract phase.
    async fn complete(&self, ctx: &OpContext<'_>, schema: &Schema) -> Result<()>;

    /// Undo [`MigrationOperation::start`].
    async fn rollback(&self, ctx: &OpContext<'_>) -> Result<()>;

    /// The effect cannot be derived from the in-memory schema; the live schema
    /// must be read again after this operation runs.
    fn requires_schema_refresh(&self) -> bool {
        false
    }

    /// The operation must be the only one in its migration.
    fn is_isolated(&self) -> bool {
        false
    }
}

/// A schema change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create a table.
    CreateTable(CreateTable),
    /// Drop a table.
    DropTable(DropTable),
    /// Add a column, backfilled from an expression.
    AddColumn(AddColumn),
    /// Drop a column.
    DropColumn(DropColumn),
    /// Rename a column.
    RenameColumn(RenameColumn),
    /// Create an index concurrently.
    CreateIndex(CreateIndex),
    /// Drop an index.
    DropIndex(DropIndex),
    /// Run raw SQL.
    #[serde(rename = "sql")]
    RawSql(RawSql),
}

impl Operation {
    /// The operation as a trait object.
    pub fn as_operation(&self) -> &dyn MigrationOperation {
        match self {
            Operation::CreateTable(op) => op,
            Operation::DropTable(op) => op,
            Operation::AddColumn(op) => op,
            Operation::DropColumn(op) => op,
            Operation::RenameColumn(op) => op,
            Operation::CreateIndex(op) => op,
            Operation::DropIndex(op) => op,
            Operation::RawSql(op) => op,
        }
    }
}

/// Column definition used by `create_table` and `add_column`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// SQL type.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether NULL is allowed.
    #[serde(default)]
    pub nullable: bool,
    /// Part of the primary key.
    #[serde(default)]
    pub pk: bool,
    /// Values must be unique.
    #[serde(default)]
    pub unique: bool,
    /// Default expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    /// Check expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
    /// Column comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl ColumnDef {
    /// A NOT NULL column of the given type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            pk: false,
            unique: false,
            default: None,
            check: None,
            comment: None,
        }
    }

    /// Set nullability.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as part of the primary key.
    pub fn with_pk(mut self, pk: bool) -> Self {
        self.pk = pk;
        self
    }

    /// Mark as unique.
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Set the default expression.
    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Set the check expression.
    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.check = Some(check.into());
        self
    }

    /// Column definition SQL, as used in `CREATE TABLE` or `ADD COLUMN`.
    ///
    /// `physical_name` replaces the column name. With `in_flight` set the
    /// column joins a table that is serving traffic: `NOT NULL` and the check
    /// are left out, and the caller adds them as `NOT VALID` constraints.
    pub(crate) fn to_sql(
        &self,
        ctx: &OpContext<'_>,
        physical_name: &str,
        in_flight: bool,
    ) -> Result<String> {
        let mut sql = format!("{} {}", quote_ident(physical_name), self.data_type);
        if !self.nullable && !in_flight {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(&format!(" DEFAULT {}", ctx.transform(default)?));
        }
        if self.unique {
            sql.push_str(" UNIQUE");
        }
        if let Some(check) = self.check.as_ref().filter(|_| !in_flight) {
            sql.push_str(&format!(" CHECK ({})", ctx.transform(check)?));
        }
        Ok(sql)
    }

    /// The column as it appears in a schema snapshot.
    pub(crate) fn to_column(&self, physical_name: &str) -> Column {
        Column {
            name: physical_name.to_string(),
            data_type: self.data_type.clone(),
            default: self.default.clone(),
            nullable: self.nullable,
            position: 0,
            comment: self.comment.clone(),
        }
    }
}

/// A named, ordered list of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Migration name, unique within a schema.
    pub name: String,
    /// Explicit version schema suffix; defaults to the name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_schema: Option<String>,
    /// Operations, applied in order.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl Migration {
    /// Create an empty migration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version_schema: None,
            operations: Vec::new(),
        }
    }

    /// Append an operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Set an explicit version schema suffix.
    pub fn with_version_schema(mut self, version_schema: impl Into<String>) -> Self {
        self.version_schema = Some(version_schema.into());
        self
    }

    /// Parse a migration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Name of the version schema this migration creates in `schema`.
    pub fn version_schema_name(&self, schema: &str) -> String {
        version_schema_name(schema, self.version_schema.as_deref().unwrap_or(&self.name))
    }

    /// Whether any operation needs the live schema to be read again.
    pub fn requires_schema_refresh(&self) -> bool {
        self.operations
            .iter()
            .any(|op| op.as_operation().requires_schema_refresh())
    }

    /// Whether every operation is raw SQL.
    pub fn contains_only_raw_sql(&self) -> bool {
        !self.operations.is_empty()
            && self
                .operations
                .iter()
                .all(|op| matches!(op, Operation::RawSql(_)))
    }

    /// Validate the migration against `schema` without touching the database.
    pub fn validate(&self, schema: &Schema) -> std::result::Result<(), ValidationError> {
        if self.operations.is_empty() {
            return Err(ValidationError::EmptyMigration(self.name.clone()));
        }

        let version_schema = self.version_schema_name(&schema.name);
        if let Err(crate::error::Error::InvalidIdentifier { reason, .. }) =
            validate_identifier(&version_schema)
        {
            return Err(ValidationError::InvalidName {
                name: version_schema,
                reason,
            });
        }

        let mut accumulated = schema.clone();
        for op in &self.operations {
            let op = op.as_operation();
            if op.is_isolated() && self.operations.len() > 1 {
                return Err(ValidationError::NotIsolated(op.kind()));
            }
            op.validate(&mut accumulated)?;
        }
        Ok(())
    }
}

/// `<schema>_<version>`, the name of a version schema.
pub fn version_schema_name(schema: &str, version: &str) -> String {
    format!("{schema}_{version}")
}

pub(crate) fn require_table<'s>(
    schema: &'s mut Schema,
    table: &str,
) -> std::result::Result<&'s mut Table, ValidationError> {
    schema
        .get_table_mut(table)
        .ok_or_else(|| ValidationError::TableDoesNotExist(table.to_string()))
}

pub(crate) fn require_field(
    operation: &'static str,
    field: &'static str,
    value: &str,
) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::FieldRequired { operation, field });
    }
    Ok(())
}

/// The exposed-to-physical mapping of a column; falls back to the given name.
pub(crate) fn physical_column<'a>(schema: &'a Schema, table: &str, column: &'a str) -> &'a str {
    schema
        .get_table(table)
        .and_then(|t| t.get_column(column))
        .map(|c| c.name.as_str())
        .unwrap_or(column)
}

/// Run `f` with a context over a lazily connected pool. Needs a runtime.
#[cfg(test)]
pub(crate) fn with_test_context<T>(f: impl FnOnce(&OpContext<'_>) -> T) -> T {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .connect_lazy("postgres://localhost/unused")
        .unwrap();
    let db = Db::from_pool(pool, crate::db::Backoff::default());
    let ctx = OpContext {
        db: &db,
        schema: "public",
        version_schema: "public_02",
        transformer: &crate::transform::NoopTransformer,
    };
    f(&ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use pretty_assertions::assert_eq;

    fn users_schema() -> Schema {
        Schema::new("public").with_table(
            "users",
            Table::new("users")
                .with_column(Column::new("id", "integer").with_nullable(false))
                .with_column(Column::new("name", "text"))
                .with_primary_key(["id"]),
        )
    }

    #[test]
    fn test_version_schema_name() {
        let migration = Migration::new("01_create_table");
        assert_eq!(migration.version_schema_name("public"), "public_01_create_table");

        let migration = migration.with_version_schema("v1");
        assert_eq!(migration.version_schema_name("public"), "public_v1");
    }

    #[test]
    fn test_deserialize_migration_json() {
        let json = r#"{
            "name": "02_add_email",
            "operations": [
                {"add_column": {"table": "users", "column": {"name": "email", "type": "text", "nullable": true}, "up": "name || '@example.com'"}},
                {"create_index": {"name": "idx_users_email", "table": "users", "columns": ["email"]}}
            ]
        }"#;
        let migration = Migration::from_json(json).unwrap();
        assert_eq!(migration.name, "02_add_email");
        assert_eq!(migration.operations.len(), 2);
        assert!(matches!(migration.operations[0], Operation::AddColumn(_)));
        assert!(migration.validate(&users_schema()).is_ok());
    }

    #[test]
    fn test_inferred_entry_parses_as_raw_sql() {
        let json = r#"{"name": "sql_0123456789ab", "operations": [{"sql": {"up": "CREATE TABLE t (id int)"}}]}"#;
        let migration = Migration::from_json(json).unwrap();
        assert!(migration.contains_only_raw_sql());
        assert!(migration.requires_schema_refresh());
    }

    #[test]
    fn test_validate_rejects_empty_migration() {
        let err = Migration::new("empty").validate(&users_schema()).unwrap_err();
        assert_eq!(err, ValidationError::EmptyMigration("empty".to_string()));
    }

    #[test]
    fn test_validate_rejects_long_version_schema() {
        let migration = Migration::new("x".repeat(60))
            .with_operation(Operation::DropTable(DropTable::new("users")));
        assert!(matches!(
            migration.validate(&users_schema()),
            Err(ValidationError::InvalidName { .. })
        ));
    }

    #[test]
    fn test_validate_accumulates_across_operations() {
        // The second operation sees the column added by the first.
        let migration = Migration::new("03")
            .with_operation(Operation::AddColumn(AddColumn::new(
                "users",
                ColumnDef::new("email", "text").with_nullable(true),
            )))
            .with_operation(Operation::RenameColumn(RenameColumn::new(
                "users", "email", "mail",
            )));
        assert!(migration.validate(&users_schema()).is_ok());

        let migration = Migration::new("04").with_operation(Operation::RenameColumn(
            RenameColumn::new("users", "email", "mail"),
        ));
        assert_eq!(
            migration.validate(&users_schema()).unwrap_err(),
            ValidationError::ColumnDoesNotExist {
                table: "users".to_string(),
                column: "email".to_string(),
            }
        );
    }

    #[test]
    fn test_validate_rejects_non_isolated_raw_sql() {
        let migration = Migration::new("05")
            .with_operation(Operation::RawSql(RawSql::new("SELECT 1")))
            .with_operation(Operation::DropTable(DropTable::new("users")));
        assert_eq!(
            migration.validate(&users_schema()).unwrap_err(),
            ValidationError::NotIsolated("sql")
        );

        // Raw SQL deferred to completion composes with other operations.
        let migration = Migration::new("06")
            .with_operation(Operation::RawSql(RawSql::new("SELECT 1").with_on_complete(true)))
            .with_operation(Operation::DropTable(DropTable::new("users")));
        assert!(migration.validate(&users_schema()).is_ok());
    }
}
