//! Logical schema snapshots.
//!
//! A [`Schema`] is what `read_schema()` returns for a namespace, cached as
//! `resulting_schema` on completed migrations. During a migration the same
//! structure accumulates virtual changes: tables and columns are keyed by the
//! name a version schema exposes, while each entry keeps the name of the
//! physical object behind it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Snapshot of one namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Namespace name.
    pub name: String,
    /// Tables keyed by exposed name.
    #[serde(default)]
    pub tables: BTreeMap<String, Table>,
}

impl Schema {
    /// Create an empty snapshot for `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Add or replace a table.
    pub fn with_table(mut self, exposed: impl Into<String>, table: Table) -> Self {
        self.add_table(exposed, table);
        self
    }

    /// Get a table by exposed name.
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    /// Get a mutable table by exposed name.
    pub fn get_table_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.get_mut(name)
    }

    /// Add or replace a table.
    pub fn add_table(&mut self, exposed: impl Into<String>, table: Table) {
        self.tables.insert(exposed.into(), table);
    }

    /// Remove a table, hiding it from version schemas.
    pub fn remove_table(&mut self, name: &str) -> Option<Table> {
        self.tables.remove(name)
    }

    /// Find an index by name in any table, returning the owning table's
    /// exposed name alongside it.
    pub fn find_index(&self, name: &str) -> Option<(&str, &Index)> {
        self.tables.iter().find_map(|(table_name, table)| {
            table
                .indexes
                .get(name)
                .map(|index| (table_name.as_str(), index))
        })
    }
}

/// A table and its structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Physical table name.
    pub name: String,
    /// Object identifier, as text.
    #[serde(default)]
    pub oid: String,
    /// Table comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// Columns keyed by exposed name.
    #[serde(default)]
    pub columns: BTreeMap<String, Column>,
    /// Primary key columns (physical names), in key order.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Indexes keyed by name.
    #[serde(default)]
    pub indexes: BTreeMap<String, Index>,
    /// Check constraints keyed by name.
    #[serde(default)]
    pub check_constraints: BTreeMap<String, CheckConstraint>,
    /// Unique constraints keyed by name.
    #[serde(default)]
    pub unique_constraints: BTreeMap<String, UniqueConstraint>,
    /// Foreign keys keyed by name.
    #[serde(default)]
    pub foreign_keys: BTreeMap<String, ForeignKey>,
}

impl Table {
    /// Create an empty table backed by `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a column exposed under its physical name.
    pub fn with_column(mut self, column: Column) -> Self {
        let exposed = column.name.clone();
        self.add_column(exposed, column);
        self
    }

    /// Set the primary key.
    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Get a column by exposed name.
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Add a column. Columns without a position are placed after the last one.
    pub fn add_column(&mut self, exposed: impl Into<String>, mut column: Column) {
        if column.position == 0 {
            column.position = self.next_position();
        }
        self.columns.insert(exposed.into(), column);
    }

    /// Remove a column, hiding it from version schemas.
    pub fn remove_column(&mut self, name: &str) -> Option<Column> {
        self.columns.remove(name)
    }

    /// Expose a column under a new name.
    pub fn rename_column(&mut self, from: &str, to: impl Into<String>) -> bool {
        match self.columns.remove(from) {
            Some(column) => {
                self.columns.insert(to.into(), column);
                true
            }
            None => false,
        }
    }

    /// Columns as `(exposed, column)` pairs in table order.
    pub fn columns_in_order(&self) -> Vec<(&str, &Column)> {
        let mut columns: Vec<_> = self
            .columns
            .iter()
            .map(|(exposed, column)| (exposed.as_str(), column))
            .collect();
        columns.sort_by_key(|(exposed, column)| (column.position, *exposed));
        columns
    }

    /// Physical types of the primary key columns, in key order.
    pub fn primary_key_types(&self) -> Option<Vec<&str>> {
        self.primary_key
            .iter()
            .map(|pk| {
                self.columns
                    .values()
                    .find(|c| &c.name == pk)
                    .map(|c| c.data_type.as_str())
            })
            .collect()
    }

    fn next_position(&self) -> i32 {
        self.columns.values().map(|c| c.position).max().unwrap_or(0) + 1
    }
}

/// A column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    /// Physical column name.
    pub name: String,
    /// Formatted type, e.g. `integer` or `character varying(255)`.
    #[serde(rename = "type")]
    pub data_type: String,
    /// Default expression.
    #[serde(default)]
    pub default: Option<String>,
    /// Whether NULL is allowed.
    #[serde(default)]
    pub nullable: bool,
    /// Ordinal position (1 based).
    #[serde(default)]
    pub position: i32,
    /// Column comment.
    #[serde(default)]
    pub comment: Option<String>,
}

impl Column {
    /// Create a nullable column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            ..Default::default()
        }
    }

    /// Set nullability.
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }
}

/// An index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    /// Index name.
    pub name: String,
    /// Whether the index enforces uniqueness.
    #[serde(default)]
    pub unique: bool,
    /// Indexed columns (physical names).
    #[serde(default)]
    pub columns: Vec<String>,
}

/// A check constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConstraint {
    /// Constraint name.
    pub name: String,
    /// Columns referenced by the constraint.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Constraint definition as reported by `pg_get_constraintdef`.
    #[serde(default)]
    pub definition: String,
}

/// A unique constraint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UniqueConstraint {
    /// Constraint name.
    pub name: String,
    /// Constrained columns.
    #[serde(default)]
    pub columns: Vec<String>,
}

/// A foreign key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    /// Constraint name.
    pub name: String,
    /// Referencing columns.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Referenced table.
    #[serde(default)]
    pub referenced_table: String,
    /// Referenced columns.
    #[serde(default)]
    pub referenced_columns: Vec<String>,
    /// `ON DELETE` action.
    #[serde(default)]
    pub on_delete: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_read_schema_output() {
        let json = serde_json::json!({
            "name": "public",
            "tables": {
                "users": {
                    "name": "users",
                    "oid": "16385",
                    "comment": null,
                    "columns": {
                        "id": {"name": "id", "type": "integer", "default": null, "nullable": false, "position": 1, "comment": null},
                        "name": {"name": "name", "type": "text", "default": null, "nullable": true, "position": 2, "comment": null}
                    },
                    "primaryKey": ["id"],
                    "indexes": {"users_pkey": {"name": "users_pkey", "unique": true, "columns": ["id"]}},
                    "checkConstraints": {},
                    "uniqueConstraints": {},
                    "foreignKeys": {}
                }
            }
        });

        let schema: Schema = serde_json::from_value(json).unwrap();
        let users = schema.get_table("users").unwrap();
        assert_eq!(users.primary_key, vec!["id".to_string()]);
        assert_eq!(users.get_column("id").unwrap().data_type, "integer");
        assert!(!users.get_column("id").unwrap().nullable);
        assert_eq!(schema.find_index("users_pkey").map(|(t, _)| t), Some("users"));
    }

    #[test]
    fn test_empty_namespace_deserializes() {
        let schema: Schema = serde_json::from_str(r#"{"name": "public"}"#).unwrap();
        assert!(schema.tables.is_empty());

        let schema: Schema = serde_json::from_str(r#"{"name": "public", "tables": {}}"#).unwrap();
        assert_eq!(schema, Schema::new("public"));
    }

    #[test]
    fn test_virtual_rename_keeps_physical_name() {
        let mut table = Table::new("users")
            .with_column(Column::new("id", "integer").with_nullable(false))
            .with_column(Column::new("name", "text"));

        assert!(table.rename_column("name", "full_name"));
        assert!(table.get_column("name").is_none());
        assert_eq!(table.get_column("full_name").unwrap().name, "name");
        assert!(!table.rename_column("missing", "x"));
    }

    #[test]
    fn test_columns_in_order() {
        let mut table = Table::new("users")
            .with_column(Column::new("id", "integer"))
            .with_column(Column::new("b", "text"));
        table.add_column("a", Column::new("_pgshift_new_a", "text"));

        let order: Vec<_> = table.columns_in_order().into_iter().map(|(n, _)| n).collect();
        assert_eq!(order, vec!["id", "b", "a"]);
        assert_eq!(table.get_column("a").unwrap().position, 3);
    }

    #[test]
    fn test_primary_key_types() {
        let table = Table::new("t")
            .with_column(Column::new("a", "integer"))
            .with_column(Column::new("b", "text"))
            .with_primary_key(["a", "b"]);
        assert_eq!(table.primary_key_types(), Some(vec!["integer", "text"]));

        let table = Table::new("t").with_primary_key(["missing"]);
        assert_eq!(table.primary_key_types(), None);
    }

    #[test]
    fn test_remove_table() {
        let mut schema = Schema::new("public").with_table("users", Table::new("users"));
        assert_eq!(schema.remove_table("users").unwrap().name, "users");
        assert!(schema.remove_table("users").is_none());
        assert!(schema.tables.is_empty());
    }
}
