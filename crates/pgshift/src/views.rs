//! Version schema DDL.

use pgshift_core::sql::{qualified, quote_ident};
use pgshift_core::Schema;

/// Statements that (re)create `version_schema` with one view per table of
/// `schema`, projecting each column under its exposed name.
pub(crate) fn create_version_schema_sql(
    schema: &Schema,
    version_schema: &str,
    security_invoker: bool,
) -> String {
    let mut stmts = vec![
        drop_version_schema_sql(version_schema),
        format!("CREATE SCHEMA {}", quote_ident(version_schema)),
    ];
    for (exposed, table) in &schema.tables {
        let columns = table
            .columns_in_order()
            .into_iter()
            .map(|(name, column)| format!("{} AS {}", quote_ident(&column.name), quote_ident(name)))
            .collect::<Vec<_>>();
        if columns.is_empty() {
            continue;
        }
        stmts.push(format!(
            "CREATE VIEW {}{} AS SELECT {} FROM {}",
            qualified(version_schema, exposed),
            if security_invoker {
                " WITH (security_invoker = true)"
            } else {
                ""
            },
            columns.join(", "),
            qualified(&schema.name, &table.name),
        ));
    }
    stmts.join("; ")
}

pub(crate) fn drop_version_schema_sql(version_schema: &str) -> String {
    format!("DROP SCHEMA IF EXISTS {} CASCADE", quote_ident(version_schema))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgshift_core::{Column, Table};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        let mut users = Table::new("users")
            .with_column(Column::new("id", "integer"))
            .with_column(Column::new("name", "text"))
            .with_primary_key(["id"]);
        users.add_column("email", Column::new("_pgshift_new_email", "text"));
        users.rename_column("name", "full_name");
        Schema::new("public").with_table("users", users)
    }

    #[test]
    fn test_views_use_exposed_names() {
        let sql = create_version_schema_sql(&schema(), "public_02_add_email", false);
        assert_eq!(
            sql,
            "DROP SCHEMA IF EXISTS \"public_02_add_email\" CASCADE; \
             CREATE SCHEMA \"public_02_add_email\"; \
             CREATE VIEW \"public_02_add_email\".\"users\" AS SELECT \"id\" AS \"id\", \
             \"name\" AS \"full_name\", \"_pgshift_new_email\" AS \"email\" \
             FROM \"public\".\"users\""
        );
    }

    #[test]
    fn test_security_invoker() {
        let sql = create_version_schema_sql(&schema(), "public_02", true);
        assert!(sql.contains("CREATE VIEW \"public_02\".\"users\" WITH (security_invoker = true) AS SELECT"));
    }

    #[test]
    fn test_renamed_table() {
        let mut schema = schema();
        let users = schema.remove_table("users").unwrap();
        schema.add_table("customers", users);
        let sql = create_version_schema_sql(&schema, "public_03", false);
        assert!(sql.contains("CREATE VIEW \"public_03\".\"customers\" AS SELECT"));
        assert!(sql.contains("FROM \"public\".\"users\""));
    }
}
