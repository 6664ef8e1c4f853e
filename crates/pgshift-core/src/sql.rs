//! SQL text helpers: identifier and literal quoting, and pgshift's naming
//! conventions for shadow columns, soft-deleted tables and triggers.

use crate::error::{Error, Result};

/// Maximum identifier length PostgreSQL keeps without truncation (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

/// Prefix for columns added by a migration that is still in progress.
pub const NEW_COLUMN_PREFIX: &str = "_pgshift_new_";

/// Prefix for tables and columns dropped by a migration that is still in progress.
pub const DELETED_PREFIX: &str = "_pgshift_del_";

/// Quote an identifier, doubling any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal, doubling any embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a schema-qualified name.
pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Quote and join a list of identifiers with `", "`.
pub fn quote_list<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Check that `name` can be used as an identifier without truncation.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidIdentifier {
            name: name.to_string(),
            reason: "identifier is empty",
        });
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(Error::InvalidIdentifier {
            name: name.to_string(),
            reason: "identifier is longer than 63 bytes",
        });
    }
    if name.contains('\0') {
        return Err(Error::InvalidIdentifier {
            name: name.to_string(),
            reason: "identifier contains a NUL byte",
        });
    }
    Ok(())
}

/// Physical name of the shadow column backing a column added in-flight.
pub fn new_column_name(column: &str) -> String {
    format!("{NEW_COLUMN_PREFIX}{column}")
}

/// Physical name a dropped table or column is parked under until completion.
pub fn deleted_name(name: &str) -> String {
    format!("{DELETED_PREFIX}{name}")
}

/// Name of the trigger (and its function) an operation keyed by `key`
/// installs on `table`.
///
/// The key must be derivable from the operation alone, so complete and
/// rollback find the trigger start created whatever else the migration did
/// to the column.
pub fn trigger_name(table: &str, key: &str) -> String {
    format!("_pgshift_trigger_{table}_{key}")
}

/// Name of the `NOT VALID` check standing in for `NOT NULL` on a column
/// added in-flight.
pub fn not_null_constraint_name(column: &str) -> String {
    format!("_pgshift_not_null_{column}")
}

/// Name of the `NOT VALID` user check on a column added in-flight.
pub fn check_constraint_name(column: &str) -> String {
    format!("_pgshift_check_{column}")
}

/// Rewrite references to `column` in a check expression so they name
/// `replacement` instead.
///
/// Both bare and quoted references are rewritten. String literals and
/// identifiers that merely contain the name are left alone.
pub fn rewrite_column_references(expression: &str, column: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(expression.len());
    let mut chars = expression.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            '\'' => {
                out.push(c);
                while let Some((_, c)) = chars.next() {
                    out.push(c);
                    if c == '\'' {
                        if chars.peek().map(|(_, c)| *c) == Some('\'') {
                            chars.next();
                            out.push('\'');
                        } else {
                            break;
                        }
                    }
                }
            }
            '"' => {
                let mut ident = String::new();
                while let Some((_, c)) = chars.next() {
                    if c == '"' {
                        if chars.peek().map(|(_, c)| *c) == Some('"') {
                            chars.next();
                            ident.push('"');
                        } else {
                            break;
                        }
                    } else {
                        ident.push(c);
                    }
                }
                if ident == column {
                    out.push_str(&quote_ident(replacement));
                } else {
                    out.push_str(&quote_ident(&ident));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut end = start + c.len_utf8();
                while let Some(&(i, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '$' {
                        end = i + c.len_utf8();
                        chars.next();
                    } else {
                        break;
                    }
                }
                let word = &expression[start..end];
                let qualified_member = out.ends_with('.');
                if !qualified_member && word.to_lowercase() == column {
                    out.push_str(&quote_ident(replacement));
                } else {
                    out.push_str(word);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Build the trigger function and trigger that fill `target` from `expression`
/// whenever a row is written from a session not using `version_schema`.
///
/// The trigger is named after `key` (see [`trigger_name`]). With
/// `from_new_version` set the logic is inverted: only writes made through
/// `version_schema` fire the expression. That covers columns the new version
/// no longer sees.
pub fn sync_trigger_sql(
    schema: &str,
    table: &str,
    key: &str,
    target: &str,
    expression: &str,
    version_schema: &str,
    from_new_version: bool,
) -> String {
    let name = trigger_name(table, key);
    let func = qualified(schema, &name);
    let comparison = if from_new_version { "=" } else { "<>" };
    format!(
        "CREATE OR REPLACE FUNCTION {func}() RETURNS TRIGGER LANGUAGE plpgsql AS $pgshift$
DECLARE
  search_path text;
BEGIN
  SELECT current_setting INTO search_path FROM current_setting('search_path');
  IF search_path {comparison} {version} THEN
    NEW.{target} := (SELECT {expression} FROM (SELECT NEW.*) AS n);
  END IF;
  RETURN NEW;
END;
$pgshift$;
DROP TRIGGER IF EXISTS {trigger} ON {table_q};
CREATE TRIGGER {trigger} BEFORE UPDATE OR INSERT ON {table_q}
  FOR EACH ROW EXECUTE PROCEDURE {func}();",
        version = quote_literal(version_schema),
        target = quote_ident(target),
        trigger = quote_ident(&name),
        table_q = qualified(schema, table),
    )
}

/// Drop the trigger and function created by [`sync_trigger_sql`] for `key`.
pub fn drop_sync_trigger_sql(schema: &str, table: &str, key: &str) -> String {
    let name = trigger_name(table, key);
    format!(
        "DROP TRIGGER IF EXISTS {} ON {}; DROP FUNCTION IF EXISTS {}();",
        quote_ident(&name),
        qualified(schema, table),
        qualified(schema, &name),
    )
}
