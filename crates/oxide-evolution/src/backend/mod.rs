//! Database backend descriptors.
//!
//! A backend describes what one SQL dialect can do (its [`Capabilities`]) and
//! how its statements are spelled. The translator picks a strategy from the
//! capability flags and asks the backend for the SQL text.

mod mysql;
mod postgres;
mod sqlite;

pub use mysql::MySqlBackend;
pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

use crate::signature::{AttrValue, FieldSignature};

/// Capability flags of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// `ALTER TABLE .. RENAME COLUMN` is available.
    pub can_rename_column: bool,
    /// Column type, nullability and default can be altered in place.
    pub can_alter_column: bool,
    /// `ALTER TABLE .. DROP COLUMN` is available.
    pub can_drop_column: bool,
    /// A NOT NULL column can be added in one statement when it has a default.
    pub can_add_not_null_with_default: bool,
    /// Foreign keys can be `DEFERRABLE INITIALLY DEFERRED`.
    pub supports_deferred_constraints: bool,
    /// `REFERENCES` in a column definition creates a real constraint.
    pub supports_inline_references: bool,
    /// Constraints can be added to an existing table.
    pub supports_add_constraint: bool,
    /// Changes without an ALTER form are done by rebuilding the table.
    pub rebuilds_tables: bool,
    /// Longest identifier the backend accepts.
    pub max_identifier_length: Option<usize>,
}

/// A column ready to be rendered, with its relation already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Backend type name.
    pub sql_type: String,
    /// Whether NULL is allowed.
    pub null: bool,
    /// Whether this is the primary key.
    pub primary_key: bool,
    /// Whether the backend generates values.
    pub auto_increment: bool,
    /// Default value.
    pub default: Option<AttrValue>,
    /// Referenced `(table, column)` for relations.
    pub references: Option<(String, String)>,
}

/// Trait for database-specific SQL generation.
pub trait Backend: Send + Sync {
    /// Returns the backend name.
    fn name(&self) -> &'static str;

    /// Returns the capability flags.
    fn capabilities(&self) -> &Capabilities;

    /// Returns the column type for a field.
    ///
    /// Relations are passed as the referenced primary key's storage field.
    fn column_type(&self, field: &FieldSignature) -> String;

    /// Returns the keyword appended to auto-increment primary keys.
    fn auto_increment_keyword(&self) -> Option<&'static str>;

    /// Quote an identifier (table name, column name, etc.).
    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Renders an attribute value as an SQL literal.
    fn literal(&self, value: &AttrValue) -> String {
        match value {
            AttrValue::Bool(true) => "TRUE".to_string(),
            AttrValue::Bool(false) => "FALSE".to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Shortens an identifier that exceeds the backend limit.
    ///
    /// The result keeps a readable prefix followed by a digest of the full
    /// name, so distinct long names stay distinct.
    fn truncate_name(&self, name: &str) -> String {
        match self.capabilities().max_identifier_length {
            Some(max) if name.len() > max => {
                let digest = blake3::hash(name.as_bytes()).to_hex();
                let suffix = &digest.as_str()[..8];
                let keep = max.saturating_sub(suffix.len() + 1);
                let mut prefix = String::new();
                for c in name.chars() {
                    if prefix.len() + c.len_utf8() > keep {
                        break;
                    }
                    prefix.push(c);
                }
                format!("{prefix}_{suffix}")
            }
            _ => name.to_string(),
        }
    }

    /// Generates a column definition.
    fn column_definition(&self, column: &ColumnDef) -> String {
        let caps = self.capabilities();
        let mut parts = vec![self.quote_identifier(&column.name), column.sql_type.clone()];

        if column.primary_key {
            parts.push("PRIMARY KEY".to_string());
            if column.auto_increment {
                if let Some(keyword) = self.auto_increment_keyword() {
                    parts.push(keyword.to_string());
                }
            }
        } else if !column.null {
            parts.push("NOT NULL".to_string());
        }

        if let Some(ref default) = column.default {
            parts.push(format!("DEFAULT {}", self.literal(default)));
        }

        if caps.supports_inline_references {
            if let Some((ref table, ref target)) = column.references {
                parts.push(format!(
                    "REFERENCES {} ({})",
                    self.quote_identifier(table),
                    self.quote_identifier(target)
                ));
                if caps.supports_deferred_constraints {
                    parts.push("DEFERRABLE INITIALLY DEFERRED".to_string());
                }
            }
        }

        parts.join(" ")
    }

    /// Generates SQL for creating a table.
    fn create_table_sql(&self, table: &str, columns: &[ColumnDef], constraints: &[String]) -> String {
        let mut defs: Vec<String> = columns.iter().map(|c| self.column_definition(c)).collect();
        defs.extend(constraints.iter().cloned());
        format!(
            "CREATE TABLE {} (\n  {}\n)",
            self.quote_identifier(table),
            defs.join(",\n  ")
        )
    }

    /// Generates SQL for dropping a table.
    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {}", self.quote_identifier(table))
    }

    /// Generates SQL for renaming a table.
    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME TO {}",
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL for adding a column.
    fn add_column_sql(&self, table: &str, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column)
        )
    }

    /// Generates SQL for dropping a column.
    fn drop_column_sql(&self, table: &str, column: &str) -> String {
        format!(
            "ALTER TABLE {} DROP COLUMN {}",
            self.quote_identifier(table),
            self.quote_identifier(column)
        )
    }

    /// Generates SQL for renaming a column.
    fn rename_column_sql(&self, table: &str, old_name: &str, new_name: &str) -> String {
        format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            self.quote_identifier(table),
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    /// Generates SQL changing the type of a column.
    fn alter_column_type_sql(&self, table: &str, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ALTER COLUMN {} TYPE {}",
            self.quote_identifier(table),
            self.quote_identifier(&column.name),
            column.sql_type
        )
    }

    /// Generates SQL changing the nullability of a column.
    fn alter_column_null_sql(&self, table: &str, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} ALTER COLUMN {} {} NOT NULL",
            self.quote_identifier(table),
            self.quote_identifier(&column.name),
            if column.null { "DROP" } else { "SET" }
        )
    }

    /// Generates SQL setting or dropping a column default.
    fn alter_column_default_sql(&self, table: &str, column: &str, default: Option<&AttrValue>) -> String {
        let action = default.map_or_else(
            || "DROP DEFAULT".to_string(),
            |value| format!("SET DEFAULT {}", self.literal(value)),
        );
        format!(
            "ALTER TABLE {} ALTER COLUMN {} {}",
            self.quote_identifier(table),
            self.quote_identifier(column),
            action
        )
    }

    /// Generates SQL adding a named unique constraint.
    fn add_unique_sql(&self, table: &str, name: &str, columns: &[String]) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
            self.quote_identifier(table),
            self.quote_identifier(name),
            self.column_list(columns)
        )
    }

    /// Generates SQL dropping a named unique constraint.
    fn drop_unique_sql(&self, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_identifier(table),
            self.quote_identifier(name)
        )
    }

    /// Generates SQL adding a foreign key constraint to an existing column.
    fn add_foreign_key_sql(
        &self,
        table: &str,
        name: &str,
        column: &str,
        references: &(String, String),
    ) -> String {
        let mut sql = format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            self.quote_identifier(table),
            self.quote_identifier(name),
            self.quote_identifier(column),
            self.quote_identifier(&references.0),
            self.quote_identifier(&references.1)
        );
        if self.capabilities().supports_deferred_constraints {
            sql.push_str(" DEFERRABLE INITIALLY DEFERRED");
        }
        sql
    }

    /// Generates SQL dropping a foreign key constraint.
    fn drop_foreign_key_sql(&self, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_identifier(table),
            self.quote_identifier(name)
        )
    }

    /// Generates SQL for creating an index.
    fn create_index_sql(&self, name: &str, table: &str, columns: &[String], unique: bool) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            self.quote_identifier(name),
            self.quote_identifier(table),
            self.column_list(columns)
        )
    }

    /// Generates SQL for dropping an index.
    fn drop_index_sql(&self, name: &str, _table: &str) -> String {
        format!("DROP INDEX {}", self.quote_identifier(name))
    }

    /// Generates SQL filling NULL values of a column.
    fn backfill_sql(&self, table: &str, column: &str, value_sql: &str) -> String {
        format!(
            "UPDATE {} SET {} = {} WHERE {} IS NULL",
            self.quote_identifier(table),
            self.quote_identifier(column),
            value_sql,
            self.quote_identifier(column)
        )
    }

    /// Generates SQL copying one column into another.
    fn copy_column_sql(&self, table: &str, from: &str, to: &str) -> String {
        format!(
            "UPDATE {} SET {} = {}",
            self.quote_identifier(table),
            self.quote_identifier(to),
            self.quote_identifier(from)
        )
    }

    /// Generates SQL copying rows between tables.
    fn copy_rows_sql(&self, to: &str, from: &str, columns: &[String], sources: &[String]) -> String {
        format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            self.quote_identifier(to),
            self.column_list(columns),
            sources.join(", "),
            self.quote_identifier(from)
        )
    }

    /// Statements run before a table rebuild.
    fn begin_rebuild_sql(&self) -> Vec<String> {
        Vec::new()
    }

    /// Statements run after a table rebuild.
    fn end_rebuild_sql(&self) -> Vec<String> {
        Vec::new()
    }

    /// Quotes and joins column names.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Returns a backend by name (`sqlite`, `postgres`, `mysql`).
#[must_use]
pub fn backend_by_name(name: &str) -> Option<Box<dyn Backend>> {
    match name.to_ascii_lowercase().as_str() {
        "sqlite" => Some(Box::new(SqliteBackend::new())),
        "sqlite-legacy" => Some(Box::new(SqliteBackend::legacy())),
        "postgres" | "postgresql" => Some(Box::new(PostgresBackend::new())),
        "mysql" => Some(Box::new(MySqlBackend::new())),
        "mysql-5.7" => Some(Box::new(MySqlBackend::v5_7())),
        _ => None,
    }
}

/// Name of the unique constraint (or unique index) of a single column.
#[must_use]
pub fn unique_name(table: &str, column: &str) -> String {
    format!("{}_{}_key", table, column)
}

/// Name of the plain index of a single column.
#[must_use]
pub fn column_index_name(table: &str, column: &str) -> String {
    format!("{}_{}_idx", table, column)
}

/// Name of a multi-column index or unique-together index.
#[must_use]
pub fn composite_index_name(table: &str, columns: &[String], unique: bool) -> String {
    format!(
        "{}_{}_{}",
        table,
        columns.join("_"),
        if unique { "uniq" } else { "idx" }
    )
}

/// Name of a foreign key constraint added after the column.
#[must_use]
pub fn foreign_key_name(table: &str, column: &str) -> String {
    format!("{}_{}_fk", table, column)
}
