//! MySQL backend.
//!
//! MySQL ignores inline `REFERENCES`, has no deferred constraints and alters
//! columns by restating the full definition with `MODIFY COLUMN`.

use crate::signature::{AttrName, FieldSignature, FieldType};

use super::{Backend, Capabilities, ColumnDef};

/// Length used for `char` fields declared without `max_length`.
const DEFAULT_VARCHAR_LENGTH: i64 = 255;

/// MySQL backend.
#[derive(Debug, Clone)]
pub struct MySqlBackend {
    capabilities: Capabilities,
}

impl Default for MySqlBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MySqlBackend {
    /// Creates a backend for MySQL 8.0 or newer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capabilities: Capabilities {
                can_rename_column: true,
                can_alter_column: true,
                can_drop_column: true,
                can_add_not_null_with_default: true,
                supports_deferred_constraints: false,
                supports_inline_references: false,
                supports_add_constraint: true,
                rebuilds_tables: false,
                max_identifier_length: Some(64),
            },
        }
    }

    /// Creates a backend for MySQL 5.7, which has no `RENAME COLUMN`.
    #[must_use]
    pub fn v5_7() -> Self {
        let mut backend = Self::new();
        backend.capabilities.can_rename_column = false;
        backend
    }

    fn modify_column_sql(&self, table: &str, column: &ColumnDef) -> String {
        format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.quote_identifier(table),
            self.column_definition(column)
        )
    }
}

impl Backend for MySqlBackend {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn column_type(&self, field: &FieldSignature) -> String {
        match field.field_type {
            FieldType::Auto
            | FieldType::Integer
            | FieldType::ForeignKey
            | FieldType::OneToOne
            | FieldType::ManyToMany => "INTEGER".to_string(),
            FieldType::BigAuto | FieldType::BigInteger => "BIGINT".to_string(),
            FieldType::Boolean => "BOOL".to_string(),
            FieldType::Char => format!(
                "VARCHAR({})",
                field
                    .int_attr(AttrName::MaxLength)
                    .unwrap_or(DEFAULT_VARCHAR_LENGTH)
            ),
            FieldType::Text => "LONGTEXT".to_string(),
            FieldType::SmallInteger => "SMALLINT".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Decimal => match (
                field.int_attr(AttrName::MaxDigits),
                field.int_attr(AttrName::DecimalPlaces),
            ) {
                (Some(digits), Some(places)) => format!("NUMERIC({digits}, {places})"),
                _ => "NUMERIC".to_string(),
            },
            FieldType::Date => "DATE".to_string(),
            FieldType::DateTime => "DATETIME(6)".to_string(),
            FieldType::Time => "TIME(6)".to_string(),
            FieldType::Binary => "LONGBLOB".to_string(),
            FieldType::Uuid => "CHAR(32)".to_string(),
            FieldType::Json => "JSON".to_string(),
        }
    }

    fn auto_increment_keyword(&self) -> Option<&'static str> {
        Some("AUTO_INCREMENT")
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn rename_table_sql(&self, old_name: &str, new_name: &str) -> String {
        format!(
            "RENAME TABLE {} TO {}",
            self.quote_identifier(old_name),
            self.quote_identifier(new_name)
        )
    }

    fn alter_column_type_sql(&self, table: &str, column: &ColumnDef) -> String {
        self.modify_column_sql(table, column)
    }

    fn alter_column_null_sql(&self, table: &str, column: &ColumnDef) -> String {
        self.modify_column_sql(table, column)
    }

    fn drop_unique_sql(&self, table: &str, name: &str) -> String {
        self.drop_index_sql(name, table)
    }

    fn drop_foreign_key_sql(&self, table: &str, name: &str) -> String {
        format!(
            "ALTER TABLE {} DROP FOREIGN KEY {}",
            self.quote_identifier(table),
            self.quote_identifier(name)
        )
    }

    fn drop_index_sql(&self, name: &str, table: &str) -> String {
        format!(
            "DROP INDEX {} ON {}",
            self.quote_identifier(name),
            self.quote_identifier(table)
        )
    }
}
