//! PostgreSQL backend.

use crate::signature::{AttrName, FieldSignature, FieldType};

use super::{Backend, Capabilities};

/// Length used for `char` fields declared without `max_length`.
const DEFAULT_VARCHAR_LENGTH: i64 = 255;

/// PostgreSQL backend.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    capabilities: Capabilities,
}

impl Default for PostgresBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresBackend {
    /// Creates a PostgreSQL backend.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capabilities: Capabilities {
                can_rename_column: true,
                can_alter_column: true,
                can_drop_column: true,
                can_add_not_null_with_default: true,
                supports_deferred_constraints: true,
                supports_inline_references: true,
                supports_add_constraint: true,
                rebuilds_tables: false,
                max_identifier_length: Some(63),
            },
        }
    }
}

impl Backend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn column_type(&self, field: &FieldSignature) -> String {
        match field.field_type {
            FieldType::Auto => "SERIAL".to_string(),
            FieldType::BigAuto => "BIGSERIAL".to_string(),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Char => format!(
                "VARCHAR({})",
                field
                    .int_attr(AttrName::MaxLength)
                    .unwrap_or(DEFAULT_VARCHAR_LENGTH)
            ),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Integer | FieldType::ForeignKey | FieldType::OneToOne | FieldType::ManyToMany => {
                "INTEGER".to_string()
            }
            FieldType::BigInteger => "BIGINT".to_string(),
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
            FieldType::DateTime => "TIMESTAMP WITH TIME ZONE".to_string(),
            FieldType::Time => "TIME".to_string(),
            FieldType::Binary => "BYTEA".to_string(),
            FieldType::Uuid => "UUID".to_string(),
            FieldType::Json => "JSONB".to_string(),
        }
    }

    fn auto_increment_keyword(&self) -> Option<&'static str> {
        None
    }

    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE {} CASCADE", self.quote_identifier(table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ColumnDef;
    use crate::signature::AttrValue;

    #[test]
    fn test_column_types() {
        let b = PostgresBackend::new();
        assert_eq!(b.column_type(&FieldSignature::new("id", FieldType::Auto)), "SERIAL");
        assert_eq!(
            b.column_type(&FieldSignature::new("title", FieldType::Char).max_length(200)),
            "VARCHAR(200)"
        );
        assert_eq!(b.column_type(&FieldSignature::new("title", FieldType::Char)), "VARCHAR(255)");
        assert_eq!(
            b.column_type(&FieldSignature::new("price", FieldType::Decimal).decimal(10, 2)),
            "NUMERIC(10, 2)"
        );
    }

    #[test]
    fn test_alter_column() {
        let b = PostgresBackend::new();
        let column = ColumnDef {
            name: "body".to_string(),
            sql_type: "TEXT".to_string(),
            null: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            references: None,
        };
        assert_eq!(
            b.alter_column_null_sql("blog_post", &column),
            "ALTER TABLE \"blog_post\" ALTER COLUMN \"body\" SET NOT NULL"
        );
        assert_eq!(
            b.alter_column_default_sql("blog_post", "body", Some(&AttrValue::Text(String::new()))),
            "ALTER TABLE \"blog_post\" ALTER COLUMN \"body\" SET DEFAULT ''"
        );
        assert_eq!(
            b.alter_column_default_sql("blog_post", "body", None),
            "ALTER TABLE \"blog_post\" ALTER COLUMN \"body\" DROP DEFAULT"
        );
    }

    #[test]
    fn test_drop_table_cascades() {
        assert_eq!(
            PostgresBackend::new().drop_table_sql("legacy_thing"),
            "DROP TABLE \"legacy_thing\" CASCADE"
        );
    }

    #[test]
    fn test_unique_constraint() {
        assert_eq!(
            PostgresBackend::new().add_unique_sql("blog_post", "blog_post_slug_key", &["slug".to_string()]),
            "ALTER TABLE \"blog_post\" ADD CONSTRAINT \"blog_post_slug_key\" UNIQUE (\"slug\")"
        );
    }
}
