//! SQLite backend.
//!
//! SQLite has limited ALTER TABLE support, so attribute changes use the
//! "table recreation" strategy: create a new table, copy data, drop the old
//! table, rename the new table.

use crate::signature::{AttrValue, FieldSignature, FieldType};

use super::{Backend, Capabilities};

/// SQLite backend.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    capabilities: Capabilities,
}

impl Default for SqliteBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteBackend {
    /// Creates a backend for SQLite 3.35 or newer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            capabilities: Capabilities {
                can_rename_column: true,
                can_alter_column: false,
                can_drop_column: true,
                can_add_not_null_with_default: true,
                supports_deferred_constraints: true,
                supports_inline_references: true,
                supports_add_constraint: false,
                rebuilds_tables: true,
                max_identifier_length: None,
            },
        }
    }

    /// Creates a backend for SQLite releases without `RENAME COLUMN` and
    /// `DROP COLUMN` (before 3.25).
    #[must_use]
    pub fn legacy() -> Self {
        let mut backend = Self::new();
        backend.capabilities.can_rename_column = false;
        backend.capabilities.can_drop_column = false;
        backend
    }
}

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn column_type(&self, field: &FieldSignature) -> String {
        match field.field_type {
            FieldType::Auto
            | FieldType::BigAuto
            | FieldType::Boolean
            | FieldType::Integer
            | FieldType::BigInteger
            | FieldType::SmallInteger
            | FieldType::ForeignKey
            | FieldType::OneToOne
            | FieldType::ManyToMany => "INTEGER",
            FieldType::Char
            | FieldType::Text
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::Time
            | FieldType::Uuid
            | FieldType::Json => "TEXT",
            FieldType::Float => "REAL",
            FieldType::Decimal => "NUMERIC",
            FieldType::Binary => "BLOB",
        }
        .to_string()
    }

    fn auto_increment_keyword(&self) -> Option<&'static str> {
        Some("AUTOINCREMENT")
    }

    fn literal(&self, value: &AttrValue) -> String {
        match value {
            AttrValue::Bool(b) => i32::from(*b).to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        }
    }

    fn begin_rebuild_sql(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys = OFF".to_string()]
    }

    fn end_rebuild_sql(&self) -> Vec<String> {
        vec!["PRAGMA foreign_keys = ON".to_string()]
    }

    fn drop_index_sql(&self, name: &str, _table: &str) -> String {
        format!("DROP INDEX IF EXISTS {}", self.quote_identifier(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ColumnDef;

    fn backend() -> SqliteBackend {
        SqliteBackend::new()
    }

    fn column(name: &str, sql_type: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            sql_type: sql_type.to_string(),
            null: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            references: None,
        }
    }

    #[test]
    fn test_create_table() {
        let mut id = column("id", "INTEGER");
        id.primary_key = true;
        id.auto_increment = true;
        let mut author = column("author_id", "INTEGER");
        author.references = Some(("auth_user".to_string(), "id".to_string()));

        let sql = backend().create_table_sql("blog_post", &[id, author], &[]);
        assert_eq!(
            sql,
            "CREATE TABLE \"blog_post\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
             \"author_id\" INTEGER NOT NULL REFERENCES \"auth_user\" (\"id\") DEFERRABLE INITIALLY DEFERRED\n)"
        );
    }

    #[test]
    fn test_add_column_with_default() {
        let mut views = column("views", "INTEGER");
        views.default = Some(AttrValue::Int(0));
        assert_eq!(
            backend().add_column_sql("blog_post", &views),
            "ALTER TABLE \"blog_post\" ADD COLUMN \"views\" INTEGER NOT NULL DEFAULT 0"
        );
    }

    #[test]
    fn test_rename_and_drop_column() {
        let b = backend();
        assert_eq!(
            b.rename_column_sql("blog_post", "title", "heading"),
            "ALTER TABLE \"blog_post\" RENAME COLUMN \"title\" TO \"heading\""
        );
        assert_eq!(
            b.drop_column_sql("blog_post", "title"),
            "ALTER TABLE \"blog_post\" DROP COLUMN \"title\""
        );
    }

    #[test]
    fn test_capabilities() {
        let caps = *backend().capabilities();
        assert!(caps.rebuilds_tables);
        assert!(!caps.can_alter_column);

        let legacy = *SqliteBackend::legacy().capabilities();
        assert!(!legacy.can_rename_column);
        assert!(!legacy.can_drop_column);
    }

    #[test]
    fn test_type_names() {
        let b = backend();
        assert_eq!(b.column_type(&FieldSignature::new("a", FieldType::BigInteger)), "INTEGER");
        assert_eq!(b.column_type(&FieldSignature::new("a", FieldType::Char).max_length(10)), "TEXT");
        assert_eq!(b.column_type(&FieldSignature::new("a", FieldType::Boolean)), "INTEGER");
        assert_eq!(b.column_type(&FieldSignature::new("a", FieldType::DateTime)), "TEXT");
        assert_eq!(b.column_type(&FieldSignature::new("a", FieldType::Binary)), "BLOB");
        assert_eq!(b.literal(&AttrValue::Bool(true)), "1");
    }
}
