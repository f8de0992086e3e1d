//! Evolution mutations.
//!
//! This module defines the closed set of structural changes an evolution can
//! express. A mutation is pure data: the signature transform lives in
//! [`crate::state`] and the SQL translation in [`crate::translate`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::signature::{AttrName, AttrValue, FieldSignature, IndexSignature, ModelSignature, ProjectSignature};

/// Value used to fill existing rows when a NOT NULL column appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Initial {
    /// A literal value.
    Value(AttrValue),
    /// An SQL expression evaluated for every existing row.
    Expression(String),
}

impl fmt::Display for Initial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{v}"),
            Self::Expression(e) => write!(f, "({e})"),
        }
    }
}

/// Old and new effective value of one changed attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrChange {
    /// Value before the change (`None` when absent).
    pub old: Option<AttrValue>,
    /// Value after the change (`None` when absent).
    pub new: Option<AttrValue>,
}

impl AttrChange {
    /// Creates an attribute change.
    #[must_use]
    pub const fn new(old: Option<AttrValue>, new: Option<AttrValue>) -> Self {
        Self { old, new }
    }
}

/// Model metadata replaced by a [`MutationSpec::ChangeMeta`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MetaChange {
    /// New table name override (`None` restores the default name).
    TableName(Option<String>),
    /// New unique-together set.
    UniqueTogether(Vec<Vec<String>>),
    /// New model-level index set.
    Indexes(Vec<IndexSignature>),
}

/// Signature transform attached to a raw SQL mutation.
///
/// The function receives the application name and the signature to update in
/// place. It is not serialized: raw SQL mutations loaded from files never
/// carry one.
#[derive(Clone, Copy)]
pub struct SignatureRewrite(pub fn(&str, &mut ProjectSignature) -> Result<()>);

impl SignatureRewrite {
    /// Runs the rewrite.
    pub fn apply(&self, app: &str, signature: &mut ProjectSignature) -> Result<()> {
        (self.0)(app, signature)
    }
}

impl fmt::Debug for SignatureRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignatureRewrite(..)")
    }
}

impl PartialEq for SignatureRewrite {
    fn eq(&self, other: &Self) -> bool {
        self.0 as usize == other.0 as usize
    }
}

impl Eq for SignatureRewrite {}

/// A single structural change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MutationSpec {
    /// Add a column-backed field to a model.
    AddField {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// The new field.
        field: FieldSignature,
        /// Backfill for existing rows.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial: Option<Initial>,
    },

    /// Remove a column-backed field.
    DeleteField {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// Rename a field, optionally giving it an explicit column or join table.
    RenameField {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// Current field name.
        old_name: String,
        /// New field name.
        new_name: String,
        /// Explicit column name for the renamed field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db_column: Option<String>,
        /// Explicit join table for a renamed many-to-many field.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db_table: Option<String>,
    },

    /// Change attributes of an existing field.
    ChangeFieldAttribute {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// Field name.
        field: String,
        /// Changed attributes only.
        changes: BTreeMap<AttrName, AttrChange>,
        /// Backfill for NULL rows when the field becomes NOT NULL.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initial: Option<Initial>,
    },

    /// Add a model (and its table).
    AddModel {
        /// Application name.
        app: String,
        /// The new model.
        model: ModelSignature,
    },

    /// Remove a model (and its table).
    DeleteModel {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
    },

    /// Remove an application from the signature.
    DeleteApplication {
        /// Application name.
        app: String,
    },

    /// Add a many-to-many relation (and its join table).
    AddRelation {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// The many-to-many field.
        field: FieldSignature,
    },

    /// Remove a many-to-many relation.
    DeleteRelation {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// Field name.
        field: String,
    },

    /// Replace a piece of model metadata.
    ChangeMeta {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// The new metadata value.
        change: MetaChange,
    },

    /// Rename a model, optionally keeping or setting its table name.
    RenameModel {
        /// Application name.
        app: String,
        /// Current model name.
        old_name: String,
        /// New model name.
        new_name: String,
        /// Table name for the renamed model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        db_table: Option<String>,
    },

    /// Run SQL verbatim and optionally rewrite the signature.
    RawSql {
        /// Application name.
        app: String,
        /// Short tag identifying this mutation in logs.
        tag: String,
        /// Statements, executed in order.
        statements: Vec<String>,
        /// Signature transform matching what the statements do.
        #[serde(skip)]
        rewrite: Option<SignatureRewrite>,
    },

    /// A detected change with no safe automatic translation.
    Unsupported {
        /// Application name.
        app: String,
        /// Model name.
        model: String,
        /// Field name, for field-level changes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
        /// Why the change is unsupported.
        reason: String,
    },
}

impl MutationSpec {
    // Convenience constructors

    /// Creates an AddField mutation.
    #[must_use]
    pub fn add_field(app: impl Into<String>, model: impl Into<String>, field: FieldSignature) -> Self {
        Self::AddField {
            app: app.into(),
            model: model.into(),
            field,
            initial: None,
        }
    }

    /// Creates a DeleteField mutation.
    #[must_use]
    pub fn delete_field(
        app: impl Into<String>,
        model: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::DeleteField {
            app: app.into(),
            model: model.into(),
            field: field.into(),
        }
    }

    /// Creates a RenameField mutation.
    #[must_use]
    pub fn rename_field(
        app: impl Into<String>,
        model: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameField {
            app: app.into(),
            model: model.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
            db_column: None,
            db_table: None,
        }
    }

    /// Creates a ChangeFieldAttribute mutation.
    #[must_use]
    pub fn change_field(
        app: impl Into<String>,
        model: impl Into<String>,
        field: impl Into<String>,
        changes: BTreeMap<AttrName, AttrChange>,
    ) -> Self {
        Self::ChangeFieldAttribute {
            app: app.into(),
            model: model.into(),
            field: field.into(),
            changes,
            initial: None,
        }
    }

    /// Creates an AddModel mutation.
    #[must_use]
    pub fn add_model(app: impl Into<String>, model: ModelSignature) -> Self {
        Self::AddModel {
            app: app.into(),
            model,
        }
    }

    /// Creates a DeleteModel mutation.
    #[must_use]
    pub fn delete_model(app: impl Into<String>, model: impl Into<String>) -> Self {
        Self::DeleteModel {
            app: app.into(),
            model: model.into(),
        }
    }

    /// Creates a DeleteApplication mutation.
    #[must_use]
    pub fn delete_application(app: impl Into<String>) -> Self {
        Self::DeleteApplication { app: app.into() }
    }

    /// Creates an AddRelation mutation.
    #[must_use]
    pub fn add_relation(app: impl Into<String>, model: impl Into<String>, field: FieldSignature) -> Self {
        Self::AddRelation {
            app: app.into(),
            model: model.into(),
            field,
        }
    }

    /// Creates a DeleteRelation mutation.
    #[must_use]
    pub fn delete_relation(
        app: impl Into<String>,
        model: impl Into<String>,
        field: impl Into<String>,
    ) -> Self {
        Self::DeleteRelation {
            app: app.into(),
            model: model.into(),
            field: field.into(),
        }
    }

    /// Creates a ChangeMeta mutation.
    #[must_use]
    pub fn change_meta(app: impl Into<String>, model: impl Into<String>, change: MetaChange) -> Self {
        Self::ChangeMeta {
            app: app.into(),
            model: model.into(),
            change,
        }
    }

    /// Creates a RenameModel mutation.
    #[must_use]
    pub fn rename_model(
        app: impl Into<String>,
        old_name: impl Into<String>,
        new_name: impl Into<String>,
    ) -> Self {
        Self::RenameModel {
            app: app.into(),
            old_name: old_name.into(),
            new_name: new_name.into(),
            db_table: None,
        }
    }

    /// Creates a RawSql mutation without a signature rewrite.
    #[must_use]
    pub fn raw_sql(app: impl Into<String>, tag: impl Into<String>, statements: Vec<String>) -> Self {
        Self::RawSql {
            app: app.into(),
            tag: tag.into(),
            statements,
            rewrite: None,
        }
    }

    /// Creates an Unsupported mutation.
    #[must_use]
    pub fn unsupported(
        app: impl Into<String>,
        model: impl Into<String>,
        field: Option<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Unsupported {
            app: app.into(),
            model: model.into(),
            field,
            reason: reason.into(),
        }
    }

    /// Sets the backfill of an AddField or ChangeFieldAttribute.
    ///
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_initial(mut self, value: Initial) -> Self {
        match &mut self {
            Self::AddField { initial, .. } | Self::ChangeFieldAttribute { initial, .. } => {
                *initial = Some(value);
            }
            _ => {}
        }
        self
    }

    /// Attaches a signature rewrite to a RawSql mutation.
    ///
    /// Other variants are returned unchanged.
    #[must_use]
    pub fn with_rewrite(mut self, func: fn(&str, &mut ProjectSignature) -> Result<()>) -> Self {
        if let Self::RawSql { rewrite, .. } = &mut self {
            *rewrite = Some(SignatureRewrite(func));
        }
        self
    }

    /// Returns the application this mutation belongs to.
    #[must_use]
    pub fn app(&self) -> &str {
        match self {
            Self::AddField { app, .. }
            | Self::DeleteField { app, .. }
            | Self::RenameField { app, .. }
            | Self::ChangeFieldAttribute { app, .. }
            | Self::AddModel { app, .. }
            | Self::DeleteModel { app, .. }
            | Self::DeleteApplication { app }
            | Self::AddRelation { app, .. }
            | Self::DeleteRelation { app, .. }
            | Self::ChangeMeta { app, .. }
            | Self::RenameModel { app, .. }
            | Self::RawSql { app, .. }
            | Self::Unsupported { app, .. } => app,
        }
    }

    /// Returns the model this mutation targets, if it targets one.
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::AddField { model, .. }
            | Self::DeleteField { model, .. }
            | Self::RenameField { model, .. }
            | Self::ChangeFieldAttribute { model, .. }
            | Self::DeleteModel { model, .. }
            | Self::AddRelation { model, .. }
            | Self::DeleteRelation { model, .. }
            | Self::ChangeMeta { model, .. }
            | Self::Unsupported { model, .. } => Some(model),
            Self::AddModel { model, .. } => Some(&model.name),
            Self::RenameModel { old_name, .. } => Some(old_name),
            Self::DeleteApplication { .. } | Self::RawSql { .. } => None,
        }
    }

    /// Returns true for mutations that remove structure.
    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        matches!(
            self,
            Self::DeleteField { .. }
                | Self::DeleteRelation { .. }
                | Self::DeleteModel { .. }
                | Self::DeleteApplication { .. }
        )
    }

    /// Returns true for mutations that add structure.
    #[must_use]
    pub const fn is_addition(&self) -> bool {
        matches!(
            self,
            Self::AddField { .. } | Self::AddRelation { .. } | Self::AddModel { .. }
        )
    }

    /// Returns a human-readable description of this mutation.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::AddField {
                app,
                model,
                field,
                initial,
            } => {
                let mut desc = format!(
                    "Add field '{}' ({}) to '{}.{}'",
                    field.name, field.field_type, app, model
                );
                if let Some(initial) = initial {
                    desc.push_str(&format!(" with initial {initial}"));
                }
                desc
            }
            Self::DeleteField { app, model, field } => {
                format!("Delete field '{}' from '{}.{}'", field, app, model)
            }
            Self::RenameField {
                app,
                model,
                old_name,
                new_name,
                ..
            } => format!(
                "Rename field '{}' to '{}' on '{}.{}'",
                old_name, new_name, app, model
            ),
            Self::ChangeFieldAttribute {
                app,
                model,
                field,
                changes,
                ..
            } => {
                let attrs: Vec<String> = changes
                    .iter()
                    .map(|(attr, change)| {
                        format!("{} {} -> {}", attr, show(&change.old), show(&change.new))
                    })
                    .collect();
                format!(
                    "Change field '{}' on '{}.{}': {}",
                    field,
                    app,
                    model,
                    attrs.join(", ")
                )
            }
            Self::AddModel { app, model } => format!("Add model '{}.{}'", app, model.name),
            Self::DeleteModel { app, model } => format!("Delete model '{}.{}'", app, model),
            Self::DeleteApplication { app } => format!("Delete application '{}'", app),
            Self::AddRelation { app, model, field } => format!(
                "Add relation '{}' to '{}.{}'",
                field.name, app, model
            ),
            Self::DeleteRelation { app, model, field } => {
                format!("Delete relation '{}' from '{}.{}'", field, app, model)
            }
            Self::ChangeMeta { app, model, change } => {
                let what = match change {
                    MetaChange::TableName(_) => "table name",
                    MetaChange::UniqueTogether(_) => "unique_together",
                    MetaChange::Indexes(_) => "indexes",
                };
                format!("Change {} of '{}.{}'", what, app, model)
            }
            Self::RenameModel {
                app,
                old_name,
                new_name,
                ..
            } => format!("Rename model '{}.{}' to '{}'", app, old_name, new_name),
            Self::RawSql {
                app,
                tag,
                statements,
                ..
            } => format!(
                "Run SQL '{}' in '{}' ({} statement(s))",
                tag,
                app,
                statements.len()
            ),
            Self::Unsupported {
                app,
                model,
                field,
                reason,
            } => match field {
                Some(field) => format!(
                    "Unsupported change to '{}.{}.{}': {}",
                    app, model, field, reason
                ),
                None => format!("Unsupported change to '{}.{}': {}", app, model, reason),
            },
        }
    }
}

fn show(value: &Option<AttrValue>) -> String {
    value
        .as_ref()
        .map_or_else(|| "(none)".to_string(), ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::FieldType;

    fn noop(_app: &str, _sig: &mut ProjectSignature) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_description() {
        let m = MutationSpec::add_field(
            "blog",
            "Post",
            FieldSignature::new("body", FieldType::Text).null(true),
        );
        assert_eq!(m.description(), "Add field 'body' (text) to 'blog.Post'");

        let m = MutationSpec::delete_application("legacy");
        assert_eq!(m.description(), "Delete application 'legacy'");

        let mut changes = BTreeMap::new();
        changes.insert(
            AttrName::Null,
            AttrChange::new(Some(AttrValue::Bool(true)), Some(AttrValue::Bool(false))),
        );
        let m = MutationSpec::change_field("blog", "Post", "body", changes);
        assert_eq!(
            m.description(),
            "Change field 'body' on 'blog.Post': null true -> false"
        );
    }

    #[test]
    fn test_with_initial_only_touches_backfilled_variants() {
        let m = MutationSpec::add_field("blog", "Post", FieldSignature::new("n", FieldType::Integer))
            .with_initial(Initial::Value(AttrValue::Int(0)));
        assert!(matches!(m, MutationSpec::AddField { initial: Some(_), .. }));

        let m = MutationSpec::delete_model("blog", "Post").with_initial(Initial::Value(AttrValue::Int(0)));
        assert_eq!(m, MutationSpec::delete_model("blog", "Post"));
    }

    #[test]
    fn test_authored_json_parses() {
        let json = r#"[
            {"type": "AddField", "app": "blog", "model": "Post",
             "field": {"name": "views", "field_type": "integer"},
             "initial": {"kind": "value", "value": 0}},
            {"type": "DeleteField", "app": "blog", "model": "Post", "field": "title"},
            {"type": "ChangeFieldAttribute", "app": "blog", "model": "Post", "field": "slug",
             "changes": {"max_length": {"old": 50, "new": 100}}},
            {"type": "RawSql", "app": "blog", "tag": "backfill",
             "statements": ["UPDATE blog_post SET views = 1"]}
        ]"#;
        let parsed: Vec<MutationSpec> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0].app(), "blog");
        assert!(matches!(
            &parsed[0],
            MutationSpec::AddField { initial: Some(Initial::Value(AttrValue::Int(0))), .. }
        ));
        assert!(parsed[1].is_deletion());
        assert!(matches!(&parsed[3], MutationSpec::RawSql { rewrite: None, .. }));
    }

    #[test]
    fn test_rewrite_is_not_serialized() {
        let m = MutationSpec::raw_sql("blog", "noop", vec!["SELECT 1".to_string()]).with_rewrite(noop);
        assert!(matches!(&m, MutationSpec::RawSql { rewrite: Some(_), .. }));

        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("rewrite"));
        let back: MutationSpec = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, MutationSpec::RawSql { rewrite: None, .. }));
    }

    #[test]
    fn test_classification() {
        let add = MutationSpec::add_model("blog", ModelSignature::new("Tag"));
        assert!(add.is_addition());
        assert_eq!(add.model(), Some("Tag"));
        let delete = MutationSpec::delete_relation("blog", "Post", "tags");
        assert!(delete.is_deletion());
        assert!(!MutationSpec::raw_sql("blog", "x", vec![]).is_addition());
    }
}
