//! Signature reconstruction from mutations.
//!
//! Replaying mutations on a signature is how an evolution is checked without a
//! database: the result of [`simulate`] must equal the declared signature.
//! Replaying never touches the base signature; it always works on a copy.

use crate::error::{EvolutionError, Result};
use crate::mutations::{MetaChange, MutationSpec};
use crate::signature::{
    split_reference, ApplicationSignature, AttrName, AttrValue, FieldSignature, ModelSignature,
    ProjectSignature,
};

/// Replays mutations on a copy of `base` and returns the resulting signature.
pub fn simulate(base: &ProjectSignature, mutations: &[MutationSpec]) -> Result<ProjectSignature> {
    let mut state = SignatureState::new(base.clone());
    state.apply_all(mutations)?;
    Ok(state.into_signature())
}

/// A signature being transformed one mutation at a time.
///
/// After an error the signature is left partially transformed and should be
/// discarded.
#[derive(Debug, Default)]
pub struct SignatureState {
    signature: ProjectSignature,
}

impl SignatureState {
    /// Creates a state starting from `signature`.
    #[must_use]
    pub const fn new(signature: ProjectSignature) -> Self {
        Self { signature }
    }

    /// Returns the current signature.
    #[must_use]
    pub const fn signature(&self) -> &ProjectSignature {
        &self.signature
    }

    /// Consumes and returns the signature.
    #[must_use]
    pub fn into_signature(self) -> ProjectSignature {
        self.signature
    }

    /// Applies a list of mutations in order.
    pub fn apply_all(&mut self, mutations: &[MutationSpec]) -> Result<()> {
        for mutation in mutations {
            self.apply_mutation(mutation)?;
        }
        Ok(())
    }

    /// Applies a single mutation.
    pub fn apply_mutation(&mut self, mutation: &MutationSpec) -> Result<()> {
        match mutation {
            MutationSpec::AddField {
                app,
                model,
                field,
                initial,
            } => {
                field.validate()?;
                if field.field_type.is_many_to_many() {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' is many-to-many; use AddRelation",
                        field.name
                    )));
                }
                self.check_relation(app, field, mutation)?;
                let m = self.model_mut(app, model)?;
                if m.fields.contains_key(&field.name) {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' already exists on '{}.{}'",
                        field.name, app, model
                    )));
                }
                if field.is_primary_key() && m.primary_key().is_some() {
                    return Err(EvolutionError::simulation(format!(
                        "Model '{}.{}' already has a primary key",
                        app, model
                    )));
                }
                if !field.is_null() && field.default().is_none() && initial.is_none() {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' on '{}.{}' is NOT NULL without a default; an initial value is required",
                        field.name, app, model
                    )));
                }
                let mut field = field.clone();
                field.normalize();
                m.fields.insert(field.name.clone(), field);
            }

            MutationSpec::DeleteField { app, model, field } => {
                let m = self.model_mut(app, model)?;
                let existing = field_of(m, app, field)?;
                if existing.field_type.is_many_to_many() {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' on '{}.{}' is many-to-many; use DeleteRelation",
                        field, app, model
                    )));
                }
                m.fields.remove(field);
                drop_meta_references(m, field);
            }

            MutationSpec::RenameField {
                app,
                model,
                old_name,
                new_name,
                db_column,
                db_table,
            } => {
                let m = self.model_mut(app, model)?;
                field_of(m, app, old_name)?;
                if m.fields.contains_key(new_name) {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' already exists on '{}.{}'",
                        new_name, app, model
                    )));
                }
                if let Some(mut field) = m.fields.remove(old_name) {
                    field.name = new_name.clone();
                    if let Some(column) = db_column {
                        field.set_attr(AttrName::DbColumn, Some(AttrValue::Text(column.clone())));
                    }
                    if let Some(table) = db_table {
                        if !field.field_type.is_many_to_many() {
                            return Err(EvolutionError::simulation(format!(
                                "Only many-to-many fields take a join table, '{}' is {}",
                                old_name, field.field_type
                            )));
                        }
                        field.set_attr(AttrName::DbTable, Some(AttrValue::Text(table.clone())));
                    }
                    m.fields.insert(new_name.clone(), field);
                }
                rename_meta_references(m, old_name, new_name);
            }

            MutationSpec::ChangeFieldAttribute {
                app,
                model,
                field,
                changes,
                initial,
            } => {
                let m = self.model_mut(app, model)?;
                let target = m.fields.get_mut(field).ok_or_else(|| {
                    EvolutionError::simulation(format!(
                        "Field '{}' does not exist on '{}.{}'",
                        field, app, model
                    ))
                })?;
                if changes.is_empty() {
                    return Err(EvolutionError::simulation(format!(
                        "No attribute changes given for '{}.{}.{}'",
                        app, model, field
                    )));
                }
                let was_null = target.is_null();
                for (attr, change) in changes {
                    if matches!(attr, AttrName::PrimaryKey | AttrName::RelatedModel) {
                        return Err(EvolutionError::UnsupportedMutation {
                            app: app.clone(),
                            mutation: mutation.description(),
                            reason: format!("changing {} is not supported", attr),
                        });
                    }
                    if !target.field_type.allows(*attr) {
                        return Err(EvolutionError::simulation(format!(
                            "Attribute '{}' is not valid for {} field '{}'",
                            attr, target.field_type, field
                        )));
                    }
                    let current = target.attr(*attr);
                    if current != change.old {
                        return Err(EvolutionError::simulation(format!(
                            "Attribute '{}' of '{}.{}.{}' is {:?}, expected {:?}",
                            attr, app, model, field, current, change.old
                        )));
                    }
                    target.set_attr(*attr, change.new.clone());
                }
                if was_null
                    && !target.is_null()
                    && target.default().is_none()
                    && initial.is_none()
                {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' on '{}.{}' becomes NOT NULL without a default; an initial value is required",
                        field, app, model
                    )));
                }
                target.validate()?;
            }

            MutationSpec::AddModel { app, model } => {
                let application = self
                    .signature
                    .apps
                    .entry(app.clone())
                    .or_insert_with(|| ApplicationSignature::new(app.clone()));
                if application.models.contains_key(&model.name) {
                    return Err(EvolutionError::simulation(format!(
                        "Model '{}.{}' already exists",
                        app, model.name
                    )));
                }
                let mut model = model.clone();
                model.normalize();
                application.models.insert(model.name.clone(), model.clone());
                for field in model.fields.values() {
                    field.validate()?;
                    self.check_relation(app, field, mutation)?;
                }
            }

            MutationSpec::DeleteModel { app, model } => {
                let application = self.app_mut(app)?;
                if application.models.remove(model).is_none() {
                    return Err(missing_model(app, model));
                }
            }

            MutationSpec::DeleteApplication { app } => {
                if self.signature.apps.remove(app).is_none() {
                    return Err(EvolutionError::simulation(format!(
                        "Application '{}' does not exist",
                        app
                    )));
                }
            }

            MutationSpec::AddRelation { app, model, field } => {
                field.validate()?;
                if !field.field_type.is_many_to_many() {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' is not many-to-many; use AddField",
                        field.name
                    )));
                }
                self.check_relation(app, field, mutation)?;
                let m = self.model_mut(app, model)?;
                if m.fields.contains_key(&field.name) {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' already exists on '{}.{}'",
                        field.name, app, model
                    )));
                }
                let mut field = field.clone();
                field.normalize();
                m.fields.insert(field.name.clone(), field);
            }

            MutationSpec::DeleteRelation { app, model, field } => {
                let m = self.model_mut(app, model)?;
                let existing = field_of(m, app, field)?;
                if !existing.field_type.is_many_to_many() {
                    return Err(EvolutionError::simulation(format!(
                        "Field '{}' on '{}.{}' is not many-to-many; use DeleteField",
                        field, app, model
                    )));
                }
                m.fields.remove(field);
            }

            MutationSpec::ChangeMeta { app, model, change } => {
                let m = self.model_mut(app, model)?;
                match change {
                    MetaChange::TableName(table) => m.table_name.clone_from(table),
                    MetaChange::UniqueTogether(together) => {
                        check_meta_fields(m, app, together.iter())?;
                        m.unique_together.clone_from(together);
                    }
                    MetaChange::Indexes(indexes) => {
                        check_meta_fields(m, app, indexes.iter().map(|i| &i.fields))?;
                        m.indexes.clone_from(indexes);
                    }
                }
                m.normalize();
            }

            MutationSpec::RenameModel {
                app,
                old_name,
                new_name,
                db_table,
            } => {
                let application = self.app_mut(app)?;
                if application.models.contains_key(new_name) {
                    return Err(EvolutionError::simulation(format!(
                        "Model '{}.{}' already exists",
                        app, new_name
                    )));
                }
                let mut model = application
                    .models
                    .remove(old_name)
                    .ok_or_else(|| missing_model(app, old_name))?;
                model.name = new_name.clone();
                model.table_name.clone_from(db_table);
                application.models.insert(new_name.clone(), model);

                let old_ref = format!("{}.{}", app, old_name);
                let new_ref = format!("{}.{}", app, new_name);
                for field in self
                    .signature
                    .apps
                    .values_mut()
                    .flat_map(|a| a.models.values_mut())
                    .flat_map(|m| m.fields.values_mut())
                {
                    if field.related() == Some(old_ref.as_str()) {
                        field.set_attr(AttrName::RelatedModel, Some(AttrValue::Text(new_ref.clone())));
                    }
                }
            }

            MutationSpec::RawSql { app, rewrite, .. } => {
                if let Some(rewrite) = rewrite {
                    rewrite.apply(app, &mut self.signature)?;
                }
            }

            MutationSpec::Unsupported { app, reason, .. } => {
                return Err(EvolutionError::UnsupportedMutation {
                    app: app.clone(),
                    mutation: mutation.description(),
                    reason: reason.clone(),
                });
            }
        }

        Ok(())
    }

    fn app_mut(&mut self, app: &str) -> Result<&mut ApplicationSignature> {
        self.signature.get_app_mut(app).ok_or_else(|| {
            EvolutionError::simulation(format!("Application '{}' does not exist", app))
        })
    }

    fn model_mut(&mut self, app: &str, model: &str) -> Result<&mut ModelSignature> {
        self.signature
            .get_model_mut(app, model)
            .ok_or_else(|| missing_model(app, model))
    }

    /// Checks that the target of a relation exists.
    ///
    /// A missing target in another application means that application's
    /// evolutions have to run first.
    fn check_relation(&self, app: &str, field: &FieldSignature, mutation: &MutationSpec) -> Result<()> {
        let Some(target) = field.related() else {
            return Ok(());
        };
        let Some((target_app, _)) = split_reference(target) else {
            return Err(EvolutionError::InvalidSignature(format!(
                "Relation field '{}' references '{}', expected 'app.Model'",
                field.name, target
            )));
        };
        if self.signature.resolve(target).is_some() {
            return Ok(());
        }
        if target_app == app {
            Err(EvolutionError::simulation(format!(
                "Field '{}' references unknown model '{}'",
                field.name, target
            )))
        } else {
            Err(EvolutionError::DependencyUnresolved {
                app: app.to_string(),
                mutation: mutation.description(),
                dependency: target.to_string(),
            })
        }
    }
}

fn missing_model(app: &str, model: &str) -> EvolutionError {
    EvolutionError::simulation(format!("Model '{}.{}' does not exist", app, model))
}

fn field_of<'a>(model: &'a ModelSignature, app: &str, field: &str) -> Result<&'a FieldSignature> {
    model.get_field(field).ok_or_else(|| {
        EvolutionError::simulation(format!(
            "Field '{}' does not exist on '{}.{}'",
            field, app, model.name
        ))
    })
}

fn check_meta_fields<'a>(
    model: &ModelSignature,
    app: &str,
    mut groups: impl Iterator<Item = &'a Vec<String>>,
) -> Result<()> {
    groups.try_for_each(|fields| {
        match fields.iter().find(|f| !model.fields.contains_key(*f)) {
            Some(missing) => Err(EvolutionError::simulation(format!(
                "Model '{}.{}' has no field '{}'",
                app, model.name, missing
            ))),
            None => Ok(()),
        }
    })
}

/// Drops unique-together entries and indexes involving a removed field.
fn drop_meta_references(model: &mut ModelSignature, field: &str) {
    model
        .unique_together
        .retain(|fields| !fields.iter().any(|f| f == field));
    model
        .indexes
        .retain(|index| !index.fields.iter().any(|f| f == field));
}

fn rename_meta_references(model: &mut ModelSignature, old_name: &str, new_name: &str) {
    let groups = model
        .unique_together
        .iter_mut()
        .chain(model.indexes.iter_mut().map(|i| &mut i.fields));
    for fields in groups {
        for f in fields.iter_mut() {
            if f == old_name {
                *f = new_name.to_string();
            }
        }
    }
    model.normalize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::{AttrChange, Initial};
    use crate::signature::{FieldType, IndexSignature};
    use std::collections::BTreeMap;

    fn blog() -> ProjectSignature {
        ProjectSignature::new().app(
            ApplicationSignature::new("blog").model(
                ModelSignature::new("Post")
                    .field(FieldSignature::new("id", FieldType::Auto).primary_key())
                    .field(FieldSignature::new("title", FieldType::Char).max_length(200))
                    .field(FieldSignature::new("slug", FieldType::Char).max_length(50))
                    .unique_together(&["title", "slug"]),
            ),
        )
    }

    #[test]
    fn test_add_nullable_field() {
        let base = blog();
        let result = simulate(
            &base,
            &[MutationSpec::add_field(
                "blog",
                "Post",
                FieldSignature::new("body", FieldType::Text).null(true),
            )],
        )
        .unwrap();

        assert!(result.get_model("blog", "Post").unwrap().get_field("body").is_some());
        // The base is untouched.
        assert!(base.get_model("blog", "Post").unwrap().get_field("body").is_none());
    }

    #[test]
    fn test_add_not_null_needs_initial() {
        let field = FieldSignature::new("views", FieldType::Integer);
        let err = simulate(&blog(), &[MutationSpec::add_field("blog", "Post", field.clone())]);
        assert!(matches!(err, Err(EvolutionError::SimulationFailure(_))));

        let ok = simulate(
            &blog(),
            &[MutationSpec::add_field("blog", "Post", field.clone())
                .with_initial(Initial::Value(AttrValue::Int(0)))],
        );
        assert!(ok.is_ok());

        let with_default = simulate(
            &blog(),
            &[MutationSpec::add_field("blog", "Post", field.default_value(0_i64))],
        );
        assert!(with_default.is_ok());
    }

    #[test]
    fn test_add_existing_field_fails() {
        let result = simulate(
            &blog(),
            &[MutationSpec::add_field(
                "blog",
                "Post",
                FieldSignature::new("title", FieldType::Text).null(true),
            )],
        );
        assert!(matches!(result, Err(EvolutionError::SimulationFailure(_))));
    }

    #[test]
    fn test_delete_field_drops_meta_references() {
        let result = simulate(&blog(), &[MutationSpec::delete_field("blog", "Post", "slug")]).unwrap();
        let post = result.get_model("blog", "Post").unwrap();
        assert!(post.get_field("slug").is_none());
        assert!(post.unique_together.is_empty());
    }

    #[test]
    fn test_rename_field_updates_meta() {
        let result = simulate(
            &blog(),
            &[MutationSpec::rename_field("blog", "Post", "title", "heading")],
        )
        .unwrap();
        let post = result.get_model("blog", "Post").unwrap();
        assert!(post.get_field("title").is_none());
        assert_eq!(post.get_field("heading").unwrap().name, "heading");
        assert_eq!(post.unique_together, vec![vec!["heading", "slug"]]);
    }

    #[test]
    fn test_change_attribute_checks_old_value() {
        let mut changes = BTreeMap::new();
        changes.insert(
            AttrName::MaxLength,
            AttrChange::new(Some(AttrValue::Int(50)), Some(AttrValue::Int(100))),
        );
        let result = simulate(
            &blog(),
            &[MutationSpec::change_field("blog", "Post", "slug", changes.clone())],
        )
        .unwrap();
        assert_eq!(
            result
                .get_model("blog", "Post")
                .unwrap()
                .get_field("slug")
                .unwrap()
                .int_attr(AttrName::MaxLength),
            Some(100)
        );

        // Replaying the same change again sees 100, not 50.
        let twice = simulate(
            &result,
            &[MutationSpec::change_field("blog", "Post", "slug", changes)],
        );
        assert!(matches!(twice, Err(EvolutionError::SimulationFailure(_))));
    }

    #[test]
    fn test_change_primary_key_is_unsupported() {
        let mut changes = BTreeMap::new();
        changes.insert(
            AttrName::PrimaryKey,
            AttrChange::new(Some(AttrValue::Bool(false)), Some(AttrValue::Bool(true))),
        );
        let result = simulate(
            &blog(),
            &[MutationSpec::change_field("blog", "Post", "slug", changes)],
        );
        assert!(matches!(result, Err(EvolutionError::UnsupportedMutation { .. })));
    }

    #[test]
    fn test_cross_app_dependency() {
        let field = FieldSignature::new("author", FieldType::ForeignKey)
            .related_model("auth.User")
            .null(true);
        let result = simulate(&blog(), &[MutationSpec::add_field("blog", "Post", field)]);
        match result {
            Err(EvolutionError::DependencyUnresolved { dependency, .. }) => {
                assert_eq!(dependency, "auth.User");
            }
            other => panic!("expected DependencyUnresolved, got {:?}", other),
        }
    }

    #[test]
    fn test_add_model_creates_app_and_allows_self_reference() {
        let model = ModelSignature::new("Category")
            .field(FieldSignature::new("id", FieldType::Auto).primary_key())
            .field(
                FieldSignature::new("parent", FieldType::ForeignKey)
                    .related_model("shop.Category")
                    .null(true),
            );
        let result = simulate(&ProjectSignature::new(), &[MutationSpec::add_model("shop", model)]).unwrap();
        assert!(result.get_model("shop", "Category").is_some());
    }

    #[test]
    fn test_delete_application() {
        let result = simulate(&blog(), &[MutationSpec::delete_application("blog")]).unwrap();
        assert!(result.apps.is_empty());

        let again = simulate(&result, &[MutationSpec::delete_application("blog")]);
        assert!(again.is_err());
    }

    #[test]
    fn test_relations() {
        let base = blog().app(
            ApplicationSignature::new("tags")
                .model(ModelSignature::new("Tag").field(FieldSignature::new("id", FieldType::Auto).primary_key())),
        );
        let tags = FieldSignature::new("tags", FieldType::ManyToMany).related_model("tags.Tag");

        let added = simulate(&base, &[MutationSpec::add_relation("blog", "Post", tags.clone())]).unwrap();
        assert!(added.get_model("blog", "Post").unwrap().get_field("tags").is_some());

        let wrong = simulate(&base, &[MutationSpec::add_field("blog", "Post", tags)]);
        assert!(wrong.is_err());

        let removed = simulate(&added, &[MutationSpec::delete_relation("blog", "Post", "tags")]).unwrap();
        assert_eq!(removed, base);
    }

    #[test]
    fn test_change_meta() {
        let result = simulate(
            &blog(),
            &[
                MutationSpec::change_meta("blog", "Post", MetaChange::TableName(Some("posts".into()))),
                MutationSpec::change_meta(
                    "blog",
                    "Post",
                    MetaChange::Indexes(vec![IndexSignature::new(vec!["slug".into()])]),
                ),
            ],
        )
        .unwrap();
        let post = result.get_model("blog", "Post").unwrap();
        assert_eq!(post.table("blog"), "posts");
        assert_eq!(post.indexes.len(), 1);

        let bad = simulate(
            &blog(),
            &[MutationSpec::change_meta(
                "blog",
                "Post",
                MetaChange::UniqueTogether(vec![vec!["nope".into()]]),
            )],
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_rename_model_updates_references() {
        let base = blog().app(
            ApplicationSignature::new("comments").model(
                ModelSignature::new("Comment").field(
                    FieldSignature::new("post", FieldType::ForeignKey).related_model("blog.Post"),
                ),
            ),
        );
        let result = simulate(&base, &[MutationSpec::rename_model("blog", "Post", "Article")]).unwrap();
        assert!(result.get_model("blog", "Article").is_some());
        let comment = result.get_model("comments", "Comment").unwrap();
        assert_eq!(comment.get_field("post").unwrap().related(), Some("blog.Article"));
    }

    #[test]
    fn test_raw_sql_rewrite() {
        fn drop_slug(app: &str, sig: &mut ProjectSignature) -> Result<()> {
            if let Some(post) = sig.get_model_mut(app, "Post") {
                post.fields.remove("slug");
                post.unique_together.clear();
            }
            Ok(())
        }

        let result = simulate(
            &blog(),
            &[MutationSpec::raw_sql("blog", "drop-slug", vec!["ALTER TABLE blog_post DROP COLUMN slug".into()])
                .with_rewrite(drop_slug)],
        )
        .unwrap();
        assert!(result.get_model("blog", "Post").unwrap().get_field("slug").is_none());
    }

    #[test]
    fn test_unsupported_fails_loudly() {
        let result = simulate(
            &blog(),
            &[MutationSpec::unsupported("blog", "Post", Some("id".into()), "type change")],
        );
        assert!(matches!(result, Err(EvolutionError::UnsupportedMutation { .. })));
    }
}
