//! Diff engine.
//!
//! Compares two project signatures and produces the ordered mutations that
//! turn the first into the second. Renames are never inferred: a renamed
//! field or model shows up as a deletion plus an addition, and the author
//! replaces that pair with an explicit rename when that is what happened.

use std::collections::{BTreeMap, BTreeSet};

use crate::mutations::{AttrChange, MetaChange, MutationSpec};
use crate::signature::{
    split_reference, AttrName, ApplicationSignature, FieldSignature, ModelSignature,
    ProjectSignature,
};

/// Returns the mutations turning `old` into `new`.
///
/// Removed applications come first, then every remaining application after
/// the applications it references (see [`app_order`]). Within an application
/// every deletion precedes every addition. Relations closing a reference
/// cycle are left out of their model and added once their target exists.
#[must_use]
pub fn diff(old: &ProjectSignature, new: &ProjectSignature) -> Vec<MutationSpec> {
    let mut mutations: Vec<MutationSpec> = old
        .apps
        .keys()
        .filter(|name| !new.apps.contains_key(*name))
        .map(MutationSpec::delete_application)
        .collect();

    let mut planner = Planner::new(old, new);
    for name in app_order(new) {
        mutations.extend(planner.app(&name));
    }
    mutations.extend(planner.deferred);
    mutations
}

/// Returns the mutations turning the `app` portion of `old` into that of
/// `new`. Models of the other applications of `new` are taken as present.
#[must_use]
pub fn diff_app(old: &ProjectSignature, new: &ProjectSignature, app: &str) -> Vec<MutationSpec> {
    let mut planner = Planner::new(old, new);
    for other in new.apps.values().filter(|a| a.name != app) {
        for model in other.models.keys() {
            planner.available.insert(format!("{}.{}", other.name, model));
        }
    }
    let mut mutations = planner.app(app);
    mutations.extend(planner.deferred);
    mutations
}

/// Returns the differences between the `app` portions of two signatures as
/// human-readable lines.
#[must_use]
pub fn describe_app(old: &ProjectSignature, new: &ProjectSignature, app: &str) -> Vec<String> {
    diff_app(old, new, app)
        .iter()
        .map(MutationSpec::description)
        .collect()
}

/// Orders the applications of `signature` so that every application comes
/// after the applications its relations point to. A cycle is broken at its
/// first application by name.
#[must_use]
pub fn app_order(signature: &ProjectSignature) -> Vec<String> {
    let mut pending: BTreeMap<&str, BTreeSet<&str>> = signature
        .apps
        .values()
        .map(|app| {
            let deps = app
                .models
                .values()
                .flat_map(|m| m.fields.values())
                .filter_map(FieldSignature::related)
                .filter_map(split_reference)
                .map(|(target, _)| target)
                .filter(|target| *target != app.name && signature.apps.contains_key(*target))
                .collect();
            (app.name.as_str(), deps)
        })
        .collect();

    let mut ordered = Vec::with_capacity(pending.len());
    loop {
        let next = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .or_else(|| pending.iter().next())
            .map(|(name, _)| *name);
        let Some(name) = next else {
            break;
        };
        pending.remove(name);
        for deps in pending.values_mut() {
            deps.remove(name);
        }
        ordered.push(name.to_string());
    }
    ordered
}

/// Where the target of a relation stands while models are being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    /// Exists already, or is the model itself.
    Present,
    /// A new model of the same application that has not been created yet.
    Pending,
    /// A new model of an application planned later.
    Later,
}

/// Plans applications one after another, tracking which models exist at
/// each point of the mutation sequence.
struct Planner<'s> {
    old: &'s ProjectSignature,
    new: &'s ProjectSignature,
    /// `"app.Model"` references of models that exist at this point.
    available: BTreeSet<String>,
    /// Relation additions waiting for a later application.
    deferred: Vec<MutationSpec>,
}

impl<'s> Planner<'s> {
    fn new(old: &'s ProjectSignature, new: &'s ProjectSignature) -> Self {
        let mut available = BTreeSet::new();
        for app in new.apps.values() {
            for name in app.models.keys() {
                if old.get_model(&app.name, name).is_some() {
                    available.insert(format!("{}.{}", app.name, name));
                }
            }
        }
        Self {
            old,
            new,
            available,
            deferred: Vec::new(),
        }
    }

    fn app(&mut self, app: &str) -> Vec<MutationSpec> {
        let (old, new) = (self.old, self.new);
        let (old_app, new_app) = match (old.get_app(app), new.get_app(app)) {
            (None, None) => return Vec::new(),
            (Some(_), None) => return vec![MutationSpec::delete_application(app)],
            (old_app, Some(new_app)) => (old_app, new_app),
        };

        let mut changes = AppChanges::default();
        let old_models = old_app.map(|a| &a.models);

        if let Some(old_models) = old_models {
            for name in old_models.keys() {
                if !new_app.models.contains_key(name) {
                    changes.model_deletions.push(MutationSpec::delete_model(app, name.clone()));
                }
            }
        }

        let added = new_app
            .models
            .values()
            .filter(|m| old_models.map_or(true, |models| !models.contains_key(&m.name)))
            .map(|m| (m.name.as_str(), m))
            .collect();
        self.create_models(new_app, added, &mut changes);

        if let Some(old_models) = old_models {
            for (name, new_model) in &new_app.models {
                if let Some(old_model) = old_models.get(name) {
                    changes.diff_model(app, old_model, new_model);
                }
            }
        }

        let mut waiting = BTreeSet::new();
        for addition in std::mem::take(&mut changes.field_additions) {
            if self.waits_for_later(&addition) {
                waiting.extend(addition.model().map(str::to_string));
                self.deferred.push(addition);
            } else {
                changes.field_additions.push(addition);
            }
        }
        // Meta of a model with a pending relation may name that relation.
        for change in std::mem::take(&mut changes.meta_changes) {
            if change.model().is_some_and(|m| waiting.contains(m)) {
                self.deferred.push(change);
            } else {
                changes.meta_changes.push(change);
            }
        }

        changes.into_mutations()
    }

    /// Emits `AddModel` for every new model of `app`, each after the models
    /// of `app` it references. A reference cycle is broken at a model whose
    /// blocking relations are nullable (or many-to-many) when there is one:
    /// the model is created without them and they are added afterwards.
    fn create_models(
        &mut self,
        app: &'s ApplicationSignature,
        mut pending: BTreeMap<&'s str, &'s ModelSignature>,
        changes: &mut AppChanges,
    ) {
        let name = app.name.as_str();
        loop {
            let next = pending
                .values()
                .find(|m| !self.blocked(name, m, &pending, |_| false))
                .or_else(|| {
                    pending.values().find(|m| {
                        !self.blocked(name, m, &pending, |f| {
                            f.is_null() || f.field_type.is_many_to_many()
                        })
                    })
                })
                .or_else(|| {
                    pending
                        .values()
                        .find(|m| !self.blocked(name, m, &pending, |f| !f.is_primary_key()))
                })
                .or_else(|| pending.values().next())
                .copied();
            let Some(model) = next else {
                break;
            };
            pending.remove(model.name.as_str());

            let mut created = model.clone();
            let mut waits_for_later = false;
            for field in model.fields.values() {
                let addition = relation_addition(name, &model.name, field);
                match self.target(name, &model.name, field, &pending) {
                    Target::Present => continue,
                    Target::Pending => changes.field_additions.push(addition),
                    Target::Later => {
                        waits_for_later = true;
                        self.deferred.push(addition);
                    }
                }
                created.fields.remove(&field.name);
            }

            if created.fields.len() != model.fields.len() {
                created
                    .unique_together
                    .retain(|group| group.iter().all(|f| created.fields.contains_key(f)));
                created
                    .indexes
                    .retain(|index| index.fields.iter().all(|f| created.fields.contains_key(f)));

                let mut restores = Vec::new();
                if created.unique_together != model.unique_together {
                    restores.push(MutationSpec::change_meta(
                        name,
                        &model.name,
                        MetaChange::UniqueTogether(model.unique_together.clone()),
                    ));
                }
                if created.indexes != model.indexes {
                    restores.push(MutationSpec::change_meta(
                        name,
                        &model.name,
                        MetaChange::Indexes(model.indexes.clone()),
                    ));
                }
                if waits_for_later {
                    self.deferred.extend(restores);
                } else {
                    changes.meta_changes.extend(restores);
                }
            }

            self.available.insert(format!("{}.{}", name, model.name));
            changes.model_additions.push(MutationSpec::add_model(name, created));
        }
    }

    /// Whether `model` references a model still pending creation through a
    /// field `breakable` does not accept.
    fn blocked(
        &self,
        app: &str,
        model: &ModelSignature,
        pending: &BTreeMap<&str, &ModelSignature>,
        breakable: fn(&FieldSignature) -> bool,
    ) -> bool {
        model.fields.values().any(|f| {
            !breakable(f) && self.target(app, &model.name, f, pending) == Target::Pending
        })
    }

    fn target(
        &self,
        app: &str,
        model: &str,
        field: &FieldSignature,
        pending: &BTreeMap<&str, &ModelSignature>,
    ) -> Target {
        let Some(reference) = field.related() else {
            return Target::Present;
        };
        let Some((target_app, target_model)) = split_reference(reference) else {
            return Target::Present;
        };
        if (target_app == app && target_model == model) || self.available.contains(reference) {
            Target::Present
        } else if target_app == app && pending.contains_key(target_model) {
            Target::Pending
        } else if self.new.get_model(target_app, target_model).is_some() {
            Target::Later
        } else {
            // Unknown targets are left for the simulation to report.
            Target::Present
        }
    }

    fn waits_for_later(&self, mutation: &MutationSpec) -> bool {
        match mutation {
            MutationSpec::AddField {
                app, model, field, ..
            }
            | MutationSpec::AddRelation { app, model, field } => {
                self.target(app, model, field, &BTreeMap::new()) == Target::Later
            }
            _ => false,
        }
    }
}

fn relation_addition(app: &str, model: &str, field: &FieldSignature) -> MutationSpec {
    if field.field_type.is_many_to_many() {
        MutationSpec::add_relation(app, model, field.clone())
    } else {
        MutationSpec::add_field(app, model, field.clone())
    }
}

/// Mutations of one application, bucketed by kind so they can be emitted in
/// dependency order.
#[derive(Default)]
struct AppChanges {
    model_deletions: Vec<MutationSpec>,
    field_deletions: Vec<MutationSpec>,
    model_additions: Vec<MutationSpec>,
    field_additions: Vec<MutationSpec>,
    field_changes: Vec<MutationSpec>,
    meta_changes: Vec<MutationSpec>,
}

impl AppChanges {
    fn into_mutations(self) -> Vec<MutationSpec> {
        let mut mutations = self.model_deletions;
        mutations.extend(self.field_deletions);
        mutations.extend(self.model_additions);
        mutations.extend(self.field_additions);
        mutations.extend(self.field_changes);
        mutations.extend(self.meta_changes);
        mutations
    }

    fn diff_model(&mut self, app: &str, old: &ModelSignature, new: &ModelSignature) {
        let model = new.name.as_str();
        let mut deleted = BTreeSet::new();

        for name in old.fields.keys() {
            if new.fields.contains_key(name) {
                continue;
            }
            let field = &old.fields[name];
            deleted.insert(name.as_str());
            self.field_deletions.push(if field.field_type.is_many_to_many() {
                MutationSpec::delete_relation(app, model, name.clone())
            } else {
                MutationSpec::delete_field(app, model, name.clone())
            });
        }

        for (name, field) in &new.fields {
            match old.fields.get(name) {
                None => self.added_field(app, old, model, field),
                Some(old_field) => self.changed_field(app, model, old_field, field),
            }
        }

        if old.table_name != new.table_name {
            self.meta_changes.push(MutationSpec::change_meta(
                app,
                model,
                MetaChange::TableName(new.table_name.clone()),
            ));
        }
        let surviving_together: Vec<Vec<String>> = old
            .unique_together
            .iter()
            .filter(|group| !group.iter().any(|f| deleted.contains(f.as_str())))
            .cloned()
            .collect();
        if surviving_together != new.unique_together {
            self.meta_changes.push(MutationSpec::change_meta(
                app,
                model,
                MetaChange::UniqueTogether(new.unique_together.clone()),
            ));
        }
        let surviving_indexes: Vec<_> = old
            .indexes
            .iter()
            .filter(|index| !index.fields.iter().any(|f| deleted.contains(f.as_str())))
            .cloned()
            .collect();
        if surviving_indexes != new.indexes {
            self.meta_changes.push(MutationSpec::change_meta(
                app,
                model,
                MetaChange::Indexes(new.indexes.clone()),
            ));
        }
    }

    fn added_field(&mut self, app: &str, old: &ModelSignature, model: &str, field: &FieldSignature) {
        if field.field_type.is_many_to_many() {
            self.field_additions
                .push(MutationSpec::add_relation(app, model, field.clone()));
        } else if field.is_primary_key() {
            let reason = match old.primary_key() {
                Some(current) => format!(
                    "adding primary key '{}' to a model keyed by '{}'",
                    field.name, current.name
                ),
                None => format!("adding primary key '{}' to an existing table", field.name),
            };
            self.field_changes.push(MutationSpec::unsupported(
                app,
                model,
                Some(field.name.clone()),
                reason,
            ));
        } else {
            self.field_additions
                .push(MutationSpec::add_field(app, model, field.clone()));
        }
    }

    fn changed_field(&mut self, app: &str, model: &str, old: &FieldSignature, new: &FieldSignature) {
        if old == new {
            return;
        }
        if old.field_type != new.field_type {
            self.field_changes.push(MutationSpec::unsupported(
                app,
                model,
                Some(new.name.clone()),
                format!("changing type from {} to {}", old.field_type, new.field_type),
            ));
            return;
        }

        let mut changes = BTreeMap::new();
        for attr in AttrName::ALL {
            let (before, after) = (old.attr(attr), new.attr(attr));
            if before != after {
                changes.insert(attr, AttrChange::new(before, after));
            }
        }

        let blocked = [AttrName::PrimaryKey, AttrName::RelatedModel]
            .into_iter()
            .find(|attr| changes.contains_key(attr));
        if let Some(attr) = blocked {
            self.field_changes.push(MutationSpec::unsupported(
                app,
                model,
                Some(new.name.clone()),
                format!("changing {}", attr),
            ));
        } else if !changes.is_empty() {
            self.field_changes
                .push(MutationSpec::change_field(app, model, new.name.clone(), changes));
        }
    }
}
