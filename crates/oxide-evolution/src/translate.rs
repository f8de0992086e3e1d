//! Mutation to SQL translation.
//!
//! Every mutation is translated from the signature before it and the
//! signature after it, so the translator never has to re-derive what a
//! mutation does to the model. The strategy for each change is chosen from
//! the backend [`Capabilities`](crate::backend::Capabilities).

use std::collections::BTreeMap;

use tracing::debug;

use crate::backend::{
    column_index_name, composite_index_name, foreign_key_name, unique_name, Backend, ColumnDef,
};
use crate::error::{EvolutionError, Result};
use crate::mutations::{AttrChange, Initial, MetaChange, MutationSpec};
use crate::signature::{
    split_reference, AttrName, FieldSignature, FieldType, ModelSignature, ProjectSignature,
};

/// Secondary structure attached to a table: indexes, unique and foreign key
/// constraints.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ConstraintSpec {
    name: String,
    table: String,
    columns: Vec<String>,
    kind: ConstraintKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConstraintKind {
    Index { unique: bool },
    Unique,
    ForeignKey(Option<(String, String)>),
}

/// What is being translated.
struct Context<'s> {
    before: &'s ProjectSignature,
    after: &'s ProjectSignature,
    app: &'s str,
    mutation: &'s MutationSpec,
}

/// Translates mutations into statements for one backend.
pub struct Translator<'a> {
    backend: &'a dyn Backend,
    purge: bool,
}

impl<'a> Translator<'a> {
    /// Creates a translator for `backend`.
    #[must_use]
    pub fn new(backend: &'a dyn Backend) -> Self {
        Self {
            backend,
            purge: false,
        }
    }

    /// Sets whether `DeleteApplication` drops the application's tables.
    #[must_use]
    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    /// Returns the statements implementing `mutation`, given the signatures
    /// before and after it.
    pub fn translate(
        &self,
        before: &ProjectSignature,
        after: &ProjectSignature,
        mutation: &MutationSpec,
    ) -> Result<Vec<String>> {
        let cx = Context {
            before,
            after,
            app: mutation.app(),
            mutation,
        };

        match mutation {
            MutationSpec::AddField {
                model,
                field,
                initial,
                ..
            } => self.add_field(&cx, model, field, initial.as_ref()),

            MutationSpec::DeleteField { model, field, .. } => self.delete_field(&cx, model, field),

            MutationSpec::RenameField {
                model,
                old_name,
                new_name,
                ..
            } => self.rename_field(&cx, model, old_name, new_name),

            MutationSpec::ChangeFieldAttribute {
                model,
                field,
                changes,
                initial,
                ..
            } => self.change_field(&cx, model, field, changes, initial.as_ref()),

            MutationSpec::AddModel { model, .. } => {
                let created = model_of(after, cx.app, &model.name)?;
                self.create_model(after, cx.app, created)
            }

            MutationSpec::DeleteModel { model, .. } => {
                let dropped = model_of(before, cx.app, model)?;
                Ok(self.drop_model(cx.app, dropped))
            }

            MutationSpec::DeleteApplication { app } => {
                if !self.purge {
                    debug!(app = %app, "keeping tables of deleted application");
                    return Ok(Vec::new());
                }
                let application = before.get_app(app).ok_or_else(|| {
                    EvolutionError::simulation(format!("Application '{}' does not exist", app))
                })?;
                Ok(application
                    .models
                    .values()
                    .flat_map(|m| self.drop_model(app, m))
                    .collect())
            }

            MutationSpec::AddRelation { model, field, .. } => {
                let owner = model_of(after, cx.app, model)?;
                self.create_join_table(after, cx.app, owner, field)
            }

            MutationSpec::DeleteRelation { model, field, .. } => {
                let owner = model_of(before, cx.app, model)?;
                let relation = field_of(owner, field)?;
                Ok(vec![self
                    .backend
                    .drop_table_sql(&self.join_table(cx.app, owner, relation))])
            }

            MutationSpec::ChangeMeta { model, change, .. } => {
                let old = model_of(before, cx.app, model)?;
                let new = model_of(after, cx.app, model)?;
                let body = match change {
                    MetaChange::TableName(_) => self.rename_tables(cx.app, old, new),
                    MetaChange::UniqueTogether(_) | MetaChange::Indexes(_) => Vec::new(),
                };
                self.with_constraints(&cx, old, new, body)
            }

            MutationSpec::RenameModel {
                old_name, new_name, ..
            } => {
                let old = model_of(before, cx.app, old_name)?;
                let new = model_of(after, cx.app, new_name)?;
                let body = self.rename_tables(cx.app, old, new);
                self.with_constraints(&cx, old, new, body)
            }

            MutationSpec::RawSql { statements, .. } => Ok(statements.clone()),

            MutationSpec::Unsupported { reason, .. } => Err(self.unsupported(&cx, reason.as_str())),
        }
    }

    fn add_field(
        &self,
        cx: &Context<'_>,
        model: &str,
        field: &FieldSignature,
        initial: Option<&Initial>,
    ) -> Result<Vec<String>> {
        let caps = self.backend.capabilities();
        let old = model_of(cx.before, cx.app, model)?;
        let new = model_of(cx.after, cx.app, model)?;
        if field.is_primary_key() {
            return Err(self.unsupported(cx, "adding a primary key to an existing table"));
        }

        let table = self.table(cx.app, new);
        let column = self.column_def(cx.after, field)?;
        let needs_backfill = !field.is_null() && field.default().is_none();
        // SQLite refuses REFERENCES columns with a non-NULL default in ADD COLUMN.
        let reference_limit = caps.rebuilds_tables && column.references.is_some() && !column.null;

        if !needs_backfill && !reference_limit {
            let body = vec![self.backend.add_column_sql(&table, &column)];
            return self.with_constraints(cx, old, new, body);
        }

        let value_sql = match (initial, field.default()) {
            (Some(initial), _) => self.value_sql(initial),
            (None, Some(default)) => self.backend.literal(default),
            (None, None) => {
                return Err(EvolutionError::simulation(format!(
                    "Field '{}' on '{}.{}' needs an initial value",
                    field.name, cx.app, model
                )))
            }
        };

        let mut body = Vec::new();
        match initial {
            Some(Initial::Value(value)) if caps.can_add_not_null_with_default && !reference_limit => {
                let mut with_default = column.clone();
                with_default.default = Some(value.clone());
                body.push(self.backend.add_column_sql(&table, &with_default));
                if field.default().is_none() && caps.can_alter_column {
                    body.push(self.backend.alter_column_default_sql(&table, &column.name, None));
                }
            }
            _ if caps.can_alter_column => {
                let mut nullable = column.clone();
                nullable.null = true;
                body.push(self.backend.add_column_sql(&table, &nullable));
                body.push(self.backend.backfill_sql(&table, &column.name, &value_sql));
                body.push(self.backend.alter_column_null_sql(&table, &column));
            }
            _ if caps.rebuilds_tables => {
                let mut sources = BTreeMap::new();
                sources.insert(field.name.clone(), value_sql);
                return self.rebuild(cx, old, new, &sources);
            }
            _ => {
                return Err(self.unsupported(cx, "adding a NOT NULL column without a default"));
            }
        }
        self.with_constraints(cx, old, new, body)
    }

    fn delete_field(&self, cx: &Context<'_>, model: &str, field: &str) -> Result<Vec<String>> {
        let caps = self.backend.capabilities();
        let old = model_of(cx.before, cx.app, model)?;
        let new = model_of(cx.after, cx.app, model)?;
        let removed = field_of(old, field)?;

        let blocks_drop = caps.rebuilds_tables
            && (removed.is_primary_key() || removed.field_type.is_column_relation());
        if caps.can_drop_column && !blocks_drop {
            let body = vec![self
                .backend
                .drop_column_sql(&self.table(cx.app, old), &removed.column())];
            self.with_constraints(cx, old, new, body)
        } else if caps.rebuilds_tables {
            self.rebuild(cx, old, new, &BTreeMap::new())
        } else {
            Err(self.unsupported(cx, "dropping a column"))
        }
    }

    fn rename_field(
        &self,
        cx: &Context<'_>,
        model: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<Vec<String>> {
        let old = model_of(cx.before, cx.app, model)?;
        let new = model_of(cx.after, cx.app, model)?;
        let old_field = field_of(old, old_name)?;
        let new_field = field_of(new, new_name)?;

        if old_field.field_type.is_many_to_many() {
            let from = self.join_table(cx.app, old, old_field);
            let to = self.join_table(cx.app, new, new_field);
            if from == to {
                return Ok(Vec::new());
            }
            return Ok(vec![self.backend.rename_table_sql(&from, &to)]);
        }

        let table = self.table(cx.app, new);
        match self.rename_column(cx.after, &table, old_field, new_field)? {
            Some(body) => self.with_constraints(cx, old, new, body),
            None if self.backend.capabilities().rebuilds_tables => {
                let mut sources = BTreeMap::new();
                sources.insert(
                    new_field.name.clone(),
                    self.backend.quote_identifier(&old_field.column()),
                );
                self.rebuild(cx, old, new, &sources)
            }
            None => Err(self.unsupported(
                cx,
                format!("renaming constrained column '{}'", old_field.column()),
            )),
        }
    }

    fn change_field(
        &self,
        cx: &Context<'_>,
        model: &str,
        field: &str,
        changes: &BTreeMap<AttrName, AttrChange>,
        initial: Option<&Initial>,
    ) -> Result<Vec<String>> {
        let caps = self.backend.capabilities();
        let old = model_of(cx.before, cx.app, model)?;
        let new = model_of(cx.after, cx.app, model)?;
        let old_field = field_of(old, field)?;
        let new_field = field_of(new, field)?;

        if new_field.field_type.is_many_to_many() {
            let from = self.join_table(cx.app, old, old_field);
            let to = self.join_table(cx.app, new, new_field);
            if from == to {
                return Ok(Vec::new());
            }
            return Ok(vec![self.backend.rename_table_sql(&from, &to)]);
        }

        let table = self.table(cx.app, new);
        let structural = changes
            .keys()
            .any(|attr| !matches!(attr, AttrName::DbIndex | AttrName::Unique | AttrName::DbColumn));

        if structural && !caps.can_alter_column {
            if !caps.rebuilds_tables {
                return Err(self.unsupported(cx, "altering a column"));
            }
            let mut sources = BTreeMap::new();
            if let Some(initial) = initial {
                if old_field.is_null() && !new_field.is_null() {
                    sources.insert(
                        new_field.name.clone(),
                        format!(
                            "COALESCE({}, {})",
                            self.backend.quote_identifier(&old_field.column()),
                            self.value_sql(initial)
                        ),
                    );
                }
            }
            return self.rebuild(cx, old, new, &sources);
        }

        let mut body = Vec::new();
        if changes.contains_key(&AttrName::DbColumn) {
            match self.rename_column(cx.after, &table, old_field, new_field)? {
                Some(statements) => body.extend(statements),
                None if caps.rebuilds_tables => return self.rebuild(cx, old, new, &BTreeMap::new()),
                None => {
                    return Err(self.unsupported(
                        cx,
                        format!("renaming constrained column '{}'", old_field.column()),
                    ))
                }
            }
        }

        let column = self.column_def(cx.after, new_field)?;
        let retyped = changes.keys().any(|attr| {
            matches!(
                attr,
                AttrName::MaxLength | AttrName::MaxDigits | AttrName::DecimalPlaces
            )
        });
        if retyped {
            body.push(self.backend.alter_column_type_sql(&table, &column));
        }
        if changes.contains_key(&AttrName::Default) {
            body.push(self.backend.alter_column_default_sql(
                &table,
                &column.name,
                new_field.default(),
            ));
        }
        if changes.contains_key(&AttrName::Null) {
            if !new_field.is_null() {
                if let Some(initial) = initial {
                    body.push(self.backend.backfill_sql(
                        &table,
                        &column.name,
                        &self.value_sql(initial),
                    ));
                }
            }
            body.push(self.backend.alter_column_null_sql(&table, &column));
        }
        self.with_constraints(cx, old, new, body)
    }

    /// Renames a column in place, or with an add/copy/drop sequence.
    ///
    /// Returns `None` when neither is possible on this backend.
    fn rename_column(
        &self,
        project: &ProjectSignature,
        table: &str,
        old_field: &FieldSignature,
        new_field: &FieldSignature,
    ) -> Result<Option<Vec<String>>> {
        let caps = self.backend.capabilities();
        let from = old_field.column();
        let to = new_field.column();
        if from == to {
            return Ok(Some(Vec::new()));
        }
        if caps.can_rename_column {
            return Ok(Some(vec![self.backend.rename_column_sql(table, &from, &to)]));
        }
        let copyable = caps.can_drop_column
            && !old_field.is_constrained()
            && (new_field.is_null() || caps.can_alter_column);
        if !copyable {
            return Ok(None);
        }

        let column = self.column_def(project, new_field)?;
        let mut nullable = column.clone();
        nullable.null = true;
        let mut statements = vec![
            self.backend.add_column_sql(table, &nullable),
            self.backend.copy_column_sql(table, &from, &to),
        ];
        if !column.null {
            statements.push(self.backend.alter_column_null_sql(table, &column));
        }
        statements.push(self.backend.drop_column_sql(table, &from));
        Ok(Some(statements))
    }

    fn create_model(&self, project: &ProjectSignature, app: &str, model: &ModelSignature) -> Result<Vec<String>> {
        let table = self.table(app, model);
        let columns = model
            .column_fields()
            .map(|f| self.column_def(project, f))
            .collect::<Result<Vec<_>>>()?;

        let mut statements = vec![self.backend.create_table_sql(&table, &columns, &[])];
        for spec in self.constraints(project, app, model) {
            statements.push(self.create_constraint(&spec)?);
        }
        for field in model.relation_fields() {
            statements.extend(self.create_join_table(project, app, model, field)?);
        }
        Ok(statements)
    }

    fn drop_model(&self, app: &str, model: &ModelSignature) -> Vec<String> {
        let mut statements: Vec<String> = model
            .relation_fields()
            .map(|f| self.backend.drop_table_sql(&self.join_table(app, model, f)))
            .collect();
        statements.push(self.backend.drop_table_sql(&self.table(app, model)));
        statements
    }

    fn create_join_table(
        &self,
        project: &ProjectSignature,
        app: &str,
        model: &ModelSignature,
        field: &FieldSignature,
    ) -> Result<Vec<String>> {
        let caps = self.backend.capabilities();
        let join = self.join_table(app, model, field);
        let (target_table, target_column, target_storage) = self.reference(project, field)?;
        let target_name = field
            .related()
            .and_then(split_reference)
            .map(|(_, name)| name.to_lowercase())
            .unwrap_or_default();

        let (source_column, source_storage) = model.primary_key().map_or_else(
            || ("id".to_string(), FieldSignature::new("id", FieldType::Integer)),
            |pk| (pk.column(), storage_field(pk)),
        );

        let mut from = format!("{}_id", model.name.to_lowercase());
        let mut to = format!("{}_id", target_name);
        if from == to {
            from = format!("from_{from}");
            to = format!("to_{to}");
        }

        let id = ColumnDef {
            name: "id".to_string(),
            sql_type: self.backend.column_type(&FieldSignature::new("id", FieldType::Auto)),
            null: false,
            primary_key: true,
            auto_increment: true,
            default: None,
            references: None,
        };
        let source = ColumnDef {
            name: from.clone(),
            sql_type: self.backend.column_type(&source_storage),
            null: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            references: Some((self.table(app, model), source_column)),
        };
        let target = ColumnDef {
            name: to.clone(),
            sql_type: self.backend.column_type(&target_storage),
            null: false,
            primary_key: false,
            auto_increment: false,
            default: None,
            references: Some((target_table, target_column)),
        };

        let mut statements = vec![self
            .backend
            .create_table_sql(&join, &[id, source.clone(), target.clone()], &[])];
        if !caps.supports_inline_references && caps.supports_add_constraint {
            for column in [&source, &target] {
                if let Some(ref references) = column.references {
                    statements.push(self.backend.add_foreign_key_sql(
                        &join,
                        &self.backend.truncate_name(&foreign_key_name(&join, &column.name)),
                        &column.name,
                        references,
                    ));
                }
            }
        }
        let pair = vec![from, to];
        statements.push(self.backend.create_index_sql(
            &self
                .backend
                .truncate_name(&composite_index_name(&join, &pair, true)),
            &join,
            &pair,
            true,
        ));
        Ok(statements)
    }

    /// Renames the model table and any join table whose default name follows it.
    fn rename_tables(&self, app: &str, old: &ModelSignature, new: &ModelSignature) -> Vec<String> {
        let mut statements = Vec::new();
        let from = self.table(app, old);
        let to = self.table(app, new);
        if from != to {
            statements.push(self.backend.rename_table_sql(&from, &to));
        }
        for field in new.relation_fields() {
            if let Some(old_field) = old.get_field(&field.name) {
                let from = self.join_table(app, old, old_field);
                let to = self.join_table(app, new, field);
                if from != to {
                    statements.push(self.backend.rename_table_sql(&from, &to));
                }
            }
        }
        statements
    }

    /// Recreates a table with the new definition and copies its rows.
    ///
    /// `sources` overrides the SELECT expression for new-side field names;
    /// other columns are copied from the same-named field or filled from
    /// their default.
    fn rebuild(
        &self,
        cx: &Context<'_>,
        old: &ModelSignature,
        new: &ModelSignature,
        sources: &BTreeMap<String, String>,
    ) -> Result<Vec<String>> {
        let table = self.table(cx.app, new);
        let temp = self
            .backend
            .truncate_name(&format!("{}__new", new.table(cx.app)));
        debug!(table = %table, "rebuilding table");

        let mut columns = Vec::new();
        let mut names = Vec::new();
        let mut selects = Vec::new();
        for field in new.column_fields() {
            let column = self.column_def(cx.after, field)?;
            let select = if let Some(source) = sources.get(&field.name) {
                source.clone()
            } else if let Some(previous) = old
                .get_field(&field.name)
                .filter(|f| !f.field_type.is_many_to_many())
            {
                self.backend.quote_identifier(&previous.column())
            } else if let Some(default) = field.default() {
                self.backend.literal(default)
            } else if field.is_null() {
                "NULL".to_string()
            } else {
                return Err(EvolutionError::simulation(format!(
                    "No value to copy into column '{}' of '{}'",
                    column.name, table
                )));
            };
            names.push(column.name.clone());
            selects.push(select);
            columns.push(column);
        }

        let mut statements = self.backend.begin_rebuild_sql();
        statements.push(self.backend.create_table_sql(&temp, &columns, &[]));
        statements.push(self.backend.copy_rows_sql(&temp, &table, &names, &selects));
        statements.push(self.backend.drop_table_sql(&table));
        statements.push(self.backend.rename_table_sql(&temp, &table));
        for spec in self.constraints(cx.after, cx.app, new) {
            statements.push(self.create_constraint(&spec)?);
        }
        statements.extend(self.backend.end_rebuild_sql());
        Ok(statements)
    }

    /// Wraps column statements with the index and constraint changes between
    /// the two model versions: drops first, creations last.
    fn with_constraints(
        &self,
        cx: &Context<'_>,
        old: &ModelSignature,
        new: &ModelSignature,
        body: Vec<String>,
    ) -> Result<Vec<String>> {
        let before = self.constraints(cx.before, cx.app, old);
        let after = self.constraints(cx.after, cx.app, new);

        let mut statements: Vec<String> = before
            .iter()
            .filter(|spec| !after.contains(spec))
            .map(|spec| self.drop_constraint(spec))
            .collect();
        statements.extend(body);
        for spec in after.iter().filter(|spec| !before.contains(spec)) {
            statements.push(self.create_constraint(spec)?);
        }
        Ok(statements)
    }

    fn constraints(&self, project: &ProjectSignature, app: &str, model: &ModelSignature) -> Vec<ConstraintSpec> {
        let caps = self.backend.capabilities();
        let table = self.table(app, model);
        let mut specs = Vec::new();

        for field in model.column_fields() {
            if field.is_primary_key() {
                continue;
            }
            let column = field.column();
            if field.is_unique() {
                specs.push(ConstraintSpec {
                    name: self.backend.truncate_name(&unique_name(&table, &column)),
                    table: table.clone(),
                    columns: vec![column.clone()],
                    kind: if caps.supports_add_constraint {
                        ConstraintKind::Unique
                    } else {
                        ConstraintKind::Index { unique: true }
                    },
                });
            } else if field.has_db_index() {
                specs.push(ConstraintSpec {
                    name: self.backend.truncate_name(&column_index_name(&table, &column)),
                    table: table.clone(),
                    columns: vec![column.clone()],
                    kind: ConstraintKind::Index { unique: false },
                });
            }
            if field.field_type.is_column_relation()
                && !caps.supports_inline_references
                && caps.supports_add_constraint
            {
                let references = self
                    .reference(project, field)
                    .ok()
                    .map(|(table, column, _)| (table, column));
                specs.push(ConstraintSpec {
                    name: self.backend.truncate_name(&foreign_key_name(&table, &column)),
                    table: table.clone(),
                    columns: vec![column],
                    kind: ConstraintKind::ForeignKey(references),
                });
            }
        }

        for fields in &model.unique_together {
            let columns = columns_of(model, fields);
            specs.push(ConstraintSpec {
                name: self
                    .backend
                    .truncate_name(&composite_index_name(&table, &columns, true)),
                table: table.clone(),
                columns,
                kind: ConstraintKind::Index { unique: true },
            });
        }
        for index in &model.indexes {
            let columns = columns_of(model, &index.fields);
            let name = index
                .name
                .clone()
                .unwrap_or_else(|| composite_index_name(&table, &columns, false));
            specs.push(ConstraintSpec {
                name: self.backend.truncate_name(&name),
                table: table.clone(),
                columns,
                kind: ConstraintKind::Index { unique: false },
            });
        }
        specs
    }

    fn create_constraint(&self, spec: &ConstraintSpec) -> Result<String> {
        match &spec.kind {
            ConstraintKind::Index { unique } => Ok(self.backend.create_index_sql(
                &spec.name,
                &spec.table,
                &spec.columns,
                *unique,
            )),
            ConstraintKind::Unique => Ok(self.backend.add_unique_sql(&spec.table, &spec.name, &spec.columns)),
            ConstraintKind::ForeignKey(Some(references)) => {
                let column = spec.columns.first().map_or("", String::as_str);
                Ok(self
                    .backend
                    .add_foreign_key_sql(&spec.table, &spec.name, column, references))
            }
            ConstraintKind::ForeignKey(None) => Err(EvolutionError::simulation(format!(
                "Foreign key '{}' on '{}' references a model missing from the signature",
                spec.name, spec.table
            ))),
        }
    }

    fn drop_constraint(&self, spec: &ConstraintSpec) -> String {
        match spec.kind {
            ConstraintKind::Index { .. } => self.backend.drop_index_sql(&spec.name, &spec.table),
            ConstraintKind::Unique => self.backend.drop_unique_sql(&spec.table, &spec.name),
            ConstraintKind::ForeignKey(_) => self.backend.drop_foreign_key_sql(&spec.table, &spec.name),
        }
    }

    fn column_def(&self, project: &ProjectSignature, field: &FieldSignature) -> Result<ColumnDef> {
        let (sql_type, references) = if field.field_type.is_column_relation() {
            let (table, column, storage) = self.reference(project, field)?;
            (self.backend.column_type(&storage), Some((table, column)))
        } else {
            (self.backend.column_type(field), None)
        };
        Ok(ColumnDef {
            name: field.column(),
            sql_type,
            null: field.is_null(),
            primary_key: field.is_primary_key(),
            auto_increment: field.is_primary_key()
                && matches!(field.field_type, FieldType::Auto | FieldType::BigAuto),
            default: field.default().cloned(),
            references,
        })
    }

    /// Resolves the table, key column and key storage type a relation points at.
    fn reference(
        &self,
        project: &ProjectSignature,
        field: &FieldSignature,
    ) -> Result<(String, String, FieldSignature)> {
        let target = field.related().ok_or_else(|| {
            EvolutionError::InvalidSignature(format!("Relation field '{}' has no related_model", field.name))
        })?;
        let (target_app, _) = split_reference(target).ok_or_else(|| {
            EvolutionError::InvalidSignature(format!(
                "Relation field '{}' references '{}', expected 'app.Model'",
                field.name, target
            ))
        })?;
        let model = project.resolve(target).ok_or_else(|| {
            EvolutionError::simulation(format!("Related model '{}' is not in the signature", target))
        })?;
        let table = self.table(target_app, model);
        Ok(model.primary_key().map_or_else(
            || (table.clone(), "id".to_string(), FieldSignature::new("id", FieldType::Integer)),
            |pk| (table.clone(), pk.column(), storage_field(pk)),
        ))
    }

    fn table(&self, app: &str, model: &ModelSignature) -> String {
        self.backend.truncate_name(&model.table(app))
    }

    fn join_table(&self, app: &str, model: &ModelSignature, field: &FieldSignature) -> String {
        self.backend.truncate_name(&field.join_table(&model.table(app)))
    }

    fn value_sql(&self, initial: &Initial) -> String {
        match initial {
            Initial::Value(value) => self.backend.literal(value),
            Initial::Expression(expression) => format!("({expression})"),
        }
    }

    fn unsupported(&self, cx: &Context<'_>, reason: impl Into<String>) -> EvolutionError {
        EvolutionError::UnsupportedMutation {
            app: cx.app.to_string(),
            mutation: cx.mutation.description(),
            reason: format!("{} is not supported on {}", reason.into(), self.backend.name()),
        }
    }
}

fn model_of<'s>(signature: &'s ProjectSignature, app: &str, model: &str) -> Result<&'s ModelSignature> {
    signature.get_model(app, model).ok_or_else(|| {
        EvolutionError::simulation(format!("Model '{}.{}' does not exist", app, model))
    })
}

fn field_of<'s>(model: &'s ModelSignature, field: &str) -> Result<&'s FieldSignature> {
    model.get_field(field).ok_or_else(|| {
        EvolutionError::simulation(format!(
            "Field '{}' does not exist on model '{}'",
            field, model.name
        ))
    })
}

fn columns_of(model: &ModelSignature, fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|f| model.get_field(f).map_or_else(|| f.clone(), FieldSignature::column))
        .collect()
}

/// The field whose column type a reference to `pk` uses.
fn storage_field(pk: &FieldSignature) -> FieldSignature {
    let mut storage = pk.clone();
    storage.field_type = match pk.field_type {
        FieldType::Auto => FieldType::Integer,
        FieldType::BigAuto => FieldType::BigInteger,
        other => other,
    };
    storage
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MySqlBackend, PostgresBackend, SqliteBackend};
    use crate::signature::{ApplicationSignature, AttrValue};
    use crate::state::simulate;

    fn blog() -> ProjectSignature {
        ProjectSignature::new()
            .app(
                ApplicationSignature::new("auth").model(
                    ModelSignature::new("User")
                        .field(FieldSignature::new("id", FieldType::Auto).primary_key()),
                ),
            )
            .app(
                ApplicationSignature::new("blog").model(
                    ModelSignature::new("Post")
                        .field(FieldSignature::new("id", FieldType::Auto).primary_key())
                        .field(FieldSignature::new("title", FieldType::Char).max_length(200))
                        .field(
                            FieldSignature::new("slug", FieldType::Char)
                                .max_length(50)
                                .unique(),
                        )
                        .field(FieldSignature::new("summary", FieldType::Text).null(true)),
                ),
            )
    }

    fn plan(backend: &dyn Backend, mutation: MutationSpec) -> Result<Vec<String>> {
        let before = blog();
        let after = simulate(&before, std::slice::from_ref(&mutation))?;
        Translator::new(backend).translate(&before, &after, &mutation)
    }

    #[test]
    fn test_add_nullable_field() {
        let sql = plan(
            &SqliteBackend::new(),
            MutationSpec::add_field("blog", "Post", FieldSignature::new("body", FieldType::Text).null(true)),
        )
        .unwrap();
        assert_eq!(sql, vec!["ALTER TABLE \"blog_post\" ADD COLUMN \"body\" TEXT"]);
    }

    #[test]
    fn test_add_not_null_with_literal_initial() {
        let mutation = MutationSpec::add_field("blog", "Post", FieldSignature::new("views", FieldType::Integer))
            .with_initial(Initial::Value(AttrValue::Int(0)));
        let sql = plan(&PostgresBackend::new(), mutation).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"blog_post\" ADD COLUMN \"views\" INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE \"blog_post\" ALTER COLUMN \"views\" DROP DEFAULT",
            ]
        );
    }

    #[test]
    fn test_add_not_null_with_expression_initial() {
        let mutation = MutationSpec::add_field("blog", "Post", FieldSignature::new("views", FieldType::Integer))
            .with_initial(Initial::Expression("length(title)".into()));
        let sql = plan(&PostgresBackend::new(), mutation.clone()).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"blog_post\" ADD COLUMN \"views\" INTEGER",
                "UPDATE \"blog_post\" SET \"views\" = (length(title)) WHERE \"views\" IS NULL",
                "ALTER TABLE \"blog_post\" ALTER COLUMN \"views\" SET NOT NULL",
            ]
        );

        let sql = plan(&SqliteBackend::new(), mutation).unwrap();
        assert_eq!(sql.first().map(String::as_str), Some("PRAGMA foreign_keys = OFF"));
        assert!(sql.iter().any(|s| s.starts_with("INSERT INTO \"blog_post__new\"")
            && s.contains("(length(title))")));
        assert!(sql.contains(&"ALTER TABLE \"blog_post__new\" RENAME TO \"blog_post\"".to_string()));
        // Unique index on slug is recreated after the rebuild.
        assert!(sql.contains(
            &"CREATE UNIQUE INDEX \"blog_post_slug_key\" ON \"blog_post\" (\"slug\")".to_string()
        ));
    }

    #[test]
    fn test_add_unique_field_uses_named_constraint() {
        let mutation = MutationSpec::add_field(
            "blog",
            "Post",
            FieldSignature::new("code", FieldType::Char).max_length(8).null(true).unique(),
        );
        let sql = plan(&PostgresBackend::new(), mutation.clone()).unwrap();
        assert_eq!(
            sql[1],
            "ALTER TABLE \"blog_post\" ADD CONSTRAINT \"blog_post_code_key\" UNIQUE (\"code\")"
        );

        let sql = plan(&SqliteBackend::new(), mutation).unwrap();
        assert_eq!(
            sql[1],
            "CREATE UNIQUE INDEX \"blog_post_code_key\" ON \"blog_post\" (\"code\")"
        );
    }

    #[test]
    fn test_add_foreign_key() {
        let author = FieldSignature::new("author", FieldType::ForeignKey)
            .related_model("auth.User")
            .null(true);
        let mutation = MutationSpec::add_field("blog", "Post", author);

        let sql = plan(&PostgresBackend::new(), mutation.clone()).unwrap();
        assert_eq!(
            sql[0],
            "ALTER TABLE \"blog_post\" ADD COLUMN \"author_id\" INTEGER REFERENCES \"auth_user\" (\"id\") DEFERRABLE INITIALLY DEFERRED"
        );
        assert_eq!(
            sql[1],
            "CREATE INDEX \"blog_post_author_id_idx\" ON \"blog_post\" (\"author_id\")"
        );

        let sql = plan(&MySqlBackend::new(), mutation).unwrap();
        assert_eq!(sql[0], "ALTER TABLE `blog_post` ADD COLUMN `author_id` INTEGER");
        assert!(sql.contains(
            &"ALTER TABLE `blog_post` ADD CONSTRAINT `blog_post_author_id_fk` FOREIGN KEY (`author_id`) REFERENCES `auth_user` (`id`)"
                .to_string()
        ));
    }

    #[test]
    fn test_rename_strategies() {
        let rename = MutationSpec::rename_field("blog", "Post", "title", "heading");

        let sql = plan(&PostgresBackend::new(), rename.clone()).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE \"blog_post\" RENAME COLUMN \"title\" TO \"heading\""]
        );

        let sql = plan(&MySqlBackend::v5_7(), rename.clone()).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE `blog_post` ADD COLUMN `heading` VARCHAR(200)",
                "UPDATE `blog_post` SET `heading` = `title`",
                "ALTER TABLE `blog_post` MODIFY COLUMN `heading` VARCHAR(200) NOT NULL",
                "ALTER TABLE `blog_post` DROP COLUMN `title`",
            ]
        );

        let sql = plan(&SqliteBackend::legacy(), rename).unwrap();
        assert!(sql
            .iter()
            .any(|s| s.starts_with("INSERT INTO \"blog_post__new\"") && s.contains("\"title\"")));
    }

    #[test]
    fn test_rename_constrained_column_on_mysql_5_7_is_unsupported() {
        let rename = MutationSpec::rename_field("blog", "Post", "slug", "handle");
        let result = plan(&MySqlBackend::v5_7(), rename);
        assert!(matches!(result, Err(EvolutionError::UnsupportedMutation { .. })));
    }

    #[test]
    fn test_delete_unique_field() {
        let sql = plan(&PostgresBackend::new(), MutationSpec::delete_field("blog", "Post", "slug")).unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"blog_post\" DROP CONSTRAINT \"blog_post_slug_key\"",
                "ALTER TABLE \"blog_post\" DROP COLUMN \"slug\"",
            ]
        );

        let sql = plan(&SqliteBackend::new(), MutationSpec::delete_field("blog", "Post", "slug")).unwrap();
        assert_eq!(
            sql,
            vec![
                "DROP INDEX IF EXISTS \"blog_post_slug_key\"",
                "ALTER TABLE \"blog_post\" DROP COLUMN \"slug\"",
            ]
        );
    }

    #[test]
    fn test_change_null_to_not_null() {
        let mut changes = BTreeMap::new();
        changes.insert(
            AttrName::Null,
            AttrChange::new(Some(AttrValue::Bool(true)), Some(AttrValue::Bool(false))),
        );
        let mutation = MutationSpec::change_field("blog", "Post", "summary", changes)
            .with_initial(Initial::Value(AttrValue::Text(String::new())));

        let sql = plan(&PostgresBackend::new(), mutation.clone()).unwrap();
        assert_eq!(
            sql,
            vec![
                "UPDATE \"blog_post\" SET \"summary\" = '' WHERE \"summary\" IS NULL",
                "ALTER TABLE \"blog_post\" ALTER COLUMN \"summary\" SET NOT NULL",
            ]
        );

        let sql = plan(&SqliteBackend::new(), mutation).unwrap();
        assert!(sql.iter().any(|s| s.contains("COALESCE(\"summary\", '')")));
    }

    #[test]
    fn test_change_max_length() {
        let mut changes = BTreeMap::new();
        changes.insert(
            AttrName::MaxLength,
            AttrChange::new(Some(AttrValue::Int(200)), Some(AttrValue::Int(300))),
        );
        let mutation = MutationSpec::change_field("blog", "Post", "title", changes);
        let sql = plan(&PostgresBackend::new(), mutation.clone()).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE \"blog_post\" ALTER COLUMN \"title\" TYPE VARCHAR(300)"]
        );
        let sql = plan(&MySqlBackend::new(), mutation).unwrap();
        assert_eq!(
            sql,
            vec!["ALTER TABLE `blog_post` MODIFY COLUMN `title` VARCHAR(300) NOT NULL"]
        );
    }

    #[test]
    fn test_add_model_with_relation() {
        let tag = ModelSignature::new("Tag")
            .field(FieldSignature::new("id", FieldType::Auto).primary_key())
            .field(FieldSignature::new("name", FieldType::Char).max_length(30).unique())
            .field(FieldSignature::new("posts", FieldType::ManyToMany).related_model("blog.Post"));
        let sql = plan(&SqliteBackend::new(), MutationSpec::add_model("blog", tag)).unwrap();
        assert_eq!(
            sql,
            vec![
                "CREATE TABLE \"blog_tag\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \"name\" TEXT NOT NULL\n)".to_string(),
                "CREATE UNIQUE INDEX \"blog_tag_name_key\" ON \"blog_tag\" (\"name\")".to_string(),
                "CREATE TABLE \"blog_tag_posts\" (\n  \"id\" INTEGER PRIMARY KEY AUTOINCREMENT,\n  \
                 \"tag_id\" INTEGER NOT NULL REFERENCES \"blog_tag\" (\"id\") DEFERRABLE INITIALLY DEFERRED,\n  \
                 \"post_id\" INTEGER NOT NULL REFERENCES \"blog_post\" (\"id\") DEFERRABLE INITIALLY DEFERRED\n)"
                    .to_string(),
                "CREATE UNIQUE INDEX \"blog_tag_posts_tag_id_post_id_uniq\" ON \"blog_tag_posts\" (\"tag_id\", \"post_id\")".to_string(),
            ]
        );
    }

    #[test]
    fn test_delete_application_respects_purge() {
        let before = blog();
        let mutation = MutationSpec::delete_application("blog");
        let after = simulate(&before, std::slice::from_ref(&mutation)).unwrap();
        let backend = PostgresBackend::new();

        let kept = Translator::new(&backend).translate(&before, &after, &mutation).unwrap();
        assert!(kept.is_empty());

        let purged = Translator::new(&backend)
            .with_purge(true)
            .translate(&before, &after, &mutation)
            .unwrap();
        assert_eq!(purged, vec!["DROP TABLE \"blog_post\" CASCADE"]);
    }

    #[test]
    fn test_change_meta_unique_together() {
        let mutation = MutationSpec::change_meta(
            "blog",
            "Post",
            MetaChange::UniqueTogether(vec![vec!["title".into(), "summary".into()]]),
        );
        let sql = plan(&PostgresBackend::new(), mutation).unwrap();
        assert_eq!(
            sql,
            vec!["CREATE UNIQUE INDEX \"blog_post_title_summary_uniq\" ON \"blog_post\" (\"title\", \"summary\")"]
        );
    }

    #[test]
    fn test_rename_model_renames_table_and_indexes() {
        let sql = plan(
            &PostgresBackend::new(),
            MutationSpec::rename_model("blog", "Post", "Article"),
        )
        .unwrap();
        assert_eq!(
            sql,
            vec![
                "ALTER TABLE \"blog_post\" DROP CONSTRAINT \"blog_post_slug_key\"",
                "ALTER TABLE \"blog_post\" RENAME TO \"blog_article\"",
                "ALTER TABLE \"blog_article\" ADD CONSTRAINT \"blog_article_slug_key\" UNIQUE (\"slug\")",
            ]
        );
    }

    #[test]
    fn test_raw_sql_and_unsupported() {
        let sql = plan(
            &SqliteBackend::new(),
            MutationSpec::raw_sql("blog", "touch", vec!["UPDATE blog_post SET title = title".into()]),
        )
        .unwrap();
        assert_eq!(sql, vec!["UPDATE blog_post SET title = title"]);

        let before = blog();
        let mutation = MutationSpec::unsupported("blog", "Post", Some("id".into()), "primary key change");
        let result = Translator::new(&SqliteBackend::new()).translate(&before, &before, &mutation);
        assert!(matches!(result, Err(EvolutionError::UnsupportedMutation { .. })));
    }
}
