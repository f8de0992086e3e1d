//! Signature representation types.
//!
//! A signature is the structural description of the declared models of a
//! project: applications contain models, models contain fields, fields carry a
//! type tag plus the attributes that matter to the database schema. Signatures
//! are compared structurally, serialized canonically (sorted keys) and
//! persisted by the ledger after every applied evolution.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EvolutionError, Result};

/// Current version of the serialized signature format.
pub const SIGNATURE_VERSION: u32 = 2;

/// Key under which version 1 documents stored their version marker.
const LEGACY_VERSION_KEY: &str = "__version__";

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Auto-incrementing integer.
    Auto,
    /// Auto-incrementing 64-bit integer.
    BigAuto,
    /// Boolean.
    Boolean,
    /// Bounded character string.
    Char,
    /// Unbounded text.
    Text,
    /// Integer (32-bit).
    Integer,
    /// Big integer (64-bit).
    BigInteger,
    /// Small integer (16-bit).
    SmallInteger,
    /// Floating point.
    Float,
    /// Fixed-point decimal.
    Decimal,
    /// Date only.
    Date,
    /// Date and time.
    DateTime,
    /// Time only.
    Time,
    /// Binary data.
    Binary,
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
    /// Many-to-one relation, stored as a column.
    ForeignKey,
    /// One-to-one relation, stored as a column.
    OneToOne,
    /// Many-to-many relation, stored as a join table.
    ManyToMany,
}

impl FieldType {
    /// Returns true for types referencing another model.
    #[must_use]
    pub const fn is_relation(self) -> bool {
        matches!(self, Self::ForeignKey | Self::OneToOne | Self::ManyToMany)
    }

    /// Returns true for relations stored as a column.
    #[must_use]
    pub const fn is_column_relation(self) -> bool {
        matches!(self, Self::ForeignKey | Self::OneToOne)
    }

    /// Returns true for many-to-many relations (no column on the model table).
    #[must_use]
    pub const fn is_many_to_many(self) -> bool {
        matches!(self, Self::ManyToMany)
    }

    /// Returns whether `attr` is meaningful for this type.
    #[must_use]
    pub fn allows(self, attr: AttrName) -> bool {
        match self {
            Self::ManyToMany => matches!(attr, AttrName::RelatedModel | AttrName::DbTable),
            _ => match attr {
                AttrName::Null
                | AttrName::PrimaryKey
                | AttrName::Unique
                | AttrName::DbIndex
                | AttrName::DbColumn
                | AttrName::Default => true,
                AttrName::MaxLength => matches!(self, Self::Char | Self::Binary),
                AttrName::MaxDigits | AttrName::DecimalPlaces => matches!(self, Self::Decimal),
                AttrName::RelatedModel => self.is_column_relation(),
                AttrName::DbTable => false,
            },
        }
    }

    /// Returns the implicit value of `attr` when the signature doesn't store one.
    #[must_use]
    pub fn default_for(self, attr: AttrName) -> Option<AttrValue> {
        if !self.allows(attr) {
            return None;
        }
        match attr {
            AttrName::Null | AttrName::PrimaryKey | AttrName::Unique => Some(AttrValue::Bool(false)),
            AttrName::DbIndex => Some(AttrValue::Bool(self.is_column_relation())),
            _ => None,
        }
    }

    /// Returns the snake_case tag of this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BigAuto => "big_auto",
            Self::Boolean => "boolean",
            Self::Char => "char",
            Self::Text => "text",
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::SmallInteger => "small_integer",
            Self::Float => "float",
            Self::Decimal => "decimal",
            Self::Date => "date",
            Self::DateTime => "date_time",
            Self::Time => "time",
            Self::Binary => "binary",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::ForeignKey => "foreign_key",
            Self::OneToOne => "one_to_one",
            Self::ManyToMany => "many_to_many",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema-relevant field attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrName {
    /// Whether the column allows NULL.
    Null,
    /// Whether the field is the primary key.
    PrimaryKey,
    /// Whether the column has a UNIQUE constraint.
    Unique,
    /// Whether the column is indexed.
    DbIndex,
    /// Explicit column name.
    DbColumn,
    /// Database default value.
    Default,
    /// Maximum length for character/binary columns.
    MaxLength,
    /// Total digits of a decimal column.
    MaxDigits,
    /// Fractional digits of a decimal column.
    DecimalPlaces,
    /// Referenced model (`"app.Model"`) of a relation.
    RelatedModel,
    /// Explicit join table name of a many-to-many relation.
    DbTable,
}

impl AttrName {
    /// Every attribute name, in canonical order.
    pub const ALL: [Self; 11] = [
        Self::Null,
        Self::PrimaryKey,
        Self::Unique,
        Self::DbIndex,
        Self::DbColumn,
        Self::Default,
        Self::MaxLength,
        Self::MaxDigits,
        Self::DecimalPlaces,
        Self::RelatedModel,
        Self::DbTable,
    ];

    /// Returns the snake_case name of this attribute.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::PrimaryKey => "primary_key",
            Self::Unique => "unique",
            Self::DbIndex => "db_index",
            Self::DbColumn => "db_column",
            Self::Default => "default",
            Self::MaxLength => "max_length",
            Self::MaxDigits => "max_digits",
            Self::DecimalPlaces => "decimal_places",
            Self::RelatedModel => "related_model",
            Self::DbTable => "db_table",
        }
    }

    /// Parses a snake_case attribute name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.as_str() == name)
    }
}

impl fmt::Display for AttrName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value of a field attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Text value.
    Text(String),
}

impl AttrValue {
    /// Returns the boolean value, if this is one.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer value, if this is one.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the text value, if this is one.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Signature of one declared field.
///
/// Attributes equal to their type default are never stored, so two fields
/// declared with the same effective attributes always compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSignature {
    /// Field name.
    pub name: String,
    /// Declared type tag.
    pub field_type: FieldType,
    /// Non-default attribute values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<AttrName, AttrValue>,
}

impl FieldSignature {
    /// Creates a field signature with default attributes.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            attrs: BTreeMap::new(),
        }
    }

    /// Sets an attribute, dropping it when it equals the type default.
    #[must_use]
    pub fn with_attr(mut self, attr: AttrName, value: impl Into<AttrValue>) -> Self {
        self.set_attr(attr, Some(value.into()));
        self
    }

    /// Sets the field as nullable (or not).
    #[must_use]
    pub fn null(self, null: bool) -> Self {
        self.with_attr(AttrName::Null, null)
    }

    /// Sets the field as the primary key.
    #[must_use]
    pub fn primary_key(self) -> Self {
        self.with_attr(AttrName::PrimaryKey, true)
    }

    /// Sets the field as unique.
    #[must_use]
    pub fn unique(self) -> Self {
        self.with_attr(AttrName::Unique, true)
    }

    /// Sets whether the column is indexed.
    #[must_use]
    pub fn db_index(self, indexed: bool) -> Self {
        self.with_attr(AttrName::DbIndex, indexed)
    }

    /// Sets an explicit column name.
    #[must_use]
    pub fn db_column(self, column: impl Into<String>) -> Self {
        self.with_attr(AttrName::DbColumn, column.into())
    }

    /// Sets the database default value.
    #[must_use]
    pub fn default_value(self, value: impl Into<AttrValue>) -> Self {
        self.with_attr(AttrName::Default, value)
    }

    /// Sets the maximum length.
    #[must_use]
    pub fn max_length(self, length: i64) -> Self {
        self.with_attr(AttrName::MaxLength, length)
    }

    /// Sets decimal precision and scale.
    #[must_use]
    pub fn decimal(self, max_digits: i64, decimal_places: i64) -> Self {
        self.with_attr(AttrName::MaxDigits, max_digits)
            .with_attr(AttrName::DecimalPlaces, decimal_places)
    }

    /// Sets the referenced model (`"app.Model"`).
    #[must_use]
    pub fn related_model(self, reference: impl Into<String>) -> Self {
        self.with_attr(AttrName::RelatedModel, reference.into())
    }

    /// Sets the join table name of a many-to-many relation.
    #[must_use]
    pub fn db_table(self, table: impl Into<String>) -> Self {
        self.with_attr(AttrName::DbTable, table.into())
    }

    /// Sets or clears an attribute, keeping the attribute map canonical.
    pub fn set_attr(&mut self, attr: AttrName, value: Option<AttrValue>) {
        match value {
            Some(value) if self.field_type.default_for(attr).as_ref() != Some(&value) => {
                self.attrs.insert(attr, value);
            }
            _ => {
                self.attrs.remove(&attr);
            }
        }
    }

    /// Returns the effective value of an attribute (stored or type default).
    #[must_use]
    pub fn attr(&self, attr: AttrName) -> Option<AttrValue> {
        self.attrs
            .get(&attr)
            .cloned()
            .or_else(|| self.field_type.default_for(attr))
    }

    fn flag(&self, attr: AttrName) -> bool {
        self.attr(attr).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Returns whether the column allows NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.flag(AttrName::Null)
    }

    /// Returns whether this field is the primary key.
    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.flag(AttrName::PrimaryKey)
    }

    /// Returns whether this field has a UNIQUE constraint.
    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.flag(AttrName::Unique)
    }

    /// Returns whether the column is indexed.
    #[must_use]
    pub fn has_db_index(&self) -> bool {
        self.flag(AttrName::DbIndex)
    }

    /// Returns the declared database default, if any.
    #[must_use]
    pub fn default(&self) -> Option<&AttrValue> {
        self.attrs.get(&AttrName::Default)
    }

    /// Returns the referenced model, if this is a relation.
    #[must_use]
    pub fn related(&self) -> Option<&str> {
        self.attrs.get(&AttrName::RelatedModel).and_then(AttrValue::as_text)
    }

    /// Returns an integer attribute.
    #[must_use]
    pub fn int_attr(&self, attr: AttrName) -> Option<i64> {
        self.attrs.get(&attr).and_then(AttrValue::as_int)
    }

    /// Returns whether the column carries a constraint that a plain
    /// add/copy/drop sequence would lose.
    #[must_use]
    pub fn is_constrained(&self) -> bool {
        self.is_primary_key() || self.is_unique() || self.field_type.is_column_relation()
    }

    /// Returns the database column name.
    #[must_use]
    pub fn column(&self) -> String {
        if let Some(column) = self.attrs.get(&AttrName::DbColumn).and_then(AttrValue::as_text) {
            return column.to_string();
        }
        if self.field_type.is_column_relation() {
            format!("{}_id", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Returns the join table of a many-to-many field on the given model table.
    #[must_use]
    pub fn join_table(&self, model_table: &str) -> String {
        self.attrs
            .get(&AttrName::DbTable)
            .and_then(AttrValue::as_text)
            .map_or_else(|| format!("{}_{}", model_table, self.name), str::to_string)
    }

    /// Drops attributes equal to their type default.
    pub fn normalize(&mut self) {
        let field_type = self.field_type;
        self.attrs
            .retain(|attr, value| field_type.default_for(*attr).as_ref() != Some(value));
    }

    /// Checks the field against the data model invariants.
    pub fn validate(&self) -> Result<()> {
        for attr in self.attrs.keys() {
            if !self.field_type.allows(*attr) {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Attribute '{}' is not valid for {} field '{}'",
                    attr, self.field_type, self.name
                )));
            }
        }
        if self.field_type.is_relation() {
            let reference = self.related().ok_or_else(|| {
                EvolutionError::InvalidSignature(format!(
                    "Relation field '{}' has no related_model",
                    self.name
                ))
            })?;
            if split_reference(reference).is_none() {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Relation field '{}' references '{}', expected 'app.Model'",
                    self.name, reference
                )));
            }
        }
        Ok(())
    }
}

/// Splits an `"app.Model"` reference.
#[must_use]
pub fn split_reference(reference: &str) -> Option<(&str, &str)> {
    match reference.split_once('.') {
        Some((app, model)) if !app.is_empty() && !model.is_empty() && !model.contains('.') => {
            Some((app, model))
        }
        _ => None,
    }
}

/// Signature of a model-level index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexSignature {
    /// Explicit index name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Indexed field names.
    pub fields: Vec<String>,
}

impl IndexSignature {
    /// Creates an unnamed index over the given fields.
    #[must_use]
    pub fn new(fields: Vec<String>) -> Self {
        Self { name: None, fields }
    }

    /// Sets an explicit name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Signature of one declared model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    /// Model name.
    pub name: String,
    /// Table name override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    /// Fields keyed by name.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSignature>,
    /// Unique-together constraints (field name lists).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_together: Vec<Vec<String>>,
    /// Model-level indexes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexSignature>,
}

impl ModelSignature {
    /// Creates an empty model signature.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: None,
            fields: BTreeMap::new(),
            unique_together: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Overrides the table name.
    #[must_use]
    pub fn db_table(mut self, table: impl Into<String>) -> Self {
        self.table_name = Some(table.into());
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldSignature) -> Self {
        self.fields.insert(field.name.clone(), field);
        self
    }

    /// Adds a unique-together constraint.
    #[must_use]
    pub fn unique_together(mut self, fields: &[&str]) -> Self {
        self.unique_together
            .push(fields.iter().map(|f| (*f).to_string()).collect());
        self.normalize();
        self
    }

    /// Adds a model-level index.
    #[must_use]
    pub fn index(mut self, index: IndexSignature) -> Self {
        self.indexes.push(index);
        self.normalize();
        self
    }

    /// Gets a field by name.
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldSignature> {
        self.fields.get(name)
    }

    /// Gets a mutable field by name.
    #[must_use]
    pub fn get_field_mut(&mut self, name: &str) -> Option<&mut FieldSignature> {
        self.fields.get_mut(name)
    }

    /// Returns the table name for this model inside `app`.
    #[must_use]
    pub fn table(&self, app: &str) -> String {
        self.table_name
            .clone()
            .unwrap_or_else(|| format!("{}_{}", app, self.name.to_lowercase()))
    }

    /// Returns the primary key field, if any.
    #[must_use]
    pub fn primary_key(&self) -> Option<&FieldSignature> {
        self.fields.values().find(|f| f.is_primary_key())
    }

    /// Returns fields stored as columns on the model table.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldSignature> {
        self.fields.values().filter(|f| !f.field_type.is_many_to_many())
    }

    /// Returns many-to-many fields.
    pub fn relation_fields(&self) -> impl Iterator<Item = &FieldSignature> {
        self.fields.values().filter(|f| f.field_type.is_many_to_many())
    }

    /// Puts attributes and metadata into canonical form.
    pub fn normalize(&mut self) {
        for field in self.fields.values_mut() {
            field.normalize();
        }
        self.unique_together.sort();
        self.unique_together.dedup();
        self.indexes.sort();
        self.indexes.dedup();
    }

    fn validate(&self, app: &str) -> Result<()> {
        for (key, field) in &self.fields {
            if key != &field.name {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Field '{}' of model '{}.{}' is stored under key '{}'",
                    field.name, app, self.name, key
                )));
            }
            field.validate()?;
        }
        let meta_fields = self
            .unique_together
            .iter()
            .chain(self.indexes.iter().map(|i| &i.fields));
        for fields in meta_fields {
            if fields.is_empty() {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Model '{}.{}' declares an empty constraint or index",
                    app, self.name
                )));
            }
            if let Some(missing) = fields.iter().find(|f| !self.fields.contains_key(*f)) {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Model '{}.{}' references unknown field '{}' in its metadata",
                    app, self.name, missing
                )));
            }
        }
        Ok(())
    }
}

/// Signature of one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationSignature {
    /// Application name.
    pub name: String,
    /// Models keyed by name.
    #[serde(default)]
    pub models: BTreeMap<String, ModelSignature>,
}

impl ApplicationSignature {
    /// Creates an empty application signature.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            models: BTreeMap::new(),
        }
    }

    /// Adds a model.
    #[must_use]
    pub fn model(mut self, model: ModelSignature) -> Self {
        self.models.insert(model.name.clone(), model);
        self
    }

    /// Gets a model by name.
    #[must_use]
    pub fn get_model(&self, name: &str) -> Option<&ModelSignature> {
        self.models.get(name)
    }

    /// Gets a mutable model by name.
    #[must_use]
    pub fn get_model_mut(&mut self, name: &str) -> Option<&mut ModelSignature> {
        self.models.get_mut(name)
    }
}

/// The root signature: every application of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSignature {
    /// Format version.
    pub version: u32,
    /// Applications keyed by name.
    #[serde(default)]
    pub apps: BTreeMap<String, ApplicationSignature>,
}

impl Default for ProjectSignature {
    fn default() -> Self {
        Self {
            version: SIGNATURE_VERSION,
            apps: BTreeMap::new(),
        }
    }
}

impl ProjectSignature {
    /// Creates an empty project signature.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an application.
    #[must_use]
    pub fn app(mut self, app: ApplicationSignature) -> Self {
        self.apps.insert(app.name.clone(), app);
        self
    }

    /// Gets an application by name.
    #[must_use]
    pub fn get_app(&self, name: &str) -> Option<&ApplicationSignature> {
        self.apps.get(name)
    }

    /// Gets a mutable application by name.
    #[must_use]
    pub fn get_app_mut(&mut self, name: &str) -> Option<&mut ApplicationSignature> {
        self.apps.get_mut(name)
    }

    /// Gets a model by application and model name.
    #[must_use]
    pub fn get_model(&self, app: &str, model: &str) -> Option<&ModelSignature> {
        self.apps.get(app).and_then(|a| a.get_model(model))
    }

    /// Gets a mutable model by application and model name.
    #[must_use]
    pub fn get_model_mut(&mut self, app: &str, model: &str) -> Option<&mut ModelSignature> {
        self.apps.get_mut(app).and_then(|a| a.get_model_mut(model))
    }

    /// Resolves an `"app.Model"` reference.
    #[must_use]
    pub fn resolve(&self, reference: &str) -> Option<&ModelSignature> {
        let (app, model) = split_reference(reference)?;
        self.get_model(app, model)
    }

    /// Returns the canonical serialized form (sorted keys).
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a serialized signature, upgrading older versions first.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Builds a signature from a JSON value, upgrading older versions first.
    pub fn from_value(value: Value) -> Result<Self> {
        let upgraded = upgrade(value)?;
        let mut signature: Self = serde_json::from_value(upgraded)?;
        for app in signature.apps.values_mut() {
            for model in app.models.values_mut() {
                model.normalize();
            }
        }
        signature.validate()?;
        Ok(signature)
    }

    /// Checks every invariant of the data model.
    pub fn validate(&self) -> Result<()> {
        if self.version != SIGNATURE_VERSION {
            return Err(EvolutionError::UnsupportedVersion {
                found: self.version,
                supported: SIGNATURE_VERSION,
            });
        }
        for (key, app) in &self.apps {
            if key != &app.name {
                return Err(EvolutionError::InvalidSignature(format!(
                    "Application '{}' is stored under key '{}'",
                    app.name, key
                )));
            }
            for (model_key, model) in &app.models {
                if model_key != &model.name {
                    return Err(EvolutionError::InvalidSignature(format!(
                        "Model '{}.{}' is stored under key '{}'",
                        app.name, model.name, model_key
                    )));
                }
                model.validate(&app.name)?;
            }
        }
        Ok(())
    }
}

/// Returns the version marker of a serialized signature.
fn document_version(value: &Value) -> Result<u32> {
    let marker = value
        .get("version")
        .or_else(|| value.get(LEGACY_VERSION_KEY));
    match marker {
        None => Ok(1),
        Some(v) => v
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| EvolutionError::InvalidSignature(format!("Bad version marker {v}"))),
    }
}

/// Upgrades a serialized signature to the current format.
fn upgrade(value: Value) -> Result<Value> {
    let version = document_version(&value)?;
    match version {
        1 => upgrade_v1(value),
        SIGNATURE_VERSION => Ok(value),
        found => Err(EvolutionError::UnsupportedVersion {
            found,
            supported: SIGNATURE_VERSION,
        }),
    }
}

/// Version 1 stored applications at the top level next to `__version__`,
/// model metadata under `meta`, and field attributes flattened next to
/// `field_type`.
fn upgrade_v1(value: Value) -> Result<Value> {
    let Value::Object(root) = value else {
        return Err(EvolutionError::InvalidSignature(
            "Version 1 signature must be an object".to_string(),
        ));
    };

    let mut apps = Map::new();
    for (app_name, app_value) in root {
        if app_name == LEGACY_VERSION_KEY {
            continue;
        }
        let models_in = app_value.as_object().cloned().unwrap_or_default();
        let mut models = Map::new();
        for (model_name, model_value) in models_in {
            models.insert(
                model_name.clone(),
                upgrade_v1_model(&app_name, &model_name, &model_value),
            );
        }
        let mut app = Map::new();
        app.insert("name".to_string(), Value::String(app_name.clone()));
        app.insert("models".to_string(), Value::Object(models));
        apps.insert(app_name, Value::Object(app));
    }

    let mut root = Map::new();
    root.insert("version".to_string(), Value::from(SIGNATURE_VERSION));
    root.insert("apps".to_string(), Value::Object(apps));
    Ok(Value::Object(root))
}

fn upgrade_v1_model(app: &str, name: &str, value: &Value) -> Value {
    let meta = value.get("meta").cloned().unwrap_or(Value::Null);
    let default_table = format!("{}_{}", app, name.to_lowercase());

    let mut model = Map::new();
    model.insert("name".to_string(), Value::String(name.to_string()));
    if let Some(table) = meta.get("db_table").and_then(Value::as_str) {
        if table != default_table {
            model.insert("table_name".to_string(), Value::String(table.to_string()));
        }
    }
    if let Some(together) = meta.get("unique_together") {
        model.insert("unique_together".to_string(), together.clone());
    }

    let mut fields = Map::new();
    if let Some(fields_in) = value.get("fields").and_then(Value::as_object) {
        for (field_name, field_value) in fields_in {
            let mut field = Map::new();
            let mut attrs = Map::new();
            field.insert("name".to_string(), Value::String(field_name.clone()));
            if let Some(entries) = field_value.as_object() {
                for (key, attr_value) in entries {
                    if key == "field_type" {
                        field.insert("field_type".to_string(), attr_value.clone());
                    } else if let Some(attr) = AttrName::parse(key) {
                        if AttrValue::from_json(attr_value).is_some() {
                            attrs.insert(attr.as_str().to_string(), attr_value.clone());
                        }
                    }
                }
            }
            field.insert("attrs".to_string(), Value::Object(attrs));
            fields.insert(field_name.clone(), Value::Object(field));
        }
    }
    model.insert("fields".to_string(), Value::Object(fields));
    Value::Object(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blog() -> ProjectSignature {
        ProjectSignature::new().app(
            ApplicationSignature::new("blog").model(
                ModelSignature::new("Post")
                    .field(FieldSignature::new("id", FieldType::Auto).primary_key())
                    .field(FieldSignature::new("title", FieldType::Char).max_length(200))
                    .field(
                        FieldSignature::new("author", FieldType::ForeignKey)
                            .related_model("auth.User"),
                    ),
            ),
        )
    }

    #[test]
    fn test_default_attrs_are_not_stored() {
        let field = FieldSignature::new("title", FieldType::Char)
            .null(false)
            .unique()
            .max_length(10);
        assert!(!field.attrs.contains_key(&AttrName::Null));
        assert_eq!(field.attrs.len(), 2);
        assert_eq!(field.attr(AttrName::Null), Some(AttrValue::Bool(false)));
    }

    #[test]
    fn test_foreign_key_defaults() {
        let field =
            FieldSignature::new("author", FieldType::ForeignKey).related_model("auth.User");
        assert!(field.has_db_index());
        assert_eq!(field.column(), "author_id");

        let unindexed = field.clone().db_index(false);
        assert_eq!(
            unindexed.attrs.get(&AttrName::DbIndex),
            Some(&AttrValue::Bool(false))
        );
    }

    #[test]
    fn test_structural_equality_ignores_declaration_order() {
        let a = ModelSignature::new("Post")
            .field(FieldSignature::new("a", FieldType::Integer))
            .field(FieldSignature::new("b", FieldType::Text))
            .unique_together(&["a", "b"])
            .unique_together(&["b"]);
        let b = ModelSignature::new("Post")
            .unique_together(&["b"])
            .field(FieldSignature::new("b", FieldType::Text))
            .unique_together(&["a", "b"])
            .field(FieldSignature::new("a", FieldType::Integer));
        assert_eq!(a, b);
    }

    #[test]
    fn test_table_and_join_table_names() {
        let model = ModelSignature::new("Post");
        assert_eq!(model.table("blog"), "blog_post");
        let model = model.db_table("posts");
        assert_eq!(model.table("blog"), "posts");

        let tags = FieldSignature::new("tags", FieldType::ManyToMany).related_model("blog.Tag");
        assert_eq!(tags.join_table("posts"), "posts_tags");
        let tags = tags.db_table("post_tag_links");
        assert_eq!(tags.join_table("posts"), "post_tag_links");
    }

    #[test]
    fn test_canonical_json_round_trip() {
        let sig = blog();
        let json = sig.to_json().unwrap();
        let parsed = ProjectSignature::from_json(&json).unwrap();
        assert_eq!(parsed, sig);
        // Canonical output is stable.
        assert_eq!(parsed.to_json().unwrap(), json);
    }

    #[test]
    fn test_orphan_attribute_rejected() {
        let sig = ProjectSignature::new().app(
            ApplicationSignature::new("blog").model(
                ModelSignature::new("Post")
                    .field(FieldSignature::new("views", FieldType::Integer).max_length(3)),
            ),
        );
        assert!(matches!(
            sig.validate(),
            Err(EvolutionError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_relation_requires_target() {
        let field = FieldSignature::new("author", FieldType::ForeignKey);
        assert!(field.validate().is_err());
        let field = field.related_model("User");
        assert!(field.validate().is_err());
        let field = field.related_model("auth.User");
        assert!(field.validate().is_ok());
    }

    #[test]
    fn test_meta_must_reference_known_fields() {
        let sig = ProjectSignature::new().app(
            ApplicationSignature::new("blog").model(
                ModelSignature::new("Post")
                    .field(FieldSignature::new("slug", FieldType::Char))
                    .unique_together(&["slug", "missing"]),
            ),
        );
        assert!(sig.validate().is_err());
    }

    #[test]
    fn test_upgrade_from_version_1() {
        let legacy = serde_json::json!({
            "__version__": 1,
            "blog": {
                "Post": {
                    "meta": {
                        "db_table": "blog_post",
                        "unique_together": [["title", "author"]],
                    },
                    "fields": {
                        "id": {"field_type": "auto", "primary_key": true},
                        "title": {"field_type": "char", "max_length": 200, "null": false, "db_tablespace": ""},
                        "author": {"field_type": "foreign_key", "related_model": "auth.User"},
                    },
                },
            },
        });

        let sig = ProjectSignature::from_value(legacy).unwrap();
        assert_eq!(sig.version, SIGNATURE_VERSION);

        let post = sig.get_model("blog", "Post").unwrap();
        assert_eq!(post.table_name, None);
        assert_eq!(post.unique_together, vec![vec!["title", "author"]]);
        let title = post.get_field("title").unwrap();
        assert_eq!(title.attrs.len(), 1);
        assert_eq!(title.int_attr(AttrName::MaxLength), Some(200));
        assert!(post.get_field("id").unwrap().is_primary_key());
    }

    #[test]
    fn test_newer_version_rejected() {
        let doc = serde_json::json!({"version": SIGNATURE_VERSION + 1, "apps": {}});
        assert!(matches!(
            ProjectSignature::from_value(doc),
            Err(EvolutionError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_resolve_reference() {
        let sig = blog();
        assert!(sig.resolve("blog.Post").is_some());
        assert!(sig.resolve("blog.Missing").is_none());
        assert!(sig.resolve("nonsense").is_none());
    }
}
