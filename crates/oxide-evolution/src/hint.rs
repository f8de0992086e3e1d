//! Hint generator.
//!
//! Turns the raw output of the diff engine into an executable starting
//! point. Only parameters whose absence would make a mutation inapplicable
//! are filled in, and every filled-in value is flagged for review.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::evolution::Evolution;
use crate::mutations::{Initial, MutationSpec};
use crate::signature::{AttrName, AttrValue, FieldType, ProjectSignature};
use crate::state::SignatureState;

/// Something in a hinted mutation a person has to look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NeedsReview {
    /// A placeholder initial value was filled in for a NOT NULL column.
    PlaceholderInitial {
        /// Field the placeholder fills.
        field: String,
        /// The placeholder.
        placeholder: Initial,
    },
    /// A foreign key column is added to a table that may already hold rows.
    ForeignKeyConstraint {
        /// The relation field.
        field: String,
        /// Referenced model (`app.Model`).
        target: String,
    },
    /// The change has no automatic mapping.
    Unsupported {
        /// Why the change cannot be resolved automatically.
        reason: String,
    },
}

impl fmt::Display for NeedsReview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlaceholderInitial { field, placeholder } => write!(
                f,
                "placeholder initial {} for '{}' must be replaced with a real value",
                placeholder, field
            ),
            Self::ForeignKeyConstraint { field, target } => write!(
                f,
                "existing rows must reference valid '{}' rows once '{}' is constrained",
                target, field
            ),
            Self::Unsupported { reason } => write!(
                f,
                "cannot be resolved automatically ({}); replace it with a RawSql mutation",
                reason
            ),
        }
    }
}

/// A mutation together with its review markers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintedMutation {
    /// The (possibly completed) mutation.
    pub mutation: MutationSpec,
    /// Review markers; empty when the mutation is ready as is.
    pub review: Vec<NeedsReview>,
}

/// Output of [`hint`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintedEvolution {
    /// Hinted mutations, in the order they were given.
    pub mutations: Vec<HintedMutation>,
}

impl HintedEvolution {
    /// Returns true when there is nothing to evolve.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Returns true if any mutation carries a review marker.
    #[must_use]
    pub fn needs_review(&self) -> bool {
        self.mutations.iter().any(|m| !m.review.is_empty())
    }

    /// Returns true if any mutation is unsupported.
    #[must_use]
    pub fn has_unsupported(&self) -> bool {
        self.mutations
            .iter()
            .any(|m| matches!(m.mutation, MutationSpec::Unsupported { .. }))
    }

    /// Returns the mutations without their markers.
    #[must_use]
    pub fn mutation_specs(&self) -> Vec<MutationSpec> {
        self.mutations.iter().map(|m| m.mutation.clone()).collect()
    }

    /// Returns one note per review marker.
    #[must_use]
    pub fn notes(&self) -> Vec<String> {
        self.mutations
            .iter()
            .flat_map(|m| {
                m.review
                    .iter()
                    .map(move |r| format!("{}: {}", m.mutation.description(), r))
            })
            .collect()
    }

    /// Packs the hinted mutations into an evolution, review markers becoming
    /// notes.
    #[must_use]
    pub fn into_evolution(self, label: impl Into<String>) -> Evolution {
        let notes = self.notes();
        let mut evolution =
            Evolution::new(label).mutations(self.mutations.into_iter().map(|m| m.mutation));
        evolution.notes = notes;
        evolution
    }
}

/// Returns the placeholder used to backfill a NOT NULL column of `field_type`.
#[must_use]
pub fn placeholder(field_type: FieldType) -> AttrValue {
    match field_type {
        FieldType::Boolean => AttrValue::Bool(false),
        FieldType::Auto
        | FieldType::BigAuto
        | FieldType::Integer
        | FieldType::BigInteger
        | FieldType::SmallInteger
        | FieldType::Float
        | FieldType::Decimal
        | FieldType::ForeignKey
        | FieldType::OneToOne
        | FieldType::ManyToMany => AttrValue::Int(0),
        FieldType::Char | FieldType::Text | FieldType::Binary => AttrValue::Text(String::new()),
        FieldType::Date => AttrValue::Text("1970-01-01".to_string()),
        FieldType::DateTime => AttrValue::Text("1970-01-01 00:00:00".to_string()),
        FieldType::Time => AttrValue::Text("00:00:00".to_string()),
        FieldType::Uuid => AttrValue::Text("00000000-0000-0000-0000-000000000000".to_string()),
        FieldType::Json => AttrValue::Text("{}".to_string()),
    }
}

/// Completes `mutations`, which apply to `base`, into an executable
/// sequence.
///
/// Order is preserved. `base` is only used to look up the types of fields
/// whose attributes change.
#[must_use]
pub fn hint(base: &ProjectSignature, mutations: &[MutationSpec]) -> HintedEvolution {
    let mut state = SignatureState::new(base.clone());
    let mut hinted = Vec::with_capacity(mutations.len());

    for mutation in mutations {
        let (mutation, review) = hint_one(state.signature(), mutation.clone());
        // A mutation that does not apply must leave no trace for later lookups.
        let mut next = SignatureState::new(state.signature().clone());
        if next.apply_mutation(&mutation).is_ok() {
            state = next;
        }
        hinted.push(HintedMutation { mutation, review });
    }

    HintedEvolution { mutations: hinted }
}

fn hint_one(current: &ProjectSignature, mutation: MutationSpec) -> (MutationSpec, Vec<NeedsReview>) {
    let mut review = Vec::new();

    let mutation = match mutation {
        MutationSpec::AddField {
            app,
            model,
            field,
            initial,
        } => {
            let initial = match initial {
                None if !field.is_null() && field.default().is_none() => {
                    let value = Initial::Value(placeholder(field.field_type));
                    review.push(NeedsReview::PlaceholderInitial {
                        field: field.name.clone(),
                        placeholder: value.clone(),
                    });
                    Some(value)
                }
                other => other,
            };
            if field.field_type.is_column_relation() {
                review.push(NeedsReview::ForeignKeyConstraint {
                    field: field.name.clone(),
                    target: field.related().unwrap_or_default().to_string(),
                });
            }
            MutationSpec::AddField {
                app,
                model,
                field,
                initial,
            }
        }

        MutationSpec::ChangeFieldAttribute {
            app,
            model,
            field,
            changes,
            initial: None,
        } => {
            let becomes_not_null = changes.get(&AttrName::Null).is_some_and(|c| {
                c.old == Some(AttrValue::Bool(true)) && c.new == Some(AttrValue::Bool(false))
            });
            let existing = current.get_model(&app, &model).and_then(|m| m.get_field(&field));
            let default_after = match changes.get(&AttrName::Default) {
                Some(change) => change.new.is_some(),
                None => existing.is_some_and(|f| f.default().is_some()),
            };

            let initial = if becomes_not_null && !default_after {
                let field_type = existing.map_or(FieldType::Integer, |f| f.field_type);
                let value = Initial::Value(placeholder(field_type));
                review.push(NeedsReview::PlaceholderInitial {
                    field: field.clone(),
                    placeholder: value.clone(),
                });
                Some(value)
            } else {
                None
            };
            MutationSpec::ChangeFieldAttribute {
                app,
                model,
                field,
                changes,
                initial,
            }
        }

        MutationSpec::Unsupported {
            app,
            model,
            field,
            reason,
        } => {
            review.push(NeedsReview::Unsupported {
                reason: reason.clone(),
            });
            MutationSpec::Unsupported {
                app,
                model,
                field,
                reason,
            }
        }

        other => other,
    };

    (mutation, review)
}
