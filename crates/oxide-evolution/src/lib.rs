//! Signature-based schema evolution for Rust.
//!
//! `oxide-evolution` keeps a database schema in step with the models an
//! application declares. Instead of hand-written migrations it works from
//! signatures:
//! - The declared models are captured as a [`signature::ProjectSignature`]
//! - The ledger stores the signature recorded after every applied evolution
//! - The difference between the two is expressed as typed mutations
//!
//! # Architecture
//!
//! - **Signature** - Canonical, comparable description of declared models
//! - **Diff** - Computes ordered mutations between two signatures
//! - **Hint** - Completes a diff into an executable starting point
//! - **State** - Pure signature transform for each mutation
//! - **Translate** - Backend statements for each mutation
//! - **Executor** - Simulates or applies mutation sequences
//! - **Ledger** - Audit trail of applied evolutions
//! - **Evolver** - Validates and applies the evolutions of an application
//!
//! # Example
//!
//! ```rust,ignore
//! use oxide_evolution::prelude::*;
//!
//! let declared = ProjectSignature::new().app(
//!     ApplicationSignature::new("blog").model(
//!         ModelSignature::new("Post")
//!             .field(FieldSignature::new("id", FieldType::Auto).primary_key())
//!             .field(FieldSignature::new("title", FieldType::Char).max_length(200)),
//!     ),
//! );
//!
//! let ledger = SqliteLedger::new(pool.clone());
//! let evolver = Evolver::new(Box::new(SqliteBackend::new()), ledger, pool);
//! evolver.init().await?;
//!
//! let evolutions = load_evolutions(Path::new("evolutions"), "blog")?;
//! evolver.evolve("blog", &evolutions, &declared).await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Show what changed since the last evolution
//! oxide-evolve diff
//!
//! # Write a starting-point evolution for review
//! oxide-evolve hint --write
//!
//! # Apply pending evolutions
//! oxide-evolve evolve
//!
//! # Show applied evolutions
//! oxide-evolve history
//! ```

pub mod backend;
pub mod diff;
pub mod error;
pub mod evolution;
pub mod evolver;
pub mod executor;
pub mod hint;
pub mod ledger;
pub mod mutations;
pub mod signature;
pub mod source;
pub mod state;
pub mod translate;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::{backend_by_name, Backend, Capabilities, MySqlBackend, PostgresBackend, SqliteBackend};
    pub use crate::diff::diff;
    pub use crate::error::{EvolutionError, Result};
    pub use crate::evolution::{load_evolutions, write_evolution, Evolution};
    pub use crate::evolver::{EvolveOutcome, Evolver, EvolverOptions, RunReport};
    pub use crate::executor::{Executor, Mode, RunOutput, RunState};
    pub use crate::hint::{hint, HintedEvolution, NeedsReview};
    pub use crate::ledger::{EvolutionRecord, Ledger, MemoryLedger, PurgeAuthorization, SqliteLedger};
    pub use crate::mutations::{AttrChange, Initial, MetaChange, MutationSpec};
    pub use crate::signature::{
        ApplicationSignature, AttrName, AttrValue, FieldSignature, FieldType, IndexSignature,
        ModelSignature, ProjectSignature,
    };
    pub use crate::source::{JsonSignatureSource, SignatureSource};
    pub use crate::state::simulate;
}

/// Trait for evolutions defined in Rust code.
///
/// Evolutions that need a signature rewrite function have to be written in
/// Rust, since functions cannot be stored in JSON files.
pub trait OxideEvolution {
    /// Application name (e.g., "blog").
    const APP: &'static str;

    /// Evolution label (e.g., "0003_split_name").
    const LABEL: &'static str;

    /// Returns the mutations.
    fn mutations() -> Vec<mutations::MutationSpec>;

    /// Converts to an [`evolution::Evolution`].
    fn to_evolution() -> evolution::Evolution {
        evolution::Evolution::new(Self::LABEL).mutations(Self::mutations())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prelude::*;

    struct SplitName;

    fn mark_name_split(app: &str, signature: &mut ProjectSignature) -> Result<()> {
        let model = signature
            .get_model_mut(app, "Author")
            .ok_or_else(|| EvolutionError::SimulationFailure("no Author".into()))?;
        model.fields.remove("name");
        Ok(())
    }

    impl OxideEvolution for SplitName {
        const APP: &'static str = "blog";
        const LABEL: &'static str = "0003_split_name";

        fn mutations() -> Vec<MutationSpec> {
            vec![MutationSpec::raw_sql(
                "blog",
                "split_name",
                vec!["ALTER TABLE blog_author DROP COLUMN name".to_string()],
            )
            .with_rewrite(mark_name_split)]
        }
    }

    #[test]
    fn test_evolution_trait() {
        assert_eq!(SplitName::APP, "blog");
        let evolution = SplitName::to_evolution();
        assert_eq!(evolution.label, "0003_split_name");
        assert_eq!(evolution.mutations.len(), 1);
    }

    #[test]
    fn test_rewrite_runs_in_simulation() {
        let base = ProjectSignature::new().app(
            ApplicationSignature::new("blog").model(
                ModelSignature::new("Author")
                    .field(FieldSignature::new("id", FieldType::Auto).primary_key())
                    .field(FieldSignature::new("name", FieldType::Char).max_length(100)),
            ),
        );

        let after = simulate(&base, &SplitName::mutations()).unwrap();
        assert!(after.get_model("blog", "Author").unwrap().get_field("name").is_none());
    }
}
