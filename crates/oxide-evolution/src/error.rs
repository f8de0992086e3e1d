//! Error types for the evolution engine.

use std::path::PathBuf;

/// Errors that can occur while diffing, simulating or applying evolutions.
#[derive(Debug, thiserror::Error)]
pub enum EvolutionError {
    /// A structural change has no safe SQL mapping on the target backend.
    #[error("Unsupported mutation in app '{app}': {mutation} ({reason})")]
    UnsupportedMutation {
        /// Application the mutation belongs to.
        app: String,
        /// Human-readable description of the mutation.
        mutation: String,
        /// Why the mutation cannot be translated.
        reason: String,
    },

    /// Replaying the evolutions does not reach the declared signature.
    #[error("Simulated signature for app '{app}' diverges from the declared models:\n{}", .differences.iter().map(|d| format!("  - {}", d)).collect::<Vec<_>>().join("\n"))]
    SimulationDivergence {
        /// Application whose signature diverged.
        app: String,
        /// Remaining changes between the simulated and declared signatures.
        differences: Vec<String>,
    },

    /// A mutation cannot be applied to the signature it is replayed on.
    #[error("Simulation failed: {0}")]
    SimulationFailure(String),

    /// A backend statement failed during apply.
    #[error(
        "Statement {} of mutation {index}{} failed: {statement}: {source}",
        .executed.len() + 1,
        .evolution.as_deref().map(|label| format!(" of evolution '{label}'")).unwrap_or_default()
    )]
    ExecutionFailure {
        /// Label of the evolution holding the failing mutation, when known.
        evolution: Option<String>,
        /// Index of the failing mutation within its evolution.
        index: usize,
        /// The statement that failed.
        statement: String,
        /// Statements that were executed before the failure.
        executed: Vec<String>,
        /// The database error.
        #[source]
        source: sqlx::Error,
    },

    /// The backend generates SQL for a database other than the one the
    /// evolver executes on.
    #[error("Backend '{0}' can only plan statements; executing requires the sqlite backend")]
    BackendMismatch(String),

    /// A mutation references a model of another application that is not
    /// present in the signature yet.
    #[error("Mutation '{mutation}' in app '{app}' depends on '{dependency}' which is not in the signature")]
    DependencyUnresolved {
        /// Application the mutation belongs to.
        app: String,
        /// Human-readable description of the mutation.
        mutation: String,
        /// The unresolved `app.Model` reference.
        dependency: String,
    },

    /// A signature violates the data model invariants.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// A persisted signature has a version this build does not understand.
    #[error("Unsupported signature version {found} (newest supported is {supported})")]
    UnsupportedVersion {
        /// Version found in the document.
        found: u32,
        /// Newest version this build can read.
        supported: u32,
    },

    /// A ledger purge was requested without a matching `DeleteApplication`.
    #[error("Purging the history of app '{0}' requires a DeleteApplication mutation")]
    PurgeNotPermitted(String),

    /// The run state machine was asked to make an illegal transition.
    #[error("Invalid run state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// Current state.
        from: crate::executor::RunState,
        /// Requested state.
        to: crate::executor::RunState,
    },

    /// Failed to parse an evolution or signature file.
    #[error("Failed to parse '{path}': {message}")]
    ParseError {
        /// Path to the file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Database error outside of statement execution (ledger I/O, pool).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading evolution or signature files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EvolutionError {
    /// Names the evolution an [`EvolutionError::ExecutionFailure`] happened
    /// in. Other errors are returned unchanged.
    pub(crate) fn in_evolution(self, label: &str) -> Self {
        match self {
            Self::ExecutionFailure {
                index,
                statement,
                executed,
                source,
                ..
            } => Self::ExecutionFailure {
                evolution: Some(label.to_string()),
                index,
                statement,
                executed,
                source,
            },
            other => other,
        }
    }

    /// Builds a [`EvolutionError::SimulationFailure`] from anything printable.
    pub(crate) fn simulation(message: impl Into<String>) -> Self {
        Self::SimulationFailure(message.into())
    }
}

/// Result type for evolution operations.
pub type Result<T> = std::result::Result<T, EvolutionError>;
