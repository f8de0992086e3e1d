//! Mutation executor and simulator.
//!
//! A run first plans every mutation: the pure signature transform is applied
//! and the step is translated into backend statements. Only once the whole
//! sequence has been planned does apply mode touch the database, so an
//! untranslatable mutation is reported before any statement executes.

use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::{EvolutionError, Result};
use crate::mutations::MutationSpec;
use crate::signature::ProjectSignature;
use crate::state::SignatureState;
use crate::translate::Translator;

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Nothing has happened yet.
    Pending,
    /// Mutations are being replayed on the signature.
    Simulating,
    /// The replay reached the declared signature.
    Validated,
    /// The replay did not reach the declared signature.
    Diverged,
    /// Statements are being executed.
    Applying,
    /// Every statement succeeded.
    Applied,
    /// A statement failed.
    Failed,
}

impl RunState {
    /// Returns true if the run can move from `self` to `to`.
    #[must_use]
    pub const fn can_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Simulating)
                | (Self::Simulating, Self::Validated | Self::Diverged)
                | (Self::Validated, Self::Applying)
                | (Self::Applying, Self::Applied | Self::Failed)
        )
    }

    /// Moves to `to`, rejecting transitions the run lifecycle does not allow.
    pub fn transition(&mut self, to: Self) -> Result<()> {
        if !self.can_transition(to) {
            return Err(EvolutionError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }

    /// Returns true for states a run never leaves.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Diverged | Self::Applied | Self::Failed)
    }
}

/// How a run treats the database.
pub enum Mode<'c> {
    /// Transform the signature and plan statements without executing them.
    Simulate,
    /// Transform the signature and execute the statements on the connection.
    Apply(&'c mut SqliteConnection),
}

/// One mutation with the statements that implement it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedMutation {
    /// Position of the mutation in the run.
    pub index: usize,
    /// Human-readable description of the mutation.
    pub description: String,
    /// Backend statements, in execution order.
    pub statements: Vec<String>,
}

/// A fully planned sequence of mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    /// Signature after every mutation.
    pub signature: ProjectSignature,
    /// Planned steps, in order.
    pub mutations: Vec<PlannedMutation>,
}

impl Plan {
    /// Returns every statement of the plan in execution order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.mutations
            .iter()
            .flat_map(|m| m.statements.iter().cloned())
            .collect()
    }
}

/// Result of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    /// Signature after the run.
    pub signature: ProjectSignature,
    /// Planned statements in simulate mode, executed statements in apply mode.
    pub statements: Vec<String>,
    /// State the run ended in.
    pub state: RunState,
}

/// Plans and runs mutation sequences against one backend.
pub struct Executor<'a> {
    backend: &'a dyn Backend,
    purge: bool,
}

impl<'a> Executor<'a> {
    /// Creates an executor for `backend`.
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

    /// Returns the backend this executor targets.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend
    }

    /// Replays `mutations` on `base` and translates every step.
    ///
    /// Nothing is executed. Fails on the first mutation that cannot be
    /// applied to the signature or translated for the backend.
    pub fn plan(&self, base: &ProjectSignature, mutations: &[MutationSpec]) -> Result<Plan> {
        let translator = Translator::new(self.backend).with_purge(self.purge);
        let mut state = SignatureState::new(base.clone());
        let mut planned = Vec::with_capacity(mutations.len());

        for (index, mutation) in mutations.iter().enumerate() {
            let before = state.signature().clone();
            state.apply_mutation(mutation)?;
            let statements = translator.translate(&before, state.signature(), mutation)?;
            debug!(
                app = %mutation.app(),
                index,
                statements = statements.len(),
                "Planned mutation: {}",
                mutation.description()
            );
            planned.push(PlannedMutation {
                index,
                description: mutation.description(),
                statements,
            });
        }

        Ok(Plan {
            signature: state.into_signature(),
            mutations: planned,
        })
    }

    /// Executes planned mutations in order.
    ///
    /// Every executed statement is appended to `executed`, which therefore
    /// also holds the partial list when a statement fails.
    pub async fn execute(
        &self,
        planned: &[PlannedMutation],
        conn: &mut SqliteConnection,
        executed: &mut Vec<String>,
    ) -> Result<()> {
        for step in planned {
            debug!(index = step.index, "Executing: {}", step.description);
            for sql in &step.statements {
                debug!(sql = %sql, "Executing SQL");
                if let Err(source) = sqlx::query(sql).execute(&mut *conn).await {
                    warn!(index = step.index, sql = %sql, error = %source, "Statement failed");
                    return Err(EvolutionError::ExecutionFailure {
                        evolution: None,
                        index: step.index,
                        statement: sql.clone(),
                        executed: executed.clone(),
                        source,
                    });
                }
                executed.push(sql.clone());
            }
        }
        Ok(())
    }

    /// Runs `mutations` from `base`.
    ///
    /// In simulate mode the returned statements are the planned ones; in
    /// apply mode they are the statements that were executed.
    pub async fn run(
        &self,
        base: &ProjectSignature,
        mutations: &[MutationSpec],
        mode: Mode<'_>,
    ) -> Result<RunOutput> {
        let mut state = RunState::Pending;
        state.transition(RunState::Simulating)?;
        let plan = self.plan(base, mutations)?;
        state.transition(RunState::Validated)?;

        match mode {
            Mode::Simulate => {
                info!(
                    backend = self.backend.name(),
                    mutations = mutations.len(),
                    "Simulated mutations"
                );
                let statements = plan.statements();
                Ok(RunOutput {
                    signature: plan.signature,
                    statements,
                    state,
                })
            }
            Mode::Apply(conn) => {
                state.transition(RunState::Applying)?;
                let mut executed = Vec::new();
                self.execute(&plan.mutations, conn, &mut executed).await?;
                state.transition(RunState::Applied)?;
                info!(
                    backend = self.backend.name(),
                    statements = executed.len(),
                    "Applied mutations"
                );
                Ok(RunOutput {
                    signature: plan.signature,
                    statements: executed,
                    state,
                })
            }
        }
    }
}
