//! Evolution orchestration.
//!
//! The evolver ties the pieces together for one application at a time:
//! it reads the last recorded signature from the ledger, replays the
//! pending evolutions on it, checks that the result matches the declared
//! models, executes the statements and records each evolution.

use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::diff::{describe_app, diff};
use crate::error::{EvolutionError, Result};
use crate::evolution::Evolution;
use crate::executor::{Executor, Plan, RunState};
use crate::hint::{hint, HintedEvolution};
use crate::ledger::{Ledger, PurgeAuthorization};
use crate::mutations::MutationSpec;
use crate::signature::ProjectSignature;

/// Options for the evolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvolverOptions {
    /// Drop the tables of deleted applications and purge their history.
    pub purge: bool,
    /// Plan and validate only; execute and record nothing.
    pub dry_run: bool,
}

impl EvolverOptions {
    /// Creates default options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            purge: false,
            dry_run: false,
        }
    }

    /// Enables purging of deleted applications.
    #[must_use]
    pub const fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Application the run was for.
    pub app: String,
    /// Labels of the evolutions the run covered, in order.
    pub labels: Vec<String>,
    /// Executed statements (planned statements in a dry run).
    pub statements: Vec<String>,
    /// Project signature after the run.
    pub signature: ProjectSignature,
    /// State the run ended in.
    pub state: RunState,
    /// Whether the application's history was purged.
    pub purged: bool,
}

/// Outcome of [`Evolver::evolve`].
#[derive(Debug, Clone, PartialEq)]
pub enum EvolveOutcome {
    /// The pending evolutions were applied.
    Applied(RunReport),
    /// Every given evolution was already recorded; nothing was done.
    AlreadyApplied {
        /// Application name.
        app: String,
        /// Labels found in the ledger.
        labels: Vec<String>,
    },
}

/// Runs evolutions against a database.
pub struct Evolver<L: Ledger> {
    backend: Box<dyn Backend>,
    ledger: L,
    pool: SqlitePool,
    options: EvolverOptions,
}

impl<L: Ledger> Evolver<L> {
    /// Creates an evolver executing statements on `pool`.
    #[must_use]
    pub fn new(backend: Box<dyn Backend>, ledger: L, pool: SqlitePool) -> Self {
        Self {
            backend,
            ledger,
            pool,
            options: EvolverOptions::default(),
        }
    }

    /// Sets the options.
    #[must_use]
    pub fn with_options(mut self, options: EvolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Creates the ledger storage.
    pub async fn init(&self) -> Result<()> {
        self.ledger.ensure_schema().await
    }

    /// Returns the latest recorded project signature, or an empty one.
    pub async fn base_signature(&self) -> Result<ProjectSignature> {
        Ok(self.ledger.latest_signature().await?.unwrap_or_default())
    }

    /// Returns the mutations between the recorded and the declared signature.
    pub async fn pending_changes(&self, declared: &ProjectSignature) -> Result<Vec<MutationSpec>> {
        let base = self.base_signature().await?;
        Ok(diff(&base, declared))
    }

    /// Returns hinted mutations for the pending changes.
    pub async fn hint(&self, declared: &ProjectSignature) -> Result<HintedEvolution> {
        let base = self.base_signature().await?;
        Ok(hint(&base, &diff(&base, declared)))
    }

    /// Returns the evolutions of `app` that have not been recorded yet.
    pub async fn pending_evolutions<'e>(
        &self,
        app: &str,
        evolutions: &'e [Evolution],
    ) -> Result<Vec<&'e Evolution>> {
        let mut pending = Vec::new();
        for evolution in evolutions {
            if !self.ledger.is_applied(app, &evolution.label).await? {
                pending.push(evolution);
            }
        }
        Ok(pending)
    }

    /// Replays the pending evolutions of `app` and checks that the result
    /// matches the declared models of `app`.
    ///
    /// Executes nothing. The report is in the `Validated` state.
    pub async fn simulate(
        &self,
        app: &str,
        evolutions: &[Evolution],
        declared: &ProjectSignature,
    ) -> Result<RunReport> {
        let pending = self.pending_evolutions(app, evolutions).await?;
        let mut state = RunState::Pending;
        let plans = self.validate(app, &pending, declared, &mut state).await?;
        Ok(planned_report(app, &pending, &plans, state))
    }

    /// Applies the pending evolutions of `app`.
    ///
    /// Nothing is executed unless the replay reaches the declared models.
    /// Each evolution is recorded once all its statements have succeeded.
    /// Outside a dry run the backend must be the sqlite one, since the
    /// statements run on a SQLite pool.
    pub async fn evolve(
        &self,
        app: &str,
        evolutions: &[Evolution],
        declared: &ProjectSignature,
    ) -> Result<EvolveOutcome> {
        if !self.options.dry_run && self.backend.name() != "sqlite" {
            return Err(EvolutionError::BackendMismatch(self.backend.name().to_string()));
        }

        let pending = self.pending_evolutions(app, evolutions).await?;
        if pending.is_empty() {
            info!(app = %app, "No pending evolutions");
            return Ok(EvolveOutcome::AlreadyApplied {
                app: app.to_string(),
                labels: evolutions.iter().map(|e| e.label.clone()).collect(),
            });
        }

        let mut state = RunState::Pending;
        let plans = self.validate(app, &pending, declared, &mut state).await?;

        if self.options.dry_run {
            info!(app = %app, "Dry run, nothing executed");
            return Ok(EvolveOutcome::Applied(planned_report(app, &pending, &plans, state)));
        }

        state.transition(RunState::Applying)?;
        let executor = Executor::new(self.backend.as_ref()).with_purge(self.options.purge);
        let mut executed = Vec::new();
        let mut purged = false;

        for (evolution, plan) in pending.iter().zip(&plans) {
            info!(app = %app, label = %evolution.label, "Applying evolution");
            let mut conn = self.pool.acquire().await?;
            let result = executor.execute(&plan.mutations, &mut conn, &mut executed).await;
            drop(conn);
            if let Err(e) = result {
                state.transition(RunState::Failed)?;
                warn!(app = %app, label = %evolution.label, "Evolution failed");
                return Err(e.in_evolution(&evolution.label));
            }

            if self.options.purge && evolution.deletes_application(app) {
                let authorization = PurgeAuthorization::from_evolution(app, evolution)?;
                self.ledger.purge(&authorization, &plan.signature).await?;
                purged = true;
            } else if !self.ledger.record(app, &evolution.label, &plan.signature).await? {
                warn!(app = %app, label = %evolution.label, "Evolution was recorded concurrently");
            }
        }

        state.transition(RunState::Applied)?;
        let signature = plans
            .last()
            .map(|p| p.signature.clone())
            .unwrap_or_default();
        info!(app = %app, statements = executed.len(), "Evolutions applied");

        Ok(EvolveOutcome::Applied(RunReport {
            app: app.to_string(),
            labels: pending.iter().map(|e| e.label.clone()).collect(),
            statements: executed,
            signature,
            state,
            purged,
        }))
    }

    /// Plans every pending evolution from the latest recorded signature and
    /// compares the outcome with the declared models of `app`.
    async fn validate(
        &self,
        app: &str,
        pending: &[&Evolution],
        declared: &ProjectSignature,
        state: &mut RunState,
    ) -> Result<Vec<Plan>> {
        state.transition(RunState::Simulating)?;
        let executor = Executor::new(self.backend.as_ref()).with_purge(self.options.purge);
        let mut signature = self.base_signature().await?;
        let mut plans = Vec::with_capacity(pending.len());

        for evolution in pending {
            debug!(app = %app, label = %evolution.label, "Simulating evolution");
            let plan = executor.plan(&signature, &evolution.mutations)?;
            signature = plan.signature.clone();
            plans.push(plan);
        }

        let differences = describe_app(&signature, declared, app);
        if !differences.is_empty() {
            state.transition(RunState::Diverged)?;
            warn!(app = %app, differences = differences.len(), "Simulated signature diverges");
            return Err(EvolutionError::SimulationDivergence {
                app: app.to_string(),
                differences,
            });
        }

        state.transition(RunState::Validated)?;
        Ok(plans)
    }
}

fn planned_report(app: &str, pending: &[&Evolution], plans: &[Plan], state: RunState) -> RunReport {
    RunReport {
        app: app.to_string(),
        labels: pending.iter().map(|e| e.label.clone()).collect(),
        statements: plans.iter().flat_map(Plan::statements).collect(),
        signature: plans
            .last()
            .map(|p| p.signature.clone())
            .unwrap_or_default(),
        state,
        purged: false,
    }
}
