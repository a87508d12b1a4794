//! Consolidation engine: scan, elect, repoint, purge and verify inside one
//! transaction, with bounded retry of transient failures and a preventive
//! unique index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dedupe_core::{
    group_duplicates, ConsolidationMapping, ConsolidationPlan, ConsolidationReport, EntitySpec,
    GroupSummary, Grouping, GuardStatus, Ident, Outcome, Phase, PhaseTransitionError, PlanError,
    ReferrerReport, RunState,
};
use dedupe_storage::{
    unique_index_name, BackoffPolicy, ConsolidationStore, GuardOutcome, PgStore, RetryDisposition,
    StoreError, StoreTransaction, TxOptions,
};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;

pub use config::{EngineConfig, GuardMode, PlanEntry, PlanFile};

#[derive(Debug, Error)]
pub enum ConsolidateError {
    #[error("invalid consolidation plan: {0}")]
    Plan(#[from] PlanError),
    #[error("configured {kind} {name} does not exist in the store")]
    MissingObject { kind: &'static str, name: String },
    #[error(
        "constraint violation while {stage} (table {}): {source}",
        .table.as_deref().unwrap_or("unknown")
    )]
    ConstraintViolation {
        stage: &'static str,
        table: Option<String>,
        source: StoreError,
    },
    #[error("verification failed for {entity}: {reason}")]
    VerificationFailed { entity: String, reason: String },
    #[error("gave up after {attempts} attempts: {source}")]
    Transient { attempts: u32, source: StoreError },
    #[error("cannot install unique index {index}: duplicate natural keys remain")]
    DuplicatesPresent { index: String },
    #[error("store error while {stage}: {source}")]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[error(transparent)]
    Phase(#[from] PhaseTransitionError),
}

impl ConsolidateError {
    /// Raised before any mutation was attempted.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            ConsolidateError::Plan(_) | ConsolidateError::MissingObject { .. }
        )
    }

    /// Signals a bug in grouping or election rather than bad data.
    pub fn is_logic_bug(&self) -> bool {
        matches!(
            self,
            ConsolidateError::VerificationFailed { .. } | ConsolidateError::Phase(_)
        )
    }

    fn is_transient(&self) -> bool {
        match self {
            ConsolidateError::Store { source, .. } => {
                source.disposition() == RetryDisposition::Retryable
            }
            _ => false,
        }
    }
}

fn stage_error(stage: &'static str, source: StoreError) -> ConsolidateError {
    if source.is_constraint_violation() {
        ConsolidateError::ConstraintViolation {
            stage,
            table: source.table().map(ToString::to_string),
            source,
        }
    } else {
        ConsolidateError::Store { stage, source }
    }
}

fn phase_error(phase: Phase) -> impl FnOnce(StoreError) -> ConsolidateError {
    move |source| stage_error(phase.as_str(), source)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Apply,
    DryRun,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Apply => "apply",
            RunMode::DryRun => "dry_run",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidatorOptions {
    pub tx: TxOptions,
    pub backoff: BackoffPolicy,
    pub guard: GuardMode,
    /// Warn about catalog foreign keys the plan does not register.
    pub check_declared_referrers: bool,
}

struct RunContext {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    attempt: u32,
    mode: RunMode,
}

#[derive(Clone)]
pub struct Consolidator {
    store: Arc<dyn ConsolidationStore>,
    options: ConsolidatorOptions,
}

impl Consolidator {
    pub fn new(store: Arc<dyn ConsolidationStore>, options: ConsolidatorOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &ConsolidatorOptions {
        &self.options
    }

    /// Runs the full routine for one entity and installs the guard according
    /// to the configured `GuardMode`.
    pub async fn consolidate(
        &self,
        plan: &ConsolidationPlan,
    ) -> Result<ConsolidationReport, ConsolidateError> {
        self.execute(plan, RunMode::Apply).await
    }

    /// Computes groups, survivors and would-be repoint counts, then rolls back.
    pub async fn scan(
        &self,
        plan: &ConsolidationPlan,
    ) -> Result<ConsolidationReport, ConsolidateError> {
        self.execute(plan, RunMode::DryRun).await
    }

    /// Each plan runs in its own transaction; one failure does not stop the rest.
    pub async fn run_all(
        &self,
        plans: &[ConsolidationPlan],
    ) -> Vec<(String, Result<ConsolidationReport, ConsolidateError>)> {
        let mut results = Vec::with_capacity(plans.len());
        for plan in plans {
            let result = self.consolidate(plan).await;
            results.push((plan.entity.table.to_string(), result));
        }
        results
    }

    pub async fn guard(&self, plan: &ConsolidationPlan) -> Result<GuardOutcome, ConsolidateError> {
        plan.validate()?;
        let index = unique_index_name(&plan.entity)?;
        match self.store.ensure_unique_index(&plan.entity, &index).await {
            Ok(outcome) => {
                info!(entity = %plan.entity.table, index = outcome.index(), ?outcome, "guard in place");
                Ok(outcome)
            }
            Err(StoreError::UniqueViolation { .. }) => Err(ConsolidateError::DuplicatesPresent {
                index: index.to_string(),
            }),
            Err(source) => Err(stage_error("guarding", source)),
        }
    }

    async fn execute(
        &self,
        plan: &ConsolidationPlan,
        mode: RunMode,
    ) -> Result<ConsolidationReport, ConsolidateError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "consolidate",
            %run_id,
            entity = %plan.entity.table,
            mode = mode.as_str(),
            backend = self.store.backend()
        );
        async move {
            self.preflight(plan).await?;
            let apply = mode == RunMode::Apply;
            if apply && self.options.guard == GuardMode::Before {
                self.guard(plan).await?;
            }

            let started_at = Utc::now();
            let mut attempt = 0u32;
            let mut report = loop {
                attempt += 1;
                let ctx = RunContext {
                    run_id,
                    started_at,
                    attempt,
                    mode,
                };
                let attempt_span = info_span!("attempt", attempt);
                match self.attempt(plan, &ctx).instrument(attempt_span).await {
                    Ok(report) => break report,
                    Err(err) if err.is_transient() => {
                        let retries_used = (attempt - 1) as usize;
                        if retries_used >= self.options.backoff.max_retries {
                            return Err(match err {
                                ConsolidateError::Store { source, .. } => {
                                    ConsolidateError::Transient {
                                        attempts: attempt,
                                        source,
                                    }
                                }
                                other => other,
                            });
                        }
                        let delay = self.options.backoff.delay_for_attempt(retries_used);
                        warn!(attempt, ?delay, error = %err, "transient failure; retrying whole transaction");
                        tokio::time::sleep(delay).await;
                    }
                    Err(err) => return Err(err),
                }
            };

            if apply && self.options.guard == GuardMode::After {
                // The consolidation is already committed; a guard failure is
                // reported alongside it rather than replacing it.
                report.guard = Some(match self.guard(plan).await {
                    Ok(outcome) => GuardStatus::Installed(outcome),
                    Err(err) => {
                        warn!(error = %err, "unique index not installed after commit");
                        GuardStatus::Failed(err.to_string())
                    }
                });
            }
            info!(
                outcome = ?report.outcome,
                groups_found = report.groups_found,
                repointed = report.repointed,
                deleted = report.deleted,
                attempts = report.attempts,
                guard_failed = report.guard_failed(),
                "consolidation finished"
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Configuration checks; nothing is opened or mutated when these fail.
    async fn preflight(&self, plan: &ConsolidationPlan) -> Result<(), ConsolidateError> {
        plan.validate()?;
        let entity = &plan.entity;
        self.require_table(&entity.table).await?;
        for column in [&entity.id_column, &entity.created_at_column]
            .into_iter()
            .chain(entity.natural_key.iter())
        {
            self.require_column(&entity.table, column).await?;
        }
        for referrer in &plan.referrers {
            self.require_table(&referrer.table).await?;
            self.require_column(&referrer.table, &referrer.column).await?;
        }

        if self.options.check_declared_referrers {
            let declared = self
                .store
                .declared_referrers(entity)
                .await
                .map_err(|source| stage_error("preflight", source))?;
            for fk in declared {
                let registered = plan
                    .referrers
                    .iter()
                    .any(|r| r.table.name() == fk.table.name() && r.column == fk.column);
                if !registered {
                    warn!(
                        referrer = %fk,
                        entity = %entity.table,
                        "foreign key is not registered in the plan; purge fails while it references a loser"
                    );
                }
            }
        }
        Ok(())
    }

    async fn require_table(&self, table: &Ident) -> Result<(), ConsolidateError> {
        let exists = self
            .store
            .table_exists(table)
            .await
            .map_err(|source| stage_error("preflight", source))?;
        if exists {
            Ok(())
        } else {
            Err(ConsolidateError::MissingObject {
                kind: "table",
                name: table.to_string(),
            })
        }
    }

    async fn require_column(&self, table: &Ident, column: &Ident) -> Result<(), ConsolidateError> {
        let exists = self
            .store
            .column_exists(table, column)
            .await
            .map_err(|source| stage_error("preflight", source))?;
        if exists {
            Ok(())
        } else {
            Err(ConsolidateError::MissingObject {
                kind: "column",
                name: format!("{table}.{column}"),
            })
        }
    }

    async fn attempt(
        &self,
        plan: &ConsolidationPlan,
        ctx: &RunContext,
    ) -> Result<ConsolidationReport, ConsolidateError> {
        let tx_options = match ctx.mode {
            RunMode::Apply => self.options.tx,
            RunMode::DryRun => self.options.tx.read_only(),
        };
        let mut tx = self
            .store
            .begin(&tx_options)
            .await
            .map_err(phase_error(Phase::Scanning))?;
        let mut state = RunState::new();

        match self.run_phases(tx.as_mut(), plan, ctx, &mut state).await {
            Ok(Finish::Commit(mut report)) => {
                tx.commit().await.map_err(|source| stage_error("committing", source))?;
                let terminal = if state.phase() == Phase::NoDuplicates {
                    Phase::Done
                } else {
                    Phase::Committed
                };
                state.advance(terminal)?;
                report.phases = state.history().to_vec();
                report.finished_at = Utc::now();
                Ok(report)
            }
            Ok(Finish::Discard(mut report)) => {
                tx.rollback()
                    .await
                    .map_err(|source| stage_error("rolling back", source))?;
                state.advance(Phase::RolledBack)?;
                report.phases = state.history().to_vec();
                report.finished_at = Utc::now();
                Ok(report)
            }
            Err(err) => {
                let failed_in = state.phase();
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "explicit rollback failed; connection drop discards the transaction");
                }
                if let Err(transition) = state.advance(Phase::RolledBack) {
                    debug!(%transition, "rollback from a terminal phase");
                }
                warn!(phase = %failed_in, attempt = ctx.attempt, error = %err, "consolidation rolled back");
                Err(err)
            }
        }
    }

    async fn run_phases(
        &self,
        tx: &mut dyn StoreTransaction,
        plan: &ConsolidationPlan,
        ctx: &RunContext,
        state: &mut RunState,
    ) -> Result<Finish, ConsolidateError> {
        let entity = &plan.entity;
        let grouping = scan_groups(tx, entity)
            .await
            .map_err(phase_error(Phase::Scanning))?;
        let mapping = ConsolidationMapping::from_groups(&grouping.groups);
        info!(
            rows_scanned = grouping.rows_scanned,
            null_key_rows = grouping.null_key_rows,
            groups = grouping.groups.len(),
            losers = mapping.len(),
            "scan complete"
        );

        let mut report = ConsolidationReport {
            run_id: ctx.run_id,
            entity: entity.table.to_string(),
            outcome: Outcome::NoDuplicates,
            groups_found: grouping.groups.len(),
            losers: mapping.len(),
            repointed: 0,
            deleted: 0,
            rows_scanned: grouping.rows_scanned,
            null_key_rows: grouping.null_key_rows,
            referrers: Vec::with_capacity(plan.referrers.len()),
            groups: grouping.groups.iter().map(GroupSummary::from).collect(),
            phases: Vec::new(),
            attempts: ctx.attempt,
            guard: None,
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
        };

        if grouping.is_clean() {
            state.advance(Phase::NoDuplicates)?;
            return Ok(Finish::Commit(report));
        }

        let loser_ids = mapping.loser_ids();
        if ctx.mode == RunMode::DryRun {
            for referrer in &plan.referrers {
                let scanned = tx
                    .count_references(referrer)
                    .await
                    .map_err(phase_error(Phase::Scanning))?;
                let would_repoint = tx
                    .count_references_to(referrer, &loser_ids)
                    .await
                    .map_err(phase_error(Phase::Scanning))?;
                report.referrers.push(ReferrerReport {
                    table: referrer.table.to_string(),
                    column: referrer.column.to_string(),
                    scanned,
                    repointed: would_repoint,
                });
            }
            report.repointed = report.referrers.iter().map(|r| r.repointed).sum();
            report.outcome = Outcome::DryRun;
            return Ok(Finish::Discard(report));
        }

        state.advance(Phase::Migrating)?;
        for referrer in &plan.referrers {
            let scanned = tx
                .count_references(referrer)
                .await
                .map_err(phase_error(Phase::Migrating))?;
            let repointed = tx
                .repoint(referrer, &mapping)
                .await
                .map_err(phase_error(Phase::Migrating))?;
            debug!(referrer = %referrer, scanned, repointed, "referrer migrated");
            report.referrers.push(ReferrerReport {
                table: referrer.table.to_string(),
                column: referrer.column.to_string(),
                scanned,
                repointed,
            });
        }
        report.repointed = report.referrers.iter().map(|r| r.repointed).sum();

        state.advance(Phase::Purging)?;
        report.deleted = tx
            .delete_rows(entity, &loser_ids)
            .await
            .map_err(phase_error(Phase::Purging))?;
        debug!(deleted = report.deleted, "losers purged");

        state.advance(Phase::Verifying)?;
        verify(tx, plan, &mapping, &report).await?;

        report.outcome = Outcome::Committed;
        Ok(Finish::Commit(report))
    }
}

enum Finish {
    Commit(ConsolidationReport),
    Discard(ConsolidationReport),
}

async fn scan_groups(
    tx: &mut dyn StoreTransaction,
    entity: &EntitySpec,
) -> Result<Grouping, StoreError> {
    let scan = tx.scan_entity(entity).await?;
    let mut grouping = group_duplicates(scan.candidates);
    grouping.rows_scanned = scan.total_rows as usize;
    grouping.null_key_rows = scan.null_key_rows as usize;
    Ok(grouping)
}

/// Post-mutation checks inside the same transaction.
async fn verify(
    tx: &mut dyn StoreTransaction,
    plan: &ConsolidationPlan,
    mapping: &ConsolidationMapping,
    report: &ConsolidationReport,
) -> Result<(), ConsolidateError> {
    let failed = |reason: String| ConsolidateError::VerificationFailed {
        entity: plan.entity.table.to_string(),
        reason,
    };

    if report.deleted != mapping.len() as u64 {
        return Err(failed(format!(
            "deleted {} rows but identified {} losers",
            report.deleted,
            mapping.len()
        )));
    }

    let regrouped = scan_groups(tx, &plan.entity)
        .await
        .map_err(phase_error(Phase::Verifying))?;
    if !regrouped.is_clean() {
        return Err(failed(format!(
            "{} duplicate groups remain after cleanup",
            regrouped.groups.len()
        )));
    }

    let loser_ids = mapping.loser_ids();
    for (referrer, counts) in plan.referrers.iter().zip(&report.referrers) {
        if counts.repointed > counts.scanned {
            return Err(failed(format!(
                "{referrer} repointed {} rows but only {} were scanned",
                counts.repointed, counts.scanned
            )));
        }
        let dangling = tx
            .count_references_to(referrer, &loser_ids)
            .await
            .map_err(phase_error(Phase::Verifying))?;
        if dangling > 0 {
            return Err(failed(format!(
                "{dangling} rows in {referrer} still reference purged ids"
            )));
        }
    }
    Ok(())
}

pub async fn connect_postgres(config: &EngineConfig) -> anyhow::Result<Arc<dyn ConsolidationStore>> {
    let store = PgStore::connect(&config.database_url, config.max_connections)
        .await
        .context("connecting to DATABASE_URL")?;
    Ok(Arc::new(store))
}

/// Writes `<reports_dir>/<run_id>/<entity>.json` and returns its path.
pub async fn write_report(
    reports_dir: &Path,
    report: &ConsolidationReport,
) -> anyhow::Result<PathBuf> {
    let run_dir = reports_dir.join(report.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(format!("{}.json", report.entity));
    let bytes = serde_json::to_vec_pretty(report).context("serializing consolidation report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Schedules `run_all` over `plans` on a cron expression (seconds first).
pub async fn build_scheduler(
    consolidator: Consolidator,
    plans: Vec<ConsolidationPlan>,
    cron: &str,
    reports_dir: Option<PathBuf>,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let consolidator = Arc::new(consolidator);
    let plans = Arc::new(plans);
    let reports_dir = Arc::new(reports_dir);
    let job = Job::new_async(cron, move |_uuid, _l| {
        let consolidator = Arc::clone(&consolidator);
        let plans = Arc::clone(&plans);
        let reports_dir = Arc::clone(&reports_dir);
        Box::pin(async move {
            for (entity, result) in consolidator.run_all(&plans).await {
                let report = match result {
                    Ok(report) => report,
                    Err(err) => {
                        error!(%entity, error = %err, "scheduled consolidation failed");
                        continue;
                    }
                };
                info!(%entity, summary = %report.summary_line(), "scheduled consolidation");
                if let Some(dir) = reports_dir.as_deref() {
                    if let Err(err) = write_report(dir, &report).await {
                        warn!(%entity, error = %err, "could not persist report");
                    }
                }
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
