use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dedupe_core::{ConsolidationPlan, ConsolidationReport};
use dedupe_engine::{
    build_scheduler, connect_postgres, write_report, ConsolidateError, Consolidator,
    EngineConfig, GuardMode, PlanFile,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "dedupe-cli")]
#[command(about = "Consolidate natural-key duplicates and guard against their return")]
struct Cli {
    /// Plan file; overrides DEDUPE_PLAN_PATH.
    #[arg(long, global = true)]
    plan: Option<PathBuf>,
    /// Restrict the run to one entity table from the plan file.
    #[arg(long, global = true)]
    entity: Option<String>,
    /// Overrides DEDUPE_GUARD (before, after, skip).
    #[arg(long, global = true)]
    guard: Option<GuardMode>,
    /// Persist JSON reports here; overrides DEDUPE_REPORTS_DIR.
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    /// Print reports as JSON instead of summary lines.
    #[arg(long, global = true)]
    json: bool,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consolidate duplicates and install the unique index.
    Consolidate,
    /// Report what a consolidation would do, then roll back.
    Scan,
    /// Only install the preventive unique index.
    Guard,
    /// Run consolidation on DEDUPE_CRON until interrupted.
    Schedule,
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_env("DEDUPE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = EngineConfig::from_env();
    if let Some(plan) = &cli.plan {
        config.plan_path = plan.clone();
    }
    if let Some(guard) = cli.guard {
        config.guard = guard;
    }
    if let Some(dir) = &cli.reports_dir {
        config.reports_dir = Some(dir.clone());
    }
    let plans = PlanFile::load(&config.plan_path)?.select(cli.entity.as_deref())?;
    let store = connect_postgres(&config).await?;
    let consolidator = Consolidator::new(store, config.consolidator_options());

    match cli.command.unwrap_or(Commands::Consolidate) {
        Commands::Consolidate => {
            let results = consolidator.run_all(&plans).await;
            report_results(results, cli.json, config.reports_dir.as_deref())
                .await
                .map(ExitCode::from)
        }
        Commands::Scan => {
            let mut results = Vec::with_capacity(plans.len());
            for plan in &plans {
                results.push((plan.entity.table.to_string(), consolidator.scan(plan).await));
            }
            report_results(results, cli.json, config.reports_dir.as_deref())
                .await
                .map(ExitCode::from)
        }
        Commands::Guard => run_guard(&consolidator, &plans, cli.json)
            .await
            .map(ExitCode::from),
        Commands::Schedule => {
            let mut sched =
                build_scheduler(consolidator, plans, &config.cron, config.reports_dir.clone())
                    .await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            sched.shutdown().await.context("stopping scheduler")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

fn exit_code_for(err: &ConsolidateError) -> u8 {
    if err.is_config_error() {
        EXIT_CONFIG
    } else {
        EXIT_FAILURE
    }
}

/// Prints every result and returns the most severe exit code seen.
async fn report_results(
    results: Vec<(String, std::result::Result<ConsolidationReport, ConsolidateError>)>,
    json: bool,
    reports_dir: Option<&Path>,
) -> Result<u8> {
    let mut worst = 0u8;
    for (entity, result) in results {
        match result {
            Ok(report) => {
                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else {
                    println!("{}", report.summary_line());
                }
                if let Some(dir) = reports_dir {
                    match write_report(dir, &report).await {
                        Ok(path) => info!(%entity, path = %path.display(), "report written"),
                        Err(err) => {
                            error!(%entity, error = %format!("{err:#}"), "could not persist report");
                            worst = worst.max(EXIT_FAILURE);
                        }
                    }
                }
            }
            Err(err) => {
                error!(%entity, error = %err, logic_bug = err.is_logic_bug(), "consolidation failed");
                eprintln!("{entity}: failed: {err}");
                worst = worst.max(exit_code_for(&err));
            }
        }
    }
    Ok(worst)
}

async fn run_guard(
    consolidator: &Consolidator,
    plans: &[ConsolidationPlan],
    json: bool,
) -> Result<u8> {
    let mut worst = 0u8;
    for plan in plans {
        let entity = plan.entity.table.to_string();
        match consolidator.guard(plan).await {
            Ok(outcome) if json => println!(
                "{}",
                serde_json::json!({ "entity": entity, "guard": outcome })
            ),
            Ok(outcome) => println!("{entity}: index {} ({outcome:?})", outcome.index()),
            Err(err) => {
                error!(%entity, error = %err, "guard failed");
                eprintln!("{entity}: guard failed: {err}");
                worst = worst.max(exit_code_for(&err));
            }
        }
    }
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dedupe_core::Outcome;
    use uuid::Uuid;

    fn report(entity: &str) -> ConsolidationReport {
        let now = Utc::now();
        ConsolidationReport {
            run_id: Uuid::nil(),
            entity: entity.to_string(),
            outcome: Outcome::Committed,
            groups_found: 1,
            losers: 1,
            repointed: 1,
            deleted: 1,
            rows_scanned: 2,
            null_key_rows: 0,
            referrers: Vec::new(),
            groups: Vec::new(),
            phases: Vec::new(),
            attempts: 1,
            guard: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn config_error() -> ConsolidateError {
        ConsolidateError::MissingObject {
            kind: "table",
            name: "carts".to_string(),
        }
    }

    fn verification_error() -> ConsolidateError {
        ConsolidateError::VerificationFailed {
            entity: "stores".to_string(),
            reason: "duplicates remain".to_string(),
        }
    }

    #[tokio::test]
    async fn most_severe_exit_code_wins_regardless_of_order() {
        let code = report_results(
            vec![
                ("carts".to_string(), Err(config_error())),
                ("stores".to_string(), Err(verification_error())),
            ],
            false,
            None,
        )
        .await
        .expect("report");
        assert_eq!(code, EXIT_CONFIG);

        let code = report_results(
            vec![
                ("stores".to_string(), Err(verification_error())),
                ("carts".to_string(), Err(config_error())),
            ],
            false,
            None,
        )
        .await
        .expect("report");
        assert_eq!(code, EXIT_CONFIG);

        let code = report_results(vec![("tags".to_string(), Ok(report("tags")))], false, None)
            .await
            .expect("report");
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn unwritable_reports_dir_does_not_stop_later_results() {
        // A plain file where the directory should be makes every write fail.
        let blocker = tempfile::NamedTempFile::new().expect("tempfile");
        let code = report_results(
            vec![
                ("tags".to_string(), Ok(report("tags"))),
                ("carts".to_string(), Err(config_error())),
            ],
            true,
            Some(blocker.path()),
        )
        .await
        .expect("report write errors are logged, not returned");
        assert_eq!(code, EXIT_CONFIG);

        let code = report_results(
            vec![("tags".to_string(), Ok(report("tags")))],
            false,
            Some(blocker.path()),
        )
        .await
        .expect("report");
        assert_eq!(code, EXIT_FAILURE);
    }
}
