use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use match_core::clock::ManualClock;
use match_core::config::MatchingConfig;
use match_core::ledger::{write_ledger_parquet, JsonlLedgerStore, MatchLedger};
use match_core::logging::init_logging;
use match_core::types::RequestState;
use match_core::MatchingEngine;
use tracing::info;

mod decision;
mod runner;
mod scenario;

use decision::{DriverDecisionConfig, SimulatedDrivers};
use runner::{RunParams, RunSummary, Simulation, TripBoard};
use scenario::{build_scenario, ScenarioParams};

// ── CLI definition ─────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "match_sim",
    about = "Drive the ride matching core with a synthetic city",
    long_about = "Runs seeded rider and driver populations through the matching engine\n\
                  on a simulated clock and reports matching KPIs."
)]
struct Cli {
    /// Default log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a seeded scenario against a fresh (or recovered) engine
    Run {
        /// RNG seed for the scenario and driver decisions
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 200)]
        drivers: usize,
        #[arg(long, default_value_t = 1_000)]
        requests: usize,
        /// Matching worker threads
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Window over which rider requests arrive, in minutes
        #[arg(long, default_value_t = 60)]
        window_min: u64,
        /// Base logit score of a driver accepting a proposal
        #[arg(long, default_value_t = 1.0)]
        accept_bias: f64,
        /// Share of riders who cancel when kept waiting
        #[arg(long, default_value_t = 0.1)]
        cancel_share: f64,
        /// TOML matching configuration (MATCH__* env vars override it)
        #[arg(long, env = "MATCH_CONFIG")]
        config: Option<PathBuf>,
        /// Append-only JSONL ledger; omitted means in-memory
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Write the ledger as Parquet after the run
        #[arg(long)]
        parquet: Option<PathBuf>,
    },
    /// Recover state from a JSONL ledger and report it
    Audit {
        /// Ledger written by an earlier run
        #[arg(long)]
        ledger: PathBuf,
        /// Also export the ledger as Parquet
        #[arg(long)]
        parquet: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run {
            seed,
            drivers,
            requests,
            workers,
            window_min,
            accept_bias,
            cancel_share,
            config,
            ledger,
            parquet,
        } => {
            let config = MatchingConfig::load(config.as_deref()).context("loading matching config")?;
            let scenario_params = ScenarioParams {
                num_drivers: drivers,
                num_requests: requests,
                ..Default::default()
            }
            .with_seed(seed)
            .with_request_window_ms(window_min * 60 * 1000)
            .with_cancel_share(cancel_share);
            let decisions = DriverDecisionConfig::default()
                .with_seed(seed)
                .with_base_acceptance_score(accept_bias);
            let params = RunParams {
                workers,
                ..Default::default()
            };
            let summary = run(config, &scenario_params, decisions, params, ledger, parquet)?;
            report(&summary);
        }
        Commands::Audit { ledger, parquet } => audit(ledger, parquet)?,
    }
    Ok(())
}

fn run(
    config: MatchingConfig,
    scenario_params: &ScenarioParams,
    decisions: DriverDecisionConfig,
    params: RunParams,
    ledger: Option<PathBuf>,
    parquet: Option<PathBuf>,
) -> anyhow::Result<RunSummary> {
    let clock = Arc::new(ManualClock::new(0));
    let drivers = Arc::new(SimulatedDrivers::new(decisions, config.decision_window_ms));
    let board = Arc::new(TripBoard::new());

    let mut builder = MatchingEngine::builder(config)
        .with_clock(clock.clone())
        .with_notifier(drivers.clone())
        .with_trip_lifecycle(board.clone())
        .with_rider_feedback(board.clone());
    if let Some(path) = &ledger {
        let store = JsonlLedgerStore::open(path)
            .with_context(|| format!("opening ledger {}", path.display()))?;
        builder = builder.with_ledger_store(store);
    }
    let engine = builder.build().context("building matching engine")?;
    if !engine.ledger().is_empty() {
        // Continue the simulated timeline after whatever the ledger recorded.
        let last = engine.ledger().entries().iter().map(|e| e.at_ms).max().unwrap_or(0);
        clock.set(last + 1);
    }

    let scenario = build_scenario(scenario_params);
    info!(
        drivers = scenario.drivers.len(),
        requests = scenario.arrivals.len(),
        seed = scenario_params.seed,
        "scenario built"
    );
    let summary = Simulation::new(&engine, &clock, &drivers, &board, params).run(&scenario)?;

    if let Some(path) = parquet {
        export(engine.ledger(), &path)?;
    }
    Ok(summary)
}

fn audit(ledger: PathBuf, parquet: Option<PathBuf>) -> anyhow::Result<()> {
    let store = JsonlLedgerStore::open(&ledger)
        .with_context(|| format!("opening ledger {}", ledger.display()))?;
    let engine = MatchingEngine::builder(MatchingConfig::default())
        .with_clock(Arc::new(ManualClock::new(0)))
        .with_ledger_store(store)
        .build()
        .context("recovering from ledger")?;

    let mut by_state = BTreeMap::<String, usize>::new();
    let mut open = 0usize;
    for id in engine.request_ids() {
        if let Some(request) = engine.request(id) {
            if matches!(request.state, RequestState::Pending | RequestState::Proposed) {
                open += 1;
            }
            *by_state.entry(request.state.to_string()).or_default() += 1;
        }
    }
    info!(
        entries = engine.ledger().len(),
        requests = engine.request_ids().len(),
        open,
        ?by_state,
        "ledger recovered"
    );

    if let Some(path) = parquet {
        export(engine.ledger(), &path)?;
    }
    Ok(())
}

fn export(ledger: &MatchLedger, path: &Path) -> anyhow::Result<()> {
    let entries = ledger.entries();
    write_ledger_parquet(path, &entries)
        .map_err(|e| anyhow!("writing {}: {e}", path.display()))?;
    info!(rows = entries.len(), path = %path.display(), "ledger exported");
    Ok(())
}

fn report(summary: &RunSummary) {
    let counts = &summary.counts;
    info!(
        submitted = counts.submitted,
        proposals = counts.proposals,
        accepted = counts.accepted,
        rejected = counts.rejected,
        timed_out = counts.timed_out,
        expired = counts.expired,
        exhausted = counts.exhausted,
        cancelled = counts.cancelled,
        conflicts = counts.reservation_conflicts,
        notification_failures = counts.notification_failures,
        acceptance_rate = counts.acceptance_rate(),
        "matching KPIs"
    );
    info!(
        completed_trips = summary.completed_trips,
        rider_cancels = summary.rider_cancels,
        no_match_notices = summary.no_match_notices,
        mean_time_to_match_s = summary.mean_time_to_match_ms.map(|ms| ms / 1000.0),
        simulated_min = summary.simulated_ms / 60_000,
        steps = summary.steps,
        "run summary"
    );
    info!(
        available = summary.drivers.available,
        reserved = summary.drivers.reserved,
        on_trip = summary.drivers.on_trip,
        offline = summary.drivers.offline,
        "driver states at end"
    );
}
