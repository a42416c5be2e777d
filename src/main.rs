mod config;
mod database;
mod generator;
mod workload;

use crate::config::{MAX_EXECUTION_TIME, OPERATION_COUNT, Properties, WorkloadConfig};
use crate::database::Registry;
use crate::workload::engine::CoreWorkload;
use crate::workload::presets::Preset;
use crate::workload::{Phase, RunPlan, WorkloadStats, exec_load, exec_run};
use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(value_enum)]
    phase: PhaseArg,

    /// Backend id (membtree, redb, sled)
    database: String,

    #[arg(short = 't', default_value = "1")]
    threads: usize,

    /// Start from one of the standard workload mixes
    #[arg(short = 'w', value_enum)]
    workload: Option<Preset>,

    /// Properties file, applied in order after the preset
    #[arg(short = 'P')]
    property_files: Vec<PathBuf>,

    /// key=value override, applied last
    #[arg(short = 'p')]
    properties: Vec<String>,

    /// Used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Copy, Clone, ValueEnum)]
enum PhaseArg {
    Load,
    Run,
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let props = collect_properties(&cli)?;

    // Everything configurable is validated here, before any worker starts.
    let config = WorkloadConfig::from_properties(&props)?;
    let operation_count: u64 = props.parse_or(OPERATION_COUNT, 1000)?;
    let max_execution_time = props
        .parse_opt::<u64>(MAX_EXECUTION_TIME)?
        .map(Duration::from_secs);
    let factory = Registry::builtin().resolve(&cli.database)?;

    let loader = match cli.phase {
        PhaseArg::Load | PhaseArg::All => Some(CoreWorkload::new(config.clone(), Phase::Load)?),
        PhaseArg::Run => None,
    };
    let runner = match cli.phase {
        PhaseArg::Run | PhaseArg::All => Some(CoreWorkload::new(config.clone(), Phase::Run)?),
        PhaseArg::Load => None,
    };

    let db = factory(&props)?;
    info!(
        backend = db.name(),
        table = %config.table,
        distribution = ?config.request_distribution,
        "workload configured"
    );

    let mut stats = WorkloadStats::default();
    if let Some(loader) = &loader {
        let plan = RunPlan {
            threads: cli.threads,
            operations: config.record_count,
            max_execution_time,
        };
        stats.load = Some(exec_load(loader, &db, &plan)?);
    }
    if let Some(runner) = &runner {
        let plan = RunPlan {
            threads: cli.threads,
            operations: operation_count,
            max_execution_time,
        };
        stats.run = Some(exec_run(runner, &db, &plan)?);
    }

    println!("{}", stats);
    Ok(())
}

/// Preset, then files, then `-p` overrides; later sources win.
fn collect_properties(cli: &Cli) -> Result<Properties> {
    let mut props = cli.workload.map(Preset::properties).unwrap_or_default();
    for path in &cli.property_files {
        props.merge(Properties::load(path)?);
    }
    for pair in &cli.properties {
        props.set_pair(pair)?;
    }
    Ok(props)
}
