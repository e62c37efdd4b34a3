use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fhirbench::config::{BenchConfig, CONFIG_FILE_NAME, Overrides};
use fhirbench::record::QueryType;
use fhirbench::{RunOrchestrator, RunSummary};

/// Shared option for locating the configuration file
#[derive(Debug, Args)]
struct ConfigArgs {
    /// Path to fhirbench.toml (default: discovered from the current directory upwards)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of rounds per backend
    #[arg(long)]
    rounds: Option<usize>,

    /// Maximum attempts per backend phase
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Pause after each phase, e.g. "30s" or "500ms"
    #[arg(long)]
    cooldown: Option<String>,

    /// Directory for the run's result CSV
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Drop OS file caches after each phase (requires sudo)
    #[arg(long)]
    clear_cache: bool,
}

impl ConfigArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            rounds: self.rounds,
            max_attempts: self.max_attempts,
            cooldown: self.cooldown.clone(),
            output_dir: self.output_dir.clone(),
            clear_cache: self.clear_cache,
        }
    }

    /// Load the configuration and apply command-line overrides
    fn load(&self) -> Result<BenchConfig> {
        let path = match &self.config {
            Some(path) => path.clone(),
            None => BenchConfig::discover().ok_or_else(|| {
                anyhow!(
                    "No {} found in the current directory or its parents (use --config)",
                    CONFIG_FILE_NAME
                )
            })?,
        };

        let mut config = BenchConfig::load(&path)?;
        config
            .apply_overrides(&self.overrides())
            .with_context(|| format!("Invalid overrides for {}", path.display()))?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every backend for the configured number of rounds and write the results
    Run(ConfigArgs),

    /// Validate the configuration and print the run plan without executing anything
    Check(ConfigArgs),
}

#[derive(Debug, Parser)]
#[command(name = "fhirbench", author, version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose {
        "fhirbench=debug"
    } else {
        "fhirbench=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// `fhirbench run`
fn cmd_run(args: ConfigArgs) -> Result<()> {
    let config = args.load()?;

    let mut orchestrator = RunOrchestrator::new(
        config.run_config(),
        config.build_backends(),
        Box::new(config.build_stabilizer()?),
        Box::new(config.build_sink()),
    );
    let mut counter = config.build_counter();

    let RunSummary {
        path,
        records,
        rounds_completed,
        failed_attempts,
        failed_phases,
        cancelled,
    } = orchestrator.run(&mut counter)?;

    info!(
        path = %path.display(),
        records,
        rounds_completed,
        failed_attempts,
        failed_phases,
        cancelled,
        "benchmark run complete"
    );
    Ok(())
}

/// `fhirbench check`
fn cmd_check(args: ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let cooldown = config.cooldown()?;

    println!("Configuration: OK");
    println!("Run plan:");
    println!("   Rounds: {}", config.run.rounds);
    println!("   Max attempts per phase: {}", config.run.max_attempts);
    println!("   Cooldown after each phase: {:?}", cooldown);
    println!(
        "   Reference counts from {}: {}",
        config.counts.engine,
        config.run.resource_types.join(", ")
    );
    println!("   Results: {}", config.run.output_dir.display());
    println!("   Query output: {}", config.run.query_output_dir.display());
    if config.run.clear_cache {
        println!("   Cache clearing: enabled");
    }

    for (position, backend) in config.backends.iter().enumerate() {
        println!("\n[{}/{}] {}", position + 1, config.backends.len(), backend.engine);
        for query_type in QueryType::all() {
            let names: Vec<&str> = backend
                .queries
                .iter()
                .filter(|q| q.query_type() == query_type)
                .map(|q| q.name())
                .collect();
            if !names.is_empty() {
                println!("   {}: {}", query_type, names.join(", "));
            }
        }
        if !backend.restart_containers.is_empty() {
            println!("   restarts: {}", backend.restart_containers.join(", "));
        }
        if !backend.reset_command.is_empty() {
            println!("   reset: {}", backend.reset_command.join(" "));
        }
    }

    let queries_per_round: usize = config.backends.iter().map(|b| b.queries.len()).sum();
    println!(
        "\nExpected records: {} ({} rounds x {} queries)",
        config.run.rounds * queries_per_round,
        config.run.rounds,
        queries_per_round
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.cmd {
        Commands::Run(args) => cmd_run(args),
        Commands::Check(args) => cmd_check(args),
    }
}
