//! chronicle - CDC materialization runner
//!
//! Loads a pipeline template, reads change events as NDJSON and writes
//! per-event outcomes and/or the materialized target as JSON lines.
//!
//! ```text
//! ┌──────────────┐     ┌────────────────────┐     ┌──────────────┐
//! │ events.ndjson│────▶│ ShardedMaterializer │────▶│ stdout (JSON)│
//! └──────────────┘     └────────────────────┘     └──────────────┘
//!                          ▲
//!                 pipeline.yaml + --param
//! ```
//!
//! # Usage
//!
//! ```bash
//! # Materialize a change stream into history intervals
//! chronicle -c pipelines.yaml --template claims_history --param partial=true \
//!     run --input events.ndjson --output state
//!
//! # Validate and print the resolved pipeline
//! chronicle -c pipelines.yaml --template claims_history validate
//! ```
//!
//! Logs go to stderr so stdout stays machine-readable.

mod runner;
mod template;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use runner::{OutputMode, RunOptions};
use std::path::PathBuf;
use template::TemplateParams;
use tokio::io::{AsyncBufRead, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "chronicle")]
#[command(version, about = "Materialize CDC event streams into append, SCD1 or SCD2 targets")]
struct Cli {
    /// Path to pipeline file (single pipeline or template catalog)
    #[arg(short, long, default_value = "pipeline.yaml")]
    config: PathBuf,

    /// Template to select from a catalog file
    #[arg(short, long)]
    template: Option<String>,

    /// Template parameter as name=value (repeatable)
    #[arg(short, long = "param", value_name = "NAME=VALUE")]
    params: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Materialize events (default)
    Run(RunArgs),
    /// Resolve and validate the pipeline without processing events
    Validate,
}

#[derive(Args)]
struct RunArgs {
    /// NDJSON event file; reads stdin when omitted or "-"
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Number of key-partitioned shards
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Pending events buffered per shard
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,

    /// What to write to stdout
    #[arg(long, value_enum, default_value_t = OutputMode::Outcomes)]
    output: OutputMode,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            input: None,
            shards: 4,
            channel_capacity: 1024,
            output: OutputMode::Outcomes,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let params = TemplateParams::from_args(&cli.params)?;
    let description = template::load_pipeline(&cli.config, cli.template.as_deref(), &params)?;

    match cli.command.unwrap_or_else(|| Commands::Run(RunArgs::default())) {
        Commands::Validate => {
            info!("Pipeline '{}' is valid", description.name);
            print!("{}", serde_yaml::to_string(&description)?);
            Ok(())
        }
        Commands::Run(args) => run(description, args).await,
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

async fn run(description: chronicle::PipelineDescription, args: RunArgs) -> Result<()> {
    let input: Box<dyn AsyncBufRead + Unpin + Send> = match &args.input {
        Some(path) if path.as_os_str() != "-" => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Box::new(BufReader::new(file))
        }
        _ => Box::new(BufReader::new(tokio::io::stdin())),
    };

    let options = RunOptions {
        shards: args.shards,
        channel_capacity: args.channel_capacity,
        output: args.output,
    };
    let name = description.name.clone();
    let mut stdout = tokio::io::stdout();
    let summary = runner::run(description, input, &mut stdout, &options).await?;

    let stats = &summary.stats;
    info!(
        "Pipeline '{}' done: {} lines, {} applied, {} discarded, {} rejected, {} failed ({:.1}% applied)",
        name,
        summary.lines,
        stats.events_applied,
        stats.discarded(),
        stats.rejected(),
        stats.failed(),
        stats.applied_rate() * 100.0
    );
    if summary.skipped > 0 {
        warn!("Skipped {} input lines that were not JSON objects", summary.skipped);
    }
    if stats.failed_invariant > 0 {
        anyhow::bail!(
            "{} event(s) failed on history invariant violations",
            stats.failed_invariant
        );
    }
    if stats.failed_other > 0 {
        anyhow::bail!("{} event(s) failed on engine errors", stats.failed_other);
    }
    Ok(())
}
