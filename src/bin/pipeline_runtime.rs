//! Pipeline Runtime
//!
//! Reads vitals messages from a channel, validates and scores them, maintains
//! per-patient windows, and writes events and aggregates to the analytics sink.
//!
//! Usage:
//!   pipeline_runtime --source jsonl:/data/vitals.jsonl --sink sqlite:/data/vitals.db --follow
//!   vitals_simulator | pipeline_runtime --source stdin --sink vitals.db
//!
//! Tuning variables (WINDOW_SIZE_MS, SINK_BATCH_SIZE, ...) are read from the
//! environment or `.env`.

use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use std::process::ExitCode;
use vitalflow::endpoints::{DeadLetterSpec, SinkSpec, SourceSpec};
use vitalflow::pipeline::{PipelineConfig, PipelineCoordinator};

#[derive(Debug, Parser)]
#[command(name = "pipeline_runtime", about = "Patient vitals validation and enrichment pipeline")]
struct Args {
    /// Channel to read from: stdin, jsonl:<path> or a path
    #[arg(long, env = "VITALFLOW_SOURCE")]
    source: SourceSpec,

    /// Analytics sink: sqlite:<path> or a path
    #[arg(long, env = "VITALFLOW_SINK")]
    sink: SinkSpec,

    /// Dead-letter destination: jsonl:<path> or sqlite:<path>
    /// (default: dead_letters.jsonl next to the sink)
    #[arg(long, env = "VITALFLOW_DEAD_LETTER")]
    dead_letter: Option<DeadLetterSpec>,

    /// Keep tailing the source file instead of stopping at EOF
    #[arg(long)]
    follow: bool,

    /// Skip this many lines (the `last_cursor` of a previous run)
    #[arg(long, default_value_t = 0)]
    start_cursor: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("❌ {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    info!("🚀 vitalflow pipeline runtime v{}", env!("CARGO_PKG_VERSION"));

    let config = PipelineConfig::from_env()?;

    let dead_letter = args
        .dead_letter
        .clone()
        .unwrap_or_else(|| DeadLetterSpec::default_for(&args.sink));
    info!("   ├─ Source: {}", args.source);
    info!("   ├─ Sink: {}", args.sink);
    info!("   └─ Dead letters: {}", dead_letter);

    let source = args.source.open(args.follow, args.start_cursor).await?;
    let sink = args.sink.open(&config)?;
    let dead_letters = dead_letter.open(&config)?;

    let coordinator = PipelineCoordinator::new(config, sink, dead_letters);
    let shutdown = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("🛑 Received Ctrl-C"),
            Err(e) => {
                error!("❌ Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    let report = coordinator.run(source, shutdown).await?;
    info!("👋 Done (last cursor: {})", report.last_cursor);
    Ok(())
}
