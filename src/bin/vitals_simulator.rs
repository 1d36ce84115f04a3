//! Vitals Simulator
//!
//! Emits synthetic patient vitals as JSONL, with a configurable share of
//! malformed records, for feeding `pipeline_runtime`.
//!
//! Usage:
//!   vitals_simulator --count 500 --seed 7 --output /data/vitals.jsonl
//!   vitals_simulator | pipeline_runtime --source stdin --sink vitals.db
//!
//! Environment variables:
//!   PATIENT_COUNT, STREAM_INTERVAL (seconds), ERROR_RATE, ERROR_MODE, MISSING_FIELD_STYLE

use chrono::Utc;
use clap::Parser;
use dotenv::dotenv;
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use vitalflow::simulator::{SimulatorConfig, VitalsSimulator};

#[derive(Debug, Parser)]
#[command(name = "vitals_simulator", about = "Synthetic patient vitals generator")]
struct Args {
    /// Append to this file instead of writing to stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Stop after this many messages (default: run until Ctrl-C)
    #[arg(long)]
    count: Option<u64>,

    /// Seed for a reproducible stream
    #[arg(long)]
    seed: Option<u64>,
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
    let config = SimulatorConfig::from_env()?;
    info!("🩺 Vitals simulator");
    info!("   ├─ Patients: {}", config.patient_count);
    info!("   ├─ Interval: {:?}", config.stream_interval);
    info!("   ├─ Error rate: {} ({})", config.error_rate, config.error_mode);
    info!("   └─ Output: {}", args.output.as_ref().map_or("stdout".to_string(), |p| p.display().to_string()));

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut simulator = VitalsSimulator::new(config, rng);

    let mut out: Box<dyn AsyncWrite + Send + Unpin> = match &args.output {
        Some(path) => Box::new(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let interval = simulator.config().stream_interval;
    let mut sent = 0u64;
    let mut errors = 0u64;
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());

    while args.count.map_or(true, |max| sent < max) {
        let payload = simulator.next_payload(Utc::now());
        if payload["_is_error"] == true {
            errors += 1;
        }

        let mut line = serde_json::to_vec(&payload)?;
        line.push(b'\n');
        out.write_all(&line).await?;
        out.flush().await?;
        sent += 1;
        log::debug!("📤 {}", payload);

        if args.count == Some(sent) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = &mut ctrl_c => {
                info!("🛑 Received Ctrl-C");
                break;
            }
        }
    }

    info!("✅ Sent {} messages ({} with injected errors)", sent, errors);
    Ok(())
}
