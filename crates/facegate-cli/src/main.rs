mod batch;
mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::{spawn_workers, Capabilities, ImageSource, VerificationEngine};
use serde::Serialize;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face verification CLI")]
struct Cli {
    /// TOML configuration file; FACEGATE_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a probe image against one or more reference images
    Verify {
        /// Reference image; repeat for several images of the same person
        #[arg(short, long = "reference", required = true)]
        references: Vec<PathBuf>,
        /// Image to verify
        probe: PathBuf,
        /// Decision threshold in [0, 1] (default from config)
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Run every verification in a JSON manifest through the worker pool
    Batch {
        /// JSON array of {"reference" | "references", "probe", "threshold"?, "id"?}
        manifest: PathBuf,
    },
    /// Show which methods loaded
    Status,
}

#[derive(Serialize)]
struct StatusReport<'a> {
    model_dir: &'a std::path::Path,
    threshold: f32,
    workers: usize,
    capabilities: &'a facegate_core::CapabilityReport,
}

fn build_engine(config: &Config) -> VerificationEngine {
    let capabilities = Capabilities::load(&config.model_paths(), &config.toggles());
    VerificationEngine::new(capabilities, config.engine_options())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::info!(model_dir = %config.model_dir.display(), threshold = config.threshold, "configuration loaded");

    match cli.command {
        Commands::Verify { references, probe, threshold } => {
            let threshold = threshold.unwrap_or(config.threshold);
            let engine = build_engine(&config);
            let result = tokio::task::spawn_blocking(move || {
                let probe = ImageSource::Path(probe);
                let references: Vec<ImageSource> = references.into_iter().map(ImageSource::Path).collect();
                match references.as_slice() {
                    [reference] => engine.verify(reference, &probe, threshold),
                    _ => engine.verify_enrolled(&references, &probe, threshold),
                }
            })
            .await
            .context("verification task failed")?;

            print_json(&result)?;
            if !result.security_passed {
                std::process::exit(1);
            }
        }
        Commands::Batch { manifest } => {
            let entries = batch::load_manifest(&manifest)?;
            let engine = Arc::new(build_engine(&config));
            let handle = spawn_workers(engine, config.workers.max(1))?;
            tracing::info!(entries = entries.len(), workers = handle.workers(), "running batch");
            let outcomes = batch::run(&handle, entries).await?;
            print_json(&outcomes)?;
        }
        Commands::Status => {
            let engine = build_engine(&config);
            print_json(&StatusReport {
                model_dir: &config.model_dir,
                threshold: config.threshold,
                workers: config.workers,
                capabilities: engine.capabilities(),
            })?;
        }
    }

    Ok(())
}
