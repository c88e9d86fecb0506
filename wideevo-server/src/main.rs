mod codec;
mod config;
mod error;
mod geometry;
mod http;
mod jpeg;
mod metadata;
mod naming;
mod pipeline;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt};

use crate::codec::ImageJpegEncoder;
use crate::metadata::CameraIdentity;
use crate::pipeline::{Batch, PhotoPipeline, process_batch};

#[derive(Parser)]
#[command(
    name = "wideevo-server",
    version,
    about = "Normalize photos into 2560x1920 JPEGs with a fixed EXIF block"
)]
struct Cli {
    /// Config file (created with defaults if missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API (default)
    Serve {
        /// Listen address, overrides server.bind_address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Normalize files into an output directory
    Process {
        /// Image files or glob patterns
        #[arg(required = true)]
        images: Vec<String>,
        /// Output directory, defaults to batch.output_dir
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        prefix: Option<String>,
        /// First counter value, defaults to the first unused one in the output directory
        #[arg(long)]
        start: Option<u32>,
        /// Concurrent photos; 1 runs strictly one after another
        #[arg(short, long)]
        workers: Option<usize>,
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    // Load config first so we can honor logging.filter directive.
    let shared = config::ConfigManager::load(cli.config.clone()).await?;
    let cfg_snapshot = config::ConfigManager::to_struct(&shared).await?;
    let verbose = matches!(cli.command, Some(Command::Process { verbose: true, .. }));
    let filter_directive = if verbose {
        "debug".to_string()
    } else {
        cfg_snapshot
            .logging
            .as_ref()
            .and_then(|l| l.filter.clone())
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| "info,wideevo_server=debug".to_string())
    };
    fmt()
        .with_env_filter(EnvFilter::new(filter_directive))
        .init();

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            let bind = bind.or_else(|| cfg_snapshot.server.and_then(|s| s.bind_address));
            let state = http::AppState {
                cfg: shared,
                batches: Arc::new(store::BatchStore::new()),
            };
            let app = http::router(state);
            http::serve(app, bind).await?;
        }
        Command::Process {
            images,
            output,
            prefix,
            start,
            workers,
            verbose: _,
        } => {
            let config_path = config::ConfigManager::path(&shared).await;
            let settings = &cfg_snapshot.batch;
            let prefix = prefix.unwrap_or_else(|| settings.prefix().to_string());
            config::validate_prefix(&prefix)?;
            let out_dir = output.unwrap_or_else(|| {
                config::resolve_relative(&config_path, &settings.output_dir())
            });

            let inputs = store::collect_inputs(&images).await?;
            if inputs.is_empty() {
                bail!("no readable images among {} argument(s)", images.len());
            }
            let start = start.unwrap_or_else(|| {
                naming::first_free_index(&out_dir, &prefix, settings.start_index(), inputs.len())
            });
            let encoder = ImageJpegEncoder::new(settings.quality());
            let quality = encoder.quality();
            let pipeline = PhotoPipeline::new(
                &CameraIdentity::from(&cfg_snapshot.camera),
                Arc::new(encoder),
            );
            let workers = workers.unwrap_or_else(|| settings.workers());
            let total = inputs.len();
            tracing::info!(total, workers, start, quality, prefix = %prefix, "processing");

            let outcome = if workers <= 1 {
                let prefix = prefix.clone();
                tokio::task::spawn_blocking(move || {
                    process_batch(&pipeline, inputs, Some(&prefix), Some(start))
                })
                .await
                .context("batch worker panicked")?
            } else {
                let mut batch = Batch::new(inputs, Some(&prefix), Some(start));
                let cancel = batch.cancel_flag();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received, finishing started photos");
                        cancel.cancel();
                    }
                });
                batch.process_concurrent(Arc::new(pipeline), workers).await;
                batch.into_outcome()
            };

            for photo in &outcome.done {
                println!("{} -> {}", photo.original_name, photo.filename);
            }
            for (name, reason) in &outcome.errors {
                println!("{name} failed: {reason}");
            }
            let skipped = total - outcome.done.len() - outcome.errors.len();
            if skipped > 0 {
                println!("{skipped} not started");
            }
            let written = store::save_outputs(&out_dir, &outcome.done).await?;
            let next = start.saturating_add(outcome.done.len() as u32);
            println!(
                "{} written to {}, {} failed, next index {}",
                written.len(),
                out_dir.display(),
                outcome.errors.len(),
                next
            );
        }
    }
    Ok(())
}
