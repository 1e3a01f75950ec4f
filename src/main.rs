// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fwi_gradient::config::RunConfig;
use fwi_gradient::engine::WorkerRole;
use fwi_gradient::io;
use fwi_gradient::orchestrator::{ProgressInfo, ShotLoop};
use fwi_gradient::AcousticEngine;

#[derive(Parser)]
#[command(
    name = "fwi-gradient",
    version,
    about = "Adjoint-state FWI gradient over every shot of an acquisition"
)]
struct Cli {
    /// Run file (TOML)
    #[arg(short = 'c', long)]
    config: PathBuf,

    /// Output file path (.npy or .mat); overrides run.output
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Number of Rayon worker threads for the gradient stack
    #[arg(long)]
    threads: Option<usize>,

    /// Rank of this worker (rank 0 writes all files)
    #[arg(long, default_value = "0")]
    rank: usize,

    /// Number of cooperating workers
    #[arg(long, default_value = "1")]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print time-stepping progress to stderr (see --progress-interval)
    #[arg(long)]
    progress: bool,

    /// Progress reporting interval in milliseconds (used with --progress)
    #[arg(long, default_value = "500")]
    progress_interval: u64,

    /// Validate the run file and exit
    #[arg(long)]
    check: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => bail!("unknown --log-level '{}'", other),
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = RunConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let output = cli.output.clone().unwrap_or_else(|| config.run.output.clone());
    io::infer_format(&output).with_context(|| format!("output {}", output.display()))?;

    let role = WorkerRole::new(cli.rank, cli.workers)?;
    let engine_config = Arc::new(config.engine_config()?);
    let mut acquisition = config.build_acquisition(engine_config)?;
    if cli.check {
        info!("{} is valid: {} shot(s)", cli.config.display(), acquisition.len());
        return Ok(());
    }

    let mut shot_loop = ShotLoop::<AcousticEngine>::new(role, config.run_params())?
        .with_accumulator(config.accumulator(cli.threads));

    if cli.progress && role.is_coordinator() {
        let interval_ms = cli.progress_interval;
        let last_print = AtomicU64::new(0);
        let start = Instant::now();
        shot_loop = shot_loop.with_progress(Box::new(move |p: ProgressInfo<'_>| {
            let now_ms = start.elapsed().as_millis() as u64;
            let prev = last_print.load(Ordering::Relaxed);
            if now_ms >= prev + interval_ms {
                last_print.store(now_ms, Ordering::Relaxed);
                eprintln!(
                    "[{:.1}s] shot={} {} step={} time={:.3}s",
                    p.elapsed.as_secs_f64(),
                    p.shot_id,
                    p.direction,
                    p.step,
                    p.time,
                );
            }
        }));
    }

    let summary = shot_loop.run(&mut acquisition)?;

    if let Some(gradient) = summary.gradient {
        io::save_array(gradient.values.view().into_dyn(), &output, "gradient")
            .with_context(|| format!("writing {}", output.display()))?;
        info!(
            "gradient of {} shot(s) written to {}",
            gradient.shots.len(),
            output.display()
        );
    }

    Ok(())
}
