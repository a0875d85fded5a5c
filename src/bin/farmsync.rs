use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use farmsync::{Cli, SyncPipeline};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("farmsync=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<()> {
    let controls = cli.build_controls();
    controls.validate().context("invalid sync controls")?;
    let api = cli
        .places_api()
        .context("failed to configure the places directory client")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async move {
        let stop = Arc::new(AtomicBool::new(false));
        let pipeline =
            SyncPipeline::new(controls, Arc::new(api)).with_stop_flag(Arc::clone(&stop));
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing in-flight records");
                stop.store(true, Ordering::SeqCst);
            }
        });

        let report = pipeline.run().await?;
        report.print_summary();
        if let Some(path) = pipeline.controls().report_path() {
            info!(path = %path.display(), "run report written");
        }
        Ok::<(), anyhow::Error>(())
    })
}
