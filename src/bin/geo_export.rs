use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use farmsync::store::{geo_projection, parse_records, write_json_atomic};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "farmsync-geo",
    about = "Rebuild the geo projection from an existing dataset"
)]
struct GeoCli {
    /// Dataset JSON to project
    #[arg(long, env = "FARMSYNC_DATASET", default_value = "data/farms.uk.json")]
    dataset: PathBuf,

    /// Projection output
    #[arg(long, env = "FARMSYNC_GEO_OUTPUT", default_value = "data/farms.geo.json")]
    geo_output: PathBuf,
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("farmsync=info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let cli = GeoCli::parse();
    let bytes = std::fs::read(&cli.dataset)
        .with_context(|| format!("failed to read dataset {:?}", cli.dataset))?;
    let records = parse_records(&cli.dataset, &bytes)?;
    let points = geo_projection(&records);
    write_json_atomic(&cli.geo_output, &points)
        .with_context(|| format!("failed to write {:?}", cli.geo_output))?;
    println!(
        "wrote {} of {} records to {}",
        points.len(),
        records.len(),
        cli.geo_output.display()
    );
    Ok(())
}
