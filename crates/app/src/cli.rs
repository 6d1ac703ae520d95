use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use parking::{OccupancyStore, ParkingCliArgs, ParkingConfig, pipeline::telemetry};

use crate::supervisor;

#[derive(Debug, Parser)]
#[command(name = "parking-monitor", version, about = "Parking lot occupancy monitor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the occupancy pipeline against a camera, stream or video file.
    Run(ParkingCliArgs),
    /// Apply a JSON update batch to an empty lot and print the resulting status.
    Apply {
        /// File holding `{"<spot>": "occupied" | {"status": .., "plate": ..}}`.
        #[arg(value_name = "BATCH_JSON")]
        batch: PathBuf,
        /// Number of spots in the lot.
        #[arg(long = "spots", default_value_t = 12)]
        spots: u32,
    },
}

pub fn handle_commands<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    match cli.command {
        Command::Run(args) => {
            let config = ParkingConfig::try_from(args)?;
            let _telemetry = telemetry::init_tracing(&config.telemetry, config.verbose)?;
            telemetry::init_metrics(&config.telemetry)?;
            supervisor::run(config)
        }
        Command::Apply { batch, spots } => apply_batch(&batch, spots),
    }
}

fn apply_batch(path: &Path, spots: u32) -> Result<()> {
    if spots == 0 {
        bail!("--spots must be at least 1");
    }
    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let store = OccupancyStore::new(spots);
    let summary = store.update_json(&body)?;
    if !summary.ignored.is_empty() {
        eprintln!("Ignored unknown spots: {:?}", summary.ignored);
    }
    println!("{}", store.snapshot().to_json()?);
    Ok(())
}
