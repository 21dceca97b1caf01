//! Pivotal tuning inversion over a directory of images
//!
//! Usage: cargo run --release --bin pti -- --config /path/to/run.yaml

use anyhow::Result;
use clap::Parser;
use log::info;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Invert images into a style-based generator and tune it around the pivots")]
struct Args {
    /// Path to the run configuration YAML file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured device (cpu, cuda)
    #[arg(long)]
    device: Option<String>,

    /// Override the configured log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = pivotal_tuning::load_config(&args.config)?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;
    pivotal_tuning::logging::init_logger(&config.logging.level);

    info!("Starting run {} with config: {}", config.run_name, args.config.display());
    let report = pivotal_tuning::train_from_config(config)?;

    for image in &report.images {
        match &image.final_loss {
            Some(loss) => info!("{}: {} steps, final loss {:.4}", image.image_id, image.steps, loss.total),
            None => info!("{}: {} steps", image.image_id, image.steps),
        }
    }
    info!("Tuning completed, {} checkpoint(s) written", report.checkpoints.len());
    Ok(())
}
