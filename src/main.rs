//! CLI entry point for spectral-daq.
//!
//! Provides the command-line interface for:
//! - Running an acquisition against the simulated digitizer
//! - Validating and printing the resolved configuration
//!
//! The async runtime hosts only the control plane (instruction delivery,
//! run-status watching, Ctrl-C); the data pipeline itself runs on dedicated
//! threads managed by [`spectral_daq::pipeline::Pipeline`].
//!
//! # Usage
//!
//! Run an acquisition with the default or a specific config file:
//! ```bash
//! spectral-daq run
//! spectral-daq run --config lab.toml
//! ```
//!
//! Check a configuration without touching any hardware:
//! ```bash
//! spectral-daq check-config --config lab.toml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use spectral_daq::config::Config;
use spectral_daq::data::{FrequencyRecord, PowerRecord, RealTimeRecord};
use spectral_daq::digitizer::acquisition::{RunControl, RunStatus};
use spectral_daq::digitizer::mock::SimulatedDigitizer;
use spectral_daq::digitizer::AcquisitionManager;
use spectral_daq::dsp::{FrequencyTransform, PowerAverager, TransformSource};
use spectral_daq::pipeline::{Instruction, Pipeline};
use spectral_daq::sink::DeadEnd;
use spectral_daq::stream::stream_channel;
use spectral_daq::trace;

#[derive(Parser)]
#[command(name = "spectral-daq")]
#[command(about = "Streaming spectral data acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one acquisition against the simulated digitizer
    Run {
        /// Configuration file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a configuration and print the resolved values
    CheckConfig {
        /// Configuration file path
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run_acquisition(config).await,
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    println!("✅ configuration is valid");
    println!();
    print!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

async fn run_acquisition(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;
    trace::init(&config.application)?;
    println!("🚀 spectral-daq: streaming spectral acquisition");

    // Inter-stage channels. Records allocate on first use and are recycled
    // for the life of the run.
    let (time_tx, time_rx) = stream_channel(config.digitizer.stream_slots, RealTimeRecord::default);
    let (freq_tx, freq_rx) =
        stream_channel(config.transform.stream_slots, FrequencyRecord::default);
    let (power_tx, power_rx) = stream_channel(config.averager.stream_slots, PowerRecord::default);

    // A test tone an eighth of the way up the band, visible in the averaged
    // spectra, plus a little noise so the output is not sterile.
    let driver = SimulatedDigitizer::new()
        .with_tone(config.digitizer.effective_sample_rate() / 8.0, 0.25)
        .with_noise(0.01);

    let (run_control, mut run_rx) = RunControl::new();
    let acquisition = AcquisitionManager::new(
        config.digitizer.clone(),
        driver,
        time_tx,
        run_control,
    );
    let transform = FrequencyTransform::new(
        config.transform.clone(),
        config.digitizer.effective_sample_rate(),
        TransformSource::Real(time_rx),
        freq_tx,
    );
    let averager = PowerAverager::new(config.averager.clone(), freq_rx, power_tx);
    let (sink, counters) = DeadEnd::new(power_rx);

    let mut pipeline = Pipeline::new();
    let acquisition_mailbox = pipeline.add_stage(Box::new(acquisition));
    pipeline.add_stage(Box::new(transform));
    pipeline.add_stage(Box::new(averager));
    pipeline.add_stage(Box::new(sink));
    let cancel = pipeline.cancel_token();

    let runner = tokio::task::spawn_blocking(move || pipeline.run());

    acquisition_mailbox.send(Instruction::Resume).await?;
    info!(
        duration_sec = config.digitizer.acquisition_length_sec,
        buffers = config.digitizer.buffers_per_acquisition(),
        "acquisition started"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted; canceling pipeline");
        }
        status = run_rx.wait_for(|status| *status == RunStatus::Complete) => {
            status?;
            info!("acquisition complete; flushing pipeline");
            // Let the stop signal propagate through the chain before
            // tearing the stages down.
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    cancel.cancel();
    runner.await??;

    println!(
        "✅ run finished: {} averaged spectra across {} session(s)",
        counters.records(),
        counters.sessions()
    );
    Ok(())
}
