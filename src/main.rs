//! CLI entry point.
//!
//! Headless operation: load the settings file, bring the run up, log the
//! signals a front-end would display, and shut down cleanly on a timer or
//! on operator interrupt (the configured duration).
//!
//! ```bash
//! labdaq --settings config/settings.toml --auto-start --duration 60
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use labdaq::signals::Signal;
use labdaq::{App, ProgramConfig};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "labdaq")]
#[command(about = "Laboratory data acquisition supervisor", long_about = None)]
struct Cli {
    /// Path to the settings file
    #[arg(long, default_value = "config/settings.toml")]
    settings: PathBuf,

    /// Start the run immediately
    #[arg(long)]
    auto_start: bool,

    /// Also start the configured sequence after the run comes up
    #[arg(long)]
    run_sequence: bool,

    /// Stop after this many seconds; runs until killed when omitted
    #[arg(long)]
    duration: Option<f64>,
}

fn log_signal(signal: &Signal) {
    match signal {
        Signal::Warning { device, text } => match device {
            Some(d) => warn!(device = %d, "{text}"),
            None => warn!("{text}"),
        },
        Signal::HdfStatus { text, state } => {
            info!(state = state.as_str(), "storage: {text}")
        }
        Signal::SequencerProgress {
            step,
            total,
            remaining_secs,
        } => info!(
            "sequence {step}/{total}, {} remaining",
            labdaq::sequencer::eta_text(*remaining_secs)
        ),
        Signal::SequencerFinished => info!("sequence finished"),
        Signal::DeviceError { device, message } => warn!(device = %device, "{message}"),
        // per-sample chatter stays at the bus level
        _ => {}
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ProgramConfig::load(&cli.settings)
        .with_context(|| format!("loading {}", cli.settings.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.debug_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut app = App::new(config);
    let loaded = app.load_devices()?;
    info!(devices = loaded, "ready");

    if !cli.auto_start {
        info!("nothing to do without --auto-start");
        return Ok(());
    }

    app.start_control()?;
    if cli.run_sequence {
        app.start_sequencer(1, false)?;
    }

    let started = Instant::now();
    loop {
        for signal in app.bus.drain() {
            log_signal(&signal);
        }
        if let Some(limit) = cli.duration {
            if started.elapsed() >= Duration::from_secs_f64(limit.max(0.0)) {
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(200));
    }

    app.stop_control();
    Ok(())
}
