use clap::{Parser, ValueEnum};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing_subscriber::EnvFilter;

use smartesc_runtime::config::{ConfigError, RuntimeConfig};
use smartesc_runtime::input::{IdlePedals, KeyboardPedals, REST_RAW};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PedalSource {
    /// W/S keys act as throttle/brake
    Keyboard,
    /// Pedals stay released
    Idle,
}

/// Serial front-end for a SmartESC motor controller
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// JSON config file; flags below override it
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Serial port connected to the ESC
    #[arg(short, long)]
    port: Option<String>,

    #[arg(short, long)]
    baud: Option<u32>,

    #[arg(long, value_enum, default_value_t = PedalSource::Keyboard)]
    pedals: PedalSource,

    /// Configure the flux loop and drop the flux reference at speed
    #[arg(long)]
    dynamic_flux: bool,

    /// Send a triangle torque ramp instead of the pedal torque
    #[arg(long)]
    ramp_test: bool,

    /// Log every frame as hex
    #[arg(long)]
    trace_frames: bool,

    /// Do not publish telemetry over zenoh
    #[arg(long)]
    no_publish: bool,
}

impl Cli {
    fn into_config(self) -> Result<(RuntimeConfig, PedalSource), ConfigError> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        config.dynamic_flux |= self.dynamic_flux;
        config.ramp_test |= self.ramp_test;
        config.trace_frames |= self.trace_frames;
        if self.no_publish {
            config.publish_telemetry = false;
        }
        config.validate()?;
        Ok((config, self.pedals))
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init(); // installs the subscriber globally

    let (config, pedals) = match Cli::parse().into_config() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };

    let result = match pedals {
        PedalSource::Keyboard => {
            if let Err(e) = enable_raw_mode() {
                eprintln!("Failed to enable raw terminal mode: {}", e);
                std::process::exit(1);
            }
            let result = smartesc_runtime::runtime::run(config, KeyboardPedals::new()).await;
            let _ = disable_raw_mode();
            result
        }
        PedalSource::Idle => smartesc_runtime::runtime::run(config, IdlePedals::new(REST_RAW)).await,
    };

    if let Err(e) = result {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}
