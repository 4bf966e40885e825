// Timing, protocol tuning and runtime configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::esc::receiver::DEFAULT_RX_CAPACITY;
use crate::esc::protocol::MAX_FRAME_LEN;

// Serial link to the ESC
pub const ESC_PORT: &str = "/dev/ttyUSB0";
pub const ESC_BAUDRATE: u32 = 115_200;

// Scheduler tick (receive + maybe send)
pub const TICK_PERIOD: Duration = Duration::from_millis(5);

// Minimum spacing between two frames sent to the ESC
pub const SEND_INTERVAL: Duration = Duration::from_millis(50);

// No commands are sent for this long after a fault reset
pub const FAULT_COOLDOWN: Duration = Duration::from_secs(5);

// START is held back this long after the post-configuration status query
pub const START_SETTLE_DELAY: Duration = Duration::from_millis(500);

// ESC considered silent after this long without a valid frame
pub const LINK_TIMEOUT: Duration = Duration::from_millis(500);

// Telemetry publish rate
pub const TELEMETRY_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_TELEMETRY: &str = "smartesc/state/telemetry";
pub const TOPIC_HEALTH: &str = "smartesc/state/health";

// Pedal conditioning
pub const SECURITY_OFFSET: u16 = 100;
pub const THROTTLE_DIVISOR: u16 = 4;
pub const BRAKE_DIVISOR: u16 = 3;
pub const CALIBRATION_SAMPLES: u8 = 2;

// Pedal -> torque mapping
pub const THROTTLE_TO_TORQUE_FACTOR: i32 = 8; // 128 for max
pub const BRAKE_TO_TORQUE_FACTOR: i32 = 2;
pub const THROTTLE_MINIMAL_TORQUE: i32 = 1000;

// Current loop gains written at bring-up
pub const TORQUE_KP: u16 = 200; // divided by 1024
pub const TORQUE_KI: u16 = 20; // divided by 16384
pub const FLUX_KP: u16 = 200; // divided by 1024
pub const FLUX_KI: u16 = 200; // divided by 16384
pub const STARTUP_FLUX_REFERENCE: u16 = 300;

// Flux reference is dropped to zero above this measured speed (dynamic flux)
pub const FLUX_DROP_SPEED: i32 = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Runtime-tunable settings. Every field falls back to the constant above
/// when missing from the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub port: String,
    pub baud_rate: u32,

    pub tick_period_ms: u64,
    pub send_interval_ms: u64,
    pub fault_cooldown_ms: u64,
    pub start_settle_ms: u64,
    pub link_timeout_ms: u64,
    pub rx_capacity: usize,

    pub security_offset: u16,
    pub throttle_divisor: u16,
    pub brake_divisor: u16,
    pub calibration_samples: u8,

    pub throttle_factor: i32,
    pub brake_factor: i32,
    pub throttle_minimal_torque: i32,

    pub torque_kp: u16,
    pub torque_ki: u16,
    pub flux_kp: u16,
    pub flux_ki: u16,
    pub startup_flux_reference: u16,

    /// Hex dump of every frame sent and received
    pub trace_frames: bool,
    /// Configure the flux loop and drop the flux reference at speed
    pub dynamic_flux: bool,
    /// Send a triangle torque ramp instead of the pedal torque
    pub ramp_test: bool,

    pub publish_telemetry: bool,
    pub telemetry_topic: String,
    pub health_topic: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: ESC_PORT.to_string(),
            baud_rate: ESC_BAUDRATE,
            tick_period_ms: TICK_PERIOD.as_millis() as u64,
            send_interval_ms: SEND_INTERVAL.as_millis() as u64,
            fault_cooldown_ms: FAULT_COOLDOWN.as_millis() as u64,
            start_settle_ms: START_SETTLE_DELAY.as_millis() as u64,
            link_timeout_ms: LINK_TIMEOUT.as_millis() as u64,
            rx_capacity: DEFAULT_RX_CAPACITY,
            security_offset: SECURITY_OFFSET,
            throttle_divisor: THROTTLE_DIVISOR,
            brake_divisor: BRAKE_DIVISOR,
            calibration_samples: CALIBRATION_SAMPLES,
            throttle_factor: THROTTLE_TO_TORQUE_FACTOR,
            brake_factor: BRAKE_TO_TORQUE_FACTOR,
            throttle_minimal_torque: THROTTLE_MINIMAL_TORQUE,
            torque_kp: TORQUE_KP,
            torque_ki: TORQUE_KI,
            flux_kp: FLUX_KP,
            flux_ki: FLUX_KI,
            startup_flux_reference: STARTUP_FLUX_REFERENCE,
            trace_frames: false,
            dynamic_flux: false,
            ramp_test: false,
            publish_telemetry: true,
            telemetry_topic: TOPIC_TELEMETRY.to_string(),
            health_topic: TOPIC_HEALTH.to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.throttle_divisor == 0 || self.brake_divisor == 0 {
            return Err(ConfigError::Invalid(
                "pedal divisors must be non-zero".to_string(),
            ));
        }
        if self.send_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "send_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.tick_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "tick_period_ms must be non-zero".to_string(),
            ));
        }
        if self.rx_capacity < MAX_FRAME_LEN {
            return Err(ConfigError::Invalid(format!(
                "rx_capacity must hold at least one frame ({} bytes)",
                MAX_FRAME_LEN
            )));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn fault_cooldown(&self) -> Duration {
        Duration::from_millis(self.fault_cooldown_ms)
    }

    pub fn start_settle(&self) -> Duration {
        Duration::from_millis(self.start_settle_ms)
    }

    pub fn link_timeout(&self) -> Duration {
        Duration::from_millis(self.link_timeout_ms)
    }
}
