// Pedal inputs: analog sampling contract, startup calibration and conditioning
//
// Raw samples are converted to a 0-255 pedal position relative to a resting
// baseline captured once at startup.

mod keyboard;

pub use keyboard::{KeyboardPedals, REST_RAW};

use tracing::info;

use crate::config::{BRAKE_DIVISOR, SECURITY_OFFSET, THROTTLE_DIVISOR};

/// Analog channels read by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Throttle,
    Brake,
}

/// Source of raw analog samples (ADC units)
pub trait AnalogInput {
    fn sample(&mut self, channel: Channel) -> u16;

    /// Called once per runtime tick, whether or not a sample is taken
    fn poll(&mut self) {}

    /// Operator-driven sources may ask the runtime to stop
    fn stop_requested(&self) -> bool {
        false
    }
}

/// Pedals at rest, for running without an operator
#[derive(Debug, Clone, Copy)]
pub struct IdlePedals {
    pub rest: u16,
}

impl IdlePedals {
    pub fn new(rest: u16) -> Self {
        Self { rest }
    }
}

impl AnalogInput for IdlePedals {
    fn sample(&mut self, _channel: Channel) -> u16 {
        self.rest
    }
}

/// Map a raw sample to a pedal position in 0..=255.
///
/// Uses the default security offset; see [`condition_with_offset`].
pub fn condition(raw: u16, baseline: u16, divisor: u16) -> u8 {
    condition_with_offset(raw, baseline, divisor, SECURITY_OFFSET)
}

/// `(raw - baseline - offset) / divisor`, clamped to 0..=255.
/// The offset keeps baseline noise from registering as a pedal press.
pub fn condition_with_offset(raw: u16, baseline: u16, divisor: u16, offset: u16) -> u8 {
    let value = (i32::from(raw) - i32::from(baseline) - i32::from(offset))
        / i32::from(divisor.max(1));
    value.clamp(0, u8::MAX as i32) as u8
}

/// Resting readings captured at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calibration {
    pub throttle: u16,
    pub brake: u16,
}

impl Calibration {
    /// Sample each channel `samples` times and keep the last reading;
    /// the first conversion after power-up is unreliable.
    pub fn capture<A: AnalogInput + ?Sized>(analog: &mut A, samples: u8) -> Self {
        let mut calibration = Calibration::default();
        for _ in 0..samples.max(1) {
            calibration.throttle = analog.sample(Channel::Throttle);
        }
        for _ in 0..samples.max(1) {
            calibration.brake = analog.sample(Channel::Brake);
        }
        calibration
    }
}

/// Conditioned pedal positions for one run cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PedalReading {
    pub throttle: u8,
    pub brake: u8,
    pub throttle_raw: u16,
    pub brake_raw: u16,
}

/// Conditioning parameters shared by both pedals
#[derive(Debug, Clone, Copy)]
pub struct ConditionerSettings {
    pub security_offset: u16,
    pub throttle_divisor: u16,
    pub brake_divisor: u16,
}

impl Default for ConditionerSettings {
    fn default() -> Self {
        Self {
            security_offset: SECURITY_OFFSET,
            throttle_divisor: THROTTLE_DIVISOR,
            brake_divisor: BRAKE_DIVISOR,
        }
    }
}

/// Owns the calibration baselines; read-only after construction
#[derive(Debug, Clone)]
pub struct InputConditioner {
    calibration: Calibration,
    settings: ConditionerSettings,
}

impl InputConditioner {
    pub fn new(calibration: Calibration, settings: ConditionerSettings) -> Self {
        Self {
            calibration,
            settings,
        }
    }

    /// Capture baselines from `analog` and build the conditioner
    pub fn calibrate<A: AnalogInput + ?Sized>(
        analog: &mut A,
        samples: u8,
        settings: ConditionerSettings,
    ) -> Self {
        let calibration = Calibration::capture(analog, samples);
        info!(
            "Calibrated pedals: throttle baseline={}, brake baseline={}",
            calibration.throttle, calibration.brake
        );
        Self::new(calibration, settings)
    }

    pub fn calibration(&self) -> Calibration {
        self.calibration
    }

    /// Sample both channels once and condition them
    pub fn read<A: AnalogInput + ?Sized>(&self, analog: &mut A) -> PedalReading {
        let throttle_raw = analog.sample(Channel::Throttle);
        let brake_raw = analog.sample(Channel::Brake);
        let s = &self.settings;
        PedalReading {
            throttle: condition_with_offset(
                throttle_raw,
                self.calibration.throttle,
                s.throttle_divisor,
                s.security_offset,
            ),
            brake: condition_with_offset(
                brake_raw,
                self.calibration.brake,
                s.brake_divisor,
                s.security_offset,
            ),
            throttle_raw,
            brake_raw,
        }
    }
}
