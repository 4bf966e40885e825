// ESC command sequencing
//
// Linear bring-up (status, stop, fault-ack + gains, start) followed by a run cycle
// alternating torque commands with status and speed polling. At most one frame
// leaves per send interval; extra frames of a state are queued behind it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::protocol::{
    encode_command, encode_register_get, encode_register_set, Command, EscState, Frame,
    ParsedFrame, Register, RegisterValue,
};
use crate::config::{
    RuntimeConfig, BRAKE_TO_TORQUE_FACTOR, FAULT_COOLDOWN, FLUX_DROP_SPEED, FLUX_KI, FLUX_KP,
    SEND_INTERVAL, START_SETTLE_DELAY, STARTUP_FLUX_REFERENCE, THROTTLE_MINIMAL_TORQUE,
    THROTTLE_TO_TORQUE_FACTOR, TORQUE_KI, TORQUE_KP,
};
use crate::input::PedalReading;

/// Torque control mode value for the CONTROL_MODE register
const CONTROL_MODE_TORQUE: u16 = 0;

/// Period of the ramp test waveform, in run cycles
const RAMP_PERIOD: u32 = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequencerState {
    QueryStatusInit,
    Stop,
    QueryStatusPostStop,
    Configure,
    QueryStatusPostConfig,
    Start,
    QueryStatusPostStart,
    Idle,
    ComputeTorque,
    QueryStatusRun,
    QuerySpeed,
}

impl SequencerState {
    pub const INITIAL: SequencerState = SequencerState::QueryStatusInit;

    pub fn next(self) -> Self {
        use SequencerState::*;
        match self {
            QueryStatusInit => Stop,
            Stop => QueryStatusPostStop,
            QueryStatusPostStop => Configure,
            Configure => QueryStatusPostConfig,
            QueryStatusPostConfig => Start,
            Start => QueryStatusPostStart,
            QueryStatusPostStart => Idle,
            Idle => ComputeTorque,
            ComputeTorque => QueryStatusRun,
            QueryStatusRun => QuerySpeed,
            QuerySpeed => ComputeTorque,
        }
    }

    /// Torque compute -> status query -> speed query
    pub fn is_run_cycle(self) -> bool {
        matches!(
            self,
            SequencerState::ComputeTorque | SequencerState::QueryStatusRun | SequencerState::QuerySpeed
        )
    }
}

/// Pedal -> torque scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TorqueMapping {
    pub throttle_factor: i32,
    pub brake_factor: i32,
    pub throttle_minimal_torque: i32,
}

impl Default for TorqueMapping {
    fn default() -> Self {
        Self {
            throttle_factor: THROTTLE_TO_TORQUE_FACTOR,
            brake_factor: BRAKE_TO_TORQUE_FACTOR,
            throttle_minimal_torque: THROTTLE_MINIMAL_TORQUE,
        }
    }
}

/// Torque command for the current pedals and last known speed.
///
/// Braking wins over throttle, and only while moving forward. Any throttle
/// starts at the minimal breakaway torque.
pub fn compute_torque(throttle: u8, brake: u8, speed: i32, mapping: &TorqueMapping) -> i16 {
    let torque = if brake > 0 && speed > 0 {
        (-i32::from(brake)).saturating_mul(mapping.brake_factor)
    } else if throttle > 0 {
        mapping
            .throttle_minimal_torque
            .saturating_add(i32::from(throttle).saturating_mul(mapping.throttle_factor))
    } else {
        0
    };
    torque.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Triangle wave 0 -> 200 -> 0 over RAMP_PERIOD cycles
pub fn ramp_torque(cycle: u32) -> i16 {
    let r = cycle % RAMP_PERIOD;
    let half = RAMP_PERIOD / 2;
    if r < half { r as i16 } else { (RAMP_PERIOD - r) as i16 }
}

/// Current loop gains written during bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopGains {
    pub torque_kp: u16,
    pub torque_ki: u16,
    pub flux_kp: u16,
    pub flux_ki: u16,
    pub startup_flux_reference: u16,
}

impl Default for LoopGains {
    fn default() -> Self {
        Self {
            torque_kp: TORQUE_KP,
            torque_ki: TORQUE_KI,
            flux_kp: FLUX_KP,
            flux_ki: FLUX_KI,
            startup_flux_reference: STARTUP_FLUX_REFERENCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    pub send_interval: Duration,
    pub fault_cooldown: Duration,
    pub start_settle: Duration,
    pub mapping: TorqueMapping,
    pub gains: LoopGains,
    pub dynamic_flux: bool,
    pub ramp_test: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            send_interval: SEND_INTERVAL,
            fault_cooldown: FAULT_COOLDOWN,
            start_settle: START_SETTLE_DELAY,
            mapping: TorqueMapping::default(),
            gains: LoopGains::default(),
            dynamic_flux: false,
            ramp_test: false,
        }
    }
}

impl From<&RuntimeConfig> for SequencerConfig {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            send_interval: config.send_interval(),
            fault_cooldown: config.fault_cooldown(),
            start_settle: config.start_settle(),
            mapping: TorqueMapping {
                throttle_factor: config.throttle_factor,
                brake_factor: config.brake_factor,
                throttle_minimal_torque: config.throttle_minimal_torque,
            },
            gains: LoopGains {
                torque_kp: config.torque_kp,
                torque_ki: config.torque_ki,
                flux_kp: config.flux_kp,
                flux_ki: config.flux_ki,
                startup_flux_reference: config.startup_flux_reference,
            },
            dynamic_flux: config.dynamic_flux,
            ramp_test: config.ramp_test,
        }
    }
}

/// The ESC reported a fault while the motor was running
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("ESC signalled fault state {status:?}")]
pub struct FaultSignaled {
    pub status: EscState,
}

pub struct Sequencer {
    config: SequencerConfig,
    state: SequencerState,
    next_send_at: Option<Instant>,
    cooldown_until: Option<Instant>,
    queued: VecDeque<Frame>,
    last_speed: i32,
    last_torque: i16,
    last_status: Option<u8>,
    last_pedals: PedalReading,
    cycles: u32,
}

impl Sequencer {
    pub fn new(config: SequencerConfig) -> Self {
        Self {
            config,
            state: SequencerState::INITIAL,
            next_send_at: None,
            cooldown_until: None,
            queued: VecDeque::new(),
            last_speed: 0,
            last_torque: 0,
            last_status: None,
            last_pedals: PedalReading::default(),
            cycles: 0,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn last_speed(&self) -> i32 {
        self.last_speed
    }

    pub fn last_torque(&self) -> i16 {
        self.last_torque
    }

    /// Last raw status register value
    pub fn last_status(&self) -> Option<u8> {
        self.last_status
    }

    pub fn last_pedals(&self) -> PedalReading {
        self.last_pedals
    }

    /// Completed torque commands since the last reset
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Feed one decoded frame from the ESC.
    ///
    /// A fault state carried by an error frame during the run cycle resets the
    /// sequencer and starts the cooldown; the fault is returned for reporting.
    pub fn on_frame(&mut self, frame: &ParsedFrame, now: Instant) -> Result<(), FaultSignaled> {
        match *frame {
            ParsedFrame::ByteValue { value, .. } => self.last_status = Some(value),
            ParsedFrame::Int32Value { ok: true, value } => self.last_speed = value,
            _ => {}
        }

        if let Some(status) = frame.fault_state() {
            if self.state.is_run_cycle() {
                self.reset(now);
                return Err(FaultSignaled { status });
            }
            debug!("Fault state {:?} reported outside run cycle", status);
        }
        Ok(())
    }

    /// Back to the initial state with a send blackout of `fault_cooldown`
    pub fn reset(&mut self, now: Instant) {
        warn!(
            "Resetting sequencer from {:?}, cooldown {}ms",
            self.state,
            self.config.fault_cooldown.as_millis()
        );
        self.state = SequencerState::INITIAL;
        self.queued.clear();
        self.next_send_at = None;
        self.cooldown_until = Some(now + self.config.fault_cooldown);
        self.last_speed = 0;
        self.last_torque = 0;
        self.cycles = 0;
    }

    /// Run at most one step. Returns the frame to transmit, if any.
    ///
    /// `read_pedals` is only called when a torque command is computed.
    pub fn poll(
        &mut self,
        now: Instant,
        read_pedals: impl FnOnce() -> PedalReading,
    ) -> Option<Frame> {
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
            info!("Fault cooldown over, restarting bring-up");
            self.cooldown_until = None;
        }
        if self.next_send_at.is_some_and(|at| now < at) {
            return None;
        }

        if let Some(frame) = self.queued.pop_front() {
            self.next_send_at = Some(now + self.config.send_interval);
            return Some(frame);
        }

        let state = self.state;
        let frame = self.execute(state, read_pedals);
        self.state = state.next();
        debug!("Sequencer: {:?} -> {:?}", state, self.state);

        let hold = if state == SequencerState::QueryStatusPostConfig {
            self.config.send_interval.max(self.config.start_settle)
        } else {
            self.config.send_interval
        };
        self.next_send_at = Some(now + hold);
        frame
    }

    fn execute(
        &mut self,
        state: SequencerState,
        read_pedals: impl FnOnce() -> PedalReading,
    ) -> Option<Frame> {
        use SequencerState::*;
        match state {
            QueryStatusInit | QueryStatusPostStop | QueryStatusPostConfig | QueryStatusPostStart => {
                Some(encode_register_get(Register::Status))
            }
            Stop => Some(encode_command(Command::Stop)),
            Configure => {
                self.queue_configuration();
                Some(encode_command(Command::FaultAck))
            }
            Start => {
                info!("Starting motor");
                Some(encode_command(Command::Start))
            }
            Idle => None,
            ComputeTorque => {
                let pedals = read_pedals();
                let torque = if self.config.ramp_test {
                    ramp_torque(self.cycles)
                } else {
                    compute_torque(
                        pedals.throttle,
                        pedals.brake,
                        self.last_speed,
                        &self.config.mapping,
                    )
                };
                self.cycles = self.cycles.wrapping_add(1);
                self.last_pedals = pedals;
                self.last_torque = torque;
                Some(encode_register_set(
                    Register::Torque,
                    RegisterValue::I16(torque),
                ))
            }
            QueryStatusRun => {
                if self.config.dynamic_flux && self.last_speed > FLUX_DROP_SPEED {
                    self.queued.push_back(encode_register_set(
                        Register::FluxRef,
                        RegisterValue::U16(0),
                    ));
                }
                Some(encode_register_get(Register::Status))
            }
            QuerySpeed => Some(encode_register_get(Register::SpeedMeasured)),
        }
    }

    fn queue_configuration(&mut self) {
        let gains = self.config.gains;
        let mut writes = vec![
            (Register::ControlMode, CONTROL_MODE_TORQUE),
            (Register::TorqueKi, gains.torque_ki),
            (Register::TorqueKp, gains.torque_kp),
        ];
        if self.config.dynamic_flux {
            writes.extend([
                (Register::FluxKi, gains.flux_ki),
                (Register::FluxKp, gains.flux_kp),
                (Register::FluxRef, gains.startup_flux_reference),
            ]);
        }
        for (register, value) in writes {
            self.queued
                .push_back(encode_register_set(register, RegisterValue::U16(value)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(5);

    fn pedals(throttle: u8, brake: u8) -> PedalReading {
        PedalReading {
            throttle,
            brake,
            ..PedalReading::default()
        }
    }

    /// Tick until the next frame leaves; returns it with its send time
    fn next_frame(seq: &mut Sequencer, now: &mut Instant, reading: PedalReading) -> (Frame, Instant) {
        for _ in 0..10_000 {
            *now += TICK;
            if let Some(frame) = seq.poll(*now, || reading) {
                return (frame, *now);
            }
        }
        panic!("sequencer stalled in {:?}", seq.state());
    }

    fn run_until(seq: &mut Sequencer, now: &mut Instant, state: SequencerState) {
        for _ in 0..10_000 {
            if seq.state() == state {
                return;
            }
            *now += TICK;
            seq.poll(*now, PedalReading::default);
        }
        panic!("never reached {:?}", state);
    }

    #[test]
    fn test_transition_order() {
        use SequencerState::*;
        let mut state = SequencerState::INITIAL;
        let mut seen = vec![state];
        for _ in 0..10 {
            state = state.next();
            seen.push(state);
        }
        assert_eq!(
            seen,
            vec![
                QueryStatusInit,
                Stop,
                QueryStatusPostStop,
                Configure,
                QueryStatusPostConfig,
                Start,
                QueryStatusPostStart,
                Idle,
                ComputeTorque,
                QueryStatusRun,
                QuerySpeed,
            ]
        );
        assert_eq!(QuerySpeed.next(), ComputeTorque);
        assert!(!Idle.is_run_cycle());
        assert!(QuerySpeed.is_run_cycle());
    }

    #[test]
    fn test_compute_torque() {
        let m = TorqueMapping::default();
        assert_eq!(compute_torque(50, 0, 10, &m), 1400);
        assert_eq!(compute_torque(0, 50, 10, &m), -100);
        assert_eq!(compute_torque(0, 0, 10, &m), 0);
        assert_eq!(compute_torque(0, 0, -10, &m), 0);
        // brake wins over throttle while moving forward
        assert_eq!(compute_torque(50, 50, 10, &m), -100);
        // no regenerative brake when stopped or reversing
        assert_eq!(compute_torque(0, 50, 0, &m), 0);
        assert_eq!(compute_torque(50, 50, -5, &m), 1400);
        assert_eq!(compute_torque(255, 0, 0, &m), 1000 + 255 * 8);
    }

    #[test]
    fn test_compute_torque_saturates_with_extreme_factors() {
        let m = TorqueMapping {
            throttle_factor: i32::MAX,
            brake_factor: i32::MAX,
            throttle_minimal_torque: i32::MAX,
        };
        assert_eq!(compute_torque(255, 0, 0, &m), i16::MAX);
        assert_eq!(compute_torque(0, 255, 10, &m), i16::MIN);

        let m = TorqueMapping {
            throttle_factor: i32::MIN,
            brake_factor: i32::MIN,
            throttle_minimal_torque: i32::MIN,
        };
        assert_eq!(compute_torque(255, 0, 0, &m), i16::MIN);
        assert_eq!(compute_torque(0, 255, 10, &m), i16::MAX);
    }

    #[test]
    fn test_ramp_torque() {
        assert_eq!(ramp_torque(0), 0);
        assert_eq!(ramp_torque(150), 150);
        assert_eq!(ramp_torque(200), 200);
        assert_eq!(ramp_torque(250), 150);
        assert_eq!(ramp_torque(399), 1);
        assert_eq!(ramp_torque(400), 0);
    }

    #[test]
    fn test_bring_up_sequence() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        let status = encode_register_get(Register::Status);

        let expected = vec![
            status.clone(),
            encode_command(Command::Stop),
            status.clone(),
            encode_command(Command::FaultAck),
            encode_register_set(Register::ControlMode, RegisterValue::U16(0)),
            encode_register_set(Register::TorqueKi, RegisterValue::U16(TORQUE_KI)),
            encode_register_set(Register::TorqueKp, RegisterValue::U16(TORQUE_KP)),
            status.clone(),
            encode_command(Command::Start),
            status.clone(),
            encode_register_set(Register::Torque, RegisterValue::I16(0)),
            status,
            encode_register_get(Register::SpeedMeasured),
            encode_register_set(Register::Torque, RegisterValue::I16(0)),
        ];
        let sent: Vec<Frame> = (0..expected.len())
            .map(|_| next_frame(&mut seq, &mut now, pedals(0, 0)).0)
            .collect();
        assert_eq!(sent, expected);
    }

    #[test]
    fn test_dynamic_flux_configuration() {
        let config = SequencerConfig {
            dynamic_flux: true,
            ..SequencerConfig::default()
        };
        let mut seq = Sequencer::new(config);
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::QueryStatusPostConfig);

        // the configuration burst ends with the startup flux reference
        let mut sent = Vec::new();
        while seq.state() == SequencerState::QueryStatusPostConfig {
            sent.push(next_frame(&mut seq, &mut now, pedals(0, 0)).0);
        }
        assert_eq!(sent.len(), 7);
        assert_eq!(
            sent[3..6],
            [
                encode_register_set(Register::FluxKi, RegisterValue::U16(FLUX_KI)),
                encode_register_set(Register::FluxKp, RegisterValue::U16(FLUX_KP)),
                encode_register_set(
                    Register::FluxRef,
                    RegisterValue::U16(STARTUP_FLUX_REFERENCE)
                ),
            ]
        );

        // above the threshold speed, the status poll is followed by a flux drop
        run_until(&mut seq, &mut now, SequencerState::QueryStatusRun);
        seq.on_frame(&ParsedFrame::Int32Value { ok: true, value: 500 }, now)
            .unwrap();
        let (first, _) = next_frame(&mut seq, &mut now, pedals(0, 0));
        let (second, _) = next_frame(&mut seq, &mut now, pedals(0, 0));
        assert_eq!(first, encode_register_get(Register::Status));
        assert_eq!(
            second,
            encode_register_set(Register::FluxRef, RegisterValue::U16(0))
        );
    }

    #[test]
    fn test_never_two_frames_within_interval() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        let mut last: Option<Instant> = None;
        for _ in 0..2_000 {
            now += TICK;
            if seq.poll(now, || pedals(30, 0)).is_some() {
                if let Some(previous) = last {
                    assert!(now - previous >= SEND_INTERVAL);
                }
                last = Some(now);
            }
        }
        assert!(seq.state().is_run_cycle());
    }

    #[test]
    fn test_start_waits_for_settle_delay() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::QueryStatusPostConfig);

        // drain the configuration burst; the state stays put meanwhile
        let mut last = next_frame(&mut seq, &mut now, pedals(0, 0));
        while seq.state() == SequencerState::QueryStatusPostConfig {
            last = next_frame(&mut seq, &mut now, pedals(0, 0));
        }
        assert_eq!(last.0, encode_register_get(Register::Status));

        let (start, at) = next_frame(&mut seq, &mut now, pedals(0, 0));
        assert_eq!(start, encode_command(Command::Start));
        assert!(at - last.1 >= START_SETTLE_DELAY);
    }

    #[test]
    fn test_torque_uses_pedals_and_speed() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::ComputeTorque);

        let (frame, _) = next_frame(&mut seq, &mut now, pedals(50, 0));
        assert_eq!(
            frame,
            encode_register_set(Register::Torque, RegisterValue::I16(1400))
        );
        assert_eq!(seq.last_torque(), 1400);

        seq.on_frame(&ParsedFrame::Int32Value { ok: true, value: 10 }, now)
            .unwrap();
        run_until(&mut seq, &mut now, SequencerState::ComputeTorque);
        let (frame, _) = next_frame(&mut seq, &mut now, pedals(0, 50));
        assert_eq!(
            frame,
            encode_register_set(Register::Torque, RegisterValue::I16(-100))
        );
        assert_eq!(seq.last_pedals().brake, 50);
    }

    #[test]
    fn test_ramp_mode_ignores_pedals() {
        let config = SequencerConfig {
            ramp_test: true,
            ..SequencerConfig::default()
        };
        let mut seq = Sequencer::new(config);
        let mut now = Instant::now();
        let mut torques = Vec::new();
        while torques.len() < 3 {
            run_until(&mut seq, &mut now, SequencerState::ComputeTorque);
            next_frame(&mut seq, &mut now, pedals(255, 0));
            torques.push(seq.last_torque());
        }
        assert_eq!(torques, vec![0, 1, 2]);
    }

    #[test]
    fn test_fault_in_run_cycle_resets_with_cooldown() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::QueryStatusRun);
        seq.on_frame(&ParsedFrame::Int32Value { ok: true, value: 80 }, now)
            .unwrap();

        let fault = ParsedFrame::ByteValue {
            ok: false,
            value: EscState::FaultNow as u8,
        };
        assert_eq!(
            seq.on_frame(&fault, now),
            Err(FaultSignaled {
                status: EscState::FaultNow
            })
        );
        assert_eq!(seq.state(), SequencerState::INITIAL);
        assert_eq!(seq.last_speed(), 0);

        let faulted_at = now;
        while now - faulted_at < FAULT_COOLDOWN {
            assert!(seq.in_cooldown(now));
            assert!(seq.poll(now, PedalReading::default).is_none());
            now += TICK;
        }
        let frame = seq.poll(now, PedalReading::default);
        assert_eq!(frame, Some(encode_register_get(Register::Status)));
        assert_eq!(seq.state(), SequencerState::Stop);
    }

    #[test]
    fn test_fault_outside_run_cycle_is_ignored() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::Configure);

        let fault = ParsedFrame::ByteValue {
            ok: false,
            value: EscState::FaultOver as u8,
        };
        assert!(seq.on_frame(&fault, now).is_ok());
        assert_eq!(seq.state(), SequencerState::Configure);
        assert!(!seq.in_cooldown(now));
        assert_eq!(seq.last_status(), Some(EscState::FaultOver as u8));
    }

    #[test]
    fn test_ok_status_frame_is_not_a_fault() {
        let mut seq = Sequencer::new(SequencerConfig::default());
        let mut now = Instant::now();
        run_until(&mut seq, &mut now, SequencerState::QuerySpeed);
        let frame = ParsedFrame::ByteValue {
            ok: true,
            value: EscState::FaultNow as u8,
        };
        assert!(seq.on_frame(&frame, now).is_ok());
        assert_eq!(seq.state(), SequencerState::QuerySpeed);
    }
}
