// Tick loop driving the ESC
// Each tick: drain the serial link, decode every complete frame, then let the
// sequencer send at most one frame. Everything the loop mutates lives in `Runtime`.

use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

// local imports
use crate::config::{RuntimeConfig, TELEMETRY_HZ};
use crate::esc::protocol::{
    encode_command, encode_register_set, hex, Command, EscState, ParsedFrame, Register,
    RegisterValue,
};
use crate::esc::{FrameReceiver, Sequencer, SequencerConfig, SequencerState, SerialTransport, Transport};
use crate::input::{AnalogInput, ConditionerSettings, InputConditioner};
use crate::messages::{LinkHealth, Telemetry};

pub struct Runtime<T: Transport, A: AnalogInput> {
    transport: T,
    analog: A,
    receiver: FrameReceiver,
    sequencer: Sequencer,
    conditioner: InputConditioner,
    link_timeout: Duration,
    trace_frames: bool,
    last_rx_at: Option<Instant>,
    rx_frames: u64,
    rx_errors: u64,
    tx_frames: u64,
    faults: u64,
}

impl<T: Transport, A: AnalogInput> Runtime<T, A> {
    /// Calibrates the pedals from `analog` before anything is sent
    pub fn new(transport: T, mut analog: A, config: &RuntimeConfig) -> Self {
        let settings = ConditionerSettings {
            security_offset: config.security_offset,
            throttle_divisor: config.throttle_divisor,
            brake_divisor: config.brake_divisor,
        };
        let conditioner =
            InputConditioner::calibrate(&mut analog, config.calibration_samples, settings);

        let mut receiver = FrameReceiver::with_capacity(config.rx_capacity);
        receiver.set_trace(config.trace_frames);

        Self {
            transport,
            analog,
            receiver,
            sequencer: Sequencer::new(SequencerConfig::from(config)),
            conditioner,
            link_timeout: config.link_timeout(),
            trace_frames: config.trace_frames,
            last_rx_at: None,
            rx_frames: 0,
            rx_errors: 0,
            tx_frames: 0,
            faults: 0,
        }
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    pub fn stop_requested(&self) -> bool {
        self.analog.stop_requested()
    }

    /// One scheduler tick at time `now`
    pub fn tick(&mut self, now: Instant) {
        // Operator input is drained even while nothing is being sampled
        self.analog.poll();

        // 1. Drain whatever the link has buffered
        match self.transport.read_available() {
            Ok(bytes) => self.receiver.extend(&bytes),
            Err(e) => warn!("Read from ESC failed: {}", e),
        }

        // 2. Decode everything complete before deciding on the next send
        for result in self.receiver.frames() {
            match result {
                Ok(ParsedFrame::MalformedLength { length, .. }) => {
                    self.rx_errors += 1;
                    warn!("Dropped frame with unsupported payload length {}", length);
                }
                Ok(frame) => {
                    self.rx_frames += 1;
                    self.last_rx_at = Some(now);
                    log_frame(&frame);
                    if let Err(fault) = self.sequencer.on_frame(&frame, now) {
                        self.faults += 1;
                        warn!("{}", fault);
                    }
                }
                Err(e) => {
                    self.rx_errors += 1;
                    warn!("Dropped frame: {}", e);
                }
            }
        }

        // 3. Maybe advance the sequencer
        let analog = &mut self.analog;
        let conditioner = &self.conditioner;
        let Some(frame) = self.sequencer.poll(now, || conditioner.read(analog)) else {
            return;
        };
        let bytes = frame.to_bytes();
        if self.trace_frames {
            info!("send {:?}: {}", frame.marker, hex(&bytes));
        } else {
            debug!("send {:?}: {:02X?}", frame.marker, frame.payload);
        }
        match self.transport.write(&bytes) {
            Ok(()) => self.tx_frames += 1,
            Err(e) => warn!("Write to ESC failed: {}", e),
        }

        // a torque command was just sent: report the cycle
        if self.sequencer.state() == SequencerState::QueryStatusRun {
            match serde_json::to_string(&self.telemetry(now)) {
                Ok(json) => debug!("cycle: {}", json),
                Err(e) => warn!("Failed to serialize telemetry: {}", e),
            }
        }
    }

    pub fn health(&self, now: Instant) -> LinkHealth {
        if self.sequencer.in_cooldown(now) {
            return LinkHealth::Cooldown;
        }
        if !self.sequencer.state().is_run_cycle() {
            return LinkHealth::BringUp;
        }
        match self.last_rx_at {
            Some(at) if now.duration_since(at) <= self.link_timeout => LinkHealth::Running,
            _ => LinkHealth::EscSilent,
        }
    }

    pub fn telemetry(&self, now: Instant) -> Telemetry {
        let pedals = self.sequencer.last_pedals();
        let calibration = self.conditioner.calibration();
        Telemetry {
            state: self.sequencer.state(),
            throttle: pedals.throttle,
            brake: pedals.brake,
            throttle_raw: pedals.throttle_raw,
            brake_raw: pedals.brake_raw,
            throttle_baseline: calibration.throttle,
            brake_baseline: calibration.brake,
            torque: self.sequencer.last_torque(),
            speed: self.sequencer.last_speed(),
            esc_status: self.sequencer.last_status(),
            rx_frames: self.rx_frames,
            rx_errors: self.rx_errors,
            tx_frames: self.tx_frames,
            faults: self.faults,
            health: self.health(now),
        }
    }

    /// Zero torque, then STOP. Errors are logged, not returned.
    pub fn shutdown(&mut self) {
        info!("Stopping motor");
        let frames = [
            encode_register_set(Register::Torque, RegisterValue::I16(0)),
            encode_command(Command::Stop),
        ];
        for frame in frames {
            if let Err(e) = self.transport.write(&frame.to_bytes()) {
                warn!("Failed to send {:?} on shutdown: {}", frame.marker, e);
            }
        }
    }
}

impl<T: Transport, A: AnalogInput> Drop for Runtime<T, A> {
    fn drop(&mut self) {
        // Leave the ESC stopped whatever way the loop ended
        self.shutdown();
    }
}

/// JSON payloads for the telemetry and health topics
fn telemetry_payloads(telemetry: &Telemetry) -> serde_json::Result<(String, String)> {
    Ok((
        serde_json::to_string(telemetry)?,
        serde_json::to_string(&telemetry.health)?,
    ))
}

/// Publish one snapshot. Failures are logged and the control loop carries on.
async fn publish(
    pub_telemetry: &zenoh::pubsub::Publisher<'_>,
    pub_health: &zenoh::pubsub::Publisher<'_>,
    telemetry: &Telemetry,
) {
    let (telemetry_json, health_json) = match telemetry_payloads(telemetry) {
        Ok(payloads) => payloads,
        Err(e) => {
            warn!("Failed to serialize telemetry: {}", e);
            return;
        }
    };
    if let Err(e) = pub_telemetry.put(telemetry_json).await {
        warn!("Failed to publish telemetry: {}", e);
    }
    if let Err(e) = pub_health.put(health_json).await {
        warn!("Failed to publish health: {}", e);
    }
}

fn log_frame(frame: &ParsedFrame) {
    let verdict = if frame.ok() { "ok" } else { "KO" };
    match *frame {
        ParsedFrame::Ack { .. } => debug!("ESC {}: ack", verdict),
        ParsedFrame::ByteValue { value, .. } => match EscState::from_byte(value) {
            Some(state) => debug!("ESC {}: status {:?} ({})", verdict, state, value),
            None => debug!("ESC {}: value 0x{:02X}", verdict, value),
        },
        ParsedFrame::Unknown { .. } => debug!("ESC {}: two-byte payload (unsupported)", verdict),
        ParsedFrame::Int32Value { value, .. } => debug!("ESC {}: speed {}", verdict, value),
        ParsedFrame::MalformedLength { length, .. } => {
            debug!("ESC {}: malformed length {}", verdict, length)
        }
    }
}

pub async fn run<A: AnalogInput>(
    config: RuntimeConfig,
    analog: A,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening ESC link on {} at {} baud", config.port, config.baud_rate);
    let transport = SerialTransport::open(&config.port, config.baud_rate)?;
    let mut runtime = Runtime::new(transport, analog, &config);

    let session = if config.publish_telemetry {
        info!("Opening Zenoh session...");
        Some(zenoh::open(zenoh::Config::default()).await?)
    } else {
        None
    };
    let publishers = match &session {
        Some(session) => Some((
            session
                .declare_publisher(config.telemetry_topic.clone())
                .await?,
            session.declare_publisher(config.health_topic.clone()).await?,
        )),
        None => None,
    };

    let mut tick = interval(config.tick_period());
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut publish_timer = interval(Duration::from_millis(1000 / TELEMETRY_HZ));

    info!(
        "Runtime started: {}ms tick, {}ms send interval, {}ms fault cooldown",
        config.tick_period_ms, config.send_interval_ms, config.fault_cooldown_ms
    );
    if publishers.is_some() {
        info!(
            "Publishing to: {}, {}",
            config.telemetry_topic, config.health_topic
        );
    }

    loop {
        tokio::select! {
            _ = tick.tick() => {
                runtime.tick(Instant::now());
                if runtime.stop_requested() {
                    info!("Stop requested by operator");
                    break;
                }
            }
            _ = publish_timer.tick(), if publishers.is_some() => {
                if let Some((pub_telemetry, pub_health)) = &publishers {
                    let telemetry = runtime.telemetry(Instant::now());
                    publish(pub_telemetry, pub_health, &telemetry).await;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    // Drop sends zero torque + STOP
    drop(runtime);
    Ok(())
}
