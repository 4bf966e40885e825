// Keyboard pedals for bench runs on a desktop host: W throttle, S brake,
// R/F pedal depth, Q/Esc/Ctrl-C stop. Pedals spring back after PEDAL_HOLD.
//
// Keys are drained by `poll` on every tick. The terminal must be in raw mode
// (see `crossterm::terminal::enable_raw_mode`).

use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{info, warn};

use super::{AnalogInput, Channel};

/// Full-scale reading of a 12-bit converter
const ADC_MAX: u16 = 4095;

/// Resting reading reported for a released pedal
pub const REST_RAW: u16 = 300;

/// Pedal depth presets, as a fraction of travel
const DEPTHS: [f32; 3] = [0.25, 0.5, 1.0];
const DEPTH_LABELS: [&str; 3] = ["LOW", "MED", "FULL"];

/// Release pedals this long after the last key event
const PEDAL_HOLD: Duration = Duration::from_millis(150);

pub struct KeyboardPedals {
    depth_idx: usize,
    throttle_pressed_at: Option<Instant>,
    brake_pressed_at: Option<Instant>,
    stop: bool,
}

impl KeyboardPedals {
    pub fn new() -> Self {
        info!("Pedals: W=throttle, S=brake, R/F=depth, Q=quit");
        Self {
            depth_idx: 0,
            throttle_pressed_at: None,
            brake_pressed_at: None,
            stop: false,
        }
    }

    fn pressed_raw(&self) -> u16 {
        let travel = f32::from(ADC_MAX - REST_RAW) * DEPTHS[self.depth_idx];
        REST_RAW + travel as u16
    }

    /// Drain pending key events without blocking
    fn poll_keys(&mut self) {
        loop {
            match event::poll(Duration::ZERO) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!("Keyboard poll failed: {}", e);
                    break;
                }
            }
            let Ok(Event::Key(key)) = event::read() else {
                continue;
            };
            self.on_key(key, Instant::now());
        }
    }

    fn on_key(&mut self, key: KeyEvent, now: Instant) {
        let KeyEvent {
            code,
            kind,
            modifiers,
            ..
        } = key;
        if kind == KeyEventKind::Release {
            return;
        }
        match code {
            KeyCode::Char('w') => {
                self.throttle_pressed_at = Some(now);
                self.brake_pressed_at = None;
            }
            KeyCode::Char('s') => {
                self.brake_pressed_at = Some(now);
                self.throttle_pressed_at = None;
            }
            KeyCode::Char('r') => {
                self.depth_idx = (self.depth_idx + 1).min(DEPTHS.len() - 1);
                info!("Pedal depth: {}", DEPTH_LABELS[self.depth_idx]);
            }
            KeyCode::Char('f') => {
                self.depth_idx = self.depth_idx.saturating_sub(1);
                info!("Pedal depth: {}", DEPTH_LABELS[self.depth_idx]);
            }
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => self.stop = true,
            KeyCode::Char('q') | KeyCode::Esc => self.stop = true,
            _ => {}
        }
    }

    fn level(&self, pressed_at: Option<Instant>, now: Instant) -> u16 {
        match pressed_at {
            Some(at) if now.duration_since(at) <= PEDAL_HOLD => self.pressed_raw(),
            _ => REST_RAW,
        }
    }
}

impl Default for KeyboardPedals {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalogInput for KeyboardPedals {
    fn sample(&mut self, channel: Channel) -> u16 {
        let now = Instant::now();
        match channel {
            Channel::Throttle => self.level(self.throttle_pressed_at, now),
            Channel::Brake => self.level(self.brake_pressed_at, now),
        }
    }

    fn poll(&mut self) {
        self.poll_keys();
    }

    fn stop_requested(&self) -> bool {
        self.stop
    }
}
