// Message types published by the runtime

use serde::{Deserialize, Serialize};

use crate::esc::SequencerState;

// Snapshot of the link and the last command, published for display/logging
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub state: SequencerState,
    pub throttle: u8,
    pub brake: u8,
    pub throttle_raw: u16,
    pub brake_raw: u16,
    pub throttle_baseline: u16,
    pub brake_baseline: u16,
    pub torque: i16,
    pub speed: i32,
    pub esc_status: Option<u8>,
    pub rx_frames: u64,
    pub rx_errors: u64,
    pub tx_frames: u64,
    pub faults: u64,
    pub health: LinkHealth,
}

/// Link health published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LinkHealth {
    BringUp,
    Running,
    Cooldown,
    EscSilent,
}
