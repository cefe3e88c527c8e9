use crate::rmd::{MotionReply, TelemetryScaling};

/// Connection state
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    /// No `connected` report yet, or the device reported the link down
    #[default]
    Disconnected,
    Connected,
    /// Link considered lost by the panel itself
    Error(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Run state as commanded from the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    #[default]
    Stopped,
    Running,
}

/// Last raw telemetry values received from the device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub can_id: Option<i64>,
    pub can_speed: Option<i64>,
    /// Max torque (N·m × 100)
    pub max_torque: Option<i64>,
    /// Fault bitmask
    pub errors: Option<u32>,
    /// Run state index
    pub state: Option<i64>,
    /// Bus voltage (V × 10)
    pub voltage: Option<i64>,
    /// Multi-turn position (turns × 10000)
    pub pos_turns: Option<i64>,
    pub pos_turns_offset: Option<i64>,
    pub single_pos: Option<i64>,
    pub single_offset: Option<i64>,
    pub multi_pos: Option<i64>,
    pub multi_pos_raw: Option<i64>,
    pub multi_offset: Option<i64>,
    /// Last single- or multi-turn angle (deg × 100)
    pub angle: Option<i64>,
    /// Torque current (A × 100)
    pub torque: Option<i64>,
    pub motion: Option<MotionReply>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position in turns
    pub fn turns(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.pos_turns.map(|v| v as f64 / scaling.turns_divisor)
    }

    /// Turn offset
    pub fn turns_offset(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.pos_turns_offset
            .map(|v| v as f64 / scaling.turns_divisor)
    }

    /// Position in turns relative to the offset, once both have been reported
    pub fn turns_relative(&self, scaling: &TelemetryScaling) -> Option<f64> {
        Some(self.turns(scaling)? - self.turns_offset(scaling)?)
    }

    /// Angle [deg]
    pub fn angle_deg(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.angle.map(|v| v as f64 / scaling.angle_divisor)
    }

    /// Output torque [N·m]
    pub fn torque_nm(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.torque
            .map(|v| v as f64 / scaling.torque_current_divisor * scaling.torque_constant)
    }

    /// Configured max torque [N·m]
    pub fn max_torque_nm(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.max_torque
            .map(|v| v as f64 / scaling.max_torque_divisor)
    }

    /// Bus voltage [V]
    pub fn voltage_v(&self, scaling: &TelemetryScaling) -> Option<f64> {
        self.voltage.map(|v| v as f64 / scaling.voltage_divisor)
    }
}
