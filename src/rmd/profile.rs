//! Firmware profiles
//!
//! Each supported RMD firmware revision reports its run state and faults
//! with its own tables, and scales motion and telemetry fields with its own
//! constants. A profile carries all of them so the rest of the crate never
//! branches on the revision.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ProfileError;
use crate::rmd::protocol::PidParameters;

/// Names of the built-in profiles
pub const BUILTIN_PROFILES: [&str; 2] = ["rmd-x", "rmd-legacy"];

/// Inclusive engineering-unit range of one motion field
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldRange {
    pub min: f64,
    pub max: f64,
}

impl FieldRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Ranges of the five motion word fields
///
/// Position is in radians and velocity in rad/s; the codec converts from
/// degrees before checking them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionRanges {
    pub position: FieldRange,
    pub velocity: FieldRange,
    pub position_gain: FieldRange,
    pub velocity_gain: FieldRange,
    pub feed_forward: FieldRange,
}

impl Default for MotionRanges {
    fn default() -> Self {
        Self {
            position: FieldRange::new(-12.5, 12.5),
            velocity: FieldRange::new(-45.0, 45.0),
            position_gain: FieldRange::new(0.0, 500.0),
            velocity_gain: FieldRange::new(0.0, 5.0),
            feed_forward: FieldRange::new(-24.0, 24.0),
        }
    }
}

/// Divisors turning raw telemetry integers into engineering units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetryScaling {
    /// raw / divisor = volts
    pub voltage_divisor: f64,
    /// raw / divisor = amps
    pub torque_current_divisor: f64,
    /// N·m per amp
    pub torque_constant: f64,
    /// raw / divisor = turns
    pub turns_divisor: f64,
    /// raw / divisor = degrees
    pub angle_divisor: f64,
    /// raw / divisor = N·m, and N·m × divisor = raw on write
    pub max_torque_divisor: f64,
}

impl Default for TelemetryScaling {
    fn default() -> Self {
        Self {
            voltage_divisor: 10.0,
            torque_current_divisor: 100.0,
            torque_constant: 2.6,
            turns_divisor: 10_000.0,
            angle_divisor: 100.0,
            max_torque_divisor: 100.0,
        }
    }
}

/// One named bit of the fault mask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlag {
    pub name: String,
    pub mask: u32,
}

impl ErrorFlag {
    pub fn new(name: &str, mask: u32) -> Self {
        Self {
            name: name.to_string(),
            mask,
        }
    }
}

/// Protocol tables and constants of one firmware revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmwareProfile {
    pub name: String,
    /// Telemetry poll period while the panel is shown
    pub poll_period_ms: u64,
    /// Time after the last motion command at which the actuator is stopped
    pub guard_timeout_ms: u64,
    pub home_position_gain: f64,
    pub home_velocity_gain: f64,
    /// Run state names, indexed by the `state` field
    pub states: Vec<String>,
    /// Fault flags, reported in this order
    pub errors: Vec<ErrorFlag>,
    /// Gains submitted right before the home motion
    pub home_pid: PidParameters,
    #[serde(default)]
    pub motion: MotionRanges,
    #[serde(default)]
    pub scaling: TelemetryScaling,
}

impl FirmwareProfile {
    /// RMD-X series, protocol V3 status tables
    pub fn rmd_x() -> Self {
        Self {
            name: "rmd-x".to_string(),
            states: ["IDLE", "WAIT_READY", "START_RUNNING", "RUNNING"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            errors: vec![
                ErrorFlag::new("motor_stall", 0x0002),
                ErrorFlag::new("low_pressure", 0x0004),
                ErrorFlag::new("overvoltage", 0x0008),
                ErrorFlag::new("overcurrent", 0x0010),
                ErrorFlag::new("power_overrun", 0x0040),
                ErrorFlag::new("speeding", 0x0100),
                ErrorFlag::new("motor_over_temperature", 0x1000),
                ErrorFlag::new("encoder_calibration_error", 0x2000),
            ],
            motion: MotionRanges::default(),
            scaling: TelemetryScaling::default(),
            poll_period_ms: 25,
            guard_timeout_ms: 3000,
            home_pid: PidParameters {
                ip: 100,
                ii: 100,
                vp: 50,
                vi: 40,
                kp: 30,
                ki: 0,
            },
            home_position_gain: 20.0,
            home_velocity_gain: 1.0,
        }
    }

    /// Older RMD-L firmware with the V2 single-byte fault state
    pub fn rmd_legacy() -> Self {
        Self {
            name: "rmd-legacy".to_string(),
            states: ["STOPPED", "RUNNING"].iter().map(|s| s.to_string()).collect(),
            errors: vec![
                ErrorFlag::new("low_voltage", 0x01),
                ErrorFlag::new("over_temperature", 0x08),
            ],
            motion: MotionRanges::default(),
            scaling: TelemetryScaling::default(),
            poll_period_ms: 500,
            guard_timeout_ms: 3000,
            home_pid: PidParameters {
                ip: 100,
                ii: 100,
                vp: 50,
                vi: 40,
                kp: 30,
                ki: 0,
            },
            home_position_gain: 20.0,
            home_velocity_gain: 1.0,
        }
    }

    /// Look up a built-in profile by name
    pub fn builtin(name: &str) -> Result<Self, ProfileError> {
        match name {
            "rmd-x" => Ok(Self::rmd_x()),
            "rmd-legacy" => Ok(Self::rmd_legacy()),
            other => Err(ProfileError::Unknown(other.to_string())),
        }
    }

    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_timeout_ms)
    }

    /// Check the invariants the codec and decoders rely on
    pub fn validate(&self) -> Result<(), ProfileError> {
        let invalid = |reason: String| ProfileError::Invalid {
            name: self.name.clone(),
            reason,
        };

        if self.states.is_empty() {
            return Err(invalid("state table is empty".to_string()));
        }
        if let Some(flag) = self.errors.iter().find(|f| f.mask == 0) {
            return Err(invalid(format!("error flag {} has an empty mask", flag.name)));
        }
        if self.poll_period_ms == 0 {
            return Err(invalid("poll period must be non-zero".to_string()));
        }
        if self.guard_timeout_ms == 0 {
            return Err(invalid("guard timeout must be non-zero".to_string()));
        }

        let m = &self.motion;
        for (field, range) in [
            ("position", m.position),
            ("velocity", m.velocity),
            ("position_gain", m.position_gain),
            ("velocity_gain", m.velocity_gain),
            ("feed_forward", m.feed_forward),
        ] {
            if !(range.min.is_finite() && range.max.is_finite() && range.min < range.max) {
                return Err(invalid(format!(
                    "{} range [{}, {}] is empty",
                    field, range.min, range.max
                )));
            }
        }

        for (field, gain, range) in [
            ("home_position_gain", self.home_position_gain, m.position_gain),
            ("home_velocity_gain", self.home_velocity_gain, m.velocity_gain),
        ] {
            if !range.contains(gain) {
                return Err(invalid(format!(
                    "{} {} not in [{}, {}]",
                    field, gain, range.min, range.max
                )));
            }
        }

        let s = &self.scaling;
        for (field, divisor) in [
            ("voltage_divisor", s.voltage_divisor),
            ("torque_current_divisor", s.torque_current_divisor),
            ("turns_divisor", s.turns_divisor),
            ("angle_divisor", s.angle_divisor),
            ("max_torque_divisor", s.max_torque_divisor),
        ] {
            if divisor == 0.0 || !divisor.is_finite() {
                return Err(invalid(format!("{} must be finite and non-zero", field)));
            }
        }

        Ok(())
    }

    /// Parse and validate a profile from TOML
    pub fn from_toml_str(text: &str) -> Result<Self, ProfileError> {
        let profile: Self = toml::from_str(text).map_err(|e| ProfileError::Invalid {
            name: "<toml>".to_string(),
            reason: e.to_string(),
        })?;
        profile.validate()?;
        Ok(profile)
    }
}

impl Default for FirmwareProfile {
    fn default() -> Self {
        Self::rmd_x()
    }
}
