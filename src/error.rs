//! Error types for the RMD codec, profiles and configuration.

use thiserror::Error;

/// Motion command field, used to report which input was out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionField {
    Position,
    Velocity,
    PositionGain,
    VelocityGain,
    FeedForward,
}

impl MotionField {
    pub fn name(self) -> &'static str {
        match self {
            MotionField::Position => "position",
            MotionField::Velocity => "velocity",
            MotionField::PositionGain => "position gain",
            MotionField::VelocityGain => "velocity gain",
            MotionField::FeedForward => "feed-forward torque",
        }
    }
}

impl std::fmt::Display for MotionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A motion input fell outside the range its bit field can carry.
///
/// `value`, `min` and `max` are in the units the field is scaled from
/// (radians, rad/s, raw gain or N·m).
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("{field} out of range: {value} not in [{min}, {max}]")]
pub struct RangeError {
    pub field: MotionField,
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Unknown firmware profile: {0}")]
    Unknown(String),

    #[error("Invalid firmware profile {name}: {reason}")]
    Invalid { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Profile(#[from] ProfileError),
}
