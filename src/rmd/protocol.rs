// RMD command/telemetry wire encodings
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{MotionField, RangeError};
use crate::rmd::profile::{FieldRange, MotionRanges};

/// Bus subsystem name used for every RMD field
pub const SUBSYSTEM: &str = "rmd";

/// Bus field names
pub mod fields {
    /// CAN id of the bridge (u8)
    pub const CAN_ID: &str = "canid";

    /// CAN speed preset
    pub const CAN_SPEED: &str = "canspd";

    /// Maximum torque (N·m × 100)
    pub const MAX_TORQUE: &str = "maxtorque";

    /// Link status (0 = disconnected)
    pub const CONNECTED: &str = "connected";

    /// Fault bitmask
    pub const ERRORS: &str = "errors";

    /// Run state index
    pub const STATE: &str = "state";

    /// Bus voltage (V × 10)
    pub const VOLTAGE: &str = "voltage";

    /// Absolute position (unused by the panel)
    pub const ABS_POSITION: &str = "apos";

    /// Position in turns (× 10000)
    pub const POS_TURNS: &str = "pos_turns";

    /// Turn offset (× 10000)
    pub const POS_TURNS_OFFSET: &str = "pos_turns_offset";

    /// Single-turn encoder position, raw
    pub const SINGLE_POS: &str = "single_pos";

    /// Single-turn encoder offset, raw
    pub const SINGLE_OFFSET: &str = "single_offset";

    /// Multi-turn position
    pub const MULTI_POS: &str = "multi_pos";

    /// Multi-turn position, raw
    pub const MULTI_POS_RAW: &str = "multi_pos_raw";

    /// Multi-turn offset; writing 0 zeroes the current position
    pub const MULTI_OFFSET: &str = "multi_offset";

    /// Single-turn angle (deg × 100)
    pub const SINGLE_ANGLE: &str = "single_ang";

    /// Multi-turn angle (deg × 100)
    pub const MULTI_ANGLE: &str = "multi_ang";

    /// Torque current (A × 100)
    pub const TORQUE: &str = "torque";

    /// PID gains, 8-byte little-endian word
    pub const PID: &str = "pid";

    /// Motion command / motion feedback word
    pub const MOTION: &str = "motion";

    /// Enter run mode
    pub const START: &str = "start";

    /// Stop the actuator
    pub const STOP: &str = "stop";

    /// Device function call (1 = reset multi-turn value)
    pub const FUNCTION: &str = "function";

    /// RMD baudrate preset index
    pub const BAUDRATE: &str = "baudrate";
}

/// Function code for resetting the multi-turn counter
pub const FUNCTION_RESET_MULTITURN: i64 = 1;

/// Fields requested once whenever the panel becomes visible
pub const INIT_FIELDS: [&str; 3] = [fields::CAN_ID, fields::CAN_SPEED, fields::MAX_TORQUE];

/// Fields requested on every telemetry poll tick
pub const POLL_FIELDS: [&str; 12] = [
    fields::CONNECTED,
    fields::VOLTAGE,
    fields::ERRORS,
    fields::STATE,
    fields::POS_TURNS,
    fields::POS_TURNS_OFFSET,
    fields::TORQUE,
    fields::MULTI_POS_RAW,
    fields::MULTI_OFFSET,
    fields::SINGLE_POS,
    fields::SINGLE_OFFSET,
    fields::MULTI_ANGLE,
];

// ============================================================================
// PID parameters
// ============================================================================

/// Gains of the three cascaded loops, one byte each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PidParameters {
    /// Current loop Kp
    pub ip: u8,
    /// Current loop Ki
    pub ii: u8,
    /// Velocity loop Kp
    pub vp: u8,
    /// Velocity loop Ki
    pub vi: u8,
    /// Position loop Kp
    pub kp: u8,
    /// Position loop Ki
    pub ki: u8,
}

/// Encode PID parameters into the 64-bit wire word
///
/// Byte order is little-endian: `[ip, ii, vp, vi, kp, ki, 0, 0]`.
pub fn encode_pid(pid: &PidParameters) -> u64 {
    u64::from_le_bytes([pid.ip, pid.ii, pid.vp, pid.vi, pid.kp, pid.ki, 0, 0])
}

/// Decode PID parameters from the 64-bit wire word
///
/// The two reserved high bytes are ignored.
pub fn decode_pid(word: u64) -> PidParameters {
    let [ip, ii, vp, vi, kp, ki, _, _] = word.to_le_bytes();
    PidParameters {
        ip,
        ii,
        vp,
        vi,
        kp,
        ki,
    }
}

// ============================================================================
// Motion command
// ============================================================================

/// Bit widths of the motion word fields, in wire order
pub const POSITION_BITS: u32 = 16;
pub const VELOCITY_BITS: u32 = 12;
pub const POSITION_GAIN_BITS: u32 = 12;
pub const VELOCITY_GAIN_BITS: u32 = 12;
pub const FEED_FORWARD_BITS: u32 = 12;

/// Motion setpoint in engineering units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionCommand {
    /// Target position [deg]
    pub position_deg: f64,
    /// Target velocity [deg/s]
    pub velocity_deg_s: f64,
    /// Position gain, raw units
    pub position_gain: f64,
    /// Velocity gain, raw units
    pub velocity_gain: f64,
    /// Feed-forward torque [N·m]
    pub feed_forward_nm: f64,
}

impl MotionCommand {
    pub const fn new(
        position_deg: f64,
        velocity_deg_s: f64,
        position_gain: f64,
        velocity_gain: f64,
        feed_forward_nm: f64,
    ) -> Self {
        Self {
            position_deg,
            velocity_deg_s,
            position_gain,
            velocity_gain,
            feed_forward_nm,
        }
    }

    /// Values in the units the wire ranges are expressed in
    fn scaled_inputs(&self) -> [(MotionField, f64); 5] {
        [
            (MotionField::Position, self.position_deg.to_radians()),
            (MotionField::Velocity, self.velocity_deg_s.to_radians()),
            (MotionField::PositionGain, self.position_gain),
            (MotionField::VelocityGain, self.velocity_gain),
            (MotionField::FeedForward, self.feed_forward_nm),
        ]
    }

    /// Encode into the packed motion word, rejecting out-of-range inputs
    pub fn encode(&self, ranges: &MotionRanges) -> Result<MotionWord, RangeError> {
        let [pos, vel, kp, kd, ff] = self.scaled_inputs();
        let word = MotionWord::pack(
            quantize(pos, &ranges.position, POSITION_BITS)?,
            quantize(vel, &ranges.velocity, VELOCITY_BITS)?,
            quantize(kp, &ranges.position_gain, POSITION_GAIN_BITS)?,
            quantize(kd, &ranges.velocity_gain, VELOCITY_GAIN_BITS)?,
            quantize(ff, &ranges.feed_forward, FEED_FORWARD_BITS)?,
        );
        debug!("Motion command {:?} encoded as 0x{:016X}", self, word.value());
        Ok(word)
    }

    /// Copy of this command with every field saturated into its range
    ///
    /// Each saturated field is logged as a warning.
    pub fn clamped(&self, ranges: &MotionRanges) -> Self {
        let clamp = |field: MotionField, value: f64, range: &FieldRange| {
            let clamped = value.clamp(range.min, range.max);
            if clamped != value {
                warn!(
                    "Motion {} {} clamped to [{}, {}]",
                    field, value, range.min, range.max
                );
            }
            clamped
        };

        Self {
            position_deg: clamp(
                MotionField::Position,
                self.position_deg.to_radians(),
                &ranges.position,
            )
            .to_degrees(),
            velocity_deg_s: clamp(
                MotionField::Velocity,
                self.velocity_deg_s.to_radians(),
                &ranges.velocity,
            )
            .to_degrees(),
            position_gain: clamp(
                MotionField::PositionGain,
                self.position_gain,
                &ranges.position_gain,
            ),
            velocity_gain: clamp(
                MotionField::VelocityGain,
                self.velocity_gain,
                &ranges.velocity_gain,
            ),
            feed_forward_nm: clamp(
                MotionField::FeedForward,
                self.feed_forward_nm,
                &ranges.feed_forward,
            ),
        }
    }
}

/// Scale `value` from `range` onto the unsigned `bits`-wide code space
fn quantize(
    (field, value): (MotionField, f64),
    range: &FieldRange,
    bits: u32,
) -> Result<u16, RangeError> {
    // Tolerance absorbs degree/radian roundoff at the range edges
    let tolerance = (range.max - range.min) * 1e-9;
    if !value.is_finite() || value < range.min - tolerance || value > range.max + tolerance {
        return Err(RangeError {
            field,
            value,
            min: range.min,
            max: range.max,
        });
    }

    let value = value.clamp(range.min, range.max);
    let full_scale = f64::from((1u32 << bits) - 1);
    let code = ((value - range.min) / (range.max - range.min) * full_scale).round();
    // In range by construction: value is within [min, max]
    Ok(code as u16)
}

/// Packed 64-bit motion word
///
/// Big-endian layout, most significant first: position (16), velocity (12),
/// position gain (12), velocity gain (12), feed-forward (12). Adjacent
/// 12-bit codes share a byte through a nibble interleave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionWord(u64);

impl MotionWord {
    /// Pack pre-quantized field codes
    ///
    /// Codes are masked to their bit width.
    pub fn pack(
        position: u16,
        velocity: u16,
        position_gain: u16,
        velocity_gain: u16,
        feed_forward: u16,
    ) -> Self {
        let velocity = velocity & 0xFFF;
        let position_gain = position_gain & 0xFFF;
        let velocity_gain = velocity_gain & 0xFFF;
        let feed_forward = feed_forward & 0xFFF;

        let bytes = [
            (position >> 8) as u8,
            (position & 0xFF) as u8,
            (velocity >> 4) as u8,
            (((velocity & 0xF) << 4) | (position_gain >> 8)) as u8,
            (position_gain & 0xFF) as u8,
            (velocity_gain >> 4) as u8,
            (((velocity_gain & 0xF) << 4) | (feed_forward >> 8)) as u8,
            (feed_forward & 0xFF) as u8,
        ];
        Self(u64::from_be_bytes(bytes))
    }

    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Low 32 bits, sent as the value parameter
    pub const fn low(self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// High 32 bits, sent as the address parameter
    pub const fn high(self) -> u32 {
        ((self.0 >> 32) & 0xFFFF_FFFF) as u32
    }

    pub const fn position_code(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn velocity_code(self) -> u16 {
        ((self.0 >> 36) & 0xFFF) as u16
    }

    pub const fn position_gain_code(self) -> u16 {
        ((self.0 >> 24) & 0xFFF) as u16
    }

    pub const fn velocity_gain_code(self) -> u16 {
        ((self.0 >> 12) & 0xFFF) as u16
    }

    pub const fn feed_forward_code(self) -> u16 {
        (self.0 & 0xFFF) as u16
    }
}

/// Encode a motion command from its five engineering-unit inputs
///
/// # Arguments
/// * `position_deg` - Target position [deg]
/// * `velocity_deg_s` - Target velocity [deg/s]
/// * `position_gain` - Position gain, raw units
/// * `velocity_gain` - Velocity gain, raw units
/// * `feed_forward_nm` - Feed-forward torque [N·m]
///
/// # Returns
/// * `Ok(MotionWord)` if every input is inside its range
/// * `Err(RangeError)` naming the first field that is not
pub fn encode_motion(
    position_deg: f64,
    velocity_deg_s: f64,
    position_gain: f64,
    velocity_gain: f64,
    feed_forward_nm: f64,
    ranges: &MotionRanges,
) -> Result<MotionWord, RangeError> {
    MotionCommand::new(
        position_deg,
        velocity_deg_s,
        position_gain,
        velocity_gain,
        feed_forward_nm,
    )
    .encode(ranges)
}

// ============================================================================
// Motion reply
// ============================================================================

/// Raw motion feedback word
///
/// The feedback layout is undocumented, so the word is only carried between
/// the signed bus representation and its unsigned bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionReply(u64);

impl MotionReply {
    pub const fn from_signed(value: i64) -> Self {
        Self(value as u64)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn as_signed(self) -> i64 {
        self.0 as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rmd::profile::FirmwareProfile;

    fn ranges() -> MotionRanges {
        FirmwareProfile::rmd_x().motion
    }

    #[test]
    fn test_encode_decode_pid() {
        let pid = PidParameters {
            ip: 100,
            ii: 90,
            vp: 50,
            vi: 40,
            kp: 30,
            ki: 255,
        };
        assert_eq!(decode_pid(encode_pid(&pid)), pid);
    }

    #[test]
    fn test_pid_wire_order() {
        let pid = PidParameters {
            ip: 1,
            ii: 2,
            vp: 3,
            vi: 4,
            kp: 5,
            ki: 6,
        };
        let bytes = encode_pid(&pid).to_le_bytes();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 0, 0]);
        assert_eq!(encode_pid(&pid) & 0xFF, 1);
        assert_eq!((encode_pid(&pid) >> 40) & 0xFF, 6);
    }

    #[test]
    fn test_decode_pid_ignores_reserved_bytes() {
        let word = u64::from_le_bytes([7, 8, 9, 10, 11, 12, 0xAA, 0xBB]);
        let pid = decode_pid(word);
        assert_eq!(pid.ip, 7);
        assert_eq!(pid.ki, 12);
        assert_eq!(encode_pid(&pid), word & 0x0000_FFFF_FFFF_FFFF);
    }

    #[test]
    fn test_encode_motion_midscale_fields() {
        let word = encode_motion(0.0, 0.0, 0.0, 0.0, -24.0, &ranges()).unwrap();

        assert_eq!(
            u64::from(word.position_code()),
            (12.5f64 / 25.0 * 65535.0).round() as u64
        );
        assert_eq!(
            u64::from(word.velocity_code()),
            (45.0f64 / 90.0 * 4095.0).round() as u64
        );
        assert_eq!(word.position_gain_code(), 0);
        assert_eq!(word.velocity_gain_code(), 0);
        assert_eq!(word.feed_forward_code(), 0);

        // Independent masks on the raw value
        assert_eq!(word.value() >> 48, 32768);
        assert_eq!((word.value() >> 36) & 0xFFF, 2048);
        assert_eq!(word.value() & 0xFFF, 0);
    }

    #[test]
    fn test_motion_nibble_interleave() {
        let word = MotionWord::pack(0x1234, 0xABC, 0xDEF, 0x123, 0x456);
        assert_eq!(
            word.to_be_bytes(),
            [0x12, 0x34, 0xAB, 0xCD, 0xEF, 0x12, 0x34, 0x56]
        );
        assert_eq!(word.position_code(), 0x1234);
        assert_eq!(word.velocity_code(), 0xABC);
        assert_eq!(word.position_gain_code(), 0xDEF);
        assert_eq!(word.velocity_gain_code(), 0x123);
        assert_eq!(word.feed_forward_code(), 0x456);
    }

    #[test]
    fn test_motion_word_halves() {
        let word = MotionWord::from_value(0x89AB_CDEF_0123_4567);
        assert_eq!(word.low(), 0x0123_4567);
        assert_eq!(word.high(), 0x89AB_CDEF);
    }

    #[test]
    fn test_encode_motion_full_scale() {
        let max_deg = 12.5f64.to_degrees();
        let max_vel = 45.0f64.to_degrees();
        let word = encode_motion(max_deg, max_vel, 500.0, 5.0, 24.0, &ranges()).unwrap();
        assert_eq!(word.value(), u64::MAX);
    }

    #[test]
    fn test_encode_motion_rejects_out_of_range() {
        let err = encode_motion(0.0, 0.0, 0.0, 0.0, 24.5, &ranges()).unwrap_err();
        assert_eq!(err.field, MotionField::FeedForward);
        assert_eq!(err.max, 24.0);

        let err = encode_motion(0.0, 0.0, -1.0, 0.0, 0.0, &ranges()).unwrap_err();
        assert_eq!(err.field, MotionField::PositionGain);

        let err = encode_motion(1000.0, 0.0, 0.0, 0.0, 0.0, &ranges()).unwrap_err();
        assert_eq!(err.field, MotionField::Position);

        let err = encode_motion(0.0, f64::NAN, 0.0, 0.0, 0.0, &ranges()).unwrap_err();
        assert_eq!(err.field, MotionField::Velocity);
    }

    #[test]
    fn test_clamped_command_encodes() {
        let cmd = MotionCommand::new(5000.0, -9000.0, 600.0, 2.0, -30.0);
        assert!(cmd.encode(&ranges()).is_err());

        let clamped = cmd.clamped(&ranges());
        assert_eq!(clamped.position_gain, 500.0);
        assert_eq!(clamped.velocity_gain, 2.0);
        assert_eq!(clamped.feed_forward_nm, -24.0);

        let word = clamped.encode(&ranges()).unwrap();
        assert_eq!(word.position_code(), 0xFFFF);
        assert_eq!(word.velocity_code(), 0);
        assert_eq!(word.feed_forward_code(), 0);
    }

    #[test]
    fn test_motion_reply_sign_extension() {
        let reply = MotionReply::from_signed(-1);
        assert_eq!(reply.raw(), u64::MAX);
        assert_eq!(reply.as_signed(), -1);

        let reply = MotionReply::from_signed(0x1234);
        assert_eq!(reply.raw(), 0x1234);
    }
}
