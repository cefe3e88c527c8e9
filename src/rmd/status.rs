//! Status telemetry decoding
//!
//! Every decoder is total: unknown bits, unknown indices and a missing link
//! all map to a defined string.

use crate::rmd::profile::FirmwareProfile;
use crate::state::ConnectionState;

/// Text reported by every decoder while the device is not connected
pub const NOT_CONNECTED: &str = "Not connected";

/// Text reported for an empty fault mask
pub const NO_ERRORS: &str = "None";

/// Names of the fault flags set in `mask`, in profile order
pub fn error_names<'a>(mask: u32, profile: &'a FirmwareProfile) -> Vec<&'a str> {
    profile
        .errors
        .iter()
        .filter(|flag| mask & flag.mask != 0)
        .map(|flag| flag.name.as_str())
        .collect()
}

/// Describe a fault mask
///
/// # Returns
/// * `"Not connected"` unless the link is up
/// * `"None"` for an empty mask
/// * matching flag names joined by newlines
/// * the decimal mask if no flag matches
pub fn describe_errors(
    mask: u32,
    profile: &FirmwareProfile,
    connection: &ConnectionState,
) -> String {
    if !connection.is_connected() {
        return NOT_CONNECTED.to_string();
    }
    if mask == 0 {
        return NO_ERRORS.to_string();
    }

    let names = error_names(mask, profile);
    if names.is_empty() {
        mask.to_string()
    } else {
        names.join("\n")
    }
}

/// Describe a run state index, falling back to the decimal index
pub fn describe_state(
    index: i64,
    profile: &FirmwareProfile,
    connection: &ConnectionState,
) -> String {
    if !connection.is_connected() {
        return NOT_CONNECTED.to_string();
    }

    usize::try_from(index)
        .ok()
        .and_then(|i| profile.states.get(i))
        .cloned()
        .unwrap_or_else(|| index.to_string())
}

/// Describe the bus voltage reading
pub fn describe_voltage(
    raw: i64,
    profile: &FirmwareProfile,
    connection: &ConnectionState,
) -> String {
    if !connection.is_connected() {
        return NOT_CONNECTED.to_string();
    }
    format!("{}V", raw as f64 / profile.scaling.voltage_divisor)
}
