//! Decoded headset telemetry.

use serde_derive::Serialize;
use std::fmt;

/// Earpiece that authored an advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ear {
    Left,
    Right,
}

impl fmt::Display for Ear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ear::Left => write!(f, "left"),
            Ear::Right => write!(f, "right"),
        }
    }
}

/// Battery, charging and placement state carried by one Continuity
/// proximity-pairing advertisement.
///
/// Battery levels are percentages in steps of 10. `None` means the
/// component reported no level, which is what a disconnected earpiece or a
/// case that has not been opened recently looks like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Telemetry {
    /// Human-readable model name, `"Unknown"` for identifiers not in the table
    pub model: &'static str,
    /// Raw product identifier
    #[serde(skip)]
    pub model_id: u16,
    /// Product identifier formatted as `0xXXXX`
    #[serde(rename = "model_id")]
    pub model_id_hex: String,
    pub left_battery: Option<u8>,
    pub right_battery: Option<u8>,
    pub case_battery: Option<u8>,
    pub left_charging: bool,
    pub right_charging: bool,
    pub case_charging: bool,
    pub left_in_ear: bool,
    pub right_in_ear: bool,
    /// Neither earpiece is in an ear
    pub both_in_case: bool,
    pub lid_open: bool,
    pub broadcasting_ear: Ear,
}

/// Known product identifiers.
///
/// Apple ships new identifiers with every hardware generation, so anything
/// missing here still decodes, only with [`UNKNOWN_MODEL`] as its name.
pub const KNOWN_MODELS: &[(u16, &str)] = &[
    (0x2002, "AirPods 1"),
    (0x200F, "AirPods 2"),
    (0x2013, "AirPods 3"),
    (0x200E, "AirPods Pro"),
    (0x2014, "AirPods Pro 2"),
    (0x2024, "AirPods Pro 2 (USB-C)"),
    (0x200A, "AirPods Max"),
    (0x2012, "Beats Fit Pro"),
];

pub const UNKNOWN_MODEL: &str = "Unknown";

/// Look up the marketing name for a product identifier.
pub fn model_name(model_id: u16) -> &'static str {
    KNOWN_MODELS
        .iter()
        .find(|(id, _)| *id == model_id)
        .map_or(UNKNOWN_MODEL, |(_, name)| name)
}

/// Format a product identifier the way reports show it.
pub fn format_model_id(model_id: u16) -> String {
    format!("0x{model_id:04X}")
}

/// Render a battery level for logs and text output: `90%`, or `--` when unknown.
pub fn format_battery(level: Option<u8>) -> String {
    match level {
        Some(level) => format!("{level}%"),
        None => "--".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_battery() {
        assert_eq!(format_battery(Some(90)), "90%");
        assert_eq!(format_battery(Some(0)), "0%");
        assert_eq!(format_battery(None), "--");
    }

    #[test]
    fn test_model_name_known() {
        assert_eq!(model_name(0x2014), "AirPods Pro 2");
        assert_eq!(model_name(0x200E), "AirPods Pro");
        assert_eq!(model_name(0x200F), "AirPods 2");
        assert_eq!(model_name(0x2013), "AirPods 3");
    }

    #[test]
    fn test_model_name_unknown() {
        assert_eq!(model_name(0x1234), UNKNOWN_MODEL);
        assert_eq!(model_name(0), UNKNOWN_MODEL);
    }

    #[test]
    fn test_model_table_has_no_duplicates() {
        for (i, (id, _)) in KNOWN_MODELS.iter().enumerate() {
            assert!(
                KNOWN_MODELS[i + 1..].iter().all(|(other, _)| other != id),
                "duplicate model id {id:#06x}"
            );
        }
    }

    #[test]
    fn test_format_model_id() {
        assert_eq!(format_model_id(0x2014), "0x2014");
        assert_eq!(format_model_id(0x200e), "0x200E");
        assert_eq!(format_model_id(0x7), "0x0007");
    }

    #[test]
    fn test_ear_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Ear::Right).unwrap(), "\"right\"");
        assert_eq!(Ear::Left.to_string(), "left");
    }
}
