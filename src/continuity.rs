//! Decoder for Apple Continuity proximity-pairing payloads.
//!
//! The payload is the manufacturer-specific data registered under Apple's
//! company identifier, with the two identifier bytes already stripped:
//!
//! | offset | meaning                                                  |
//! |--------|----------------------------------------------------------|
//! | 0      | message type, `0x07` for proximity pairing               |
//! | 1..3   | length and prefix, not interpreted                       |
//! | 3, 4   | product identifier, low byte first                       |
//! | 5      | case battery (high nibble), charging flags (low bits)    |
//! | 6      | left battery (high nibble), right battery (low nibble)   |
//! | 7      | lid open and in-ear flags                                |
//!
//! Battery nibbles are in tens of percent. Values above 10 mean the
//! component did not report a level.

use crate::telemetry::{Ear, Telemetry, format_model_id, model_name};
use thiserror::Error;

/// Apple's Bluetooth SIG company identifier.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Continuity message type for proximity pairing (headset status).
pub const PROXIMITY_PAIRING_TYPE: u8 = 0x07;

/// Shortest payload that carries every field we decode.
pub const MIN_PAYLOAD_LEN: usize = 8;

const MODEL_LOW_OFFSET: usize = 3;
const MODEL_HIGH_OFFSET: usize = 4;
const STATUS_OFFSET: usize = 5;
const BATTERY_OFFSET: usize = 6;
const LID_OFFSET: usize = 7;

const CASE_CHARGING_BIT: u8 = 0x04;
const LEFT_CHARGING_BIT: u8 = 0x02;
const RIGHT_CHARGING_BIT: u8 = 0x01;

const LID_OPEN_BIT: u8 = 0x04;
const LEFT_IN_EAR_BIT: u8 = 0x02;
const RIGHT_IN_EAR_BIT: u8 = 0x01;

/// Why a payload was not decoded as headset telemetry.
///
/// Most Apple advertisements (iPhones, Macs, Find My beacons) land here, so
/// this is an ordinary outcome rather than a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotRecognized {
    #[error("payload too short: {len} bytes, need at least {MIN_PAYLOAD_LEN}")]
    TooShort { len: usize },
    #[error("unsupported Continuity message type 0x{0:02x}")]
    UnsupportedType(u8),
}

/// Decode a Continuity payload into headset telemetry.
///
/// # Arguments
/// * `data` - Manufacturer data for [`APPLE_COMPANY_ID`], without the
///   company identifier prefix
///
/// # Example
/// ```
/// use airpods_listener::continuity::decode_continuity;
///
/// let telemetry = decode_continuity(&[0x07, 0x00, 0x00, 0x14, 0x20, 0x55, 0x96, 0x05]).unwrap();
/// assert_eq!(telemetry.model, "AirPods Pro 2");
/// assert_eq!(telemetry.left_battery, Some(90));
/// ```
pub fn decode_continuity(data: &[u8]) -> Result<Telemetry, NotRecognized> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(NotRecognized::TooShort { len: data.len() });
    }
    if data[0] != PROXIMITY_PAIRING_TYPE {
        return Err(NotRecognized::UnsupportedType(data[0]));
    }

    let model_id = u16::from_le_bytes([data[MODEL_LOW_OFFSET], data[MODEL_HIGH_OFFSET]]);
    let status = data[STATUS_OFFSET];
    let battery = data[BATTERY_OFFSET];
    let lid = data[LID_OFFSET];

    let left_in_ear = lid & LEFT_IN_EAR_BIT != 0;
    let right_in_ear = lid & RIGHT_IN_EAR_BIT != 0;

    Ok(Telemetry {
        model: model_name(model_id),
        model_id,
        model_id_hex: format_model_id(model_id),
        left_battery: battery_level(battery >> 4),
        right_battery: battery_level(battery & 0x0F),
        case_battery: battery_level(status >> 4),
        left_charging: status & LEFT_CHARGING_BIT != 0,
        right_charging: status & RIGHT_CHARGING_BIT != 0,
        case_charging: status & CASE_CHARGING_BIT != 0,
        left_in_ear,
        right_in_ear,
        both_in_case: !left_in_ear && !right_in_ear,
        lid_open: lid & LID_OPEN_BIT != 0,
        // The decoded bytes do not say which earpiece sent the broadcast.
        broadcasting_ear: Ear::Right,
    })
}

/// Scale a battery nibble to a percentage.
fn battery_level(nibble: u8) -> Option<u8> {
    (nibble <= 10).then(|| nibble * 10)
}

/// Lowercase hex rendering of a byte slice, no separators.
pub fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE: [u8; 8] = [0x07, 0x00, 0x00, 0x14, 0x20, 0x55, 0x96, 0x05];

    fn payload(status: u8, battery: u8, lid: u8) -> [u8; 8] {
        [0x07, 0x19, 0x01, 0x14, 0x20, status, battery, lid]
    }

    #[test]
    fn test_decode_reference_payload() {
        let t = decode_continuity(&REFERENCE).unwrap();
        assert_eq!(t.model_id, 0x2014);
        assert_eq!(t.model, "AirPods Pro 2");
        assert_eq!(t.model_id_hex, "0x2014");
        assert_eq!(t.case_battery, Some(50));
        assert_eq!(t.left_battery, Some(90));
        assert_eq!(t.right_battery, Some(60));
        assert!(t.case_charging);
        assert!(!t.left_charging);
        assert!(t.right_charging);
        assert!(t.lid_open);
        assert!(!t.left_in_ear);
        assert!(t.right_in_ear);
        assert!(!t.both_in_case);
        assert_eq!(t.broadcasting_ear, Ear::Right);
    }

    #[test]
    fn test_short_payloads_not_recognized() {
        for len in 0..MIN_PAYLOAD_LEN {
            assert_eq!(
                decode_continuity(&REFERENCE[..len]),
                Err(NotRecognized::TooShort { len })
            );
        }
    }

    #[test]
    fn test_wrong_type_not_recognized() {
        for marker in (0u8..=255).filter(|m| *m != PROXIMITY_PAIRING_TYPE) {
            let mut data = REFERENCE.to_vec();
            data[0] = marker;
            data.extend_from_slice(&[0xAB; 4]);
            assert_eq!(
                decode_continuity(&data),
                Err(NotRecognized::UnsupportedType(marker))
            );
        }
    }

    #[test]
    fn test_longer_payload_decodes() {
        let mut data = REFERENCE.to_vec();
        data.extend_from_slice(&[0u8; 19]);
        assert!(decode_continuity(&data).is_ok());
    }

    #[test]
    fn test_unknown_model_still_decodes() {
        let data = [0x07, 0x00, 0x00, 0x99, 0x30, 0x00, 0x00, 0x00];
        let t = decode_continuity(&data).unwrap();
        assert_eq!(t.model, "Unknown");
        assert_eq!(t.model_id, 0x3099);
        assert_eq!(t.model_id_hex, "0x3099");
    }

    #[test]
    fn test_battery_levels_are_tens_in_range() {
        for status in 0u8..=255 {
            for battery in [0x00u8, 0x5A, 0xA5, 0xFF, 0x37, 0xB1] {
                let t = decode_continuity(&payload(status, battery, 0)).unwrap();
                for level in [t.left_battery, t.right_battery, t.case_battery]
                    .into_iter()
                    .flatten()
                {
                    assert!(level <= 100 && level % 10 == 0, "bad level {level}");
                }
            }
        }
    }

    #[test]
    fn test_disconnected_nibble_is_unknown() {
        let t = decode_continuity(&payload(0xF0, 0xF8, 0)).unwrap();
        assert_eq!(t.case_battery, None);
        assert_eq!(t.left_battery, None);
        assert_eq!(t.right_battery, Some(80));

        let full = decode_continuity(&payload(0xA0, 0xAA, 0)).unwrap();
        assert_eq!(full.case_battery, Some(100));
        assert_eq!(full.left_battery, Some(100));
        assert_eq!(full.right_battery, Some(100));
    }

    #[test]
    fn test_both_in_case_all_combinations() {
        let cases = [
            (0x00, false, false, true),
            (0x01, false, true, false),
            (0x02, true, false, false),
            (0x03, true, true, false),
        ];
        for (lid, left, right, both) in cases {
            let t = decode_continuity(&payload(0, 0, lid)).unwrap();
            assert_eq!(t.left_in_ear, left);
            assert_eq!(t.right_in_ear, right);
            assert_eq!(t.both_in_case, both, "lid byte {lid:#04x}");
        }
    }

    #[test]
    fn test_charging_flags() {
        let t = decode_continuity(&payload(0x02, 0, 0)).unwrap();
        assert!(t.left_charging);
        assert!(!t.right_charging);
        assert!(!t.case_charging);
    }

    #[test]
    fn test_not_recognized_display() {
        assert_eq!(
            NotRecognized::TooShort { len: 3 }.to_string(),
            "payload too short: 3 bytes, need at least 8"
        );
        assert_eq!(
            NotRecognized::UnsupportedType(0x10).to_string(),
            "unsupported Continuity message type 0x10"
        );
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x07, 0xAB, 0x00]), "07ab00");
        assert_eq!(to_hex(&[]), "");
    }
}
