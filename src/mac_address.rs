//! Bluetooth device address type.
//!
//! Radio stacks hand out addresses in different shapes: BlueZ uses a 6-byte
//! array, the HCI wire format is little-endian, and the report consumer wants
//! both the 48-bit integer and a 12-digit lowercase hex id. [`MacAddress`]
//! is the one representation the rest of the crate works with.

use std::fmt;

/// Largest value a 48-bit Bluetooth address can hold.
pub const MAX_ADDRESS: u64 = 0xFFFF_FFFF_FFFF;

/// A Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from its 48-bit integer form.
    ///
    /// Bits above the low 48 are ignored.
    pub fn from_u64(value: u64) -> Self {
        let bytes = (value & MAX_ADDRESS).to_be_bytes();
        let mut addr = [0u8; 6];
        addr.copy_from_slice(&bytes[2..]);
        Self(addr)
    }

    /// The address as a 48-bit integer.
    pub fn as_u64(&self) -> u64 {
        self.0
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte))
    }

    /// Twelve lowercase hex digits without separators, e.g. `a1b2c3d4e5f6`.
    pub fn device_id(&self) -> String {
        format!("{:012x}", self.as_u64())
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}
