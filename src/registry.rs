//! Latest state per observed device.
//!
//! The registry is written by the watcher's event loop and read by the scan
//! session and the report builder, possibly from different threads. Every
//! operation takes the lock once and never across an `.await`.

use crate::mac_address::MacAddress;
use crate::scanner::RawAdvertisement;
use crate::telemetry::Telemetry;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::SystemTime;

/// What we last heard from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub address: MacAddress,
    /// Signal strength of the latest advertisement in dBm
    pub rssi: i16,
    pub last_seen: SystemTime,
    /// Apple manufacturer data of the latest advertisement
    pub manufacturer_data: Vec<u8>,
    pub telemetry: Option<Telemetry>,
}

impl DeviceRecord {
    pub fn has_telemetry(&self) -> bool {
        self.telemetry.is_some()
    }
}

#[derive(Debug, Default)]
struct Records {
    /// Records in first-observed order
    ordered: Vec<DeviceRecord>,
    index: HashMap<MacAddress, usize>,
}

/// Thread-safe map from address to [`DeviceRecord`], last write wins.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    records: RwLock<Records>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `advertisement.address`.
    ///
    /// # Arguments
    /// * `advertisement` - The advertisement the record is built from
    /// * `payload` - The manufacturer data that was decoded
    /// * `telemetry` - Decoded telemetry, `None` when the payload was not recognized
    pub fn upsert(
        &self,
        advertisement: &RawAdvertisement,
        payload: &[u8],
        telemetry: Option<Telemetry>,
    ) {
        let record = DeviceRecord {
            address: advertisement.address,
            rssi: advertisement.rssi,
            last_seen: advertisement.observed_at,
            manufacturer_data: payload.to_vec(),
            telemetry,
        };

        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match records.index.get(&record.address) {
            Some(&slot) => records.ordered[slot] = record,
            None => {
                let slot = records.ordered.len();
                records.index.insert(record.address, slot);
                records.ordered.push(record);
            }
        }
    }

    /// Copy of every record, in the order devices were first observed.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .clone()
    }

    /// Whether any record satisfies `predicate`.
    pub fn contains_matching<F>(&self, predicate: F) -> bool
    where
        F: Fn(&DeviceRecord) -> bool,
    {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .iter()
            .any(predicate)
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ordered
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
