//! Serializable scan report.
//!
//! The field names and value encodings here are consumed by existing
//! tooling, so they stay stable: the timestamp and the address are strings,
//! a device without telemetry carries `airpods_data: null`.

use crate::continuity::to_hex;
use crate::mac_address::MacAddress;
use crate::registry::DeviceRecord;
use crate::session::ScanOutcome;
use crate::telemetry::Telemetry;
use serde_derive::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Report format version.
pub const SCANNER_VERSION: &str = "5.0";

pub const REPORT_NOTE: &str = "AirPods listener - passive BLE advertisement capture";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// One device in a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceReport {
    #[serde(skip)]
    pub mac: MacAddress,
    /// Address as 12 lowercase hex digits
    pub device_id: String,
    /// Address as a decimal 48-bit integer
    pub address: String,
    pub rssi: i16,
    pub manufacturer_data_hex: String,
    pub airpods_data: Option<Telemetry>,
}

impl From<&DeviceRecord> for DeviceReport {
    fn from(record: &DeviceRecord) -> Self {
        DeviceReport {
            mac: record.address,
            device_id: record.address.device_id(),
            address: record.address.as_u64().to_string(),
            rssi: record.rssi,
            manufacturer_data_hex: to_hex(&record.manufacturer_data),
            airpods_data: record.telemetry.clone(),
        }
    }
}

/// Result of one scan, ready for output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub scanner_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_timestamp: Option<String>,
    pub total_devices: usize,
    pub devices: Vec<DeviceReport>,
    pub airpods_count: usize,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<&'static str>,
}

impl ScanReport {
    /// Report for a completed scan, stamped with `at`.
    pub fn success(outcome: &ScanOutcome, at: SystemTime) -> Self {
        let devices: Vec<DeviceReport> = outcome.devices.iter().map(DeviceReport::from).collect();
        let airpods_count = devices.iter().filter(|d| d.airpods_data.is_some()).count();
        let timestamp = at
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs())
            .unwrap_or_default();

        ScanReport {
            scanner_version: SCANNER_VERSION,
            scan_timestamp: Some(timestamp.to_string()),
            total_devices: devices.len(),
            devices,
            airpods_count,
            status: ReportStatus::Success,
            error: None,
            note: Some(REPORT_NOTE),
        }
    }

    /// Report for a scan that could not run.
    pub fn error(message: impl Into<String>) -> Self {
        ScanReport {
            scanner_version: SCANNER_VERSION,
            scan_timestamp: None,
            total_devices: 0,
            devices: Vec::new(),
            airpods_count: 0,
            status: ReportStatus::Error,
            error: Some(message.into()),
            note: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }
}
