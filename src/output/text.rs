//! Human-readable report formatter.

use crate::output::OutputFormatter;
use crate::report::{DeviceReport, ScanReport};
use crate::telemetry::{Telemetry, format_battery};
use std::fmt::Write;

/// One line per device followed by a summary line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextFormatter;

fn battery_with_charging(level: Option<u8>, charging: bool) -> String {
    let mut rendered = format_battery(level);
    if charging {
        rendered.push('+');
    }
    rendered
}

fn placement(telemetry: &Telemetry) -> &'static str {
    match (telemetry.left_in_ear, telemetry.right_in_ear) {
        (true, true) => "both in ear",
        (true, false) => "left in ear",
        (false, true) => "right in ear",
        (false, false) => "in case",
    }
}

fn device_line(device: &DeviceReport) -> String {
    let mut line = format!("{}  {:>4} dBm  ", device.mac, device.rssi);
    match &device.airpods_data {
        Some(t) => {
            // Writing to a String cannot fail.
            let _ = write!(
                line,
                "{} ({})  L:{} R:{} Case:{}  {}",
                t.model,
                t.model_id_hex,
                battery_with_charging(t.left_battery, t.left_charging),
                battery_with_charging(t.right_battery, t.right_charging),
                battery_with_charging(t.case_battery, t.case_charging),
                placement(t),
            );
            if t.lid_open {
                line.push_str(", lid open");
            }
        }
        None => {
            let _ = write!(line, "Apple device {}", device.manufacturer_data_hex);
        }
    }
    line
}

impl OutputFormatter for TextFormatter {
    fn format(&self, report: &ScanReport) -> Result<String, serde_json::Error> {
        if let Some(error) = &report.error {
            return Ok(format!("error: {error}"));
        }

        let mut lines: Vec<String> = report.devices.iter().map(device_line).collect();
        lines.push(format!(
            "{} device(s) seen, {} with AirPods telemetry",
            report.total_devices, report.airpods_count
        ));
        Ok(lines.join("\n"))
    }
}
