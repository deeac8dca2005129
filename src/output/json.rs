//! JSON report formatter.

use crate::output::OutputFormatter;
use crate::report::ScanReport;

/// Pretty-printed JSON, one report per invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFormatter;

impl OutputFormatter for JsonFormatter {
    fn format(&self, report: &ScanReport) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(report)
    }
}
