//! Output formatters for scan reports.
//!
//! This module provides a trait for rendering a [`ScanReport`] and the two
//! formats the binary offers: pretty JSON for scripts and a short
//! human-readable summary.

pub mod json;
pub mod text;

use crate::report::ScanReport;

pub use json::JsonFormatter;
pub use text::TextFormatter;

/// Selectable output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    /// Pretty-printed JSON report
    #[default]
    Json,
    /// One line per device plus a summary
    Text,
}

/// Trait for formatting scan reports into output strings.
pub trait OutputFormatter: Send + Sync {
    /// Format a report.
    ///
    /// # Arguments
    /// * `report` - The report to render
    ///
    /// # Returns
    /// The formatted report, without a trailing newline
    ///
    /// # Errors
    /// Returns an error if the report cannot be serialized
    fn format(&self, report: &ScanReport) -> Result<String, serde_json::Error>;
}

/// Formatter for the given output format.
pub fn formatter(format: Format) -> Box<dyn OutputFormatter> {
    match format {
        Format::Json => Box::new(JsonFormatter),
        Format::Text => Box::new(TextFormatter),
    }
}
