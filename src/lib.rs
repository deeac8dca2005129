//! `airpods-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, logging setup and
//! process exit codes. The pieces it drives live here: a radio abstraction in
//! [`crate::scanner`], the Continuity decoder, the device registry, the
//! self-restarting [`AdvertisementWatcher`] and the bounded [`ScanSession`].
//! [`crate::app`] ties them together so a whole run can be tested with an
//! injected radio and output stream.

pub mod app;
pub mod continuity;
pub mod mac_address;
pub mod output;
pub mod registry;
pub mod report;
pub mod scanner;
pub mod session;
pub mod telemetry;
pub mod watcher;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use continuity::{APPLE_COMPANY_ID, NotRecognized, decode_continuity};
pub use mac_address::MacAddress;
pub use output::{Format, JsonFormatter, OutputFormatter, TextFormatter};
pub use registry::{DeviceRecord, DeviceRegistry};
pub use report::ScanReport;
pub use scanner::{
    Backend, EventSink, Radio, RadioEvent, RadioFuture, RawAdvertisement, ScanError, StopReason,
};
pub use session::{ScanDuration, ScanOutcome, ScanPolicy, ScanSession};
pub use telemetry::{Ear, Telemetry};
pub use watcher::{AdvertisementWatcher, WatcherConfig, WatcherError, WatcherState};
