//! Core application runner for `airpods-listener`.
//!
//! This module is decoupled from CLI parsing and process exit codes so it can
//! be tested deterministically with an injected radio and output stream.

use crate::output::{self, Format};
use crate::report::ScanReport;
use crate::scanner::{Backend, Radio};
use crate::session::{ScanDuration, ScanPolicy, ScanSession};
use crate::watcher::{DEFAULT_BACKOFF, WatcherConfig, WatcherError};
use clap::Parser;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Command-line configuration.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// Scan duration in seconds (1-30). Out-of-range values fall back to 4.
    #[arg(short = 'd', long, value_name = "SECONDS", allow_negative_numbers = true)]
    pub duration: Option<i64>,

    /// Ultra-fast scan: 2 seconds, stop as soon as AirPods are seen
    #[arg(short, long)]
    pub fast: bool,

    /// Quick scan: 3 seconds, stop as soon as AirPods are seen
    #[arg(short, long)]
    pub quick: bool,

    /// Scan until AirPods are seen, for at most 30 seconds
    #[arg(short, long)]
    pub continuous: bool,

    /// Stop a fixed-duration scan early once AirPods are seen
    #[arg(long)]
    pub early_exit: bool,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Report format
    #[arg(long, default_value_t, value_enum)]
    pub format: Format,

    /// Ignore advertisements weaker than this many dBm
    #[arg(long, value_name = "DBM", allow_negative_numbers = true)]
    pub min_rssi: Option<i16>,

    /// Delay between scan restarts when the radio drops a scan.
    /// Accepts duration with suffix: 3s, 1m, 500ms, 2h.
    #[arg(long, value_parser = parse_duration, default_value = "3s")]
    pub backoff: Duration,

    /// Verbose output, log every advertisement and state change
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    /// Scan policy selected by the flags.
    ///
    /// `--continuous` wins over `--fast`, which wins over `--quick`; any of
    /// them overrides `--duration`.
    pub fn policy(&self) -> ScanPolicy {
        if self.continuous {
            return ScanPolicy::continuous();
        }
        if self.fast {
            return ScanPolicy::fast();
        }
        if self.quick {
            return ScanPolicy::quick();
        }

        let duration = self.duration.map(ScanDuration::clamped).unwrap_or_default();
        if self.early_exit {
            ScanPolicy::EarlyExit(duration)
        } else {
            ScanPolicy::Fixed(duration)
        }
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig::default()
            .with_backoff(self.backoff)
            .with_min_rssi(self.min_rssi)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            duration: None,
            fast: false,
            quick: false,
            continuous: false,
            early_exit: false,
            backend: Backend::default(),
            format: Format::default(),
            min_rssi: None,
            backoff: DEFAULT_BACKOFF,
            verbose: false,
        }
    }
}

/// Errors returned by the runner.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Failed to start BLE scan: {0}")]
    Watcher(#[from] WatcherError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Parse a duration from a human-readable string.
///
/// Accepts the suffixes `ms`, `s`, `m` and `h`; a bare number is seconds.
///
/// # Examples
/// ```
/// use airpods_listener::app::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();
    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    // `ms` must be tried before `m` and `s`.
    let units: [(&str, fn(u64) -> Duration); 4] = [
        ("ms", Duration::from_millis),
        ("h", |n| Duration::from_secs(n.saturating_mul(3600))),
        ("m", |n| Duration::from_secs(n.saturating_mul(60))),
        ("s", Duration::from_secs),
    ];
    let (number, to_duration) = units
        .iter()
        .find_map(|(suffix, to_duration)| {
            src.strip_suffix(suffix).map(|number| (number, *to_duration))
        })
        .unwrap_or((src, Duration::from_secs));

    number
        .trim()
        .parse::<u64>()
        .map(to_duration)
        .map_err(|_| format!("invalid duration: {src}"))
}

/// Run one scan and write its report to `out`.
///
/// A radio that cannot be started still produces a report, with
/// `status: "error"`, before the error is returned.
pub async fn run_with_io(
    options: &Options,
    radio: Arc<dyn Radio>,
    out: &mut dyn Write,
) -> Result<ScanReport, RunError> {
    let formatter = output::formatter(options.format);
    let session = ScanSession::new(radio, options.watcher_config(), options.policy());

    let (report, result) = match session.run().await {
        Ok(outcome) => (ScanReport::success(&outcome, SystemTime::now()), Ok(())),
        Err(e) => {
            let err = RunError::from(e);
            (ScanReport::error(err.to_string()), Err(err))
        }
    };

    writeln!(out, "{}", formatter.format(&report)?)?;
    result.map(|()| report)
}
