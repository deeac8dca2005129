//! Bounded observation windows.
//!
//! A [`ScanSession`] starts a watcher, keeps it running for as long as its
//! [`ScanPolicy`] says, stops it and hands back what the registry saw. The
//! session only ever reads the registry; decoding happens in the watcher.

use crate::registry::{DeviceRecord, DeviceRegistry};
use crate::scanner::Radio;
use crate::watcher::{AdvertisementWatcher, WatcherConfig, WatcherError, WatcherState};
use log::{info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Scan length used when none, or an out-of-range one, is given.
pub const DEFAULT_SCAN_SECS: u64 = 4;
pub const MIN_SCAN_SECS: u64 = 1;
pub const MAX_SCAN_SECS: u64 = 30;

/// `--fast`: 2 second scan with early exit.
pub const FAST_SCAN_SECS: u64 = 2;
/// `--quick`: 3 second scan with early exit.
pub const QUICK_SCAN_SECS: u64 = 3;
/// Safety ceiling for continuous scans.
pub const CONTINUOUS_CEILING_SECS: u64 = MAX_SCAN_SECS;

pub const EARLY_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const UNTIL_FOUND_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Time allowed for the radio's stop confirmation before the final snapshot.
pub const STOP_SETTLE_DELAY: Duration = Duration::from_millis(100);

/// A scan length in whole seconds, always within
/// [`MIN_SCAN_SECS`]..=[`MAX_SCAN_SECS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanDuration(u64);

impl ScanDuration {
    /// Accept `secs` if it is in range, otherwise fall back to the default.
    ///
    /// ```
    /// use airpods_listener::session::ScanDuration;
    ///
    /// assert_eq!(ScanDuration::clamped(10).secs(), 10);
    /// assert_eq!(ScanDuration::clamped(0).secs(), 4);
    /// assert_eq!(ScanDuration::clamped(120).secs(), 4);
    /// ```
    pub fn clamped(secs: i64) -> Self {
        match u64::try_from(secs) {
            Ok(secs) if (MIN_SCAN_SECS..=MAX_SCAN_SECS).contains(&secs) => Self(secs),
            _ => Self::default(),
        }
    }

    pub fn secs(&self) -> u64 {
        self.0
    }

    pub fn as_duration(&self) -> Duration {
        Duration::from_secs(self.0)
    }
}

impl Default for ScanDuration {
    fn default() -> Self {
        Self(DEFAULT_SCAN_SECS)
    }
}

impl fmt::Display for ScanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.0)
    }
}

/// How long a session listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPolicy {
    /// Listen for the whole duration.
    Fixed(ScanDuration),
    /// Listen for up to the duration, checking every 500 ms for telemetry.
    EarlyExit(ScanDuration),
    /// Listen until telemetry shows up, checking every 200 ms, giving up at
    /// the ceiling.
    UntilFound(ScanDuration),
}

impl ScanPolicy {
    /// `--continuous`: until found, with the 30 second ceiling.
    pub fn continuous() -> Self {
        ScanPolicy::UntilFound(ScanDuration(CONTINUOUS_CEILING_SECS))
    }

    pub fn fast() -> Self {
        ScanPolicy::EarlyExit(ScanDuration(FAST_SCAN_SECS))
    }

    pub fn quick() -> Self {
        ScanPolicy::EarlyExit(ScanDuration(QUICK_SCAN_SECS))
    }
}

impl Default for ScanPolicy {
    fn default() -> Self {
        ScanPolicy::Fixed(ScanDuration::default())
    }
}

/// What a finished session observed.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Every device seen, in first-observed order
    pub devices: Vec<DeviceRecord>,
    /// Whether any device produced telemetry
    pub telemetry_found: bool,
    /// Time spent listening
    pub elapsed: Duration,
}

/// One bounded scan.
pub struct ScanSession {
    watcher: AdvertisementWatcher,
    policy: ScanPolicy,
}

impl ScanSession {
    /// Create a session with its own registry and watcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(radio: Arc<dyn Radio>, config: WatcherConfig, policy: ScanPolicy) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        Self::with_watcher(AdvertisementWatcher::new(radio, registry, config), policy)
    }

    pub fn with_watcher(watcher: AdvertisementWatcher, policy: ScanPolicy) -> Self {
        Self { watcher, policy }
    }

    /// Run the session to completion.
    ///
    /// # Errors
    /// Returns the watcher's error if the radio could not be started. Nothing
    /// is observed in that case.
    pub async fn run(self) -> Result<ScanOutcome, WatcherError> {
        let ScanSession { watcher, policy } = self;
        let registry = Arc::clone(watcher.registry());

        if let Err(e) = watcher.start().await {
            watcher.shutdown().await;
            return Err(e);
        }

        let began = Instant::now();
        let telemetry_found = match policy {
            ScanPolicy::Fixed(duration) => {
                info!("Scanning for {} seconds...", duration.secs());
                tokio::time::sleep(duration.as_duration()).await;
                registry.contains_matching(DeviceRecord::has_telemetry)
            }
            ScanPolicy::EarlyExit(duration) => {
                info!("Scanning for up to {} seconds...", duration.secs());
                poll_for_telemetry(&registry, EARLY_EXIT_POLL_INTERVAL, duration).await
            }
            ScanPolicy::UntilFound(ceiling) => {
                info!(
                    "Scanning continuously until AirPods are found (max {} seconds)...",
                    ceiling.secs()
                );
                poll_for_telemetry(&registry, UNTIL_FOUND_POLL_INTERVAL, ceiling).await
            }
        };
        let elapsed = began.elapsed();

        if let Err(e) = watcher.stop().await {
            warn!("Stopping scan failed: {e}");
        }
        watcher.wait_until(WatcherState::Idle, STOP_SETTLE_DELAY).await;

        let devices = registry.snapshot();
        watcher.shutdown().await;

        Ok(ScanOutcome {
            devices,
            telemetry_found,
            elapsed,
        })
    }
}

/// Check the registry every `interval` until telemetry appears or `limit`
/// worth of checks have passed.
async fn poll_for_telemetry(
    registry: &DeviceRegistry,
    interval: Duration,
    limit: ScanDuration,
) -> bool {
    let checks = limit.as_duration().as_millis() / interval.as_millis().max(1);
    for check in 1..=checks {
        tokio::time::sleep(interval).await;
        if registry.contains_matching(DeviceRecord::has_telemetry) {
            let waited = interval.as_secs_f64() * check as f64;
            info!("AirPods found after {waited:.1} seconds, stopping scan");
            return true;
        }
    }
    info!("No AirPods found within {} seconds", limit.secs());
    false
}
