//! Advertisement watcher: radio lifecycle, auto-restart and event intake.
//!
//! The watcher owns one [`Radio`] and a single consumer task that drains the
//! radio's event channel. Advertisements carrying the configured company
//! identifier are decoded and written to the [`DeviceRegistry`]. Stop
//! notifications drive the lifecycle:
//!
//! ```text
//!          start              stop() / radio drop
//!   Idle ─────────▶ Running ─────────────────────▶ Stopping
//!    ▲                 ▲                             │  │
//!    │                 └──── restart after backoff ──┘  │
//!    └────────────── stop confirmed ────────────────────┘
//!                                 (Destroyed once shut down)
//! ```
//!
//! Radio stacks drop scans on their own now and then. When that happens
//! without a stop having been requested, the watcher waits until one
//! backoff interval has passed since the last start attempt and starts the
//! radio again, for as long as it takes. Any stop, start or shutdown
//! request cancels a pending wait.

use crate::continuity::{APPLE_COMPANY_ID, decode_continuity, to_hex};
use crate::registry::DeviceRegistry;
use crate::scanner::{
    EVENT_CHANNEL_BUFFER_SIZE, EventSink, Radio, RadioEvent, RawAdvertisement, ScanError,
    SessionEvent, StopReason,
};
use crate::telemetry::format_battery;
use log::{debug, error, info, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Delay between the last start attempt and an automatic restart.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(3);

/// How long shutdown waits for the radio to confirm it stopped.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle state of an [`AdvertisementWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Running,
    Stopping,
    Destroyed,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatcherState::Idle => write!(f, "idle"),
            WatcherState::Running => write!(f, "running"),
            WatcherState::Stopping => write!(f, "stopping"),
            WatcherState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Errors returned by watcher operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WatcherError {
    #[error(transparent)]
    Radio(#[from] ScanError),
    #[error("cannot {op} a watcher that is {state}")]
    InvalidTransition {
        op: &'static str,
        state: WatcherState,
    },
}

/// Tunables for an [`AdvertisementWatcher`].
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherConfig {
    /// Company identifier whose manufacturer data is decoded
    pub company_id: u16,
    /// Minimum time between start attempts when restarting automatically
    pub backoff: Duration,
    /// Upper bound on how long shutdown waits for stop confirmation
    pub teardown_timeout: Duration,
    /// Advertisements weaker than this (dBm) are ignored
    pub min_rssi: Option<i16>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            company_id: APPLE_COMPANY_ID,
            backoff: DEFAULT_BACKOFF,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            min_rssi: None,
        }
    }
}

impl WatcherConfig {
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn with_min_rssi(mut self, min_rssi: Option<i16>) -> Self {
        self.min_rssi = min_rssi;
        self
    }
}

#[derive(Debug)]
struct Lifecycle {
    state: WatcherState,
    /// Session number of the scan the radio accepted last
    session: u64,
    /// Highest session number handed to the radio so far
    issued: u64,
    last_start: Option<Instant>,
    stop_requested: bool,
    destroying: bool,
}

/// Per-advertisement processing step run by the consumer.
type IngestFn = fn(&Shared, &RawAdvertisement);

struct Shared {
    radio: Arc<dyn Radio>,
    ingest: IngestFn,
    registry: Arc<DeviceRegistry>,
    config: WatcherConfig,
    lifecycle: Mutex<Lifecycle>,
    state_tx: watch::Sender<WatcherState>,
    events_tx: mpsc::Sender<SessionEvent>,
}

/// Keeps a radio scanning and feeds what it hears into a registry.
pub struct AdvertisementWatcher {
    shared: Arc<Shared>,
    consumer: JoinHandle<()>,
}

impl AdvertisementWatcher {
    /// Create an idle watcher.
    ///
    /// Spawns the event consumer task, so this must be called from within a
    /// Tokio runtime.
    pub fn new(
        radio: Arc<dyn Radio>,
        registry: Arc<DeviceRegistry>,
        config: WatcherConfig,
    ) -> Self {
        Self::with_ingest(radio, registry, config, Shared::ingest)
    }

    fn with_ingest(
        radio: Arc<dyn Radio>,
        registry: Arc<DeviceRegistry>,
        config: WatcherConfig,
        ingest: IngestFn,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
        let (state_tx, _) = watch::channel(WatcherState::Idle);
        let shared = Arc::new(Shared {
            radio,
            ingest,
            registry,
            config,
            lifecycle: Mutex::new(Lifecycle {
                state: WatcherState::Idle,
                session: 0,
                issued: 0,
                last_start: None,
                stop_requested: false,
                destroying: false,
            }),
            state_tx,
            events_tx,
        });
        let consumer = tokio::spawn(Arc::clone(&shared).consume(events_rx));
        Self { shared, consumer }
    }

    pub fn state(&self) -> WatcherState {
        *self.shared.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<WatcherState> {
        self.shared.state_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Start the radio. Valid from `Idle` or `Stopping`.
    ///
    /// # Errors
    /// Returns [`WatcherError::Radio`] if the radio refuses to start, in
    /// which case the state is left unchanged.
    pub async fn start(&self) -> Result<(), WatcherError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let state = lifecycle.state;
        match state {
            WatcherState::Idle | WatcherState::Stopping => {
                self.shared.start_locked(&mut lifecycle).await
            }
            state => Err(WatcherError::InvalidTransition { op: "start", state }),
        }
    }

    /// Stop the radio. Valid from `Running`, or from `Stopping` while an
    /// automatic restart is pending.
    ///
    /// Returns once the radio accepted the request; the state reaches `Idle`
    /// when the radio confirms.
    pub async fn stop(&self) -> Result<(), WatcherError> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        self.shared.stop_locked(&mut lifecycle).await
    }

    /// Wait up to `within` for the watcher to reach `target`.
    pub async fn wait_until(&self, target: WatcherState, within: Duration) -> bool {
        let mut state_rx = self.shared.state_tx.subscribe();
        matches!(
            tokio::time::timeout(within, state_rx.wait_for(|state| *state == target)).await,
            Ok(Ok(_))
        )
    }

    /// Stop the radio and tear the watcher down.
    ///
    /// Waits at most [`WatcherConfig::teardown_timeout`] for the radio to
    /// confirm the stop; after that the watcher is destroyed regardless.
    pub async fn shutdown(self) {
        {
            let mut lifecycle = self.shared.lifecycle.lock().await;
            lifecycle.destroying = true;
            let state = lifecycle.state;
            match state {
                WatcherState::Idle => self.shared.set_state(&mut lifecycle, WatcherState::Destroyed),
                WatcherState::Running | WatcherState::Stopping if !lifecycle.stop_requested => {
                    if let Err(e) = self.shared.stop_locked(&mut lifecycle).await {
                        warn!("Stop during shutdown failed: {e}");
                    }
                }
                _ => {}
            }
        }

        let timeout = self.shared.config.teardown_timeout;
        if !self.wait_until(WatcherState::Destroyed, timeout).await {
            warn!("Radio did not confirm stop within {timeout:?}, shutting down anyway");
            let mut lifecycle = self.shared.lifecycle.lock().await;
            self.shared.set_state(&mut lifecycle, WatcherState::Destroyed);
        }
        debug!("Advertisement watcher destroyed");
    }
}

impl Drop for AdvertisementWatcher {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

impl Shared {
    fn set_state(&self, lifecycle: &mut MutexGuard<'_, Lifecycle>, state: WatcherState) {
        if lifecycle.state != state {
            debug!("Watcher state {} -> {}", lifecycle.state, state);
        }
        lifecycle.state = state;
        self.state_tx.send_replace(state);
    }

    async fn start_locked(
        &self,
        lifecycle: &mut MutexGuard<'_, Lifecycle>,
    ) -> Result<(), WatcherError> {
        lifecycle.issued += 1;
        let session = lifecycle.issued;
        lifecycle.last_start = Some(Instant::now());
        let sink = EventSink::new(session, self.events_tx.clone());

        // A scan that is still stopping keeps its session until this one
        // is accepted, so its confirmation is not mistaken for a stale one.
        match self.radio.start(sink).await {
            Ok(()) => {
                lifecycle.session = session;
                lifecycle.stop_requested = false;
                self.set_state(lifecycle, WatcherState::Running);
                info!("Bluetooth advertisement watcher started");
                Ok(())
            }
            Err(e) => {
                error!("Starting advertisement watcher failed: {e}");
                Err(e.into())
            }
        }
    }

    async fn stop_locked(
        &self,
        lifecycle: &mut MutexGuard<'_, Lifecycle>,
    ) -> Result<(), WatcherError> {
        let state = lifecycle.state;
        match state {
            WatcherState::Running => {
                lifecycle.stop_requested = true;
                self.set_state(lifecycle, WatcherState::Stopping);
                match self.radio.stop().await {
                    Ok(()) => {
                        info!("Bluetooth advertisement watcher stop requested");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Stopping advertisement watcher failed: {e}");
                        Err(e.into())
                    }
                }
            }
            // A restart is pending and the radio is already down.
            WatcherState::Stopping if !lifecycle.stop_requested => {
                lifecycle.stop_requested = true;
                let next = self.settled_state(lifecycle);
                self.set_state(lifecycle, next);
                Ok(())
            }
            state => Err(WatcherError::InvalidTransition { op: "stop", state }),
        }
    }

    fn settled_state(&self, lifecycle: &Lifecycle) -> WatcherState {
        if lifecycle.destroying {
            WatcherState::Destroyed
        } else {
            WatcherState::Idle
        }
    }

    async fn consume(self: Arc<Self>, mut events: mpsc::Receiver<SessionEvent>) {
        while let Some((session, event)) = events.recv().await {
            match event {
                RadioEvent::Advertisement(advertisement) => {
                    self.handle_advertisement(&advertisement)
                }
                RadioEvent::Stopped(reason) => self.handle_stopped(session, reason).await,
            }
        }
    }

    fn handle_advertisement(&self, advertisement: &RawAdvertisement) {
        let ingest = self.ingest;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| ingest(self, advertisement)));
        if outcome.is_err() {
            error!(
                "Dropped advertisement from {} after an internal fault",
                advertisement.address
            );
        }
    }

    fn ingest(&self, advertisement: &RawAdvertisement) {
        let Some(payload) = advertisement.manufacturer_data.get(&self.config.company_id) else {
            return;
        };
        if let Some(min_rssi) = self.config.min_rssi
            && advertisement.rssi < min_rssi
        {
            debug!(
                "Ignoring {} at {} dBm (below {} dBm)",
                advertisement.address, advertisement.rssi, min_rssi
            );
            return;
        }

        let telemetry = match decode_continuity(payload) {
            Ok(telemetry) => {
                info!(
                    "AirPods detected: {} - Left:{} Right:{} Case:{}",
                    telemetry.model,
                    format_battery(telemetry.left_battery),
                    format_battery(telemetry.right_battery),
                    format_battery(telemetry.case_battery)
                );
                Some(telemetry)
            }
            Err(reason) => {
                debug!(
                    "Apple device {} detected: {} ({reason})",
                    advertisement.address,
                    to_hex(payload)
                );
                None
            }
        };
        self.registry.upsert(advertisement, payload, telemetry);
    }

    async fn handle_stopped(&self, session: u64, reason: StopReason) {
        let mut lifecycle = self.lifecycle.lock().await;
        if session != lifecycle.session {
            debug!("Ignoring stop notification from earlier scan session {session}");
            return;
        }
        info!("BLE advertisement scan stopped ({reason:?})");

        let state = lifecycle.state;
        match state {
            WatcherState::Stopping if lifecycle.stop_requested => {
                let next = self.settled_state(&lifecycle);
                self.set_state(&mut lifecycle, next);
            }
            WatcherState::Running => {
                warn!(
                    "Scan stopped without a request, restarting within {:?}",
                    self.config.backoff
                );
                self.set_state(&mut lifecycle, WatcherState::Stopping);
                drop(lifecycle);
                self.restart_after_backoff().await;
            }
            _ => {}
        }
    }

    /// Restart the radio once the backoff has elapsed, retrying until it
    /// starts or someone else changes the state.
    async fn restart_after_backoff(&self) {
        let mut state_rx = self.state_tx.subscribe();
        loop {
            let deadline = {
                let lifecycle = self.lifecycle.lock().await;
                if !restart_pending(&lifecycle) {
                    return;
                }
                lifecycle
                    .last_start
                    .map_or_else(Instant::now, |started| started + self.config.backoff)
            };

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = state_rx.wait_for(|state| *state != WatcherState::Stopping) => {
                    debug!("Restart backoff cancelled");
                    return;
                }
            }

            let mut lifecycle = self.lifecycle.lock().await;
            if !restart_pending(&lifecycle) {
                return;
            }
            if self.start_locked(&mut lifecycle).await.is_ok() {
                return;
            }
        }
    }
}

fn restart_pending(lifecycle: &Lifecycle) -> bool {
    lifecycle.state == WatcherState::Stopping && !lifecycle.stop_requested && !lifecycle.destroying
}
