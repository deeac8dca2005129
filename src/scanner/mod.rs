//! Radio backends that deliver raw BLE advertisements.
//!
//! Every backend implements [`Radio`]: it is started with an [`EventSink`]
//! and pushes [`RadioEvent`]s into it from its own task until it is stopped
//! or the underlying stack gives up. The watcher on the other end never
//! sees backend types, only [`RawAdvertisement`] values.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for radio operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

/// Channel buffer size between a radio backend and the watcher.
pub const EVENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// RSSI reported when the controller has no reading (HCI uses 127).
pub const RSSI_UNAVAILABLE: i16 = 127;

/// One received advertisement, as reported by the radio.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAdvertisement {
    pub address: MacAddress,
    /// Received signal strength in dBm
    pub rssi: i16,
    pub observed_at: SystemTime,
    /// Manufacturer-specific data keyed by company identifier, prefix stripped
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Why a radio stopped delivering advertisements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The watcher asked for it.
    Requested,
    /// The backend's event stream ended on its own.
    StreamEnded,
    /// The backend hit an error and abandoned the scan.
    Fault(String),
}

/// Events a radio pushes to the watcher.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    Advertisement(RawAdvertisement),
    Stopped(StopReason),
}

/// A radio event tagged with the scan session that produced it.
pub type SessionEvent = (u64, RadioEvent);

/// Sending half handed to a radio on each start.
///
/// Each start gets a new session number, which lets the watcher tell a late
/// stop notification from an earlier scan apart from one for the scan that
/// is running now.
#[derive(Debug, Clone)]
pub struct EventSink {
    session: u64,
    tx: mpsc::Sender<SessionEvent>,
}

impl EventSink {
    pub fn new(session: u64, tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    /// Deliver an advertisement, waiting for channel capacity.
    ///
    /// Returns `false` once the watcher has gone away.
    pub async fn advertisement(&self, advertisement: RawAdvertisement) -> bool {
        self.tx
            .send((self.session, RadioEvent::Advertisement(advertisement)))
            .await
            .is_ok()
    }

    /// Report that scanning ceased.
    ///
    /// Never waits: a stop notification is sent from inside [`Radio::stop`],
    /// where blocking on a full channel could deadlock against the watcher.
    pub fn stopped(&self, reason: StopReason) -> bool {
        match self.tx.try_send((self.session, RadioEvent::Stopped(reason))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let _ = tx.send(event).await;
                });
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Future returned by [`Radio`] operations.
pub type RadioFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + 'a>>;

/// A source of BLE advertisements that can be started and stopped.
///
/// Implementations deliver events from their own tasks and must not wait on
/// `sink` capacity inside `start` or `stop` themselves.
pub trait Radio: Send + Sync {
    /// Begin scanning, delivering events into `sink` until stopped.
    fn start(&self, sink: EventSink) -> RadioFuture<'_>;

    /// Stop scanning. A successful stop is confirmed with
    /// [`StopReason::Requested`] on the sink of the running scan.
    fn stop(&self) -> RadioFuture<'_>;
}

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" => Ok(Backend::Bluer),
            #[cfg(feature = "hci")]
            "hci" | "raw" => Ok(Backend::Hci),
            _ => Err(ScanError::BackendNotAvailable(s.to_string())),
        }
    }
}

/// Open the radio for the given backend.
///
/// Nothing touches the adapter until the radio is started.
pub fn open_radio(backend: Backend) -> Arc<dyn Radio> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Arc::new(bluer::BluerRadio::new()),
        #[cfg(feature = "hci")]
        Backend::Hci => Arc::new(hci::HciRadio::new(hci::DEFAULT_DEVICE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TEST_MAC, advertisement};
    use std::str::FromStr;

    #[test]
    fn test_scan_error_display() {
        let err = ScanError::Bluetooth("adapter not found".to_string());
        assert_eq!(format!("{}", err), "Bluetooth error: adapter not found");

        let err = ScanError::BackendNotAvailable("winrt".to_string());
        assert_eq!(
            format!("{}", err),
            "Backend 'winrt' not available (not compiled in)"
        );
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!(Backend::from_str("bluer").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("BlueZ").unwrap(), Backend::Bluer);
        assert_eq!(Backend::from_str("hci").unwrap(), Backend::Hci);
        assert_eq!(Backend::from_str("raw").unwrap(), Backend::Hci);
        assert!(Backend::from_str("invalid").is_err());
    }

    #[test]
    fn test_backend_display() {
        assert_eq!(format!("{}", Backend::Bluer), "bluer");
        assert_eq!(format!("{}", Backend::Hci), "hci");
    }

    #[tokio::test]
    async fn test_event_sink_tags_session() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(7, tx);

        assert!(sink.advertisement(advertisement(TEST_MAC, -40, &[])).await);
        assert!(sink.stopped(StopReason::StreamEnded));

        let (session, event) = rx.recv().await.unwrap();
        assert_eq!(session, 7);
        assert!(matches!(event, RadioEvent::Advertisement(_)));
        assert_eq!(
            rx.recv().await.unwrap(),
            (7, RadioEvent::Stopped(StopReason::StreamEnded))
        );
    }

    #[tokio::test]
    async fn test_event_sink_stopped_when_full_is_delivered_later() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(1, tx);
        assert!(sink.advertisement(advertisement(TEST_MAC, -40, &[])).await);

        assert!(sink.stopped(StopReason::Requested));

        assert!(matches!(
            rx.recv().await,
            Some((1, RadioEvent::Advertisement(_)))
        ));
        assert_eq!(
            rx.recv().await,
            Some((1, RadioEvent::Stopped(StopReason::Requested)))
        );
    }

    #[tokio::test]
    async fn test_event_sink_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(1, tx);
        assert!(!sink.stopped(StopReason::Requested));
        assert!(!sink.advertisement(advertisement(TEST_MAC, -40, &[])).await);
    }
}
