use crate::continuity::APPLE_COMPANY_ID;
use crate::mac_address::MacAddress;
use crate::scanner::{EventSink, Radio, RadioFuture, RawAdvertisement, ScanError, StopReason};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Proximity-pairing payload for AirPods Pro 2 (left 90%, right 60%, case 50%).
pub const AIRPODS_PAYLOAD: [u8; 8] = [0x07, 0x00, 0x00, 0x14, 0x20, 0x55, 0x96, 0x05];

/// An Apple payload that is not a headset status message (Nearby Info).
pub const PHONE_PAYLOAD: [u8; 8] = [0x10, 0x05, 0x1B, 0x1C, 0x0A, 0x3B, 0x7E, 0x00];

/// Build an advertisement carrying `payload` under Apple's company identifier.
pub fn advertisement(mac: MacAddress, rssi: i16, payload: &[u8]) -> RawAdvertisement {
    let mut manufacturer_data = HashMap::new();
    manufacturer_data.insert(APPLE_COMPANY_ID, payload.to_vec());
    RawAdvertisement {
        address: mac,
        rssi,
        observed_at: SystemTime::now(),
        manufacturer_data,
    }
}

#[derive(Debug, Default)]
struct FakeState {
    sink: Option<EventSink>,
    start_results: VecDeque<Result<(), ScanError>>,
    start_calls: usize,
    stop_calls: usize,
    silent_stop: bool,
}

/// A radio whose behaviour is scripted by the test.
///
/// Starts succeed unless a failure was queued with [`FakeRadio::fail_next_start`].
/// Stops are confirmed on the sink right away unless
/// [`FakeRadio::set_silent_stop`] turned that off.
#[derive(Debug, Default)]
pub struct FakeRadio {
    state: Mutex<FakeState>,
}

impl FakeRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_start(&self, message: &str) {
        self.state
            .lock()
            .unwrap()
            .start_results
            .push_back(Err(ScanError::Bluetooth(message.to_string())));
    }

    pub fn set_silent_stop(&self, silent: bool) {
        self.state.lock().unwrap().silent_stop = silent;
    }

    pub fn start_calls(&self) -> usize {
        self.state.lock().unwrap().start_calls
    }

    pub fn stop_calls(&self) -> usize {
        self.state.lock().unwrap().stop_calls
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn current_sink(&self) -> Option<EventSink> {
        self.state.lock().unwrap().sink.clone()
    }

    /// Deliver an advertisement on the running scan, if any.
    pub async fn emit(&self, advertisement: RawAdvertisement) -> bool {
        let sink = self.state.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.advertisement(advertisement).await,
            None => false,
        }
    }

    /// Drop the running scan without being asked to, like a flaky driver.
    pub fn drop_scan(&self) {
        if let Some(sink) = self.state.lock().unwrap().sink.take() {
            sink.stopped(StopReason::StreamEnded);
        }
    }
}

impl Radio for FakeRadio {
    fn start(&self, sink: EventSink) -> RadioFuture<'_> {
        let mut state = self.state.lock().unwrap();
        state.start_calls += 1;
        let result = state.start_results.pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            state.sink = Some(sink);
        }
        Box::pin(async move { result })
    }

    fn stop(&self) -> RadioFuture<'_> {
        let mut state = self.state.lock().unwrap();
        state.stop_calls += 1;
        let sink = state.sink.take();
        if !state.silent_stop
            && let Some(sink) = sink
        {
            sink.stopped(StopReason::Requested);
        }
        Box::pin(async { Ok(()) })
    }
}
