//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to register an advertisement monitor
//! with the BlueZ daemon, matching Apple manufacturer data. It requires the
//! `bluetoothd` daemon to be running.

use super::{
    EventSink, MANUFACTURER_DATA_TYPE, RSSI_UNAVAILABLE, Radio, RadioFuture, RawAdvertisement,
    ScanError, StopReason,
};
use crate::continuity::APPLE_COMPANY_ID;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Session};
use futures::{Stream, StreamExt};
use log::{debug, info};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::task::JoinHandle;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

struct ScanTask {
    handle: JoinHandle<()>,
    sink: EventSink,
}

/// Radio backed by a BlueZ advertisement monitor.
///
/// Each start opens a fresh D-Bus session and monitor; the monitor lives in
/// a spawned task until it is stopped or BlueZ ends the event stream.
#[derive(Default)]
pub struct BluerRadio {
    running: Mutex<Option<ScanTask>>,
}

impl BluerRadio {
    pub fn new() -> Self {
        Self::default()
    }

    fn replace_task(&self, task: Option<ScanTask>) -> Option<ScanTask> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *running, task)
    }
}

impl Radio for BluerRadio {
    fn start(&self, sink: EventSink) -> RadioFuture<'_> {
        Box::pin(async move {
            let handle = spawn_monitor(sink.clone()).await?;
            if let Some(previous) = self.replace_task(Some(ScanTask { handle, sink })) {
                previous.handle.abort();
            }
            Ok(())
        })
    }

    fn stop(&self) -> RadioFuture<'_> {
        Box::pin(async move {
            if let Some(task) = self.replace_task(None) {
                // Dropping the task drops the monitor, which unregisters it.
                task.handle.abort();
                task.sink.stopped(StopReason::Requested);
            }
            Ok(())
        })
    }
}

/// Monitor pattern matching manufacturer data that starts with Apple's
/// company identifier.
fn apple_pattern() -> Pattern {
    Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: APPLE_COMPANY_ID.to_le_bytes().to_vec(),
    }
}

/// Power the default adapter, register the monitor and spawn the task that
/// forwards what it finds into `sink`.
async fn spawn_monitor(sink: EventSink) -> Result<JoinHandle<()>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![apple_pattern()]),
            ..Default::default()
        })
        .await?;
    info!("BlueZ advertisement monitor registered on {}", adapter.name());

    // The task owns all Bluetooth state so it stays alive as long as the scan.
    Ok(tokio::spawn(async move {
        let _session = session;
        let _monitor_manager = monitor_manager;

        let reason = forward_events(&adapter, &mut monitor_handle, &sink).await;
        sink.stopped(reason);
    }))
}

async fn forward_events<S>(adapter: &Adapter, events: &mut S, sink: &EventSink) -> StopReason
where
    S: Stream<Item = MonitorEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        let MonitorEvent::DeviceFound(device_id) = event else {
            continue;
        };
        match read_advertisement(adapter, device_id.device).await {
            Ok(Some(advertisement)) => {
                if !sink.advertisement(advertisement).await {
                    return StopReason::Requested;
                }
            }
            Ok(None) => {}
            Err(e) => debug!("Reading {} failed: {e}", device_id.device),
        }
    }
    StopReason::StreamEnded
}

/// Read the current RSSI and manufacturer data BlueZ holds for `address`.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<RawAdvertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };
    let rssi = device.rssi().await?.unwrap_or(RSSI_UNAVAILABLE);

    Ok(Some(RawAdvertisement {
        address: address.into(),
        rssi,
        observed_at: SystemTime::now(),
        manufacturer_data,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac_address::MacAddress;

    #[test]
    fn test_address_to_mac_address() {
        let addr = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mac: MacAddress = addr.into();
        assert_eq!(mac, MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }

    #[test]
    fn test_apple_pattern() {
        let pattern = apple_pattern();
        assert_eq!(pattern.data_type, 0xff);
        assert_eq!(pattern.start_position, 0);
        assert_eq!(pattern.content, vec![0x4c, 0x00]);
    }

    #[test]
    fn test_stop_without_start_is_a_no_op() {
        let radio = BluerRadio::new();
        tokio_test::assert_ok!(tokio_test::block_on(radio.stop()));
        assert!(radio.replace_task(None).is_none());
    }
}
