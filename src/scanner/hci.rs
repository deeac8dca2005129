//! Raw HCI socket backend.
//!
//! This backend drives a passive LE scan over raw Linux HCI sockets without
//! the BlueZ daemon. It requires CAP_NET_RAW and CAP_NET_ADMIN capabilities
//! or root privileges.

use super::{
    EventSink, MANUFACTURER_DATA_TYPE, Radio, RadioFuture, RawAdvertisement, ScanError,
    StopReason,
};
use crate::mac_address::MacAddress;
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;

/// First HCI controller (`hci0`).
pub const DEFAULT_DEVICE: u16 = 0;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// Packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// LE controller commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// Scan interval and window, in 0.625 ms units (10 ms).
const SCAN_INTERVAL: u16 = 0x0010;
const SCAN_WINDOW: u16 = 0x0010;

/// Largest HCI event: header plus 255 parameter bytes.
const MAX_EVENT_LEN: usize = 258;

/// Bytes per report before the AD data: event type, address type, address, length.
const REPORT_HEADER_LEN: usize = 9;

#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel-side filter for raw HCI sockets.
#[repr(C)]
#[derive(Debug, Default)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter passing only LE meta events.
    fn le_meta_events() -> Self {
        let mut filter = Self::default();
        filter.type_mask |= 1 << u32::from(HCI_EVENT_PKT);
        let bit = usize::from(EVT_LE_META_EVENT);
        filter.event_mask[bit / 32] |= 1 << (bit % 32);
        filter
    }
}

fn os_error(what: &str) -> ScanError {
    ScanError::Bluetooth(format!("{what}: {}", io::Error::last_os_error()))
}

/// A non-blocking raw HCI socket bound to one controller.
#[derive(Debug)]
struct HciSocket(OwnedFd);

impl HciSocket {
    fn open(device: u16) -> Result<Self, ScanError> {
        // SOCK_NONBLOCK is required for AsyncFd.
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(os_error("Failed to create HCI socket"));
        }
        let socket = HciSocket(unsafe { OwnedFd::from_raw_fd(fd) });

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: device,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                &addr as *const SockaddrHci as *const sockaddr,
                mem::size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error(&format!("Failed to bind HCI socket to hci{device}")));
        }
        Ok(socket)
    }

    fn set_filter(&self, filter: &HciFilter) -> Result<(), ScanError> {
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                filter as *const HciFilter as *const c_void,
                mem::size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to set HCI filter"));
        }
        Ok(())
    }

    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = command_packet(OGF_LE_CTL, ocf, params);
        let ret = unsafe {
            libc::write(
                self.as_raw_fd(),
                packet.as_ptr() as *const c_void,
                packet.len(),
            )
        };
        if ret < 0 {
            return Err(os_error("Failed to send HCI command"));
        }
        Ok(())
    }

    fn set_scan_enabled(&self, enabled: bool) -> Result<(), ScanError> {
        // Duplicates are kept so every advertisement refreshes the registry.
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[u8::from(enabled), 0x00])
    }

    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = unsafe { libc::read(self.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// Build an HCI command packet.
fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(HCI_COMMAND_PKT);
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Parameters of LE Set Scan Parameters for a passive scan.
fn scan_parameters() -> [u8; 7] {
    let [interval_lo, interval_hi] = SCAN_INTERVAL.to_le_bytes();
    let [window_lo, window_hi] = SCAN_WINDOW.to_le_bytes();
    [
        LE_SCAN_PASSIVE,
        interval_lo,
        interval_hi,
        window_lo,
        window_hi,
        LE_PUBLIC_ADDRESS,
        FILTER_POLICY_ACCEPT_ALL,
    ]
}

/// Collect every manufacturer-specific AD structure, keyed by company id.
fn manufacturer_data(ad_data: &[u8]) -> HashMap<u16, Vec<u8>> {
    let mut entries = HashMap::new();
    let mut offset = 0;
    while offset + 1 < ad_data.len() {
        let len = usize::from(ad_data[offset]);
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }
        let structure = &ad_data[offset + 1..offset + 1 + len];
        if structure[0] == MANUFACTURER_DATA_TYPE && structure.len() >= 3 {
            let company_id = u16::from_le_bytes([structure[1], structure[2]]);
            entries.insert(company_id, structure[3..].to_vec());
        }
        offset += 1 + len;
    }
    entries
}

/// Parse an LE Advertising Report event into advertisements.
///
/// Reports that are cut short end parsing; everything before them is kept.
fn parse_advertising_reports(packet: &[u8], observed_at: SystemTime) -> Vec<RawAdvertisement> {
    let mut advertisements = Vec::new();
    if packet.len() < 5
        || packet[0] != HCI_EVENT_PKT
        || packet[1] != EVT_LE_META_EVENT
        || packet[3] != EVT_LE_ADVERTISING_REPORT
    {
        return advertisements;
    }

    let num_reports = usize::from(packet[4]);
    let mut rest = &packet[5..];
    for _ in 0..num_reports {
        if rest.len() < REPORT_HEADER_LEN {
            break;
        }
        let data_len = usize::from(rest[8]);
        let Some(rssi) = rest.get(REPORT_HEADER_LEN + data_len) else {
            break;
        };

        // HCI transmits addresses least significant byte first.
        let mut address = [0u8; 6];
        address.copy_from_slice(&rest[2..8]);
        address.reverse();

        advertisements.push(RawAdvertisement {
            address: MacAddress(address),
            rssi: i16::from(*rssi as i8),
            observed_at,
            manufacturer_data: manufacturer_data(
                &rest[REPORT_HEADER_LEN..REPORT_HEADER_LEN + data_len],
            ),
        });
        rest = &rest[REPORT_HEADER_LEN + data_len + 1..];
    }
    advertisements
}

/// Read advertising reports until the socket fails or the watcher goes away.
async fn forward_reports(events: AsyncFd<HciSocket>, sink: &EventSink) -> StopReason {
    let mut buf = [0u8; MAX_EVENT_LEN];
    loop {
        let mut guard = match events.readable().await {
            Ok(guard) => guard,
            Err(e) => return StopReason::Fault(e.to_string()),
        };

        // Drain all available packets before waiting again.
        loop {
            let n = match guard.try_io(|inner| inner.get_ref().read_packet(&mut buf)) {
                Ok(Ok(0)) => return StopReason::StreamEnded,
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return StopReason::Fault(format!("HCI read failed: {e}")),
                Err(_would_block) => break,
            };

            for advertisement in parse_advertising_reports(&buf[..n], SystemTime::now()) {
                if advertisement.manufacturer_data.is_empty() {
                    continue;
                }
                if !sink.advertisement(advertisement).await {
                    return StopReason::Requested;
                }
            }
        }
    }
}

struct ScanTask {
    handle: JoinHandle<()>,
    sink: EventSink,
    command: HciSocket,
}

/// Radio reading LE advertising reports straight from an HCI controller.
pub struct HciRadio {
    device: u16,
    running: Mutex<Option<ScanTask>>,
}

impl HciRadio {
    pub fn new(device: u16) -> Self {
        Self {
            device,
            running: Mutex::new(None),
        }
    }

    fn replace_task(&self, task: Option<ScanTask>) -> Option<ScanTask> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *running, task)
    }

    fn open_scan(&self, sink: EventSink) -> Result<ScanTask, ScanError> {
        let events = HciSocket::open(self.device)?;
        events.set_filter(&HciFilter::le_meta_events())?;

        // Commands go out on their own socket bound to the same controller.
        let command = HciSocket::open(self.device)?;
        command.send_command(OCF_LE_SET_SCAN_PARAMETERS, &scan_parameters())?;
        command.set_scan_enabled(true)?;

        let events = AsyncFd::new(events)
            .map_err(|e| ScanError::Bluetooth(format!("Failed to create async fd: {e}")))?;
        info!("Passive LE scan enabled on hci{}", self.device);

        let task_sink = sink.clone();
        let handle = tokio::spawn(async move {
            let reason = forward_reports(events, &task_sink).await;
            if let StopReason::Fault(e) = &reason {
                warn!("HCI scan failed: {e}");
            }
            task_sink.stopped(reason);
        });
        Ok(ScanTask {
            handle,
            sink,
            command,
        })
    }
}

impl Radio for HciRadio {
    fn start(&self, sink: EventSink) -> RadioFuture<'_> {
        let result = self.open_scan(sink).map(|task| {
            if let Some(previous) = self.replace_task(Some(task)) {
                previous.handle.abort();
            }
        });
        Box::pin(async move { result })
    }

    fn stop(&self) -> RadioFuture<'_> {
        let result = match self.replace_task(None) {
            Some(task) => {
                let disabled = task.command.set_scan_enabled(false);
                task.handle.abort();
                task.sink.stopped(StopReason::Requested);
                if let Err(e) = &disabled {
                    debug!("Disabling LE scan on hci{} failed: {e}", self.device);
                }
                disabled
            }
            None => Ok(()),
        };
        Box::pin(async move { result })
    }
}
