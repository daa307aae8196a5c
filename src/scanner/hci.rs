//! Raw HCI socket backend for Tilt scanning.
//!
//! This backend uses raw Linux HCI sockets to scan for BLE advertisements
//! without requiring the BlueZ daemon. It requires CAP_NET_RAW and
//! CAP_NET_ADMIN capabilities or root privileges.
//!
//! Scan windows run as a blocking poll/read loop on tokio's blocking thread
//! pool, so a slow or stuck driver never stalls the async runtime.

use super::{
    APPLE_COMPANY_ID, Advertisement, EVENT_CHANNEL_BUFFER_SIZE, MANUFACTURER_DATA_TYPE, ScanError,
    ScanEvent, ScanHandle, StartScanFuture,
};
use libc::{AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_RAW, c_int, c_void, sockaddr, socklen_t};
use log::{debug, warn};
use std::future::Future;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

// HCI protocol constants
const BTPROTO_HCI: c_int = 1;
const HCI_FILTER: c_int = 2;

// HCI packet types
const HCI_EVENT_PKT: u8 = 0x04;

// HCI events
const EVT_LE_META_EVENT: u8 = 0x3E;

// LE Meta event sub-events
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// HCI commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan types
const LE_SCAN_PASSIVE: u8 = 0x00;

// Own address type
const LE_PUBLIC_ADDRESS: u8 = 0x00;

// Filter policy
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

/// HCI device the backend binds to (hci0).
const HCI_DEV_ID: u16 = 0;

/// Longest single poll, so a dropped receiver is noticed quickly.
const POLL_SLICE: Duration = Duration::from_millis(250);

/// HCI socket address structure
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// HCI filter structure for raw sockets
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    fn new() -> Self {
        Self {
            type_mask: 0,
            event_mask: [0, 0],
            opcode: 0,
        }
    }

    fn set_ptype(&mut self, ptype: u8) {
        self.type_mask |= 1 << (ptype as u32);
    }

    fn set_event(&mut self, event: u8) {
        let bit = event as usize;
        self.event_mask[bit / 32] |= 1 << (bit % 32);
    }
}

/// LE Set Scan Parameters command
#[repr(C, packed)]
struct LeSetScanParametersCmd {
    scan_type: u8,
    interval: u16,
    window: u16,
    own_address_type: u8,
    filter_policy: u8,
}

/// Create an HCI command packet
fn hci_command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = Vec::with_capacity(4 + params.len());
    packet.push(0x01); // HCI command packet type
    packet.push((opcode & 0xFF) as u8);
    packet.push((opcode >> 8) as u8);
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    packet
}

/// Open a raw HCI socket
fn open_hci_socket() -> io::Result<OwnedFd> {
    // SOCK_NONBLOCK so a read after a spurious poll wakeup never hangs
    let fd = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            SOCK_RAW | SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            BTPROTO_HCI,
        )
    };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Bind HCI socket to a device
fn bind_hci_socket(fd: &OwnedFd, dev_id: u16) -> io::Result<()> {
    let addr = SockaddrHci {
        hci_family: AF_BLUETOOTH as u16,
        hci_dev: dev_id,
        hci_channel: 0, // HCI_CHANNEL_RAW
    };

    let ret = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &addr as *const SockaddrHci as *const sockaddr,
            mem::size_of::<SockaddrHci>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Only deliver LE meta events to the socket
fn set_hci_filter(fd: &OwnedFd) -> io::Result<()> {
    let mut filter = HciFilter::new();
    filter.set_ptype(HCI_EVENT_PKT);
    filter.set_event(EVT_LE_META_EVENT);

    let ret = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            0, // SOL_HCI
            HCI_FILTER,
            &filter as *const HciFilter as *const c_void,
            mem::size_of::<HciFilter>() as socklen_t,
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Send an HCI command
fn send_hci_command(fd: &OwnedFd, packet: &[u8]) -> io::Result<()> {
    let ret = unsafe {
        libc::write(
            fd.as_raw_fd(),
            packet.as_ptr() as *const c_void,
            packet.len(),
        )
    };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Build the LE Set Scan Enable command
fn scan_enable_packet(enable: bool) -> Vec<u8> {
    // enable, filter_dup (0: report every advertisement)
    hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[u8::from(enable), 0x00])
}

/// Configure passive LE scanning and turn it on
fn configure_le_scan(fd: &OwnedFd) -> io::Result<()> {
    // Set scan parameters: passive scan, 10ms interval, 10ms window
    let params = LeSetScanParametersCmd {
        scan_type: LE_SCAN_PASSIVE,
        interval: 0x0010, // 10ms in 0.625ms units
        window: 0x0010,   // 10ms in 0.625ms units
        own_address_type: LE_PUBLIC_ADDRESS,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };

    let params_bytes = unsafe {
        std::slice::from_raw_parts(
            &params as *const LeSetScanParametersCmd as *const u8,
            mem::size_of::<LeSetScanParametersCmd>(),
        )
    };

    let packet = hci_command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_PARAMETERS, params_bytes);
    send_hci_command(fd, &packet)?;
    send_hci_command(fd, &scan_enable_packet(true))
}

/// Parse an HCI LE advertising report event into an iBeacon advertisement.
///
/// Only the first report of the event is looked at. Reports are parsed as a
/// self-contained record: header, address, data length, AD structures, RSSI.
fn parse_advertising_report(data: &[u8]) -> Option<Advertisement> {
    // Skip HCI header (1 byte packet type + 1 byte event code + 1 byte param len + 1 byte subevent)
    let report = data.get(4..)?;

    // Number of reports
    if *report.first()? == 0 {
        return None;
    }

    // num_reports(1) + event_type(1) + addr_type(1) + address(6)
    let data_len = *report.get(9)? as usize;
    let ad_data = report.get(10..10 + data_len)?;
    let rssi = *report.get(10 + data_len)? as i8;

    // Walk AD structures looking for Apple manufacturer data
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[offset + 1];
        if ad_type == MANUFACTURER_DATA_TYPE && len >= 3 {
            let field = &ad_data[offset + 2..offset + 1 + len];
            let company_id = u16::from_le_bytes([field[0], field[1]]);

            if company_id == APPLE_COMPANY_ID {
                return Some(Advertisement {
                    payload: field.to_vec(),
                    rssi: i16::from(rssi),
                });
            }
        }

        offset += 1 + len;
    }

    None
}

/// Whether an HCI packet is an LE advertising report event
fn is_advertising_report(packet: &[u8]) -> bool {
    packet.len() >= 4
        && packet[0] == HCI_EVENT_PKT
        && packet[1] == EVT_LE_META_EVENT
        && packet[3] == EVT_LE_ADVERTISING_REPORT
}

/// Read HCI events until `window` has passed or the receiver is dropped.
///
/// Runs on a blocking thread.
fn scan_window(fd: &OwnedFd, window: Duration, tx: &mpsc::Sender<ScanEvent>) {
    let deadline = Instant::now() + window;
    let mut buf = [0u8; 258]; // Max HCI event size

    while !tx.is_closed() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }

        let mut pollfd = libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = remaining.min(POLL_SLICE).as_millis() as c_int;
        let ready = unsafe { libc::poll(&mut pollfd, 1, timeout) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            let _ = tx.blocking_send(ScanEvent::Interrupted(ScanError::Transient(err.to_string())));
            return;
        }
        if ready == 0 {
            continue;
        }

        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) {
                continue;
            }
            let _ = tx.blocking_send(ScanEvent::Interrupted(ScanError::Transient(err.to_string())));
            return;
        }

        let packet = &buf[..n as usize];
        if is_advertising_report(packet)
            && let Some(advertisement) = parse_advertising_report(packet)
            && tx
                .blocking_send(ScanEvent::Advertisement(advertisement))
                .is_err()
        {
            return;
        }
    }
}

/// An opened HCI device with LE scanning enabled.
pub struct HciScanner {
    event_fd: Arc<OwnedFd>,
    cmd_fd: OwnedFd,
}

impl HciScanner {
    /// Open hci0, install the event filter and enable passive LE scanning.
    pub fn open() -> Result<Self, ScanError> {
        let adapter_error = |what: &str, e: io::Error| ScanError::Adapter(format!("{what}: {e}"));

        // Socket for receiving advertising events
        let event_fd =
            open_hci_socket().map_err(|e| adapter_error("Failed to create HCI socket", e))?;
        bind_hci_socket(&event_fd, HCI_DEV_ID)
            .map_err(|e| adapter_error("Failed to bind HCI socket", e))?;
        set_hci_filter(&event_fd).map_err(|e| adapter_error("Failed to set HCI filter", e))?;

        // Separate socket for sending commands
        let cmd_fd =
            open_hci_socket().map_err(|e| adapter_error("Failed to create HCI socket", e))?;
        bind_hci_socket(&cmd_fd, HCI_DEV_ID)
            .map_err(|e| adapter_error("Failed to bind HCI socket", e))?;
        configure_le_scan(&cmd_fd).map_err(|e| adapter_error("Failed to enable LE scan", e))?;

        debug!("Enabled passive LE scan on hci{HCI_DEV_ID}");

        Ok(Self {
            event_fd: Arc::new(event_fd),
            cmd_fd,
        })
    }
}

impl ScanHandle for HciScanner {
    fn start_scan(&mut self, window: Duration) -> StartScanFuture<'_> {
        let fd = Arc::clone(&self.event_fd);
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            tokio::task::spawn_blocking(move || scan_window(&fd, window, &tx));
            Ok(rx)
        })
    }

    fn stop(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            match send_hci_command(&self.cmd_fd, &scan_enable_packet(false)) {
                Ok(()) => debug!("Disabled LE scan on hci{HCI_DEV_ID}"),
                Err(e) => warn!("Failed to disable LE scan: {e}"),
            }
        })
    }
}
