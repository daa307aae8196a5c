//! BlueZ D-Bus backend for Tilt scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! Each scan window registers an advertisement monitor matching the iBeacon
//! prefix and drops it again when the window ends, so every Tilt in range is
//! reported afresh in every window.

use super::{
    APPLE_COMPANY_ID, Advertisement, EVENT_CHANNEL_BUFFER_SIZE, IBEACON_PREFIX,
    MANUFACTURER_DATA_TYPE, ScanError, ScanEvent, ScanHandle, StartScanFuture,
};
use bluer::monitor::{Monitor, MonitorEvent, MonitorHandle, MonitorManager, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use log::{debug, info};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;

/// An opened BlueZ adapter.
pub struct BluerScanner {
    _session: Session,
    adapter: Adapter,
    monitor_manager: MonitorManager,
}

impl BluerScanner {
    /// Connect to BlueZ, power on the default adapter and prepare monitoring.
    pub async fn open() -> Result<Self, ScanError> {
        let adapter_error = |e: bluer::Error| ScanError::Adapter(e.to_string());

        let session = Session::new().await.map_err(adapter_error)?;
        let adapter = session.default_adapter().await.map_err(adapter_error)?;
        adapter.set_powered(true).await.map_err(adapter_error)?;
        let monitor_manager = adapter.monitor().await.map_err(adapter_error)?;

        info!("Using Bluetooth adapter {}", adapter.name());

        Ok(Self {
            _session: session,
            adapter,
            monitor_manager,
        })
    }
}

impl ScanHandle for BluerScanner {
    fn start_scan(&mut self, window: Duration) -> StartScanFuture<'_> {
        Box::pin(async move {
            // Create a pattern to filter for iBeacon manufacturer data
            let pattern = Pattern {
                data_type: MANUFACTURER_DATA_TYPE,
                start_position: 0,
                content: IBEACON_PREFIX.to_vec(),
            };

            let monitor_handle = self
                .monitor_manager
                .register(Monitor {
                    patterns: Some(vec![pattern]),
                    ..Default::default()
                })
                .await
                .map_err(|e| ScanError::Transient(e.to_string()))?;

            let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER_SIZE);
            let adapter = self.adapter.clone();

            // The task owns the monitor handle; dropping it at the end of the
            // window unregisters the monitor.
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(window) => {}
                    _ = tx.closed() => {}
                    _ = forward_events(&adapter, monitor_handle, &tx) => {}
                }
            });

            Ok(rx)
        })
    }

    fn stop(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            debug!("Releasing Bluetooth adapter {}", self.adapter.name());
        })
    }
}

/// Forward found devices until the monitor stream ends or the receiver is gone.
async fn forward_events(
    adapter: &Adapter,
    mut monitor_handle: MonitorHandle,
    tx: &mpsc::Sender<ScanEvent>,
) {
    while let Some(event) = monitor_handle.next().await {
        if let MonitorEvent::DeviceFound(device_id) = event {
            match read_advertisement(adapter, device_id.device).await {
                Ok(Some(advertisement)) => {
                    if tx.send(ScanEvent::Advertisement(advertisement)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                // The device may have gone out of range between the event and the lookup
                Err(e) => debug!("Cannot read device {}: {e}", device_id.device),
            }
        }
    }

    let _ = tx
        .send(ScanEvent::Interrupted(ScanError::Transient(
            "advertisement monitor closed".to_string(),
        )))
        .await;
}

/// Read the Apple manufacturer field and RSSI of a discovered device.
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> bluer::Result<Option<Advertisement>> {
    let device = adapter.device(address)?;

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(None);
    };
    if !manufacturer_data.contains_key(&APPLE_COMPANY_ID) {
        return Ok(None);
    }

    let rssi = device.rssi().await?;
    Ok(apple_advertisement(&manufacturer_data, rssi))
}

/// Build an advertisement from the Apple manufacturer field.
///
/// BlueZ may not know the signal strength of a device yet; such a sighting is
/// skipped rather than reported with a made-up RSSI.
fn apple_advertisement(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    rssi: Option<i16>,
) -> Option<Advertisement> {
    let data = manufacturer_data.get(&APPLE_COMPANY_ID)?;
    Some(Advertisement {
        payload: manufacturer_field(data),
        rssi: rssi?,
    })
}

/// Rebuild the complete manufacturer field; BlueZ strips the company ID.
fn manufacturer_field(data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + data.len());
    payload.extend_from_slice(&APPLE_COMPANY_ID.to_le_bytes());
    payload.extend_from_slice(data);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::colour::DeviceColour;
    use crate::decoder::decode_tilt_data;
    use crate::test_utils::tilt_payload;

    #[test]
    fn test_manufacturer_field_prepends_company_id() {
        let payload = manufacturer_field(&[0x02, 0x15, 0xAA]);
        assert_eq!(payload, vec![0x4C, 0x00, 0x02, 0x15, 0xAA]);
        assert!(payload.starts_with(&IBEACON_PREFIX));
    }

    #[test]
    fn test_apple_advertisement() {
        let full = tilt_payload(DeviceColour::Yellow, 61, 1008);
        let data = HashMap::from([(APPLE_COMPANY_ID, full[2..].to_vec())]);

        let advertisement = apple_advertisement(&data, Some(-68)).unwrap();
        assert_eq!(advertisement.payload, full);
        assert_eq!(advertisement.rssi, -68);
    }

    #[test]
    fn test_apple_advertisement_requires_rssi() {
        let full = tilt_payload(DeviceColour::Yellow, 61, 1008);
        let data = HashMap::from([(APPLE_COMPANY_ID, full[2..].to_vec())]);

        assert_eq!(apple_advertisement(&data, None), None);
    }

    #[test]
    fn test_apple_advertisement_other_company() {
        let data = HashMap::from([(0x0499, vec![0x05, 0x12, 0xFC])]);
        assert_eq!(apple_advertisement(&data, Some(-50)), None);
    }

    #[test]
    fn test_manufacturer_field_decodes() {
        // BlueZ reports the field without the company ID
        let full = tilt_payload(DeviceColour::Orange, 65, 1012);
        let payload = manufacturer_field(&full[2..]);

        let reading = decode_tilt_data(&payload, -77).unwrap();
        assert_eq!(reading.colour, DeviceColour::Orange);
        assert_eq!(reading.raw_temp_f, 65);
        assert_eq!(reading.raw_sg, 1.012);
    }
}
