//! Heart Rate Device
//!
//! Top-level wrapper for one BLE peripheral implementing the heart-rate
//! profile: the three declared services, connection-status propagation and
//! the discovery/matching entry points. A device is constructed by
//! discovery, initialized once and permanently retired by [`close`]; there
//! is no re-initialize path, reconnecting means discovering a new device.
//!
//! [`close`]: HeartRateDevice::close

use crate::domain::models::ConnectionStatus;
use crate::infrastructure::bluetooth::service::{
    BatteryService, BleService, DeviceInformationService, HeartRateService,
};
use crate::infrastructure::bluetooth::uuid::resolve_uuid;
use crate::infrastructure::events::EventSource;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCommunicationStatus;
use windows::Devices::Bluetooth::{
    BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Enumeration::DeviceInformation;
use windows::Foundation::TypedEventHandler;

/// 16-bit ids of the services a peripheral must advertise to count as a
/// heart-rate device: Heart Rate, Device Information, Battery.
pub const REQUIRED_SERVICES: [&str; 3] = ["180D", "180A", "180F"];

struct DeviceState {
    device_info: Option<DeviceInformation>,
    le_device: Option<BluetoothLEDevice>,
    status_token: Option<i64>,
}

pub struct HeartRateDevice {
    pub heart_rate: HeartRateService,
    pub device_information: DeviceInformationService,
    pub battery: BatteryService,
    state: Mutex<DeviceState>,
    connection_changed: EventSource<ConnectionStatus>,
}

impl HeartRateDevice {
    fn new(device_info: DeviceInformation, le_device: BluetoothLEDevice) -> Self {
        Self {
            heart_rate: HeartRateService::new(),
            device_information: DeviceInformationService::new(),
            battery: BatteryService::new(),
            state: Mutex::new(DeviceState {
                device_info: Some(device_info),
                le_device: Some(le_device),
                status_token: None,
            }),
            connection_changed: EventSource::new(),
        }
    }

    fn services(&self) -> [&BleService; 3] {
        [
            &self.heart_rate.service,
            &self.device_information.service,
            &self.battery.service,
        ]
    }

    pub fn name(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .device_info
            .as_ref()
            .and_then(|info| info.Name().ok())
            .map(|name| name.to_string())
    }

    pub fn device_id(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .device_info
            .as_ref()
            .and_then(|info| info.Id().ok())
            .map(|id| id.to_string())
    }

    pub fn bluetooth_address(&self) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .le_device
            .as_ref()
            .and_then(|device| device.BluetoothAddress().ok())
    }

    /// Current connection status; a closed device reads as disconnected.
    pub fn connection_status(&self) -> ConnectionStatus {
        let status = self
            .state
            .lock()
            .unwrap()
            .le_device
            .as_ref()
            .and_then(|device| device.ConnectionStatus().ok());
        match status {
            Some(BluetoothConnectionStatus::Connected) => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status() == ConnectionStatus::Connected
    }

    /// Connection-status transitions, one event per underlying change.
    pub fn connection_changed(&self) -> &EventSource<ConnectionStatus> {
        &self.connection_changed
    }

    /// Emits a connection-status event carrying the current status without
    /// waiting for a real transition. Lets consumers bootstrap their state
    /// right after subscribing.
    pub fn notify_connection_status(&self) {
        self.connection_changed.emit(&self.connection_status());
    }

    /// Initializes every service in declaration order, then starts watching
    /// the transport's connection status.
    async fn initialize(&self) -> windows::core::Result<()> {
        let Some(le_device) = self.le_device() else {
            return Ok(());
        };

        for service in self.services() {
            service.initialize(&le_device).await;
        }

        let source = self.connection_changed.clone();
        let handler = TypedEventHandler::new(
            move |sender: windows::core::Ref<BluetoothLEDevice>, _: windows::core::Ref<windows::core::IInspectable>| {
                if let Some(device) = sender.as_ref() {
                    let status = match device.ConnectionStatus() {
                        Ok(BluetoothConnectionStatus::Connected) => ConnectionStatus::Connected,
                        _ => ConnectionStatus::Disconnected,
                    };
                    source.emit(&status);
                }
                Ok(())
            },
        );
        let token = le_device.ConnectionStatusChanged(&handler)?;
        self.state.lock().unwrap().status_token = Some(token);
        Ok(())
    }

    /// Closes all services, releases the transport handle and clears the
    /// device identity. The object is unusable afterwards.
    pub async fn close(&self) {
        for service in self.services() {
            service.close().await;
        }

        let (le_device, token) = {
            let mut state = self.state.lock().unwrap();
            state.device_info = None;
            (state.le_device.take(), state.status_token.take())
        };

        if let Some(device) = le_device {
            if let Some(token) = token {
                let _ = device.RemoveConnectionStatusChanged(token);
            }
            let _ = device.Close();
        }
    }

    fn le_device(&self) -> Option<BluetoothLEDevice> {
        self.state.lock().unwrap().le_device.clone()
    }

    /// Finds every peripheral matching the heart-rate profile. Peripherals
    /// that cannot be opened are skipped; matches are initialized before
    /// being returned.
    pub async fn find_all() -> anyhow::Result<Vec<HeartRateDevice>> {
        let selector = BluetoothLEDevice::GetDeviceSelector()?;
        let candidates = DeviceInformation::FindAllAsyncAqsFilter(&selector)?.await?;
        let mut matching = Vec::new();

        for index in 0..candidates.Size()? {
            let device_info = candidates.GetAt(index)?;
            let id = device_info.Id()?;

            let le_device = match open_device(&id).await {
                Some(device) => device,
                None => {
                    debug!(id = %id, "could not open peripheral, skipping");
                    continue;
                }
            };

            let advertised = match advertised_service_uuids(&le_device, BluetoothCacheMode::Cached)
                .await
            {
                Ok(uuids) => uuids,
                Err(error) => {
                    debug!(id = %id, %error, "service enumeration failed, skipping");
                    continue;
                }
            };
            if !has_required_services(&advertised) {
                continue;
            }

            let device = HeartRateDevice::new(device_info, le_device);
            if let Err(error) = device.initialize().await {
                warn!(id = %id, %error, "device initialization failed, skipping");
                continue;
            }
            info!(name = ?device.name(), "found heart rate device");
            matching.push(device);
        }

        Ok(matching)
    }

    /// First peripheral matching the heart-rate profile, if any.
    pub async fn find_first() -> anyhow::Result<Option<HeartRateDevice>> {
        let mut all = Self::find_all().await?;
        if all.is_empty() {
            return Ok(None);
        }
        let first = all.remove(0);
        // The remaining matches are not handed out; release them.
        for device in all {
            device.close().await;
        }
        Ok(Some(first))
    }

    /// Case-insensitive exact-name lookup among matching peripherals.
    pub async fn find_by_name(device_name: &str) -> anyhow::Result<Option<HeartRateDevice>> {
        let all = Self::find_all().await?;
        let mut found = None;
        for device in all {
            if found.is_none()
                && device
                    .name()
                    .is_some_and(|name| name.eq_ignore_ascii_case(device_name))
            {
                found = Some(device);
            } else {
                device.close().await;
            }
        }
        Ok(found)
    }
}

async fn open_device(id: &windows::core::HSTRING) -> Option<BluetoothLEDevice> {
    match BluetoothLEDevice::FromIdAsync(id) {
        Ok(operation) => operation.await.ok(),
        Err(_) => None,
    }
}

/// Enumerates the UUIDs of a peripheral's GATT services.
pub(crate) async fn advertised_service_uuids(
    device: &BluetoothLEDevice,
    cache_mode: BluetoothCacheMode,
) -> windows::core::Result<Vec<GUID>> {
    let result = device.GetGattServicesWithCacheModeAsync(cache_mode)?.await?;
    if result.Status()? != GattCommunicationStatus::Success {
        return Ok(Vec::new());
    }
    let services = result.Services()?;
    let mut uuids = Vec::with_capacity(services.Size()? as usize);
    for index in 0..services.Size()? {
        uuids.push(services.GetAt(index)?.Uuid()?);
    }
    Ok(uuids)
}

/// A peripheral matches the heart-rate profile iff every required service is
/// present among its advertised services.
pub(crate) fn has_required_services(advertised: &[GUID]) -> bool {
    REQUIRED_SERVICES
        .iter()
        .all(|required| advertised.contains(&resolve_uuid(required)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_required_services_must_be_present() {
        let heart_rate = resolve_uuid("180D");
        let device_information = resolve_uuid("180A");
        let battery = resolve_uuid("180F");
        let extra = resolve_uuid("1800");

        assert!(has_required_services(&[
            heart_rate,
            device_information,
            battery
        ]));
        assert!(has_required_services(&[
            extra,
            battery,
            heart_rate,
            device_information
        ]));

        // Missing Device Information is a rejection, whatever else is there.
        assert!(!has_required_services(&[heart_rate, battery, extra]));
        assert!(!has_required_services(&[]));
    }
}
