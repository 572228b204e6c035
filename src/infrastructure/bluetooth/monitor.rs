//! Heart Rate Monitor Facade
//!
//! Composes one [`HeartRateDevice`] with the heart-rate and battery codecs
//! into the application-level protocol: connect (by name or first match),
//! subscribe to rate and connection events, read device information,
//! disconnect. Failure to find a device is reported in the connect result,
//! never raised.

use crate::domain::models::{
    ConnectedDevice, ConnectionStatus, ConnectionStatusChanged, DeviceInfo, RateChanged,
};
use crate::infrastructure::bluetooth::device::HeartRateDevice;
use crate::infrastructure::bluetooth::parser::{
    read_as_string, BatteryLevelCodec, HeartRateMeasurementCodec, ValueParser,
};
use crate::infrastructure::events::EventSource;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::{info, warn};
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCommunicationStatus;

const NO_DEVICE_MESSAGE: &str = "Could not find any heart rate device";

pub struct HeartRateMonitor {
    device: Mutex<Option<HeartRateDevice>>,
    heart_rate_parser: ValueParser<HeartRateMeasurementCodec>,
    battery_parser: ValueParser<BatteryLevelCodec>,
    rate_changed: EventSource<RateChanged>,
    connection_changed: EventSource<ConnectionStatusChanged>,
    // The rate handler outlives a single connection's device, so it must be
    // detached explicitly on disconnect.
    rate_handler: StdMutex<Option<u64>>,
}

impl HeartRateMonitor {
    pub fn new() -> Self {
        Self {
            device: Mutex::new(None),
            heart_rate_parser: ValueParser::new(HeartRateMeasurementCodec),
            battery_parser: ValueParser::new(BatteryLevelCodec),
            rate_changed: EventSource::new(),
            connection_changed: EventSource::new(),
            rate_handler: StdMutex::new(None),
        }
    }

    /// Decoded heart-rate notifications of the connected device.
    pub fn rate_changed(&self) -> &EventSource<RateChanged> {
        &self.rate_changed
    }

    /// Connection-status changes, including the synthesized initial event
    /// emitted by a successful connect.
    pub fn connection_changed(&self) -> &EventSource<ConnectionStatusChanged> {
        &self.connection_changed
    }

    /// Connects to the named device, or to the first compatible device when
    /// `device_name` is empty. When nothing matches, the result carries
    /// `is_connected == false` and an error message; no error is raised.
    pub async fn connect(&self, device_name: &str) -> anyhow::Result<ConnectedDevice> {
        // Repeated connects must not stack registrations or leak devices.
        self.disconnect().await;

        let found = if device_name.is_empty() {
            HeartRateDevice::find_first().await?
        } else {
            HeartRateDevice::find_by_name(device_name).await?
        };
        let Some(device) = found else {
            warn!(device_name, "no compatible heart rate device found");
            return Ok(ConnectedDevice {
                name: String::new(),
                is_connected: false,
                error_message: Some(NO_DEVICE_MESSAGE.to_string()),
            });
        };

        let connection_source = self.connection_changed.clone();
        device.connection_changed().attach(move |status| {
            connection_source.emit(&ConnectionStatusChanged {
                is_connected: *status == ConnectionStatus::Connected,
            });
        });

        self.heart_rate_parser
            .bind(Arc::clone(&device.heart_rate.measurement))
            .await;
        let rate_source = self.rate_changed.clone();
        let rate_handler = self.heart_rate_parser.value_changed().attach(move |value| {
            rate_source.emit(&RateChanged {
                beats_per_minute: *value,
            });
        });
        *self.rate_handler.lock().unwrap() = Some(rate_handler);

        self.battery_parser
            .bind(Arc::clone(&device.battery.level))
            .await;

        // Give subscribers the initial status without waiting for a real
        // transition.
        device.notify_connection_status();

        let result = ConnectedDevice {
            name: device.name().unwrap_or_default(),
            is_connected: device.is_connected(),
            error_message: None,
        };
        info!(name = %result.name, connected = result.is_connected, "connected");

        *self.device.lock().await = Some(device);
        Ok(result)
    }

    /// Closes the current device, cascading through service and
    /// characteristic shutdown. Safe to call when not connected.
    pub async fn disconnect(&self) {
        self.heart_rate_parser.unbind().await;
        self.battery_parser.unbind().await;

        let rate_handler = self.rate_handler.lock().unwrap().take();
        if let Some(handler) = rate_handler {
            self.heart_rate_parser.value_changed().detach(handler);
        }

        let device = self.device.lock().await.take();
        if let Some(device) = device {
            device.close().await;
            info!("disconnected from heart rate device");
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.device
            .lock()
            .await
            .as_ref()
            .map(|device| device.is_connected())
            .unwrap_or(false)
    }

    /// Subscribes to heart-rate notifications on the peripheral.
    pub async fn enable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        self.heart_rate_parser.enable_notifications().await
    }

    pub async fn disable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        self.heart_rate_parser.disable_notifications().await
    }

    /// Reads the device-information strings and battery level. Individual
    /// read failures leave the affected field at its default; the aggregate
    /// never fails.
    pub async fn get_device_info(&self) -> DeviceInfo {
        let guard = self.device.lock().await;
        let Some(device) = guard.as_ref() else {
            return DeviceInfo::default();
        };

        let information = &device.device_information;
        DeviceInfo {
            name: device.name().unwrap_or_default(),
            manufacturer: read_as_string(&information.manufacturer_name).await,
            model_number: read_as_string(&information.model_number).await,
            serial_number: read_as_string(&information.serial_number).await,
            firmware: read_as_string(&information.firmware_revision).await,
            hardware: read_as_string(&information.hardware_revision).await,
            battery_percent: i32::from(self.battery_parser.read().await),
        }
    }

    /// Name and connection state of every peripheral matching the
    /// heart-rate profile.
    pub async fn get_all_devices() -> anyhow::Result<Vec<ConnectedDevice>> {
        let devices = HeartRateDevice::find_all().await?;
        let mut listed = Vec::with_capacity(devices.len());
        for device in devices {
            listed.push(ConnectedDevice {
                name: device.name().unwrap_or_default(),
                is_connected: device.is_connected(),
                error_message: None,
            });
            device.close().await;
        }
        Ok(listed)
    }
}

impl Default for HeartRateMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disconnected_monitor_answers_defaults() {
        let monitor = HeartRateMonitor::new();

        assert!(!monitor.is_connected().await);

        let info = monitor.get_device_info().await;
        assert_eq!(info.name, "");
        assert_eq!(info.battery_percent, 0);

        assert_eq!(
            monitor.enable_notifications().await.unwrap(),
            GattCommunicationStatus::Unreachable
        );
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_a_no_op() {
        let monitor = HeartRateMonitor::new();
        monitor.disconnect().await;
        monitor.disconnect().await;
        assert!(!monitor.is_connected().await);
    }
}
