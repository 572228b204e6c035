//! GATT Service Wrappers
//!
//! A [`BleService`] is a named, fixed tuple of characteristics declared at
//! construction time plus the service's own UUID and mandatory flag. The
//! heart-rate profile declares three concrete services: Heart Rate, Device
//! Information and Battery.

use crate::infrastructure::bluetooth::characteristic::BleCharacteristic;
use crate::infrastructure::bluetooth::uuid::resolve_uuid;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::BluetoothLEDevice;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCommunicationStatus, GattDeviceService,
};
use windows::Devices::Enumeration::DeviceAccessStatus;

/// One GATT service and its declared characteristics, in declaration order.
pub struct BleService {
    uuid: GUID,
    mandatory: bool,
    characteristics: Vec<Arc<BleCharacteristic>>,
    handle: Mutex<Option<GattDeviceService>>,
}

impl BleService {
    pub fn new(
        uuid: &str,
        mandatory: bool,
        characteristics: Vec<Arc<BleCharacteristic>>,
    ) -> Self {
        Self {
            uuid: resolve_uuid(uuid),
            mandatory,
            characteristics,
            handle: Mutex::new(None),
        }
    }

    pub fn uuid(&self) -> GUID {
        self.uuid
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// False when the device does not implement this service.
    pub fn is_available(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }

    pub fn characteristics(&self) -> &[Arc<BleCharacteristic>] {
        &self.characteristics
    }

    /// Binds the native service by UUID and offers initialization to every
    /// declared characteristic in order. Partial availability is normal:
    /// individual characteristic failures are logged and skipped, and a
    /// missing service leaves the whole tuple unbound.
    pub(crate) async fn initialize(&self, device: &BluetoothLEDevice) {
        let service = match self.lookup_service(device).await {
            Ok(Some(service)) => service,
            Ok(None) => {
                debug!(service = ?self.uuid, "service not present");
                return;
            }
            Err(error) => {
                warn!(service = ?self.uuid, %error, "service lookup failed");
                return;
            }
        };

        // Access must be granted before characteristics of unpaired devices
        // can be enumerated.
        match service.RequestAccessAsync() {
            Ok(operation) => match operation.await {
                Ok(DeviceAccessStatus::Allowed) => {}
                Ok(status) => {
                    warn!(service = ?self.uuid, ?status, "access not granted");
                }
                Err(error) => {
                    warn!(service = ?self.uuid, %error, "access request failed");
                }
            },
            Err(error) => {
                warn!(service = ?self.uuid, %error, "access request failed");
            }
        }

        for characteristic in &self.characteristics {
            if let Err(error) = characteristic.initialize(&service).await {
                warn!(
                    characteristic = characteristic.name(),
                    %error,
                    "characteristic initialization failed"
                );
            }
        }

        *self.handle.lock().unwrap() = Some(service);
    }

    async fn lookup_service(
        &self,
        device: &BluetoothLEDevice,
    ) -> windows::core::Result<Option<GattDeviceService>> {
        let result = device.GetGattServicesForUuidAsync(self.uuid)?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Ok(None);
        }
        let services = result.Services()?;
        if services.Size()? == 0 {
            return Ok(None);
        }
        Ok(Some(services.GetAt(0)?))
    }

    /// Closes every characteristic, then releases the native service handle.
    pub(crate) async fn close(&self) {
        for characteristic in &self.characteristics {
            characteristic.close().await;
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(service) = handle {
            let _ = service.Close();
        }
    }
}

/// Heart Rate service (0x180D).
pub struct HeartRateService {
    pub service: BleService,
    pub measurement: Arc<BleCharacteristic>,
    pub body_sensor_location: Arc<BleCharacteristic>,
    pub control_point: Arc<BleCharacteristic>,
}

impl HeartRateService {
    pub fn new() -> Self {
        let measurement = Arc::new(BleCharacteristic::new("Heart Rate Measurement", "2A37", true));
        let body_sensor_location =
            Arc::new(BleCharacteristic::new("Body Sensor Location", "2A38", false));
        let control_point =
            Arc::new(BleCharacteristic::new("Heart Rate Control Point", "2A39", false));
        Self {
            service: BleService::new(
                "180D",
                true,
                vec![
                    Arc::clone(&measurement),
                    Arc::clone(&body_sensor_location),
                    Arc::clone(&control_point),
                ],
            ),
            measurement,
            body_sensor_location,
            control_point,
        }
    }
}

impl Default for HeartRateService {
    fn default() -> Self {
        Self::new()
    }
}

/// Device Information service (0x180A). All characteristics are optional.
pub struct DeviceInformationService {
    pub service: BleService,
    pub manufacturer_name: Arc<BleCharacteristic>,
    pub model_number: Arc<BleCharacteristic>,
    pub serial_number: Arc<BleCharacteristic>,
    pub hardware_revision: Arc<BleCharacteristic>,
    pub firmware_revision: Arc<BleCharacteristic>,
    pub software_revision: Arc<BleCharacteristic>,
    pub system_id: Arc<BleCharacteristic>,
    pub regulatory_certification_data: Arc<BleCharacteristic>,
    pub pnp_id: Arc<BleCharacteristic>,
}

impl DeviceInformationService {
    pub fn new() -> Self {
        let manufacturer_name =
            Arc::new(BleCharacteristic::new("Manufacturer Name String", "2A29", false));
        let model_number = Arc::new(BleCharacteristic::new("Model Number String", "2A24", false));
        let serial_number = Arc::new(BleCharacteristic::new("Serial Number String", "2A25", false));
        let hardware_revision =
            Arc::new(BleCharacteristic::new("Hardware Revision String", "2A27", false));
        let firmware_revision =
            Arc::new(BleCharacteristic::new("Firmware Revision String", "2A26", false));
        let software_revision =
            Arc::new(BleCharacteristic::new("Software Revision String", "2A28", false));
        let system_id = Arc::new(BleCharacteristic::new("System ID", "2A23", false));
        let regulatory_certification_data = Arc::new(BleCharacteristic::new(
            "IEEE 11073-20601 Regulatory Certification Data List",
            "2A2A",
            false,
        ));
        let pnp_id = Arc::new(BleCharacteristic::new("PnP ID", "2A50", false));
        Self {
            service: BleService::new(
                "180A",
                true,
                vec![
                    Arc::clone(&manufacturer_name),
                    Arc::clone(&model_number),
                    Arc::clone(&serial_number),
                    Arc::clone(&hardware_revision),
                    Arc::clone(&firmware_revision),
                    Arc::clone(&software_revision),
                    Arc::clone(&system_id),
                    Arc::clone(&regulatory_certification_data),
                    Arc::clone(&pnp_id),
                ],
            ),
            manufacturer_name,
            model_number,
            serial_number,
            hardware_revision,
            firmware_revision,
            software_revision,
            system_id,
            regulatory_certification_data,
            pnp_id,
        }
    }
}

impl Default for DeviceInformationService {
    fn default() -> Self {
        Self::new()
    }
}

/// Battery service (0x180F).
pub struct BatteryService {
    pub service: BleService,
    pub level: Arc<BleCharacteristic>,
}

impl BatteryService {
    pub fn new() -> Self {
        let level = Arc::new(BleCharacteristic::new("Battery Level", "2A19", true));
        Self {
            service: BleService::new("180F", true, vec![Arc::clone(&level)]),
            level,
        }
    }
}

impl Default for BatteryService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::uuid::short_id;

    #[test]
    fn declarations_carry_profile_uuids() {
        let heart_rate = HeartRateService::new();
        assert_eq!(short_id(&heart_rate.service.uuid()), 0x180D);
        assert_eq!(short_id(&heart_rate.measurement.uuid()), 0x2A37);
        assert!(heart_rate.measurement.is_mandatory());
        assert!(!heart_rate.body_sensor_location.is_mandatory());

        let battery = BatteryService::new();
        assert_eq!(short_id(&battery.service.uuid()), 0x180F);
        assert_eq!(battery.service.characteristics().len(), 1);

        let info = DeviceInformationService::new();
        assert_eq!(short_id(&info.service.uuid()), 0x180A);
        assert_eq!(info.service.characteristics().len(), 9);
    }

    #[tokio::test]
    async fn unbound_service_reports_children_unavailable() {
        let heart_rate = HeartRateService::new();
        assert!(!heart_rate.service.is_available());
        for characteristic in heart_rate.service.characteristics() {
            assert!(!characteristic.is_available());
        }

        // Closing a never-initialized service must be harmless.
        heart_rate.service.close().await;
        assert!(!heart_rate.service.is_available());
    }
}
