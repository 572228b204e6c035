//! GATT Characteristic Wrapper
//!
//! Wraps one `GattCharacteristic` with an explicit bound/unbound state,
//! capability queries, read/write, and notify/indicate subscription control.
//! A characteristic is declared up front (name, UUID, mandatory flag) and
//! only bound to a native handle while its parent service is initialized;
//! every operation on an unbound characteristic answers with the
//! `Unreachable` status instead of failing.

use crate::domain::models::RawValueChange;
use crate::infrastructure::bluetooth::uuid::resolve_uuid;
use crate::infrastructure::events::{EventSource, EventStream};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCharacteristicProperties,
    GattClientCharacteristicConfigurationDescriptorValue, GattCommunicationStatus,
    GattDeviceService, GattValueChangedEventArgs,
};
use windows::Foundation::{DateTime, TypedEventHandler};
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

/// Result of a characteristic read. `value` is only present when the
/// transport reported success.
#[derive(Debug, Clone)]
pub struct CharacteristicReadResult {
    pub status: GattCommunicationStatus,
    pub value: Option<Vec<u8>>,
    pub timestamp: SystemTime,
}

impl CharacteristicReadResult {
    fn unreachable() -> Self {
        Self {
            status: GattCommunicationStatus::Unreachable,
            value: None,
            timestamp: SystemTime::now(),
        }
    }
}

struct Binding {
    characteristic: GattCharacteristic,
    properties: GattCharacteristicProperties,
    value_token: Option<i64>,
}

/// One declared GATT characteristic of a service.
pub struct BleCharacteristic {
    name: &'static str,
    uuid: GUID,
    mandatory: bool,
    binding: Mutex<Option<Binding>>,
    value_changed: EventSource<RawValueChange>,
}

impl BleCharacteristic {
    /// Declares a characteristic. `uuid` accepts both 16-bit shorthand and
    /// full form; the handle stays unbound until [`initialize`] finds it.
    ///
    /// [`initialize`]: BleCharacteristic::initialize
    pub fn new(name: &'static str, uuid: &str, mandatory: bool) -> Self {
        Self {
            name,
            uuid: resolve_uuid(uuid),
            mandatory,
            binding: Mutex::new(None),
            value_changed: EventSource::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn uuid(&self) -> GUID {
        self.uuid
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// True while a native handle is bound. Non-mandatory characteristics
    /// commonly stay unavailable on real devices.
    pub fn is_available(&self) -> bool {
        self.binding.lock().unwrap().is_some()
    }

    /// The peripheral's user description, when the characteristic exposes one.
    pub fn description(&self) -> Option<String> {
        self.bound_handle()
            .and_then(|ch| ch.UserDescription().ok())
            .map(|text| text.to_string())
    }

    pub fn is_readable(&self) -> bool {
        self.has_property(GattCharacteristicProperties::Read)
    }

    pub fn is_writable(&self) -> bool {
        self.has_property(GattCharacteristicProperties::Write)
    }

    pub fn is_writable_without_response(&self) -> bool {
        self.has_property(GattCharacteristicProperties::WriteWithoutResponse)
    }

    pub fn supports_broadcast(&self) -> bool {
        self.has_property(GattCharacteristicProperties::Broadcast)
    }

    pub fn supports_notification(&self) -> bool {
        self.has_property(GattCharacteristicProperties::Notify)
    }

    pub fn supports_indication(&self) -> bool {
        self.has_property(GattCharacteristicProperties::Indicate)
    }

    pub fn supports_signed_writes(&self) -> bool {
        self.has_property(GattCharacteristicProperties::AuthenticatedSignedWrites)
    }

    pub fn has_extended_properties(&self) -> bool {
        self.has_property(GattCharacteristicProperties::ExtendedProperties)
    }

    pub fn supports_reliable_writes(&self) -> bool {
        self.has_property(GattCharacteristicProperties::ReliableWrites)
    }

    pub fn has_writable_auxiliaries(&self) -> bool {
        self.has_property(GattCharacteristicProperties::WritableAuxiliaries)
    }

    /// Raw value-changed events, delivered in transport-arrival order from
    /// the transport's callback context.
    pub fn value_changed(&self) -> &EventSource<RawValueChange> {
        &self.value_changed
    }

    pub fn subscribe(&self) -> EventStream<RawValueChange> {
        self.value_changed.subscribe()
    }

    /// Looks up the native characteristic under `service`. A missing
    /// characteristic is a normal outcome (optional characteristics), so the
    /// handle simply stays unbound. When the characteristic supports notify
    /// or indicate, a raw value-changed listener is registered immediately.
    pub(crate) async fn initialize(&self, service: &GattDeviceService) -> windows::core::Result<()> {
        let result = service.GetCharacteristicsForUuidAsync(self.uuid)?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            debug!(
                characteristic = self.name,
                status = ?result.Status()?,
                "characteristic lookup did not succeed"
            );
            return Ok(());
        }

        let matches = result.Characteristics()?;
        if matches.Size()? == 0 {
            debug!(characteristic = self.name, "not offered by this device");
            return Ok(());
        }

        let characteristic = matches.GetAt(0)?;
        let properties = characteristic.CharacteristicProperties()?;

        let notifiable = (properties.0
            & (GattCharacteristicProperties::Notify.0 | GattCharacteristicProperties::Indicate.0))
            != 0;
        let value_token = if notifiable {
            Some(self.register_value_handler(&characteristic)?)
        } else {
            None
        };

        *self.binding.lock().unwrap() = Some(Binding {
            characteristic,
            properties,
            value_token,
        });
        debug!(characteristic = self.name, "bound");
        Ok(())
    }

    /// Disables notifications and indications, drops the value listener and
    /// unbinds. Safe to call on an already-unbound characteristic.
    pub(crate) async fn close(&self) {
        if self.is_available() {
            // Failures here are not actionable; the handle is going away.
            let _ = self.disable_notifications().await;
            let _ = self.disable_indications().await;
        }

        let binding = self.binding.lock().unwrap().take();
        if let Some(binding) = binding {
            if let Some(token) = binding.value_token {
                let _ = binding.characteristic.RemoveValueChanged(token);
            }
        }
    }

    /// Reads the raw value. Answers `Unreachable` unless bound and readable.
    pub async fn read(&self) -> windows::core::Result<CharacteristicReadResult> {
        if !self.is_readable() {
            return Ok(CharacteristicReadResult::unreachable());
        }
        let Some(characteristic) = self.bound_handle() else {
            return Ok(CharacteristicReadResult::unreachable());
        };

        let result = characteristic.ReadValueAsync()?.await?;
        let status = result.Status()?;
        let value = if status == GattCommunicationStatus::Success {
            Some(buffer_to_bytes(&result.Value()?)?)
        } else {
            None
        };

        Ok(CharacteristicReadResult {
            status,
            value,
            timestamp: SystemTime::now(),
        })
    }

    /// Writes the raw value. Answers `Unreachable` unless bound and writable.
    pub async fn write(&self, data: &[u8]) -> windows::core::Result<GattCommunicationStatus> {
        if !self.is_writable() {
            return Ok(GattCommunicationStatus::Unreachable);
        }
        let Some(characteristic) = self.bound_handle() else {
            return Ok(GattCommunicationStatus::Unreachable);
        };

        let writer = DataWriter::new()?;
        writer.WriteBytes(data)?;
        let buffer = writer.DetachBuffer()?;
        characteristic.WriteValueAsync(&buffer)?.await
    }

    /// Enables notifications. Already-notifying characteristics short-circuit
    /// to `Success` without a redundant descriptor write.
    pub async fn enable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        if !self.supports_notification() {
            return Ok(GattCommunicationStatus::Unreachable);
        }
        if self.is_notifying().await {
            return Ok(GattCommunicationStatus::Success);
        }
        self.write_client_configuration(GattClientCharacteristicConfigurationDescriptorValue::Notify)
            .await
    }

    /// Disables notifications. Always issues the descriptor write when bound
    /// and capable.
    pub async fn disable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        if !self.supports_notification() {
            return Ok(GattCommunicationStatus::Unreachable);
        }
        self.write_client_configuration(GattClientCharacteristicConfigurationDescriptorValue::None)
            .await
    }

    /// Enables indications, idempotently like [`enable_notifications`].
    ///
    /// [`enable_notifications`]: BleCharacteristic::enable_notifications
    pub async fn enable_indications(&self) -> windows::core::Result<GattCommunicationStatus> {
        if !self.supports_indication() {
            return Ok(GattCommunicationStatus::Unreachable);
        }
        if self.is_indicating().await {
            return Ok(GattCommunicationStatus::Success);
        }
        self.write_client_configuration(
            GattClientCharacteristicConfigurationDescriptorValue::Indicate,
        )
        .await
    }

    pub async fn disable_indications(&self) -> windows::core::Result<GattCommunicationStatus> {
        if !self.supports_indication() {
            return Ok(GattCommunicationStatus::Unreachable);
        }
        self.write_client_configuration(GattClientCharacteristicConfigurationDescriptorValue::None)
            .await
    }

    /// Whether the client configuration descriptor currently has the notify
    /// bit set. Any transport failure reads as `false`.
    pub async fn is_notifying(&self) -> bool {
        self.client_configuration_has(GattClientCharacteristicConfigurationDescriptorValue::Notify)
            .await
    }

    /// Whether the client configuration descriptor currently has the
    /// indicate bit set. Any transport failure reads as `false`.
    pub async fn is_indicating(&self) -> bool {
        if !self.supports_indication() {
            return false;
        }
        self.client_configuration_has(
            GattClientCharacteristicConfigurationDescriptorValue::Indicate,
        )
        .await
    }

    async fn client_configuration_has(
        &self,
        flag: GattClientCharacteristicConfigurationDescriptorValue,
    ) -> bool {
        let Some(characteristic) = self.bound_handle() else {
            return false;
        };

        let read = async {
            let result = characteristic
                .ReadClientCharacteristicConfigurationDescriptorAsync()?
                .await?;
            if result.Status()? != GattCommunicationStatus::Success {
                return Ok(GattClientCharacteristicConfigurationDescriptorValue::None);
            }
            result.ClientCharacteristicConfigurationDescriptor()
        };

        match read.await {
            Ok(value) => (value.0 & flag.0) != 0,
            Err(_) => false,
        }
    }

    async fn write_client_configuration(
        &self,
        value: GattClientCharacteristicConfigurationDescriptorValue,
    ) -> windows::core::Result<GattCommunicationStatus> {
        let Some(characteristic) = self.bound_handle() else {
            return Ok(GattCommunicationStatus::Unreachable);
        };
        characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(value)?
            .await
    }

    fn register_value_handler(
        &self,
        characteristic: &GattCharacteristic,
    ) -> windows::core::Result<i64> {
        let source = self.value_changed.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = buffer_to_bytes(&args.CharacteristicValue()?)?;
                    let timestamp = system_time_from(args.Timestamp()?);
                    source.emit(&RawValueChange { bytes, timestamp });
                }
                Ok(())
            },
        );
        characteristic.ValueChanged(&handler)
    }

    fn bound_handle(&self) -> Option<GattCharacteristic> {
        self.binding
            .lock()
            .unwrap()
            .as_ref()
            .map(|binding| binding.characteristic.clone())
    }

    fn has_property(&self, flag: GattCharacteristicProperties) -> bool {
        let properties = self
            .binding
            .lock()
            .unwrap()
            .as_ref()
            .map(|binding| binding.properties)
            .unwrap_or(GattCharacteristicProperties::None);
        (properties.0 & flag.0) != 0
    }
}

pub(crate) fn buffer_to_bytes(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    if length > 0 {
        reader.ReadBytes(&mut bytes)?;
    }
    Ok(bytes)
}

// 100ns intervals between 1601-01-01 (WinRT epoch) and 1970-01-01.
const UNIX_EPOCH_OFFSET_100NS: i64 = 116_444_736_000_000_000;

pub(crate) fn system_time_from(timestamp: DateTime) -> SystemTime {
    let relative = timestamp.UniversalTime - UNIX_EPOCH_OFFSET_100NS;
    if relative >= 0 {
        UNIX_EPOCH + Duration::from_nanos(relative as u64 * 100)
    } else {
        UNIX_EPOCH - Duration::from_nanos(relative.unsigned_abs() * 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_characteristic_reports_no_capabilities() {
        let characteristic = BleCharacteristic::new("Heart Rate Measurement", "2A37", true);
        assert!(!characteristic.is_available());
        assert!(!characteristic.is_readable());
        assert!(!characteristic.is_writable());
        assert!(!characteristic.supports_notification());
        assert!(!characteristic.supports_indication());
        assert!(characteristic.description().is_none());
    }

    #[tokio::test]
    async fn unbound_operations_answer_unreachable() {
        let characteristic = BleCharacteristic::new("Heart Rate Control Point", "2A39", false);

        let read = characteristic.read().await.unwrap();
        assert_eq!(read.status, GattCommunicationStatus::Unreachable);
        assert!(read.value.is_none());

        let write = characteristic.write(&[0x01]).await.unwrap();
        assert_eq!(write, GattCommunicationStatus::Unreachable);

        let enable = characteristic.enable_notifications().await.unwrap();
        assert_eq!(enable, GattCommunicationStatus::Unreachable);

        assert!(!characteristic.is_notifying().await);
        assert!(!characteristic.is_indicating().await);
    }

    #[tokio::test]
    async fn close_is_a_no_op_when_unbound() {
        let characteristic = BleCharacteristic::new("Battery Level", "2A19", true);
        characteristic.close().await;
        characteristic.close().await;
        assert!(!characteristic.is_available());
    }

    #[test]
    fn raw_events_fan_out_to_subscribers() {
        let characteristic = BleCharacteristic::new("Heart Rate Measurement", "2A37", true);
        let mut stream = characteristic.subscribe();

        characteristic.value_changed().emit(&RawValueChange {
            bytes: vec![0x00, 0x48],
            timestamp: SystemTime::now(),
        });

        let event = stream.try_recv().expect("event was delivered");
        assert_eq!(event.bytes, vec![0x00, 0x48]);
    }

    #[test]
    fn winrt_timestamps_convert_to_unix_time() {
        let epoch = system_time_from(DateTime {
            UniversalTime: UNIX_EPOCH_OFFSET_100NS,
        });
        assert_eq!(epoch, UNIX_EPOCH);

        let one_second_later = system_time_from(DateTime {
            UniversalTime: UNIX_EPOCH_OFFSET_100NS + 10_000_000,
        });
        assert_eq!(one_second_later, UNIX_EPOCH + Duration::from_secs(1));
    }
}
