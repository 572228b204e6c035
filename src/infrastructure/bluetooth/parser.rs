//! Value Codecs and Parsers
//!
//! A [`ValueCodec`] converts a characteristic's raw byte buffer to and from a
//! typed value. A [`ValueParser`] binds a codec to one characteristic,
//! forwards reads/writes through the codec and re-publishes the
//! characteristic's raw value-changed events as typed events.
//!
//! Codecs for read-only characteristics leave `encode` unimplemented;
//! invoking the unsupported direction is a programming error and aborts, it
//! is never a runtime data condition.

use crate::infrastructure::bluetooth::characteristic::BleCharacteristic;
use crate::infrastructure::events::{EventSource, EventStream};
use std::sync::{Arc, Mutex};
use windows::Devices::Bluetooth::GenericAttributeProfile::GattCommunicationStatus;

/// Typed conversion for one kind of characteristic value.
///
/// `decode` must accept the empty buffer and answer the codec's "no data"
/// sentinel for it; an unbound or failed read decodes the empty buffer.
pub trait ValueCodec: Send + Sync + 'static {
    type Read: Clone + Send + 'static;
    type Write;

    fn decode(&self, raw: &[u8]) -> Self::Read;
    fn encode(&self, value: &Self::Write) -> Vec<u8>;
}

struct BoundCharacteristic {
    characteristic: Arc<BleCharacteristic>,
    handler_id: u64,
}

/// Binds a [`ValueCodec`] to a characteristic and republishes its
/// notifications as typed events.
pub struct ValueParser<C: ValueCodec> {
    codec: Arc<C>,
    bound: Mutex<Option<BoundCharacteristic>>,
    value_changed: EventSource<C::Read>,
}

impl<C: ValueCodec> ValueParser<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec: Arc::new(codec),
            bound: Mutex::new(None),
            value_changed: EventSource::new(),
        }
    }

    /// Typed value-changed events of the currently bound characteristic.
    pub fn value_changed(&self) -> &EventSource<C::Read> {
        &self.value_changed
    }

    pub fn subscribe(&self) -> EventStream<C::Read> {
        self.value_changed.subscribe()
    }

    pub fn is_bound(&self) -> bool {
        self.bound.lock().unwrap().is_some()
    }

    pub fn is_readable(&self) -> bool {
        self.bound_characteristic()
            .map(|ch| ch.is_readable())
            .unwrap_or(false)
    }

    pub fn is_writable(&self) -> bool {
        self.bound_characteristic()
            .map(|ch| ch.is_writable())
            .unwrap_or(false)
    }

    pub fn supports_notification(&self) -> bool {
        self.bound_characteristic()
            .map(|ch| ch.supports_notification())
            .unwrap_or(false)
    }

    /// Binds to `characteristic`, fully unbinding from any previous one
    /// first. Raw events arriving after this call surface as typed events.
    pub async fn bind(&self, characteristic: Arc<BleCharacteristic>) {
        self.unbind().await;

        let codec = Arc::clone(&self.codec);
        let source = self.value_changed.clone();
        let handler_id = characteristic.value_changed().attach(move |raw| {
            source.emit(&codec.decode(&raw.bytes));
        });

        *self.bound.lock().unwrap() = Some(BoundCharacteristic {
            characteristic,
            handler_id,
        });
    }

    /// Disables notifications and indications on the bound characteristic,
    /// detaches from its raw events and forgets it. No-op when unbound.
    pub async fn unbind(&self) {
        let previous = self.bound.lock().unwrap().take();
        if let Some(previous) = previous {
            let _ = previous.characteristic.disable_notifications().await;
            let _ = previous.characteristic.disable_indications().await;
            previous
                .characteristic
                .value_changed()
                .detach(previous.handler_id);
        }
    }

    /// Reads and decodes the current value. An unbound parser, a failed read
    /// and an empty payload all decode the empty buffer.
    pub async fn read(&self) -> C::Read {
        let Some(characteristic) = self.bound_characteristic() else {
            return self.codec.decode(&[]);
        };

        match characteristic.read().await {
            Ok(result) => self.codec.decode(result.value.as_deref().unwrap_or(&[])),
            Err(_) => self.codec.decode(&[]),
        }
    }

    /// Encodes and writes a value. Answers `Unreachable` when unbound.
    pub async fn write(&self, value: &C::Write) -> windows::core::Result<GattCommunicationStatus> {
        let Some(characteristic) = self.bound_characteristic() else {
            return Ok(GattCommunicationStatus::Unreachable);
        };
        let encoded = self.codec.encode(value);
        characteristic.write(&encoded).await
    }

    pub async fn enable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        match self.bound_characteristic() {
            Some(characteristic) => characteristic.enable_notifications().await,
            None => Ok(GattCommunicationStatus::Unreachable),
        }
    }

    pub async fn disable_notifications(&self) -> windows::core::Result<GattCommunicationStatus> {
        match self.bound_characteristic() {
            Some(characteristic) => characteristic.disable_notifications().await,
            None => Ok(GattCommunicationStatus::Unreachable),
        }
    }

    pub async fn enable_indications(&self) -> windows::core::Result<GattCommunicationStatus> {
        match self.bound_characteristic() {
            Some(characteristic) => characteristic.enable_indications().await,
            None => Ok(GattCommunicationStatus::Unreachable),
        }
    }

    pub async fn disable_indications(&self) -> windows::core::Result<GattCommunicationStatus> {
        match self.bound_characteristic() {
            Some(characteristic) => characteristic.disable_indications().await,
            None => Ok(GattCommunicationStatus::Unreachable),
        }
    }

    fn bound_characteristic(&self) -> Option<Arc<BleCharacteristic>> {
        self.bound
            .lock()
            .unwrap()
            .as_ref()
            .map(|bound| Arc::clone(&bound.characteristic))
    }
}

/// Heart Rate Measurement (0x2A37), read-only.
///
/// Wire format per the Bluetooth heart-rate profile: first byte is a flags
/// field whose bit 0 selects the value width.
///
/// ```text
/// flags bit 0 clear: [flags, u8 bpm]
/// flags bit 0 set:   [flags, reserved, u16-le bpm]
/// ```
///
/// Empty or truncated buffers decode to the sentinel `-1`.
pub struct HeartRateMeasurementCodec;

const HEART_RATE_VALUE_FORMAT: u8 = 0x01;

impl ValueCodec for HeartRateMeasurementCodec {
    type Read = i16;
    type Write = i16;

    fn decode(&self, raw: &[u8]) -> i16 {
        let Some(&flags) = raw.first() else {
            return -1;
        };

        if flags & HEART_RATE_VALUE_FORMAT != 0 {
            // 16-bit format: one reserved byte, then the little-endian value.
            match raw.get(2..4) {
                Some(value) => u16::from_le_bytes([value[0], value[1]]) as i16,
                None => -1,
            }
        } else {
            match raw.get(1) {
                Some(&value) => value as i16,
                None => -1,
            }
        }
    }

    fn encode(&self, _value: &i16) -> Vec<u8> {
        unimplemented!("heart rate measurement is a read-only characteristic")
    }
}

/// Battery Level (0x2A19), read-only. A single byte, 0-100.
pub struct BatteryLevelCodec;

impl ValueCodec for BatteryLevelCodec {
    type Read = u8;
    type Write = u8;

    fn decode(&self, raw: &[u8]) -> u8 {
        raw.first().copied().unwrap_or(0)
    }

    fn encode(&self, _value: &u8) -> Vec<u8> {
        unimplemented!("battery level is a read-only characteristic")
    }
}

/// Text encoding for [`StringCodec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StringFormat {
    #[default]
    Utf8,
    Utf16,
}

/// String characteristics (device information revisions, names). Both
/// directions are supported; UTF-16 is little-endian.
pub struct StringCodec {
    format: StringFormat,
}

impl StringCodec {
    pub fn new(format: StringFormat) -> Self {
        Self { format }
    }

    pub fn utf8() -> Self {
        Self::new(StringFormat::Utf8)
    }

    pub fn utf16() -> Self {
        Self::new(StringFormat::Utf16)
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::utf8()
    }
}

impl ValueCodec for StringCodec {
    type Read = String;
    type Write = String;

    fn decode(&self, raw: &[u8]) -> String {
        match self.format {
            StringFormat::Utf8 => String::from_utf8_lossy(raw).into_owned(),
            StringFormat::Utf16 => {
                let units: Vec<u16> = raw
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }

    fn encode(&self, value: &String) -> Vec<u8> {
        match self.format {
            StringFormat::Utf8 => value.as_bytes().to_vec(),
            StringFormat::Utf16 => value
                .encode_utf16()
                .flat_map(|unit| unit.to_le_bytes())
                .collect(),
        }
    }
}

/// Reads a characteristic as a UTF-8 string, answering the empty string on
/// any failure. The device-information read path of the monitor facade.
pub async fn read_as_string(characteristic: &BleCharacteristic) -> String {
    match characteristic.read().await {
        Ok(result) => StringCodec::utf8().decode(result.value.as_deref().unwrap_or(&[])),
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heart_rate_decodes_eight_bit_values() {
        let codec = HeartRateMeasurementCodec;
        assert_eq!(codec.decode(&[0x00, 0x48]), 72);
        assert_eq!(codec.decode(&[0x00, 0xFF]), 255);
    }

    #[test]
    fn heart_rate_decodes_sixteen_bit_values() {
        let codec = HeartRateMeasurementCodec;
        // Reserved byte at offset 1 is skipped.
        assert_eq!(codec.decode(&[0x01, 0x00, 0x90, 0x00]), 144);
        assert_eq!(codec.decode(&[0x01, 0xAA, 0x2C, 0x01]), 300);
    }

    #[test]
    fn heart_rate_sentinel_for_empty_and_truncated_buffers() {
        let codec = HeartRateMeasurementCodec;
        assert_eq!(codec.decode(&[]), -1);
        assert_eq!(codec.decode(&[0x00]), -1);
        assert_eq!(codec.decode(&[0x01, 0x00]), -1);
    }

    #[test]
    fn battery_decodes_single_byte() {
        let codec = BatteryLevelCodec;
        assert_eq!(codec.decode(&[0x64]), 100);
        assert_eq!(codec.decode(&[]), 0);
    }

    #[test]
    #[should_panic]
    fn encoding_a_read_only_codec_is_fatal() {
        HeartRateMeasurementCodec.encode(&72);
    }

    #[test]
    fn strings_encode_and_decode_in_both_formats() {
        let utf8 = StringCodec::utf8();
        assert_eq!(utf8.decode(b"Polar H10"), "Polar H10");
        assert_eq!(utf8.encode(&"Polar H10".to_string()), b"Polar H10");

        let utf16 = StringCodec::utf16();
        let encoded = utf16.encode(&"HRM".to_string());
        assert_eq!(encoded, vec![b'H', 0x00, b'R', 0x00, b'M', 0x00]);
        assert_eq!(utf16.decode(&encoded), "HRM");
    }

    #[test]
    fn empty_buffers_decode_to_empty_strings() {
        assert_eq!(StringCodec::utf8().decode(&[]), "");
        assert_eq!(StringCodec::utf16().decode(&[]), "");
    }

    #[tokio::test]
    async fn unbound_parser_answers_defaults() {
        let parser = ValueParser::new(HeartRateMeasurementCodec);
        assert!(!parser.is_bound());
        assert_eq!(parser.read().await, -1);
        assert_eq!(
            parser.enable_notifications().await.unwrap(),
            GattCommunicationStatus::Unreachable
        );

        let battery = ValueParser::new(BatteryLevelCodec);
        assert_eq!(battery.read().await, 0);
    }

    #[tokio::test]
    async fn parser_republishes_raw_events_as_typed_values() {
        use crate::domain::models::RawValueChange;
        use std::time::SystemTime;

        let characteristic = Arc::new(BleCharacteristic::new(
            "Heart Rate Measurement",
            "2A37",
            true,
        ));
        let parser = ValueParser::new(HeartRateMeasurementCodec);
        parser.bind(Arc::clone(&characteristic)).await;
        let mut events = parser.subscribe();

        characteristic.value_changed().emit(&RawValueChange {
            bytes: vec![0x00, 0x48],
            timestamp: SystemTime::now(),
        });
        characteristic.value_changed().emit(&RawValueChange {
            bytes: vec![0x01, 0x00, 0x90, 0x00],
            timestamp: SystemTime::now(),
        });

        assert_eq!(events.try_recv(), Some(72));
        assert_eq!(events.try_recv(), Some(144));
    }

    #[tokio::test]
    async fn rebinding_detaches_from_the_previous_characteristic() {
        use crate::domain::models::RawValueChange;
        use std::time::SystemTime;

        let first = Arc::new(BleCharacteristic::new("Heart Rate Measurement", "2A37", true));
        let second = Arc::new(BleCharacteristic::new("Heart Rate Measurement", "2A37", true));

        let parser = ValueParser::new(HeartRateMeasurementCodec);
        parser.bind(Arc::clone(&first)).await;
        parser.bind(Arc::clone(&second)).await;
        let mut events = parser.subscribe();

        // Events from the old binding must no longer surface.
        first.value_changed().emit(&RawValueChange {
            bytes: vec![0x00, 0x50],
            timestamp: SystemTime::now(),
        });
        assert_eq!(events.try_recv(), None);
        assert_eq!(first.value_changed().handler_count(), 0);

        second.value_changed().emit(&RawValueChange {
            bytes: vec![0x00, 0x50],
            timestamp: SystemTime::now(),
        });
        assert_eq!(events.try_recv(), Some(80));
    }
}
