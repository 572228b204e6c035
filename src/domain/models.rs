use std::collections::HashMap;
use std::time::SystemTime;

/// Raw characteristic payload as delivered by the transport.
#[derive(Debug, Clone)]
pub struct RawValueChange {
    pub bytes: Vec<u8>,
    /// Wall-clock moment the transport captured the value.
    pub timestamp: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
}

/// Heart rate notification decoded to beats per minute. `-1` means the
/// peripheral sent an empty measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateChanged {
    pub beats_per_minute: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatusChanged {
    pub is_connected: bool,
}

/// Outcome of a connect attempt or a discovery listing entry.
#[derive(Debug, Clone, Default)]
pub struct ConnectedDevice {
    pub name: String,
    pub is_connected: bool,
    pub error_message: Option<String>,
}

/// Aggregate of the Device Information service plus battery level. Fields the
/// peripheral does not expose stay at their defaults.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub name: String,
    pub manufacturer: String,
    pub model_number: String,
    pub serial_number: String,
    pub firmware: String,
    pub hardware: String,
    pub battery_percent: i32,
}

/// Which enumeration population the device watcher observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceSelector {
    #[default]
    BluetoothLeUnpairedOnly,
    BluetoothLePairedOnly,
}

/// Snapshot of a discovered peripheral, produced fresh for every watcher
/// event. Update/remove events only carry id, kind and properties.
#[derive(Debug, Clone, Default)]
pub struct WatcherDevice {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub is_default: bool,
    pub is_enabled: bool,
    pub is_paired: bool,
    pub properties: HashMap<String, String>,
}
