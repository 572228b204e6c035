//! BLE heart rate monitor library for Windows.
//!
//! Exposes GATT Heart Rate Service peripherals as typed objects: a device
//! with declared services and characteristics, value codecs for the
//! heart-rate wire format, a compatibility-filtering device watcher and a
//! connect/subscribe/read-info facade. Built on the WinRT Bluetooth stack;
//! consumers are expected to run inside a Tokio runtime.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    ConnectedDevice, ConnectionStatus, ConnectionStatusChanged, DeviceInfo, DeviceSelector,
    RateChanged, RawValueChange, WatcherDevice,
};
pub use infrastructure::bluetooth::watcher::WatcherError;
pub use infrastructure::bluetooth::{HeartRateDevice, HeartRateDeviceWatcher, HeartRateMonitor};
pub use infrastructure::events::{EventSource, EventStream};
