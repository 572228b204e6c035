//! Bluetooth Module
//!
//! Typed GATT access to BLE heart rate peripherals over the WinRT stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   HeartRateMonitor                       │
//! │  (Facade - connect, subscribe, read info, disconnect)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Watcher  │  │   Device   │  │  Parser  │
//! │           │  │            │  │          │
//! │ - discovery│ │ - services │  │ - codecs │
//! │ - filtering│ │ - charact. │  │ - typed  │
//! │           │  │   lifecycle│  │   events │
//! └───────────┘  └────────────┘  └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`uuid`] - short/full Bluetooth UUID resolution
//! - [`characteristic`] - single-characteristic wrapper and subscriptions
//! - [`service`] - service binding and the declared profile services
//! - [`device`] - device lifecycle and profile discovery
//! - [`parser`] - value codecs and typed re-publication
//! - [`watcher`] - compatibility-filtered device enumeration
//! - [`monitor`] - the application-level facade

pub mod characteristic;
pub mod device;
pub mod monitor;
pub mod parser;
pub mod service;
pub mod uuid;
pub mod watcher;

// Re-export the main entry points for convenience
pub use device::HeartRateDevice;
pub use monitor::HeartRateMonitor;
pub use watcher::HeartRateDeviceWatcher;
