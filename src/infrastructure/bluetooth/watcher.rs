//! Heart Rate Device Watcher
//!
//! Wraps the enumeration `DeviceWatcher` and re-emits its add/update/remove
//! stream filtered down to peripherals that match the heart-rate profile.
//! Compatibility requires every service in
//! [`REQUIRED_SERVICES`](crate::infrastructure::bluetooth::device::REQUIRED_SERVICES)
//! and, when name filters were supplied, a case-insensitive substring match
//! against at least one filter. Incompatible devices are silently
//! suppressed; `EnumerationCompleted` and `Stopped` pass through as bare
//! lifecycle signals.
//!
//! The compatibility check needs async transport calls, so raw watcher
//! callbacks are forwarded over a channel to a pump task. The watcher must
//! therefore be constructed inside a Tokio runtime.

use crate::domain::models::{DeviceSelector, WatcherDevice};
use crate::infrastructure::bluetooth::device::{advertised_service_uuids, has_required_services};
use crate::infrastructure::events::EventSource;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use windows::core::{HSTRING, IInspectable, Interface};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceInformation, DeviceInformationUpdate, DeviceWatcher, DeviceWatcherStatus,
};
use windows::Foundation::Collections::IMapView;
use windows::Foundation::{IPropertyValue, PropertyType, TypedEventHandler};

#[derive(Debug, Error)]
pub enum WatcherError {
    /// `start` is only valid before the first start or after a stop.
    #[error("device watcher cannot start while {0:?}")]
    InvalidState(DeviceWatcherStatus),
    #[error(transparent)]
    Windows(#[from] windows::core::Error),
}

enum RawEvent {
    Added(WatcherDevice),
    Updated(WatcherDevice),
    Removed(WatcherDevice),
    EnumerationCompleted,
    Stopped,
}

#[derive(Clone)]
struct WatcherEventSources {
    device_added: EventSource<WatcherDevice>,
    device_updated: EventSource<WatcherDevice>,
    device_removed: EventSource<WatcherDevice>,
    enumeration_completed: EventSource<()>,
    stopped: EventSource<()>,
}

struct Tokens {
    added: i64,
    updated: i64,
    removed: i64,
    enumeration_completed: i64,
    stopped: i64,
}

pub struct HeartRateDeviceWatcher {
    watcher: DeviceWatcher,
    tokens: Tokens,
    events: WatcherEventSources,
    pump: tokio::task::JoinHandle<()>,
}

impl HeartRateDeviceWatcher {
    /// Watcher without name filtering: any peripheral exposing the required
    /// service set is reported.
    pub fn new(selector: DeviceSelector) -> Result<Self, WatcherError> {
        Self::with_filters(selector, Vec::new())
    }

    /// Watcher that additionally requires the device name to contain one of
    /// `filters` (case-insensitive). An empty list disables name filtering.
    pub fn with_filters(
        selector: DeviceSelector,
        filters: Vec<String>,
    ) -> Result<Self, WatcherError> {
        let aqs = match selector {
            DeviceSelector::BluetoothLePairedOnly => {
                BluetoothLEDevice::GetDeviceSelectorFromPairingState(true)?
            }
            DeviceSelector::BluetoothLeUnpairedOnly => {
                BluetoothLEDevice::GetDeviceSelectorFromPairingState(false)?
            }
        };
        let watcher = DeviceInformation::CreateWatcherAqsFilter(&aqs)?;

        let (raw_sender, raw_receiver) = mpsc::unbounded_channel();

        let sender = raw_sender.clone();
        let added = watcher.Added(&TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceWatcher>,
                  info: windows::core::Ref<DeviceInformation>| {
                if let Some(info) = info.as_ref() {
                    let _ = sender.send(RawEvent::Added(snapshot_from_information(info)?));
                }
                Ok(())
            },
        ))?;

        let sender = raw_sender.clone();
        let updated = watcher.Updated(&TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceWatcher>,
                  update: windows::core::Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    let _ = sender.send(RawEvent::Updated(snapshot_from_update(update)?));
                }
                Ok(())
            },
        ))?;

        let sender = raw_sender.clone();
        let removed = watcher.Removed(&TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceWatcher>,
                  update: windows::core::Ref<DeviceInformationUpdate>| {
                if let Some(update) = update.as_ref() {
                    let _ = sender.send(RawEvent::Removed(snapshot_from_update(update)?));
                }
                Ok(())
            },
        ))?;

        let sender = raw_sender.clone();
        let enumeration_completed = watcher.EnumerationCompleted(&TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceWatcher>, _: windows::core::Ref<IInspectable>| {
                let _ = sender.send(RawEvent::EnumerationCompleted);
                Ok(())
            },
        ))?;

        let sender = raw_sender;
        let stopped = watcher.Stopped(&TypedEventHandler::new(
            move |_: windows::core::Ref<DeviceWatcher>, _: windows::core::Ref<IInspectable>| {
                let _ = sender.send(RawEvent::Stopped);
                Ok(())
            },
        ))?;

        let events = WatcherEventSources {
            device_added: EventSource::new(),
            device_updated: EventSource::new(),
            device_removed: EventSource::new(),
            enumeration_completed: EventSource::new(),
            stopped: EventSource::new(),
        };
        let pump = tokio::spawn(pump_events(raw_receiver, filters, events.clone()));

        Ok(Self {
            watcher,
            tokens: Tokens {
                added,
                updated,
                removed,
                enumeration_completed,
                stopped,
            },
            events,
            pump,
        })
    }

    /// Starts enumeration. Valid from the created state or after a stop.
    pub fn start(&self) -> Result<(), WatcherError> {
        let status = self.watcher.Status()?;
        match status {
            DeviceWatcherStatus::Created
            | DeviceWatcherStatus::Stopped
            | DeviceWatcherStatus::Aborted => {
                info!("starting heart rate device watcher");
                self.watcher.Start()?;
                Ok(())
            }
            other => Err(WatcherError::InvalidState(other)),
        }
    }

    /// Stops enumeration. A no-op unless the watcher is started or has
    /// completed enumeration.
    pub fn stop(&self) -> Result<(), WatcherError> {
        let status = self.watcher.Status()?;
        if status == DeviceWatcherStatus::Started
            || status == DeviceWatcherStatus::EnumerationCompleted
        {
            info!("stopping heart rate device watcher");
            self.watcher.Stop()?;
        }
        Ok(())
    }

    pub fn status(&self) -> windows::core::Result<DeviceWatcherStatus> {
        self.watcher.Status()
    }

    /// A compatible peripheral appeared.
    pub fn device_added(&self) -> &EventSource<WatcherDevice> {
        &self.events.device_added
    }

    /// A compatible peripheral's enumeration record changed.
    pub fn device_updated(&self) -> &EventSource<WatcherDevice> {
        &self.events.device_updated
    }

    /// A compatible peripheral disappeared.
    pub fn device_removed(&self) -> &EventSource<WatcherDevice> {
        &self.events.device_removed
    }

    pub fn enumeration_completed(&self) -> &EventSource<()> {
        &self.events.enumeration_completed
    }

    pub fn stopped(&self) -> &EventSource<()> {
        &self.events.stopped
    }
}

impl Drop for HeartRateDeviceWatcher {
    fn drop(&mut self) {
        let _ = self.stop();
        let _ = self.watcher.RemoveAdded(self.tokens.added);
        let _ = self.watcher.RemoveUpdated(self.tokens.updated);
        let _ = self.watcher.RemoveRemoved(self.tokens.removed);
        let _ = self
            .watcher
            .RemoveEnumerationCompleted(self.tokens.enumeration_completed);
        let _ = self.watcher.RemoveStopped(self.tokens.stopped);
        self.pump.abort();
    }
}

async fn pump_events(
    mut raw_receiver: mpsc::UnboundedReceiver<RawEvent>,
    filters: Vec<String>,
    events: WatcherEventSources,
) {
    while let Some(event) = raw_receiver.recv().await {
        match event {
            RawEvent::Added(device) => {
                if is_device_compatible(&device.id, &filters).await {
                    debug!(name = %device.name, "compatible device added");
                    events.device_added.emit(&device);
                }
            }
            RawEvent::Updated(device) => {
                if is_device_compatible(&device.id, &filters).await {
                    events.device_updated.emit(&device);
                }
            }
            RawEvent::Removed(device) => {
                if is_device_compatible(&device.id, &filters).await {
                    events.device_removed.emit(&device);
                }
            }
            RawEvent::EnumerationCompleted => events.enumeration_completed.emit(&()),
            RawEvent::Stopped => events.stopped.emit(&()),
        }
    }
}

/// Re-resolves compatibility for one enumeration record. A peripheral that
/// can no longer be opened is treated as incompatible and suppressed.
async fn is_device_compatible(id: &str, filters: &[String]) -> bool {
    let id = HSTRING::from(id);
    let Ok(operation) = BluetoothLEDevice::FromIdAsync(&id) else {
        return false;
    };
    let Ok(device) = operation.await else {
        return false;
    };

    if !filters.is_empty() {
        let name = device
            .Name()
            .map(|name| name.to_string())
            .unwrap_or_default();
        if !matches_name_filters(&name, filters) {
            return false;
        }
    }

    let compatible = match advertised_service_uuids(&device, BluetoothCacheMode::Cached).await {
        Ok(advertised) => has_required_services(&advertised),
        Err(_) => false,
    };
    let _ = device.Close();
    compatible
}

/// True when `name` contains at least one of `filters`, ignoring case.
fn matches_name_filters(name: &str, filters: &[String]) -> bool {
    let name = name.to_lowercase();
    filters
        .iter()
        .any(|filter| name.contains(&filter.to_lowercase()))
}

fn snapshot_from_information(info: &DeviceInformation) -> windows::core::Result<WatcherDevice> {
    Ok(WatcherDevice {
        id: info.Id()?.to_string(),
        name: info.Name()?.to_string(),
        kind: format!("{:?}", info.Kind()?),
        is_default: info.IsDefault()?,
        is_enabled: info.IsEnabled()?,
        is_paired: info.Pairing()?.IsPaired()?,
        properties: properties_to_map(&info.Properties()?),
    })
}

// Update records only carry id, kind and the changed properties.
fn snapshot_from_update(update: &DeviceInformationUpdate) -> windows::core::Result<WatcherDevice> {
    Ok(WatcherDevice {
        id: update.Id()?.to_string(),
        kind: format!("{:?}", update.Kind()?),
        properties: properties_to_map(&update.Properties()?),
        ..Default::default()
    })
}

fn properties_to_map(
    properties: &IMapView<HSTRING, IInspectable>,
) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(iterator) = properties.First() else {
        return map;
    };
    while iterator.HasCurrent().unwrap_or(false) {
        if let Ok(pair) = iterator.Current() {
            if let Ok(key) = pair.Key() {
                let value = pair
                    .Value()
                    .map(|value| inspectable_to_string(&value))
                    .unwrap_or_default();
                map.insert(key.to_string(), value);
            }
        }
        if iterator.MoveNext().is_err() {
            break;
        }
    }
    map
}

fn inspectable_to_string(value: &IInspectable) -> String {
    if let Ok(property) = value.cast::<IPropertyValue>() {
        if let Ok(kind) = property.Type() {
            let rendered = match kind {
                PropertyType::String => property.GetString().ok().map(|text| text.to_string()),
                PropertyType::Boolean => property.GetBoolean().ok().map(|flag| flag.to_string()),
                PropertyType::Int32 => property.GetInt32().ok().map(|number| number.to_string()),
                PropertyType::UInt32 => property.GetUInt32().ok().map(|number| number.to_string()),
                PropertyType::Int64 => property.GetInt64().ok().map(|number| number.to_string()),
                PropertyType::UInt64 => property.GetUInt64().ok().map(|number| number.to_string()),
                PropertyType::Double => property.GetDouble().ok().map(|number| number.to_string()),
                PropertyType::Guid => property.GetGuid().ok().map(|guid| format!("{guid:?}")),
                _ => None,
            };
            if let Some(text) = rendered {
                return text;
            }
        }
    }
    value
        .GetRuntimeClassName()
        .map(|name| name.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_filters_match_substrings_case_insensitively() {
        let filters = vec!["Polar".to_string()];
        assert!(matches_name_filters("Polar H10", &filters));
        assert!(matches_name_filters("POLAR OH1", &filters));
        assert!(!matches_name_filters("Garmin HRM", &filters));
    }

    #[test]
    fn any_filter_entry_suffices() {
        let filters = vec!["Polar".to_string(), "Garmin".to_string()];
        assert!(matches_name_filters("Garmin HRM-Pro", &filters));
        assert!(!matches_name_filters("Wahoo TICKR", &filters));
    }
}
