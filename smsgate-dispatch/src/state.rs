use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use jiff::Timestamp;
use serde::Serialize;
use smsgate_at::{Registration, SignalQuality, StorageUsage};
use smsgate_core::{ConnectionStatus, EventKind};
use tokio::sync::Mutex;

/// What is known about one configured device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub name: String,
    pub endpoint: String,
    pub status: ConnectionStatus,
    /// Time of the last status change.
    pub since: Timestamp,
    pub signal_percent: Option<u8>,
    pub storage: Option<StorageUsage>,
    pub registration: Option<String>,
    pub network: Option<String>,
    pub restarts: u32,
    pub last_error: Option<String>,
    pub forwarded_sms: u64,
    pub forwarded_calls: u64,
}

impl DeviceSnapshot {
    fn new(name: &str, endpoint: &str) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            status: ConnectionStatus::Disconnected,
            since: Timestamp::now(),
            signal_percent: None,
            storage: None,
            registration: None,
            network: None,
            restarts: 0,
            last_error: None,
            forwarded_sms: 0,
            forwarded_calls: 0,
        }
    }
}

/// Shared state for tracking devices, read by the status API.
pub struct DeviceRegistry {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    devices: BTreeMap<String, DeviceSnapshot>,
    startup_time: Instant,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                devices: BTreeMap::new(),
                startup_time: Instant::now(),
            })),
        }
    }

    /// Add a device in the `Disconnected` state.
    pub async fn register(&self, name: &str, endpoint: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .devices
            .entry(name.to_string())
            .or_insert_with(|| DeviceSnapshot::new(name, endpoint));
    }

    pub async fn set_status(&self, name: &str, status: ConnectionStatus) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            if device.status != status {
                device.status = status;
                device.since = Timestamp::now();
            }
            if status == ConnectionStatus::Ready {
                device.last_error = None;
            }
        }
    }

    /// Mark a device `Faulted` and keep the reason.
    pub async fn record_fault(&self, name: &str, error: impl ToString) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            device.status = ConnectionStatus::Faulted;
            device.since = Timestamp::now();
            device.last_error = Some(error.to_string());
        }
    }

    pub async fn record_restart(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            device.restarts += 1;
        }
    }

    pub async fn update_signal(&self, name: &str, signal: Option<SignalQuality>) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            device.signal_percent = signal.and_then(|s| s.percent());
        }
    }

    /// Store the start-up snapshot of the modem.
    pub async fn update_info(
        &self,
        name: &str,
        signal: Option<SignalQuality>,
        storage: Option<StorageUsage>,
        registration: Option<Registration>,
    ) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            device.signal_percent = signal.and_then(|s| s.percent());
            device.storage = storage;
            device.registration = registration.as_ref().map(|r| r.status().to_string());
            device.network = registration
                .as_ref()
                .and_then(|r| r.technology())
                .map(str::to_string);
        }
    }

    pub async fn record_forwarded(&self, name: &str, kind: EventKind) {
        let mut inner = self.inner.lock().await;
        if let Some(device) = inner.devices.get_mut(name) {
            match kind {
                EventKind::Sms => device.forwarded_sms += 1,
                EventKind::Call => device.forwarded_calls += 1,
            }
        }
    }

    /// All devices, ordered by name.
    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let inner = self.inner.lock().await;
        inner.devices.values().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Option<DeviceSnapshot> {
        let inner = self.inner.lock().await;
        inner.devices.get(name).cloned()
    }

    /// Get the gateway uptime in seconds.
    pub async fn uptime_secs(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.startup_time.elapsed().as_secs()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for DeviceRegistry {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
