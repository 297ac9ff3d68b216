//! In-memory stores for canonical samples and devices.
//!
//! Sample identity is the typed `SampleKey`, so re-delivery of the same
//! underlying event is an upsert, not a duplicate row. The device store also
//! owns the per-device locks that serialize syncs and token refreshes.

use crate::types::{CanonicalSample, Device, MetricType, ProviderKind, SampleKey};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Storage contract for canonical samples.
pub trait SampleStore: Send + Sync {
    /// Insert or overwrite by key. Returns true when the key was new.
    fn upsert(&self, sample: CanonicalSample) -> bool;

    /// Samples for one patient and metric within the half-open window
    /// [start, end), sorted by start time. The exclusive end keeps adjacent
    /// windows sharing a boundary instant from double-counting a sample.
    fn query(
        &self,
        patient_id: &str,
        metric: MetricType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CanonicalSample>;

    /// Total stored samples for one patient and metric.
    fn count(&self, patient_id: &str, metric: MetricType) -> usize;
}

/// HashMap-backed sample store.
#[derive(Default)]
pub struct MemorySampleStore {
    samples: RwLock<HashMap<SampleKey, CanonicalSample>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemorySampleStore {
    fn upsert(&self, sample: CanonicalSample) -> bool {
        let key = sample.key();
        let mut samples = self.samples.write().unwrap_or_else(|e| e.into_inner());
        samples.insert(key, sample).is_none()
    }

    fn query(
        &self,
        patient_id: &str,
        metric: MetricType,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<CanonicalSample> {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<CanonicalSample> = samples
            .values()
            .filter(|s| {
                s.patient_id == patient_id
                    && s.metric == metric
                    && s.start >= start
                    && s.start < end
            })
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.start);
        matched
    }

    fn count(&self, patient_id: &str, metric: MetricType) -> usize {
        let samples = self.samples.read().unwrap_or_else(|e| e.into_inner());
        samples
            .values()
            .filter(|s| s.patient_id == patient_id && s.metric == metric)
            .count()
    }
}

/// Device registry keyed by device id.
#[derive(Default)]
pub struct DeviceStore {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Device) {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.insert(device.id.clone(), device);
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices.get(device_id).cloned()
    }

    /// Apply a mutation to a stored device, returning the mutation result.
    pub fn update<F, T>(&self, device_id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Device) -> T,
    {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.get_mut(device_id).map(f)
    }

    pub fn remove(&self, device_id: &str) -> Option<Device> {
        let mut devices = self.devices.write().unwrap_or_else(|e| e.into_inner());
        devices.remove(device_id)
    }

    /// Webhook device lookup: serial number matches are restricted to
    /// connected devices so a disconnected device cannot receive data.
    pub fn find_by_serial(&self, provider: ProviderKind, serial: &str) -> Option<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        devices
            .values()
            .find(|d| {
                d.provider == provider
                    && d.is_connected()
                    && d.serial_number.as_deref() == Some(serial)
            })
            .cloned()
    }

    pub fn list(&self) -> Vec<Device> {
        let devices = self.devices.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Device> = devices.values().cloned().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }
}

/// Per-device async locks. Holding a device's lock serializes its syncs and
/// makes token refresh single-flight.
#[derive(Default)]
pub struct DeviceLocks {
    locks: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DeviceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock_for(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
