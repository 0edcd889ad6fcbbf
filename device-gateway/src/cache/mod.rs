//! # Device Cache
//!
//! Concurrent id to [`DeviceRecord`] map. Records are created by discovery
//! through [`DeviceCache::load_or_store`], so concurrent reports for the same
//! id create exactly one record. Removing a record closes its sessions.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use shared::{
    constants::DEVICE_CLOSE_TIMEOUT_SECS,
    error::{GatewayError, GatewayResult},
    types::DeviceId,
};

use crate::device::DeviceRecord;

/// Memory-resident device cache
#[derive(Default)]
pub struct DeviceCache {
    devices: DashMap<DeviceId, Arc<DeviceRecord>>,
}

impl DeviceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing record for `id`, or a new one; `true` when inserted
    pub fn load_or_store(&self, id: DeviceId) -> (Arc<DeviceRecord>, bool) {
        match self.devices.entry(id) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let record = Arc::new(DeviceRecord::new(id));
                entry.insert(Arc::clone(&record));
                debug!(device_id = %id, "Cached new device");
                (record, true)
            }
        }
    }

    pub fn get(&self, id: DeviceId) -> GatewayResult<Arc<DeviceRecord>> {
        self.devices
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(GatewayError::DeviceNotFound(id))
    }

    /// Remove a record and close its sessions
    pub async fn delete(&self, id: DeviceId) -> GatewayResult<()> {
        let (_, record) = self
            .devices
            .remove(&id)
            .ok_or(GatewayError::DeviceNotFound(id))?;
        record.close().await
    }

    /// Remove every record; close failures are logged, never returned
    pub async fn delete_all(&self) {
        let ids: Vec<DeviceId> = self.devices.iter().map(|entry| *entry.key()).collect();
        let records: Vec<Arc<DeviceRecord>> = ids
            .into_iter()
            .filter_map(|id| self.devices.remove(&id).map(|(_, record)| record))
            .collect();
        let count = records.len();

        let timeout = Duration::from_secs(DEVICE_CLOSE_TIMEOUT_SECS);
        let results = join_all(records.iter().map(|record| async move {
            let result = tokio::time::timeout(timeout, record.close()).await;
            (record.id(), result)
        }))
        .await;

        let mut failures = 0;
        for (id, result) in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    warn!(device_id = %id, error = %e, "Cannot close device");
                }
                Err(_) => {
                    failures += 1;
                    warn!(device_id = %id, timeout = ?timeout, "Timed out closing device");
                }
            }
        }
        info!(devices = count, failures, "Cleared device cache");
    }

    /// All cached records
    pub fn snapshot(&self) -> Vec<Arc<DeviceRecord>> {
        self.devices
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
