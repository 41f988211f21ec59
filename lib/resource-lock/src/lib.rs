// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device exclusive lock arbitration (spec.md §4.7, C8).
//!
//! One [`DeviceLock`] exists per device name, created lazily and never
//! destroyed while the process runs. Re-entrant acquisition by the same
//! `lid` is recorded explicitly rather than implemented with a recursive
//! mutex (spec.md §9 design note).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResourceLockError {
    #[error("timed out waiting for device lock")]
    Timeout,
    #[error("link does not own this device's lock")]
    NotOwner,
}

struct DeviceLock {
    semaphore: Arc<Semaphore>,
    owner: Option<u32>,
    permit: Option<OwnedSemaphorePermit>,
}

impl DeviceLock {
    fn new() -> Self {
        Self { semaphore: Arc::new(Semaphore::new(1)), owner: None, permit: None }
    }
}

/// Maps `device_name -> (mutex, owner_lid)`.
#[derive(Default)]
pub struct ResourceLockManager {
    devices: StdMutex<HashMap<String, DeviceLock>>,
}

impl ResourceLockManager {
    pub fn new() -> Self {
        Self { devices: StdMutex::new(HashMap::new()) }
    }

    fn semaphore_for(&self, device: &str) -> Arc<Semaphore> {
        let mut devices = self.devices.lock().unwrap();
        devices.entry(device.to_string()).or_insert_with(DeviceLock::new).semaphore.clone()
    }

    /// Acquires the exclusive lock for `device` on behalf of `lid`. If
    /// `lid` already owns it, returns immediately (re-entrant). Otherwise
    /// waits up to `timeout` (or indefinitely, if `None`) for the device
    /// to become free.
    pub async fn lock(&self, device: &str, lid: u32, timeout: Option<Duration>) -> Result<(), ResourceLockError> {
        {
            let devices = self.devices.lock().unwrap();
            if let Some(existing) = devices.get(device) {
                if existing.owner == Some(lid) {
                    return Ok(());
                }
            }
        }

        let semaphore = self.semaphore_for(device);
        let permit = match timeout {
            None => semaphore.acquire_owned().await.expect("semaphore never closed"),
            Some(duration) => tokio::time::timeout(duration, semaphore.acquire_owned())
                .await
                .map_err(|_| ResourceLockError::Timeout)?
                .expect("semaphore never closed"),
        };

        let mut devices = self.devices.lock().unwrap();
        let entry = devices.entry(device.to_string()).or_insert_with(DeviceLock::new);
        entry.owner = Some(lid);
        entry.permit = Some(permit);
        Ok(())
    }

    /// Releases `device`'s lock, which must currently be held by `lid`.
    pub fn unlock(&self, device: &str, lid: u32) -> Result<(), ResourceLockError> {
        let mut devices = self.devices.lock().unwrap();
        let entry = devices.entry(device.to_string()).or_insert_with(DeviceLock::new);
        if entry.owner != Some(lid) {
            return Err(ResourceLockError::NotOwner);
        }
        entry.owner = None;
        entry.permit = None;
        Ok(())
    }

    /// Releases `device`'s lock unconditionally, used during link teardown.
    pub fn force_unlock(&self, device: &str) {
        let mut devices = self.devices.lock().unwrap();
        if let Some(entry) = devices.get_mut(device) {
            entry.owner = None;
            entry.permit = None;
        }
    }

    /// A snapshot of lock ownership, for debugging/admin purposes
    /// (supplemented from `resource_manager.py:status`, see SPEC_FULL.md §C.1).
    pub fn status(&self) -> HashMap<String, Option<u32>> {
        let devices = self.devices.lock().unwrap();
        devices.iter().map(|(name, lock)| (name.clone(), lock.owner)).collect()
    }
}
