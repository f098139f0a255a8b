//! Device manager (C8, §4.8): the id→device map, lifecycle, and the per-device worker
//! handle that feeds IRPs to it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::irp::Irp;
use crate::pdu::efs::DeviceAnnounceHeader;

/// A registered device: its announce metadata plus the handle used to feed it IRPs.
pub struct DeviceEntry {
    pub announce: DeviceAnnounceHeader,
    pub irp_tx: UnboundedSender<Irp>,
    worker: JoinHandle<()>,
}

impl Drop for DeviceEntry {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

/// Thread-safe `u32 → Device` registry. `id` is assigned monotonically starting at 1,
/// matching the spec's devman contract (§3 Data model).
#[derive(Default)]
pub struct DeviceManager {
    next_id: AtomicU32,
    devices: Mutex<BTreeMap<u32, Arc<DeviceEntry>>>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    /// Reserves the next device id without registering anything yet; used so the device's
    /// own announce blob (which embeds the id) can be built before insertion.
    pub fn reserve_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&self, id: u32, announce: DeviceAnnounceHeader, irp_tx: UnboundedSender<Irp>, worker: JoinHandle<()>) {
        let entry = Arc::new(DeviceEntry { announce, irp_tx, worker });
        self.devices.lock().expect("devman mutex poisoned").insert(id, entry);
    }

    pub fn get(&self, id: u32) -> Option<Arc<DeviceEntry>> {
        self.devices.lock().expect("devman mutex poisoned").get(&id).cloned()
    }

    /// Removes and drops the device, aborting its worker task (`free()` in §3).
    pub fn remove(&self, id: u32) -> Option<Arc<DeviceEntry>> {
        self.devices.lock().expect("devman mutex poisoned").remove(&id)
    }

    /// Snapshot of every currently-registered device id, for announce/remove bookkeeping.
    pub fn iter_ids(&self) -> Vec<u32> {
        self.devices.lock().expect("devman mutex poisoned").keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().expect("devman mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::efs::{DeviceAnnounceHeader, DeviceType};

    #[tokio::test]
    async fn register_and_remove_round_trip() {
        let manager = DeviceManager::new();
        let id = manager.reserve_id();
        assert_eq!(id, 1);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let worker = tokio::spawn(async move {
            while rx.recv().await.is_some() {}
        });
        let announce = DeviceAnnounceHeader::new(DeviceType::Filesystem, id, "test", Vec::new());
        manager.register(id, announce, tx, worker);
        assert_eq!(manager.len(), 1);
        assert!(manager.get(id).is_some());
        manager.remove(id);
        assert!(manager.is_empty());
    }
}
