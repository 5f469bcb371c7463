//! Device identities and the calling thread's current device

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{ModuleError, Result};
use crate::runtime::{AgentHandle, QueueHandle};

/// One accelerator as seen by the surrounding runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Device {
    pub id: u32,
    pub agent: AgentHandle,
    /// Queue used when a launch names none
    pub default_queue: QueueHandle,
}

impl Device {
    pub fn new(id: u32, agent: AgentHandle, default_queue: QueueHandle) -> Self {
        Self {
            id,
            agent,
            default_queue,
        }
    }
}

/// Resolves which device the calling thread is working with.
pub trait DeviceResolver: Send + Sync {
    /// Device bound to the calling thread, if any.
    fn current_device(&self) -> Option<Device>;

    fn device(&self, id: u32) -> Option<Device>;
}

static NEXT_TABLE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Current device id of this thread, per table key.
    static CURRENT: RefCell<HashMap<u64, u32>> = RefCell::new(HashMap::new());
}

/// Device table with a per-thread current-device binding.
///
/// Bindings live in thread-local storage and go away with their thread.
#[derive(Debug)]
pub struct ThreadDeviceTable {
    key: u64,
    devices: RwLock<Vec<Device>>,
}

impl Default for ThreadDeviceTable {
    fn default() -> Self {
        Self {
            key: NEXT_TABLE.fetch_add(1, Ordering::Relaxed),
            devices: RwLock::new(Vec::new()),
        }
    }
}

impl ThreadDeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with `devices`, none bound to any thread yet.
    pub fn with_devices(devices: impl IntoIterator<Item = Device>) -> Self {
        let table = Self::new();
        table.devices.write().extend(devices);
        table
    }

    /// Add a device, replacing one with the same id.
    pub fn add_device(&self, device: Device) {
        let mut devices = self.devices.write();
        devices.retain(|existing| existing.id != device.id);
        devices.push(device);
    }

    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    /// Bind device `id` as current for the calling thread.
    pub fn set_current(&self, id: u32) -> Result<()> {
        if self.device(id).is_none() {
            return Err(ModuleError::invalid_value(format!("unknown device {id}")));
        }
        CURRENT.with(|current| current.borrow_mut().insert(self.key, id));
        Ok(())
    }

    /// Unbind the calling thread's current device.
    pub fn clear_current(&self) {
        CURRENT.with(|current| current.borrow_mut().remove(&self.key));
    }

    fn current_id(&self) -> Option<u32> {
        CURRENT.with(|current| current.borrow().get(&self.key).copied())
    }
}

impl Drop for ThreadDeviceTable {
    fn drop(&mut self) {
        // Other threads' bindings to this key are never consulted again.
        let _ = CURRENT.try_with(|current| current.borrow_mut().remove(&self.key));
    }
}

impl DeviceResolver for ThreadDeviceTable {
    fn current_device(&self) -> Option<Device> {
        self.device(self.current_id()?)
    }

    fn device(&self, id: u32) -> Option<Device> {
        self.devices.read().iter().find(|d| d.id == id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn gpu(id: u32) -> Device {
        Device::new(id, AgentHandle(0x100 + u64::from(id)), QueueHandle(0x200 + u64::from(id)))
    }

    #[test]
    fn no_current_device_until_bound() {
        let table = ThreadDeviceTable::with_devices([gpu(0), gpu(1)]);
        assert!(table.current_device().is_none());

        table.set_current(1).unwrap();
        assert_eq!(table.current_device(), Some(gpu(1)));

        table.clear_current();
        assert!(table.current_device().is_none());
    }

    #[test]
    fn unknown_device_rejected() {
        let table = ThreadDeviceTable::with_devices([gpu(0)]);
        assert!(matches!(table.set_current(7), Err(ModuleError::InvalidValue(_))));
    }

    #[test]
    fn binding_is_per_thread() {
        let table = Arc::new(ThreadDeviceTable::with_devices([gpu(0), gpu(1)]));
        table.set_current(0).unwrap();

        let other = Arc::clone(&table);
        let seen = std::thread::spawn(move || {
            let before = other.current_device();
            other.set_current(1).unwrap();
            (before, other.current_device())
        })
        .join()
        .unwrap();

        assert_eq!(seen, (None, Some(gpu(1))));
        assert_eq!(table.current_device(), Some(gpu(0)));
    }

    #[test]
    fn tables_bind_independently() {
        let first = ThreadDeviceTable::with_devices([gpu(0), gpu(1)]);
        let second = ThreadDeviceTable::with_devices([gpu(0), gpu(1)]);
        first.set_current(1).unwrap();
        assert!(second.current_device().is_none());

        second.set_current(0).unwrap();
        drop(first);
        assert_eq!(second.current_device(), Some(gpu(0)));
        CURRENT.with(|current| assert_eq!(current.borrow().len(), 1));
    }

    #[test]
    fn binding_ends_with_its_thread() {
        let table = Arc::new(ThreadDeviceTable::with_devices([gpu(0)]));
        let other = Arc::clone(&table);
        let bound = std::thread::spawn(move || {
            other.set_current(0).unwrap();
            CURRENT.with(|current| current.borrow().len())
        })
        .join()
        .unwrap();
        assert_eq!(bound, 1);
        assert!(table.current_device().is_none());
    }

    #[test]
    fn add_device_replaces_same_id() {
        let table = ThreadDeviceTable::new();
        table.add_device(gpu(0));
        table.add_device(Device::new(0, AgentHandle(9), QueueHandle(9)));
        assert_eq!(table.device_count(), 1);
        assert_eq!(table.device(0).unwrap().agent, AgentHandle(9));
    }
}
