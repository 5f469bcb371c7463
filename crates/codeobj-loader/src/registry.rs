//! Resources that outlive the load that acquired them
//!
//! Host globals pinned for device access and the file readers backing
//! file-loaded code objects must stay alive for as long as any executable
//! may reference them. They are recorded here against the module that
//! acquired them on each successful load and released by
//! [`ResidencyRegistry::teardown`] once that module has been unloaded.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::RuntimeError;
use crate::module::ModuleId;
use crate::runtime::{ReaderHandle, Runtime};

/// A host global pinned and bound into an executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedGlobal {
    pub name: String,
    pub host_address: u64,
    pub device_address: u64,
    pub size: u64,
}

/// Outcome of [`ResidencyRegistry::teardown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub unpinned: usize,
    pub readers_destroyed: usize,
    /// Pins and readers kept because their module is still loaded
    pub in_use: usize,
    pub failures: Vec<RuntimeError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Default)]
struct Retained {
    pinned: Vec<(ModuleId, PinnedGlobal)>,
    readers: Vec<(ModuleId, ReaderHandle)>,
    live: HashSet<ModuleId>,
}

#[derive(Debug, Default)]
pub struct ResidencyRegistry {
    retained: Mutex<Retained>,
    torn_down: AtomicBool,
}

impl ResidencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what `module` keeps alive and mark it loaded.
    pub fn retain(&self, module: ModuleId, pins: impl IntoIterator<Item = PinnedGlobal>, reader: Option<ReaderHandle>) {
        let mut retained = self.retained.lock();
        retained.pinned.extend(pins.into_iter().map(|pin| (module, pin)));
        retained.readers.extend(reader.map(|reader| (module, reader)));
        retained.live.insert(module);
        self.torn_down.store(false, Ordering::Release);
    }

    /// `module` has been unloaded; its resources may go at the next teardown.
    pub fn release_module(&self, module: ModuleId) {
        self.retained.lock().live.remove(&module);
    }

    pub fn is_live(&self, module: ModuleId) -> bool {
        self.retained.lock().live.contains(&module)
    }

    pub fn live_count(&self) -> usize {
        self.retained.lock().live.len()
    }

    pub fn pinned_count(&self) -> usize {
        self.retained.lock().pinned.len()
    }

    pub fn reader_count(&self) -> usize {
        self.retained.lock().readers.len()
    }

    /// Snapshot of retained pins, in retention order.
    pub fn pinned(&self) -> Vec<PinnedGlobal> {
        self.retained.lock().pinned.iter().map(|(_, pin)| pin.clone()).collect()
    }

    /// True once a teardown left nothing behind.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Unpin the globals and destroy the readers of every unloaded module.
    ///
    /// Entries of modules still loaded are kept and counted in
    /// [`TeardownReport::in_use`]. Failures are logged and collected; a
    /// failed entry is not retried.
    pub fn teardown(&self, runtime: &dyn Runtime) -> TeardownReport {
        let (pinned, readers, in_use) = {
            let mut retained = self.retained.lock();
            let Retained { pinned, readers, live } = &mut *retained;
            let (kept_pins, released_pins): (Vec<_>, Vec<_>) =
                std::mem::take(pinned).into_iter().partition(|(module, _)| live.contains(module));
            let (kept_readers, released_readers): (Vec<_>, Vec<_>) =
                std::mem::take(readers).into_iter().partition(|(module, _)| live.contains(module));
            let in_use = kept_pins.len() + kept_readers.len();
            *pinned = kept_pins;
            *readers = kept_readers;
            (released_pins, released_readers, in_use)
        };
        let mut report = TeardownReport {
            in_use,
            ..TeardownReport::default()
        };

        for (_, pin) in pinned {
            match runtime.unlock_memory(pin.host_address) {
                Ok(()) => report.unpinned += 1,
                Err(err) => {
                    tracing::warn!(symbol = %pin.name, error = %err, "failed to unpin host global");
                    report.failures.push(err);
                }
            }
        }

        for (_, reader) in readers {
            match runtime.destroy_reader(reader) {
                Ok(()) => report.readers_destroyed += 1,
                Err(err) => {
                    tracing::warn!(%reader, error = %err, "failed to destroy code object reader");
                    report.failures.push(err);
                }
            }
        }

        if in_use > 0 {
            tracing::warn!(
                in_use,
                live_modules = self.live_count(),
                "residency teardown kept resources of loaded modules"
            );
        }
        self.torn_down.store(in_use == 0, Ordering::Release);
        tracing::info!(
            unpinned = report.unpinned,
            readers_destroyed = report.readers_destroyed,
            in_use,
            failures = report.failures.len(),
            "residency_teardown"
        );
        report
    }
}
