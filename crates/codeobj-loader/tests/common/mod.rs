//! Shared fixtures for loader integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};

use codeobj_loader::testing::ElfBuilder;
use codeobj_tracing::TracingConfig;
use codeobj_loader::{
    AgentHandle, Device, HostImage, LoaderConfig, ModuleLoader, QueueHandle, ReferenceRuntime, ThreadDeviceTable,
};

pub const AGENT: AgentHandle = AgentHandle(0xa600);
pub const DEFAULT_QUEUE: QueueHandle = QueueHandle(0x9000);

static TRACING: Once = Once::new();

/// Install the JSON subscriber once per test binary; `RUST_LOG` widens it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let config = TracingConfig {
            default_directive: "warn".to_string(),
            ..TracingConfig::for_ci()
        };
        if let Err(err) = codeobj_tracing::init_global_tracing(&config) {
            eprintln!("tracing not installed: {err}");
        }
    });
}

pub struct Fixture {
    pub runtime: Arc<ReferenceRuntime>,
    pub devices: Arc<ThreadDeviceTable>,
    pub loader: ModuleLoader,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(LoaderConfig::default())
    }

    pub fn with_config(config: LoaderConfig) -> Self {
        Self::with_runtime(ReferenceRuntime::new(), config)
    }

    pub fn with_runtime(runtime: ReferenceRuntime, config: LoaderConfig) -> Self {
        init_tracing();
        let runtime = Arc::new(runtime);
        let devices = Arc::new(ThreadDeviceTable::with_devices([Device::new(0, AGENT, DEFAULT_QUEUE)]));
        devices.set_current(0).unwrap();
        let loader = ModuleLoader::new(runtime.clone(), devices.clone(), config);
        Self {
            runtime,
            devices,
            loader,
        }
    }

    /// Same fixture, resolving device externs against `host`.
    pub fn with_host(mut self, host: HostImage) -> Self {
        let loader = std::mem::replace(
            &mut self.loader,
            ModuleLoader::new(self.runtime.clone(), self.devices.clone(), LoaderConfig::default()),
        );
        self.loader = loader.with_host_image(host);
        self
    }
}

/// Host image whose symbols `names[i]` live at `storage[i]`.
pub fn host_image_over(storage: &[u64], names: &[&str]) -> HostImage {
    let base = storage.as_ptr() as u64;
    let mut builder = ElfBuilder::new().elf_type(goblin::elf::header::ET_EXEC);
    for (i, name) in names.iter().enumerate() {
        builder = builder.object(name, (i * 8) as u64, 8);
    }
    HostImage::from_bytes("/test/host", &builder.build(), base).unwrap()
}

/// Device object with kernels `vadd` and `scale` and a global `table`.
pub fn device_object() -> ElfBuilder {
    ElfBuilder::new()
        .text(vec![0; 0x200])
        .function("vadd", 0x000, 0x100)
        .function("scale", 0x100, 0x100)
        .object("table", 0x180, 48)
}
