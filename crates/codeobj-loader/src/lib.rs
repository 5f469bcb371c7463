//! Device code-object loading and kernel dispatch
//!
//! This crate provides:
//! - **ELF reader**: section headers, symbol tables and image extents
//! - **Host symbol resolver**: binds a device object's undefined globals to
//!   pinned host storage
//! - **Module loader**: file and in-memory loads, symbol lookup, unload
//! - **Argument packer**: structured arguments or a raw extra buffer
//! - **Dispatch**: AQL kernel dispatch packets and the launch path
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      ModuleLoader                        │
//! │   load / load_data / get_function / launch / unload      │
//! └───────┬──────────────┬──────────────┬───────────────────┘
//!         │              │              │
//!         ▼              ▼              ▼
//!   ┌──────────┐  ┌────────────┐  ┌────────────┐
//!   │   ELF    │  │  Resolver  │  │  Kernarg   │
//!   │  reader  │  │ + registry │  │  + packet  │
//!   └──────────┘  └─────┬──────┘  └─────┬──────┘
//!                       │               │
//!                       ▼               ▼
//!               ┌─────────────────────────────┐
//!               │       dyn Runtime           │
//!               │  Reference  │  HSA (feature)│
//!               └─────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use codeobj_loader::{
//!     ArgInfo, Device, Dim3, KernelArgs, LoaderConfig, ModuleLoader, ReferenceRuntime, ThreadDeviceTable,
//!     AgentHandle, QueueHandle,
//! };
//! use codeobj_loader::testing::ElfBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Arc::new(ReferenceRuntime::new());
//! let devices = Arc::new(ThreadDeviceTable::with_devices([Device::new(0, AgentHandle(1), QueueHandle(1))]));
//! devices.set_current(0)?;
//!
//! let loader = ModuleLoader::new(runtime, devices, LoaderConfig::default());
//! let module = loader.load_data(&ElfBuilder::new().function("scale", 0, 64).build())?;
//! let scale = loader.get_function(&module, "scale")?;
//!
//! loader.register_kernel_args("scale", vec![ArgInfo::of::<u64>(), ArgInfo::of::<f32>()]);
//! let buffer = 0x1000u64.to_ne_bytes();
//! let factor = 2.0f32.to_ne_bytes();
//! let params: [&[u8]; 2] = [&buffer, &factor];
//! loader.launch_kernel(&scale, Dim3::linear(4), Dim3::linear(64), 0, None, &KernelArgs::params(&params))?;
//!
//! loader.unload(module)?;
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod elf;
pub mod error;
pub mod event;
pub mod host;
pub mod kernarg;
pub mod launch;
pub mod loader;
pub mod module;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod testing;

// Re-export public API
pub use backends::{FaultPoint, ReferenceRuntime};
pub use config::{FlushMode, LoaderConfig};
pub use device::{Device, DeviceResolver, ThreadDeviceTable};
pub use dispatch::{dispatch_header, Dim3, DispatchPacket};
pub use elf::{ElfError, ElfImage};
pub use error::{ErrorKind, ModuleError, Result, RuntimeError, UnloadError};
pub use event::{CompletionEvent, CompletionLease, Event, EventRecord, EventRole};
pub use host::{HostImage, HostSymbol};
pub use kernarg::{ArgInfo, ArgLayoutCache, KernargReader, KernelArgLayout, KernelArgs, KernelMetadata, PackedArgs};
pub use launch::{DefaultLaunchHooks, GlobalLaunch, LaunchGeometry, LaunchHooks};
pub use loader::{JitOption, ModuleLoader};
pub use module::{FunctionSymbol, GlobalSymbol, Module, ModuleId, ModuleSource};
pub use registry::{PinnedGlobal, ResidencyRegistry, TeardownReport};
pub use runtime::{
    AgentHandle, CodeObjectHandle, CompletionHandle, ExecutableHandle, ExecutableSymbol, QueueHandle, ReaderHandle,
    RegionHandle, Runtime, SymbolKind,
};

#[cfg(feature = "hsa")]
pub use backends::HsaRuntime;
