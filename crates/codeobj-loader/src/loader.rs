//! Module loading, symbol lookup and kernel launch
//!
//! ```text
//!             load(path)                        load_data(image)
//!                 │                                    │
//!      read file, parse ELF            parse ELF, measure extent
//!                 │                      allocate fine-grained memory
//!                 │                      copy image, deserialize
//!                 └──────────────┬─────────────────────┘
//!                                ▼
//!                      create executable
//!                      bind host globals  ◀── HostImage (lazy, cached)
//!                      load code object
//!                      freeze
//!                                │
//!                                ▼
//!                             Module ──▶ get_function / get_global
//!                                │
//!                                ▼
//!   launch_kernel ─┐
//!                  ├─▶ pack args ─▶ packet ─▶ pre_launch ─▶ dispatch ─▶ events ─▶ post_launch
//!   launch_global ─┘
//! ```
//!
//! Any failure during a load rolls back everything that load acquired. A
//! launch validates its packet before any hook runs, and `post_launch`
//! follows every `pre_launch` that returned a queue, even when the dispatch
//! then fails.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use codeobj_tracing::perf_span;
use codeobj_tracing::performance::{record_dispatch, record_module_load};
use parking_lot::Mutex;

use crate::config::LoaderConfig;
use crate::device::{Device, DeviceResolver};
use crate::dispatch::{Dim3, DispatchPacket};
use crate::elf::{ElfError, ElfImage};
use crate::error::{ModuleError, Result, RuntimeError, UnloadError};
use crate::event::{CompletionEvent, CompletionLease, EventRole};
use crate::host::HostImage;
use crate::kernarg::{pack_args, ArgInfo, ArgLayoutCache, KernelArgLayout, KernelArgs, KernelMetadata};
use crate::launch::{DefaultLaunchHooks, GlobalLaunch, LaunchGeometry, LaunchHooks, PostLaunch};
use crate::module::{DeviceImage, FunctionSymbol, GlobalSymbol, Module, ModuleId, ModuleSource};
use crate::registry::{PinnedGlobal, ResidencyRegistry, TeardownReport};
use crate::resolver::{bind_host_globals, release_pins};
use crate::runtime::{AgentHandle, CodeObjectHandle, ExecutableHandle, QueueHandle, ReaderHandle, Runtime};

/// Load options accepted by [`ModuleLoader::load_data_ex`].
///
/// None of them changes how a code object is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitOption {
    MaxRegisters(u32),
    ThreadsPerBlock(u32),
    OptimizationLevel(u32),
    InfoLogBufferBytes(usize),
    ErrorLogBufferBytes(usize),
    Other { option: u32, value: u64 },
}

/// Resources acquired by an in-progress load, released on drop unless the
/// load commits.
struct PartialLoad<'r> {
    runtime: &'r dyn Runtime,
    executable: Option<ExecutableHandle>,
    code_object: Option<CodeObjectHandle>,
    allocation: Option<u64>,
    reader: Option<ReaderHandle>,
    pins: Vec<PinnedGlobal>,
}

impl<'r> PartialLoad<'r> {
    fn new(runtime: &'r dyn Runtime) -> Self {
        Self {
            runtime,
            executable: None,
            code_object: None,
            allocation: None,
            reader: None,
            pins: Vec::new(),
        }
    }

    /// Keep everything; hand back what must outlive the module.
    fn commit(mut self) -> (Vec<PinnedGlobal>, Option<ReaderHandle>) {
        self.executable = None;
        self.code_object = None;
        self.allocation = None;
        (std::mem::take(&mut self.pins), self.reader.take())
    }
}

impl Drop for PartialLoad<'_> {
    fn drop(&mut self) {
        let runtime = self.runtime;
        let mut rolled_back = false;

        if let Some(executable) = self.executable.take() {
            rolled_back = true;
            if let Err(err) = runtime.destroy_executable(executable) {
                tracing::warn!(%executable, error = %err, "rollback: failed to destroy executable");
            }
        }
        if let Some(code_object) = self.code_object.take() {
            rolled_back = true;
            if let Err(err) = runtime.destroy_code_object(code_object) {
                tracing::warn!(%code_object, error = %err, "rollback: failed to destroy code object");
            }
        }
        if let Some(address) = self.allocation.take() {
            rolled_back = true;
            if let Err(err) = runtime.free(address) {
                tracing::warn!(address, error = %err, "rollback: failed to free device image");
            }
        }
        if let Some(reader) = self.reader.take() {
            rolled_back = true;
            if let Err(err) = runtime.destroy_reader(reader) {
                tracing::warn!(%reader, error = %err, "rollback: failed to destroy reader");
            }
        }
        if !self.pins.is_empty() {
            rolled_back = true;
            release_pins(runtime, &self.pins);
        }

        if rolled_back {
            tracing::debug!("partial_load_rolled_back");
        }
    }
}

/// Undefined dynamic symbols of a device object, by name.
fn undefined_globals(elf: &ElfImage<'_>) -> Result<Vec<String>> {
    Ok(elf
        .dynamic_symbol_table()?
        .map(|table| table.undefined().map(|s| s.name.to_string()).collect())
        .unwrap_or_default())
}

/// Loads device code objects for the calling thread's current device and
/// launches their kernels.
///
/// Owns the argument layout cache and the residency registry; the registry
/// is torn down by [`ModuleLoader::shutdown`] or when the loader is dropped.
pub struct ModuleLoader {
    runtime: Arc<dyn Runtime>,
    devices: Arc<dyn DeviceResolver>,
    hooks: Arc<dyn LaunchHooks>,
    config: LoaderConfig,
    layouts: ArgLayoutCache,
    residency: ResidencyRegistry,
    host_image: Mutex<Option<Arc<HostImage>>>,
    next_module: AtomicU64,
}

impl ModuleLoader {
    pub fn new(runtime: Arc<dyn Runtime>, devices: Arc<dyn DeviceResolver>, config: LoaderConfig) -> Self {
        tracing::debug!(runtime = runtime.name(), flush_mode = ?config.flush_mode, "module_loader_created");
        Self {
            runtime,
            devices,
            hooks: Arc::new(DefaultLaunchHooks),
            config,
            layouts: ArgLayoutCache::new(),
            residency: ResidencyRegistry::new(),
            host_image: Mutex::new(None),
            next_module: AtomicU64::new(1),
        }
    }

    /// Replace the launch hooks.
    pub fn with_hooks(mut self, hooks: Arc<dyn LaunchHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Use an already indexed host image instead of reading
    /// [`LoaderConfig::host_image`].
    pub fn with_host_image(self, host: HostImage) -> Self {
        *self.host_image.lock() = Some(Arc::new(host));
        self
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn layouts(&self) -> &ArgLayoutCache {
        &self.layouts
    }

    pub fn residency(&self) -> &ResidencyRegistry {
        &self.residency
    }

    fn current_device(&self) -> Result<Device> {
        self.devices.current_device().ok_or(ModuleError::InvalidContext)
    }

    fn next_id(&self) -> ModuleId {
        ModuleId(self.next_module.fetch_add(1, Ordering::Relaxed))
    }

    fn host_image(&self) -> Result<Arc<HostImage>> {
        let mut cached = self.host_image.lock();
        if let Some(host) = cached.as_ref() {
            return Ok(Arc::clone(host));
        }
        let host = Arc::new(HostImage::load(&self.config)?);
        *cached = Some(Arc::clone(&host));
        Ok(host)
    }

    /// Pin and define every name in `undefined`; the host image is only read
    /// when there is something to resolve.
    fn bind_globals(
        &self,
        partial: &mut PartialLoad<'_>,
        agent: AgentHandle,
        executable: ExecutableHandle,
        undefined: &[String],
    ) -> Result<()> {
        if undefined.is_empty() {
            return Ok(());
        }
        let host = self.host_image()?;
        let names: Vec<&str> = undefined.iter().map(String::as_str).collect();
        partial.pins = bind_host_globals(self.runtime.as_ref(), &host, agent, executable, &names)?;
        Ok(())
    }

    fn commit(&self, partial: PartialLoad<'_>) -> ModuleId {
        let id = self.next_id();
        let (pins, reader) = partial.commit();
        self.residency.retain(id, pins, reader);
        id
    }

    /// Load the code object file at `path`.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Module> {
        let path = path.as_ref();
        let device = self.current_device()?;
        let started = Instant::now();
        let source = path.display().to_string();
        let _span = perf_span!("module_load", source = source.as_str());

        let image = fs::read(path).map_err(|source| ModuleError::FileNotFound {
            path: path.to_path_buf(),
            source,
        })?;
        let undefined = undefined_globals(&ElfImage::parse(&image)?)?;

        let runtime = self.runtime.as_ref();
        let mut partial = PartialLoad::new(runtime);

        let executable = runtime.create_executable().map_err(ModuleError::LoadFailed)?;
        partial.executable = Some(executable);

        self.bind_globals(&mut partial, device.agent, executable, &undefined)?;

        let reader = runtime
            .create_reader_from_file(path)
            .map_err(ModuleError::LoadFailed)?;
        partial.reader = Some(reader);

        runtime
            .load_reader(executable, device.agent, reader)
            .map_err(ModuleError::LoadFailed)?;
        runtime.freeze(executable).map_err(ModuleError::LoadFailed)?;
        let id = self.commit(partial);

        let module = Module::new(
            id,
            device.agent,
            executable,
            ModuleSource::File(path.to_path_buf()),
            image,
            None,
        );
        self.finish_load(&module, undefined.len(), started);
        Ok(module)
    }

    /// Load a code object from an in-memory image.
    ///
    /// Only the image's extent is copied; trailing bytes are ignored.
    pub fn load_data(&self, image: &[u8]) -> Result<Module> {
        let device = self.current_device()?;
        let started = Instant::now();
        let _span = perf_span!("module_load", source = "memory", bytes = image.len());

        let elf = ElfImage::parse(image)?;
        let extent = elf.extent();
        if extent > image.len() as u64 {
            return Err(ElfError::Truncated {
                what: "code object",
                offset: 0,
                size: extent,
                len: image.len(),
            }
            .into());
        }
        if extent == 0 {
            return Err(ModuleError::invalid_value("code object has no section header table"));
        }
        let size = extent as usize;
        let image = &image[..size];
        let undefined = undefined_globals(&elf)?;

        let runtime = self.runtime.as_ref();
        let mut partial = PartialLoad::new(runtime);

        let region = runtime
            .find_fine_grained_region(device.agent)
            .map_err(|err| ModuleError::out_of_memory(err.to_string()))?
            .ok_or_else(|| {
                ModuleError::out_of_memory(format!("{} has no global fine-grained memory region", device.agent))
            })?;
        let address = runtime
            .allocate(region, size)
            .map_err(|err| ModuleError::out_of_memory(err.to_string()))?;
        partial.allocation = Some(address);

        runtime.write_memory(address, image).map_err(ModuleError::LoadFailed)?;
        let code_object = runtime
            .deserialize_code_object(address, size)
            .map_err(ModuleError::LoadFailed)?;
        partial.code_object = Some(code_object);

        let executable = runtime.create_executable().map_err(ModuleError::LoadFailed)?;
        partial.executable = Some(executable);

        self.bind_globals(&mut partial, device.agent, executable, &undefined)?;

        runtime
            .load_code_object(executable, device.agent, code_object)
            .map_err(ModuleError::LoadFailed)?;
        runtime.freeze(executable).map_err(ModuleError::LoadFailed)?;
        let id = self.commit(partial);

        let module = Module::new(
            id,
            device.agent,
            executable,
            ModuleSource::Memory,
            image.to_vec(),
            Some(DeviceImage {
                address,
                size,
                code_object,
            }),
        );
        self.finish_load(&module, undefined.len(), started);
        Ok(module)
    }

    /// [`Self::load_data`] accepting load options, which are ignored.
    pub fn load_data_ex(&self, image: &[u8], options: &[JitOption]) -> Result<Module> {
        if !options.is_empty() {
            tracing::warn!(count = options.len(), ?options, "load options are not supported and were ignored");
        }
        self.load_data(image)
    }

    fn finish_load(&self, module: &Module, undefined: usize, started: Instant) {
        let duration_us = started.elapsed().as_micros() as u64;
        record_module_load(
            &module.source().to_string(),
            module.image().len() as u64,
            undefined,
            duration_us,
        );
        tracing::info!(
            module = %module.id(),
            source = %module.source(),
            executable = %module.executable(),
            bytes = module.image().len(),
            bound_globals = undefined,
            "module_loaded"
        );
    }

    /// Release `module`.
    ///
    /// Blocks until all work on the module's device has finished, then
    /// destroys the executable and, for memory loads, the code object and
    /// its device image. The first failing step stops the unload and the
    /// module comes back inside the error; steps that succeeded are not
    /// repeated when it is unloaded again.
    pub fn unload(&self, module: Module) -> std::result::Result<(), UnloadError> {
        match self.release_module(&module) {
            Ok(functions) => {
                self.residency.release_module(module.id());
                tracing::info!(module = %module.id(), functions, "module_unloaded");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(module = %module.id(), error = %err, "module unload stopped");
                Err(UnloadError::new(module, ModuleError::Runtime(err)))
            }
        }
    }

    /// Release whatever runtime resources `module` still holds, returning
    /// how many function records were dropped.
    ///
    /// The device image is never freed while the executable or code object
    /// that may reference it is still alive.
    fn release_module(&self, module: &Module) -> std::result::Result<usize, RuntimeError> {
        let runtime = self.runtime.as_ref();
        runtime.synchronize(module.agent())?;

        let mut released = module.release_state();
        if !released.executable {
            runtime.destroy_executable(module.executable())?;
            released.executable = true;
        }
        let functions = module.release_functions();

        if let Some(device_image) = module.device_image_record() {
            if !released.code_object {
                runtime.destroy_code_object(device_image.code_object)?;
                released.code_object = true;
            }
            if !released.device_image {
                runtime.free(device_image.address)?;
                released.device_image = true;
            }
        }
        Ok(functions)
    }

    /// Kernel entry point `name` of `module`.
    pub fn get_function(&self, module: &Module, name: &str) -> Result<Arc<FunctionSymbol>> {
        let device = self.current_device()?;
        module.resolve_function(self.runtime.as_ref(), device.agent, name)
    }

    /// Address and size of the global variable `name` of `module`.
    pub fn get_global(&self, module: &Module, name: &str) -> Result<GlobalSymbol> {
        let device = self.current_device()?;
        module.resolve_global(self.runtime.as_ref(), device.agent, name)
    }

    /// Declare the formal parameters of `kernel` for structured launches.
    pub fn register_kernel_args(&self, kernel: &str, args: Vec<ArgInfo>) {
        self.layouts.declare(kernel, args);
    }

    /// Register a precomputed argument layout for `kernel`.
    pub fn register_kernel_layout(&self, kernel: &str, layout: KernelArgLayout) -> Arc<KernelArgLayout> {
        self.layouts.register(kernel, layout)
    }

    /// Declare every kernel of a JSON metadata document, returning how many
    /// there were.
    pub fn register_kernel_metadata_json(&self, json: &str) -> Result<usize> {
        let count = self.layouts.declare_metadata(KernelMetadata::from_json(json)?);
        tracing::debug!(kernels = count, "kernel_metadata_registered");
        Ok(count)
    }

    /// Launch `function` over `blocks` workgroups of `block` work-items.
    pub fn launch_kernel(
        &self,
        function: &FunctionSymbol,
        blocks: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        queue: Option<QueueHandle>,
        args: &KernelArgs<'_>,
    ) -> Result<()> {
        let geometry = LaunchGeometry::from_block_count(blocks, block, shared_mem_bytes as usize)?;
        self.launch(function, geometry, queue, None, None, args)
    }

    /// Launch `function` over a total grid of work-items, optionally
    /// attaching completion events.
    pub fn launch_kernel_global(
        &self,
        function: &FunctionSymbol,
        launch: &GlobalLaunch<'_>,
        args: &KernelArgs<'_>,
    ) -> Result<()> {
        self.launch(
            function,
            launch.geometry(),
            launch.queue,
            launch.start_event,
            launch.stop_event,
            args,
        )
    }

    fn launch(
        &self,
        function: &FunctionSymbol,
        geometry: LaunchGeometry,
        queue: Option<QueueHandle>,
        start_event: Option<&dyn CompletionEvent>,
        stop_event: Option<&dyn CompletionEvent>,
        args: &KernelArgs<'_>,
    ) -> Result<()> {
        let device = self.current_device()?;
        let kernel = function.name();

        let packed = pack_args(kernel, args, &self.layouts)?;
        let packet = DispatchPacket::for_kernel(
            function,
            geometry.grid,
            geometry.block,
            geometry.dynamic_shared_mem,
            self.config.flush_mode,
        )?;

        let mut reported = geometry;
        let queue = self.hooks.pre_launch(&device, queue, &mut reported, kernel)?;
        let _post_launch = PostLaunch::new(self.hooks.as_ref(), kernel, queue, reported);

        let want_completion = start_event.is_some() || stop_event.is_some();
        let completion = self
            .runtime
            .dispatch(device.agent, queue, &packet, packed.as_bytes(), want_completion)
            .map_err(ModuleError::Runtime)?;

        if let Some(handle) = completion {
            let lease = CompletionLease::new(handle, Arc::downgrade(&self.runtime));
            if let Some(event) = start_event {
                event.attach(&lease, queue, EventRole::Start);
            }
            if let Some(event) = stop_event {
                event.attach(&lease, queue, EventRole::Stop);
            }
        }

        let kernarg_bytes = packed.as_bytes().len();
        drop(packed);

        record_dispatch(
            kernel,
            queue.id(),
            geometry.grid.as_array(),
            geometry.block.as_array(),
            kernarg_bytes,
        );
        Ok(())
    }

    /// Unpin the host globals and destroy the readers of every unloaded
    /// module. Modules still loaded keep theirs.
    pub fn shutdown(&self) -> TeardownReport {
        self.residency.teardown(self.runtime.as_ref())
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        if self.residency.pinned_count() > 0 || self.residency.reader_count() > 0 {
            let report = self.shutdown();
            if !report.is_clean() {
                tracing::warn!(failures = report.failures.len(), "residency teardown reported failures");
            }
        }
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .field("layouts", &self.layouts.len())
            .field("pinned", &self.residency.pinned_count())
            .field("readers", &self.residency.reader_count())
            .field("live_modules", &self.residency.live_count())
            .finish()
    }
}
