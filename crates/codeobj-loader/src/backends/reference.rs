//! In-process reference runtime
//!
//! Implements [`Runtime`] without an accelerator. Executables, code objects,
//! pinned ranges and allocations live in memory; loaded images are parsed to
//! expose their symbols; submitted dispatches are recorded instead of run.
//!
//! ```text
//! ReferenceRuntime
//! ├── executables   - globals, loaded images, symbols, frozen flag
//! ├── code objects  - deserialized images
//! ├── readers       - file images
//! ├── memory        - allocations + pinned host ranges
//! ├── dispatches    - submitted packets with their kernarg bytes
//! └── journal       - every call in order, for ordering assertions
//! ```
//!
//! Function symbols (and `*.kd` kernel descriptors) become kernels; defined
//! object symbols become variables. Faults can be injected per operation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use parking_lot::Mutex;

use crate::dispatch::DispatchPacket;
use crate::elf::{ElfImage, SymbolType};
use crate::error::RuntimeError;
use crate::runtime::{
    AgentHandle, CodeObjectHandle, CompletionHandle, ExecutableHandle, ExecutableSymbol, QueueHandle, ReaderHandle,
    RegionHandle, Runtime, RuntimeResult,
};

pub const STATUS_ERROR: u32 = 0x1000;
pub const STATUS_INVALID_ARGUMENT: u32 = 0x1001;
pub const STATUS_OUT_OF_RESOURCES: u32 = 0x1008;
pub const STATUS_INVALID_CODE_OBJECT: u32 = 0x1010;
pub const STATUS_INVALID_EXECUTABLE: u32 = 0x1011;
pub const STATUS_FROZEN_EXECUTABLE: u32 = 0x1012;
pub const STATUS_INVALID_SYMBOL_NAME: u32 = 0x1013;
pub const STATUS_VARIABLE_UNDEFINED: u32 = 0x1015;

const FINE_GRAINED_REGION: RegionHandle = RegionHandle(0x1);
const ALLOCATION_BASE: u64 = 0x7f00_0000_0000;
const CODE_BASE: u64 = 0x7e00_0000_0000;
const KERNARG_BASE: u64 = 0x7d00_0000_0000;
const PAGE: u64 = 0x1000;
const KERNEL_DESCRIPTOR_SUFFIX: &str = ".kd";

/// Runtime operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CreateExecutable,
    CreateReader,
    LoadReader,
    DeserializeCodeObject,
    LoadCodeObject,
    Freeze,
    DestroyExecutable,
    GetSymbol,
    LockMemory,
    DefineGlobal,
    FindRegion,
    Allocate,
    Free,
    WriteMemory,
    Dispatch,
    Synchronize,
}

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    CreateExecutable(ExecutableHandle),
    LoadReader(ExecutableHandle, ReaderHandle),
    LoadCodeObject(ExecutableHandle, CodeObjectHandle),
    Freeze(ExecutableHandle),
    DestroyExecutable(ExecutableHandle),
    GetSymbol(ExecutableHandle, String),
    DefineGlobal(ExecutableHandle, String),
    CreateReader(ReaderHandle),
    DestroyReader(ReaderHandle),
    DeserializeCodeObject(CodeObjectHandle),
    DestroyCodeObject(CodeObjectHandle),
    LockMemory(u64),
    UnlockMemory(u64),
    Allocate(u64),
    Free(u64),
    WriteMemory(u64),
    Dispatch(QueueHandle),
    Synchronize(AgentHandle),
    ReleaseCompletion(CompletionHandle),
}

/// A packet submitted through [`Runtime::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedDispatch {
    pub agent: AgentHandle,
    pub queue: QueueHandle,
    /// As published: argument address and completion signal filled in
    pub packet: DispatchPacket,
    pub kernargs: Vec<u8>,
}

#[derive(Debug, Default)]
struct ExecutableState {
    frozen: bool,
    globals: HashMap<String, u64>,
    symbols: HashMap<String, ExecutableSymbol>,
    loaded: usize,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    next_code_base: u64,
    next_allocation: u64,
    next_kernarg: u64,
    executables: HashMap<ExecutableHandle, ExecutableState>,
    code_objects: HashMap<CodeObjectHandle, Vec<u8>>,
    readers: HashMap<ReaderHandle, Vec<u8>>,
    allocations: HashMap<u64, Vec<u8>>,
    pinned: HashMap<u64, (usize, usize)>,
    dispatches: Vec<SubmittedDispatch>,
    completions: HashSet<CompletionHandle>,
    journal: Vec<RuntimeCall>,
    faults: HashSet<FaultPoint>,
    segment_overrides: HashMap<String, (u32, u32)>,
    kernarg_sizes: HashMap<String, u32>,
    no_fine_grained_region: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check(&self, point: FaultPoint, op: &'static str) -> RuntimeResult<()> {
        if self.faults.contains(&point) {
            return Err(RuntimeError::new(op, STATUS_ERROR, "injected fault"));
        }
        Ok(())
    }

    fn executable_mut(&mut self, executable: ExecutableHandle, op: &'static str) -> RuntimeResult<&mut ExecutableState> {
        self.executables
            .get_mut(&executable)
            .ok_or_else(|| RuntimeError::new(op, STATUS_INVALID_EXECUTABLE, format!("unknown executable {executable}")))
    }

    /// Find the allocation containing `[address, address + len)`.
    fn allocation_range(&mut self, address: u64, len: usize) -> Option<(&mut Vec<u8>, usize)> {
        let (base, bytes) = self
            .allocations
            .iter_mut()
            .find(|(base, bytes)| address >= **base && address - **base + len as u64 <= bytes.len() as u64)?;
        let offset = (address - *base) as usize;
        Some((bytes, offset))
    }

    fn load_image(
        &mut self,
        executable: ExecutableHandle,
        image: &[u8],
        op: &'static str,
    ) -> RuntimeResult<()> {
        let invalid = |err: crate::elf::ElfError| RuntimeError::new(op, STATUS_INVALID_CODE_OBJECT, err.to_string());
        let elf = ElfImage::parse(image).map_err(invalid)?;

        let state = self
            .executables
            .get(&executable)
            .ok_or_else(|| RuntimeError::new(op, STATUS_INVALID_EXECUTABLE, format!("unknown executable {executable}")))?;
        if state.frozen {
            return Err(RuntimeError::new(op, STATUS_FROZEN_EXECUTABLE, format!("{executable} is frozen")));
        }

        if let Some(dynsym) = elf.dynamic_symbol_table().map_err(invalid)? {
            if let Some(missing) = dynsym.undefined().find(|s| !state.globals.contains_key(s.name)) {
                return Err(RuntimeError::new(
                    op,
                    STATUS_VARIABLE_UNDEFINED,
                    format!("undefined variable `{}`", missing.name),
                ));
            }
        }

        self.next_code_base += 1;
        let code_base = CODE_BASE + self.next_code_base * 0x100_0000;
        let mut symbols = Vec::new();
        for table in [elf.symbol_table().map_err(invalid)?, elf.dynamic_symbol_table().map_err(invalid)?]
            .into_iter()
            .flatten()
        {
            for symbol in table.iter().filter(|s| !s.is_undefined() && !s.name.is_empty()) {
                let address = code_base + symbol.value;
                let descriptor = symbol.name.strip_suffix(KERNEL_DESCRIPTOR_SUFFIX);
                let entry = match (symbol.kind, descriptor) {
                    (SymbolType::Object, Some(kernel)) | (SymbolType::Func, Some(kernel)) => {
                        self.kernel_symbol(kernel, address)
                    }
                    (SymbolType::Func, None) => self.kernel_symbol(symbol.name, address),
                    (SymbolType::Object, None) | (SymbolType::Common, None) | (SymbolType::Tls, None) => {
                        ExecutableSymbol::variable(symbol.name, address, symbol.size)
                    }
                    _ => continue,
                };
                symbols.push(entry);
            }
        }

        let state = self.executable_mut(executable, op)?;
        for symbol in symbols {
            state.symbols.entry(symbol.name.clone()).or_insert(symbol);
        }
        state.loaded += 1;
        Ok(())
    }

    fn kernel_symbol(&self, name: &str, kernel_object: u64) -> ExecutableSymbol {
        let (group, private) = self.segment_overrides.get(name).copied().unwrap_or((0, 0));
        let mut symbol = ExecutableSymbol::kernel(name, kernel_object, group, private);
        symbol.kernarg_segment_size = self.kernarg_sizes.get(name).copied().unwrap_or(0);
        symbol
    }
}

/// In-memory [`Runtime`].
#[derive(Debug, Default)]
pub struct ReferenceRuntime {
    state: Mutex<State>,
}

impl ReferenceRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `point` fail until [`Self::clear_faults`].
    pub fn inject_fault(&self, point: FaultPoint) {
        self.state.lock().faults.insert(point);
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Report no fine-grained region for any agent.
    pub fn without_fine_grained_region(self) -> Self {
        self.state.lock().no_fine_grained_region = true;
        self
    }

    /// Group and private segment sizes reported for kernels named `kernel`
    /// in images loaded after this call.
    pub fn set_segment_sizes(&self, kernel: &str, group: u32, private: u32) {
        self.state
            .lock()
            .segment_overrides
            .insert(kernel.to_string(), (group, private));
    }

    pub fn set_kernarg_segment_size(&self, kernel: &str, size: u32) {
        self.state.lock().kernarg_sizes.insert(kernel.to_string(), size);
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().journal.clone()
    }

    pub fn dispatches(&self) -> Vec<SubmittedDispatch> {
        self.state.lock().dispatches.clone()
    }

    pub fn last_dispatch(&self) -> Option<SubmittedDispatch> {
        self.state.lock().dispatches.last().cloned()
    }

    /// Completion handles returned by dispatch and not yet released.
    pub fn outstanding_completions(&self) -> usize {
        self.state.lock().completions.len()
    }

    pub fn executable_count(&self) -> usize {
        self.state.lock().executables.len()
    }

    pub fn is_frozen(&self, executable: ExecutableHandle) -> bool {
        self.state
            .lock()
            .executables
            .get(&executable)
            .is_some_and(|e| e.frozen)
    }

    pub fn code_object_count(&self) -> usize {
        self.state.lock().code_objects.len()
    }

    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    pub fn allocation_count(&self) -> usize {
        self.state.lock().allocations.len()
    }

    /// Bytes currently stored in the allocation at `address`.
    pub fn allocation_bytes(&self, address: u64) -> Option<Vec<u8>> {
        self.state.lock().allocations.get(&address).cloned()
    }

    /// Distinct host ranges currently pinned.
    pub fn pinned_count(&self) -> usize {
        self.state.lock().pinned.len()
    }

    pub fn defined_global(&self, executable: ExecutableHandle, name: &str) -> Option<u64> {
        self.state
            .lock()
            .executables
            .get(&executable)?
            .globals
            .get(name)
            .copied()
    }
}

impl Runtime for ReferenceRuntime {
    fn name(&self) -> &str {
        "reference"
    }

    fn create_executable(&self) -> RuntimeResult<ExecutableHandle> {
        let mut state = self.state.lock();
        state.check(FaultPoint::CreateExecutable, "executable_create")?;
        let handle = ExecutableHandle(state.next_id());
        state.executables.insert(handle, ExecutableState::default());
        state.journal.push(RuntimeCall::CreateExecutable(handle));
        Ok(handle)
    }

    fn load_reader(&self, executable: ExecutableHandle, _agent: AgentHandle, reader: ReaderHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::LoadReader(executable, reader));
        state.check(FaultPoint::LoadReader, "executable_load_agent_code_object")?;
        let image = state.readers.get(&reader).cloned().ok_or_else(|| {
            RuntimeError::new(
                "executable_load_agent_code_object",
                STATUS_INVALID_ARGUMENT,
                format!("unknown reader {reader}"),
            )
        })?;
        state.load_image(executable, &image, "executable_load_agent_code_object")
    }

    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        _agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::LoadCodeObject(executable, code_object));
        state.check(FaultPoint::LoadCodeObject, "executable_load_code_object")?;
        let image = state.code_objects.get(&code_object).cloned().ok_or_else(|| {
            RuntimeError::new(
                "executable_load_code_object",
                STATUS_INVALID_CODE_OBJECT,
                format!("unknown code object {code_object}"),
            )
        })?;
        state.load_image(executable, &image, "executable_load_code_object")
    }

    fn freeze(&self, executable: ExecutableHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::Freeze(executable));
        state.check(FaultPoint::Freeze, "executable_freeze")?;
        let exe = state.executable_mut(executable, "executable_freeze")?;
        if exe.frozen {
            return Err(RuntimeError::new(
                "executable_freeze",
                STATUS_FROZEN_EXECUTABLE,
                format!("{executable} already frozen"),
            ));
        }
        exe.frozen = true;
        Ok(())
    }

    fn destroy_executable(&self, executable: ExecutableHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::DestroyExecutable(executable));
        state.check(FaultPoint::DestroyExecutable, "executable_destroy")?;
        state
            .executables
            .remove(&executable)
            .map(|_| ())
            .ok_or_else(|| {
                RuntimeError::new(
                    "executable_destroy",
                    STATUS_INVALID_EXECUTABLE,
                    format!("unknown executable {executable}"),
                )
            })
    }

    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        _agent: AgentHandle,
        name: &str,
    ) -> RuntimeResult<Option<ExecutableSymbol>> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::GetSymbol(executable, name.to_string()));
        state.check(FaultPoint::GetSymbol, "executable_get_symbol")?;
        let exe = state.executable_mut(executable, "executable_get_symbol")?;
        if let Some(symbol) = exe.symbols.get(name) {
            return Ok(Some(symbol.clone()));
        }
        Ok(exe
            .globals
            .get(name)
            .map(|&address| ExecutableSymbol::variable(name, address, 0)))
    }

    fn define_global(&self, executable: ExecutableHandle, name: &str, address: u64) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::DefineGlobal(executable, name.to_string()));
        state.check(FaultPoint::DefineGlobal, "executable_global_variable_define")?;
        let exe = state.executable_mut(executable, "executable_global_variable_define")?;
        if exe.frozen {
            return Err(RuntimeError::new(
                "executable_global_variable_define",
                STATUS_FROZEN_EXECUTABLE,
                format!("{executable} is frozen"),
            ));
        }
        exe.globals.insert(name.to_string(), address);
        Ok(())
    }

    fn create_reader_from_file(&self, path: &Path) -> RuntimeResult<ReaderHandle> {
        let mut state = self.state.lock();
        state.check(FaultPoint::CreateReader, "code_object_reader_create_from_file")?;
        let bytes = fs::read(path).map_err(|err| {
            RuntimeError::new(
                "code_object_reader_create_from_file",
                STATUS_INVALID_ARGUMENT,
                format!("{}: {err}", path.display()),
            )
        })?;
        let reader = ReaderHandle(state.next_id());
        state.readers.insert(reader, bytes);
        state.journal.push(RuntimeCall::CreateReader(reader));
        Ok(reader)
    }

    fn destroy_reader(&self, reader: ReaderHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::DestroyReader(reader));
        state.readers.remove(&reader).map(|_| ()).ok_or_else(|| {
            RuntimeError::new(
                "code_object_reader_destroy",
                STATUS_INVALID_ARGUMENT,
                format!("unknown reader {reader}"),
            )
        })
    }

    fn deserialize_code_object(&self, address: u64, size: usize) -> RuntimeResult<CodeObjectHandle> {
        let mut state = self.state.lock();
        state.check(FaultPoint::DeserializeCodeObject, "code_object_deserialize")?;
        let bytes = state
            .allocation_range(address, size)
            .map(|(bytes, offset)| bytes[offset..offset + size].to_vec())
            .ok_or_else(|| {
                RuntimeError::new(
                    "code_object_deserialize",
                    STATUS_INVALID_ARGUMENT,
                    format!("{size} bytes at {address:#x} are not allocated"),
                )
            })?;
        ElfImage::parse(&bytes)
            .map_err(|err| RuntimeError::new("code_object_deserialize", STATUS_INVALID_CODE_OBJECT, err.to_string()))?;

        let handle = CodeObjectHandle(state.next_id());
        state.code_objects.insert(handle, bytes);
        state.journal.push(RuntimeCall::DeserializeCodeObject(handle));
        Ok(handle)
    }

    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::DestroyCodeObject(code_object));
        state.code_objects.remove(&code_object).map(|_| ()).ok_or_else(|| {
            RuntimeError::new(
                "code_object_destroy",
                STATUS_INVALID_CODE_OBJECT,
                format!("unknown code object {code_object}"),
            )
        })
    }

    fn lock_memory(&self, _agent: AgentHandle, host_address: u64, size: usize) -> RuntimeResult<u64> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::LockMemory(host_address));
        state.check(FaultPoint::LockMemory, "amd_memory_lock")?;
        if host_address == 0 || size == 0 {
            return Err(RuntimeError::new(
                "amd_memory_lock",
                STATUS_INVALID_ARGUMENT,
                "null or empty host range",
            ));
        }
        let entry = state.pinned.entry(host_address).or_insert((size, 0));
        entry.0 = entry.0.max(size);
        entry.1 += 1;
        // System memory: the agent sees the host address unchanged.
        Ok(host_address)
    }

    fn unlock_memory(&self, host_address: u64) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::UnlockMemory(host_address));
        let Some(entry) = state.pinned.get_mut(&host_address) else {
            return Err(RuntimeError::new(
                "amd_memory_unlock",
                STATUS_INVALID_ARGUMENT,
                format!("{host_address:#x} is not pinned"),
            ));
        };
        entry.1 -= 1;
        if entry.1 == 0 {
            state.pinned.remove(&host_address);
        }
        Ok(())
    }

    fn find_fine_grained_region(&self, _agent: AgentHandle) -> RuntimeResult<Option<RegionHandle>> {
        let state = self.state.lock();
        state.check(FaultPoint::FindRegion, "agent_iterate_regions")?;
        Ok((!state.no_fine_grained_region).then_some(FINE_GRAINED_REGION))
    }

    fn allocate(&self, region: RegionHandle, size: usize) -> RuntimeResult<u64> {
        let mut state = self.state.lock();
        state.check(FaultPoint::Allocate, "memory_allocate")?;
        if region != FINE_GRAINED_REGION || size == 0 {
            return Err(RuntimeError::new(
                "memory_allocate",
                STATUS_OUT_OF_RESOURCES,
                format!("cannot allocate {size} bytes from {region}"),
            ));
        }
        let pages = (size as u64).div_ceil(PAGE);
        let address = ALLOCATION_BASE + state.next_allocation * PAGE;
        state.next_allocation += pages + 1;
        state.allocations.insert(address, vec![0; size]);
        state.journal.push(RuntimeCall::Allocate(address));
        Ok(address)
    }

    fn free(&self, address: u64) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::Free(address));
        state.check(FaultPoint::Free, "memory_free")?;
        state.allocations.remove(&address).map(|_| ()).ok_or_else(|| {
            RuntimeError::new(
                "memory_free",
                STATUS_INVALID_ARGUMENT,
                format!("{address:#x} is not allocated"),
            )
        })
    }

    fn write_memory(&self, address: u64, bytes: &[u8]) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::WriteMemory(address));
        state.check(FaultPoint::WriteMemory, "memory_copy")?;
        let (target, offset) = state.allocation_range(address, bytes.len()).ok_or_else(|| {
            RuntimeError::new(
                "memory_copy",
                STATUS_INVALID_ARGUMENT,
                format!("{} bytes at {address:#x} are not allocated", bytes.len()),
            )
        })?;
        target[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn dispatch(
        &self,
        agent: AgentHandle,
        queue: QueueHandle,
        packet: &DispatchPacket,
        kernargs: &[u8],
        want_completion: bool,
    ) -> RuntimeResult<Option<CompletionHandle>> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::Dispatch(queue));
        state.check(FaultPoint::Dispatch, "queue_dispatch")?;

        let mut published = *packet;
        state.next_kernarg += 1;
        published.kernarg_address = KERNARG_BASE + state.next_kernarg * PAGE;

        let completion = want_completion.then(|| CompletionHandle(state.next_id()));
        published.completion_signal = completion.map(|c| c.id()).unwrap_or(0);
        if let Some(handle) = completion {
            state.completions.insert(handle);
        }

        state.dispatches.push(SubmittedDispatch {
            agent,
            queue,
            packet: published,
            kernargs: kernargs.to_vec(),
        });
        Ok(completion)
    }

    fn synchronize(&self, agent: AgentHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::Synchronize(agent));
        state.check(FaultPoint::Synchronize, "agent_synchronize")
    }

    fn release_completion(&self, completion: CompletionHandle) -> RuntimeResult<()> {
        let mut state = self.state.lock();
        state.journal.push(RuntimeCall::ReleaseCompletion(completion));
        if state.completions.remove(&completion) {
            Ok(())
        } else {
            Err(RuntimeError::new(
                "signal_destroy",
                STATUS_INVALID_ARGUMENT,
                format!("unknown completion {completion}"),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SymbolKind;
    use crate::testing::ElfBuilder;

    fn load_via_memory(runtime: &ReferenceRuntime, image: &[u8]) -> RuntimeResult<ExecutableHandle> {
        let region = runtime.find_fine_grained_region(AgentHandle(1))?.unwrap();
        let address = runtime.allocate(region, image.len())?;
        runtime.write_memory(address, image)?;
        let co = runtime.deserialize_code_object(address, image.len())?;
        let exe = runtime.create_executable()?;
        runtime.load_code_object(exe, AgentHandle(1), co)?;
        runtime.freeze(exe)?;
        Ok(exe)
    }

    #[test]
    fn exposes_kernels_and_variables() {
        let image = ElfBuilder::new()
            .function("vadd", 0x100, 64)
            .object("table", 0x400, 32)
            .object("legacy.kd", 0x800, 64)
            .build();
        let runtime = ReferenceRuntime::new();
        runtime.set_segment_sizes("vadd", 128, 16);
        let exe = load_via_memory(&runtime, &image).unwrap();

        let vadd = runtime.get_symbol(exe, AgentHandle(1), "vadd").unwrap().unwrap();
        assert_eq!(vadd.kind, SymbolKind::Kernel);
        assert_eq!(vadd.group_segment_size, 128);
        assert_eq!(vadd.private_segment_size, 16);

        let table = runtime.get_symbol(exe, AgentHandle(1), "table").unwrap().unwrap();
        assert_eq!(table.kind, SymbolKind::Variable);
        assert_eq!(table.size, 32);

        let legacy = runtime.get_symbol(exe, AgentHandle(1), "legacy").unwrap().unwrap();
        assert!(legacy.is_kernel());

        assert!(runtime.get_symbol(exe, AgentHandle(1), "nope").unwrap().is_none());
    }

    #[test]
    fn load_requires_defined_globals() {
        let image = ElfBuilder::new().function("k", 0, 4).undefined("host_flag").build();
        let runtime = ReferenceRuntime::new();
        let err = load_via_memory(&runtime, &image).unwrap_err();
        assert_eq!(err.status, STATUS_VARIABLE_UNDEFINED);
    }

    #[test]
    fn frozen_executable_rejects_loads_and_defines() {
        let image = ElfBuilder::new().function("k", 0, 4).build();
        let runtime = ReferenceRuntime::new();
        let exe = load_via_memory(&runtime, &image).unwrap();
        assert!(runtime.is_frozen(exe));

        let err = runtime.define_global(exe, "late", 0x10).unwrap_err();
        assert_eq!(err.status, STATUS_FROZEN_EXECUTABLE);
    }

    #[test]
    fn faults_fail_named_operation() {
        let runtime = ReferenceRuntime::new();
        runtime.inject_fault(FaultPoint::CreateExecutable);
        assert!(runtime.create_executable().is_err());
        runtime.clear_faults();
        assert!(runtime.create_executable().is_ok());
    }

    #[test]
    fn pins_are_reference_counted() {
        let runtime = ReferenceRuntime::new();
        runtime.lock_memory(AgentHandle(1), 0x5000, 8).unwrap();
        runtime.lock_memory(AgentHandle(1), 0x5000, 8).unwrap();
        runtime.unlock_memory(0x5000).unwrap();
        assert_eq!(runtime.pinned_count(), 1);
        runtime.unlock_memory(0x5000).unwrap();
        assert_eq!(runtime.pinned_count(), 0);
        assert!(runtime.unlock_memory(0x5000).is_err());
    }

    #[test]
    fn dispatch_fills_kernarg_address_and_signal() {
        let runtime = ReferenceRuntime::new();
        let packet = DispatchPacket::default();
        let signal = runtime
            .dispatch(AgentHandle(1), QueueHandle(2), &packet, &[1, 2, 3], true)
            .unwrap()
            .unwrap();

        let submitted = runtime.last_dispatch().unwrap();
        assert_ne!(submitted.packet.kernarg_address, 0);
        assert_eq!(submitted.packet.completion_signal, signal.id());
        assert_eq!(submitted.kernargs, vec![1, 2, 3]);

        assert!(runtime
            .dispatch(AgentHandle(1), QueueHandle(2), &packet, &[], false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn deserialize_rejects_unallocated_or_invalid_bytes() {
        let runtime = ReferenceRuntime::new();
        assert!(runtime.deserialize_code_object(0xdead, 16).is_err());

        let address = runtime.allocate(FINE_GRAINED_REGION, 64).unwrap();
        let err = runtime.deserialize_code_object(address, 64).unwrap_err();
        assert_eq!(err.status, STATUS_INVALID_CODE_OBJECT);
    }
}
