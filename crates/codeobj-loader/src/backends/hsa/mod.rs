//! [`Runtime`] over the HSA runtime library
//!
//! The library is bound with `dlopen` on first use. One multi-producer queue
//! is created per GPU agent; [`HsaRuntime::devices`] exposes them for a
//! device table. Kernel arguments are copied into the agent's kernarg region
//! per dispatch and released once the dispatch's signal reaches zero, either
//! by [`Runtime::synchronize`] or by the check each new dispatch makes.
//! Signals handed out as completion handles live until both the dispatch
//! has finished and [`Runtime::release_completion`] was called.

mod ffi;

use std::collections::{HashMap, HashSet};
use std::ffi::{c_void, CString};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use self::ffi::*;
use crate::device::Device;
use crate::dispatch::{DispatchPacket, PACKET_HEADER_TYPE, PACKET_TYPE_INVALID};
use crate::error::RuntimeError;
use crate::runtime::{
    AgentHandle, CodeObjectHandle, CompletionHandle, ExecutableHandle, ExecutableSymbol, QueueHandle, ReaderHandle,
    RegionHandle, Runtime, RuntimeResult,
};

const STATUS_ERROR: u32 = 0x1000;
const STATUS_INVALID_ARGUMENT: u32 = 0x1001;
const STATUS_INVALID_SYMBOL_NAME: HsaStatus = 0x1013;

#[derive(Debug, Clone, Copy)]
struct AgentQueue {
    agent: HsaAgent,
    /// `*mut HsaQueue`
    queue: u64,
    kernarg_region: HsaRegion,
}

#[derive(Debug)]
struct InFlight {
    agent: HsaAgent,
    signal: HsaSignal,
    kernargs: u64,
}

/// Completion signals handed to callers.
#[derive(Debug, Default)]
struct SignalBook {
    /// Still held by a caller
    leased: HashSet<HsaSignal>,
    /// Dispatch finished, waiting for the caller to let go
    retained: HashSet<HsaSignal>,
}

/// HSA-backed runtime.
pub struct HsaRuntime {
    api: &'static HsaApi,
    agents: Vec<AgentQueue>,
    readers: Mutex<HashMap<ReaderHandle, File>>,
    in_flight: Mutex<Vec<InFlight>>,
    signals: Mutex<SignalBook>,
}

impl HsaRuntime {
    /// Load the library, initialize it and create a queue on every GPU agent.
    pub fn new() -> RuntimeResult<Self> {
        let api = hsa_api().ok_or_else(|| {
            RuntimeError::new("hsa_init", STATUS_ERROR, "libhsa-runtime64.so could not be loaded")
        })?;
        check(api, unsafe { (api.init)() }, "hsa_init")?;

        let mut gpus: Vec<HsaAgent> = Vec::new();
        check(
            api,
            unsafe { (api.iterate_agents)(collect_gpu_agent, &mut gpus as *mut Vec<HsaAgent> as *mut c_void) },
            "iterate_agents",
        )?;

        let mut agents = Vec::with_capacity(gpus.len());
        for agent in gpus {
            let mut max_size: u32 = 0;
            check(
                api,
                unsafe {
                    (api.agent_get_info)(agent, HSA_AGENT_INFO_QUEUE_MAX_SIZE, &mut max_size as *mut u32 as *mut c_void)
                },
                "agent_get_info",
            )?;

            let mut queue: *mut HsaQueue = ptr::null_mut();
            check(
                api,
                unsafe {
                    (api.queue_create)(
                        agent,
                        max_size,
                        HSA_QUEUE_TYPE_MULTIPLE,
                        ptr::null_mut(),
                        ptr::null_mut(),
                        u32::MAX,
                        u32::MAX,
                        &mut queue,
                    )
                },
                "queue_create",
            )?;

            let kernarg_region = find_region(api, agent, HSA_REGION_GLOBAL_FLAG_KERNARG)?.ok_or_else(|| {
                RuntimeError::new("agent_iterate_regions", STATUS_ERROR, format!("agent {agent:#x} has no kernarg region"))
            })?;

            agents.push(AgentQueue {
                agent,
                queue: queue as u64,
                kernarg_region,
            });
        }

        tracing::info!(agents = agents.len(), "hsa_runtime_initialized");
        Ok(Self {
            api,
            agents,
            readers: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(Vec::new()),
            signals: Mutex::new(SignalBook::default()),
        })
    }

    /// One device per GPU agent, numbered in enumeration order.
    pub fn devices(&self) -> Vec<Device> {
        self.agents
            .iter()
            .enumerate()
            .map(|(id, a)| Device::new(id as u32, AgentHandle(a.agent), QueueHandle(a.queue)))
            .collect()
    }

    fn agent_queue(&self, agent: AgentHandle, op: &'static str) -> RuntimeResult<AgentQueue> {
        self.agents
            .iter()
            .find(|a| a.agent == agent.0)
            .copied()
            .ok_or_else(|| RuntimeError::new(op, STATUS_INVALID_ARGUMENT, format!("unknown {agent}")))
    }

    fn check(&self, status: HsaStatus, op: &'static str) -> RuntimeResult<()> {
        check(self.api, status, op)
    }

    fn symbol_info<T: Default>(&self, symbol: HsaExecutableSymbol, attribute: i32) -> RuntimeResult<T> {
        let mut value = T::default();
        self.check(
            unsafe { (self.api.executable_symbol_get_info)(symbol, attribute, &mut value as *mut T as *mut c_void) },
            "executable_symbol_get_info",
        )?;
        Ok(value)
    }

    /// Free a finished dispatch's kernel arguments, and its signal unless a
    /// caller still holds it.
    fn release(&self, entry: InFlight) {
        unsafe {
            (self.api.memory_free)(entry.kernargs as *mut c_void);
        }
        let mut signals = self.signals.lock();
        if signals.leased.contains(&entry.signal) {
            signals.retained.insert(entry.signal);
        } else {
            unsafe {
                (self.api.signal_destroy)(entry.signal);
            }
        }
    }

    /// Release every dispatch whose signal has already reached zero.
    fn reap_completed(&self) {
        let done: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            let (done, pending) = std::mem::take(&mut *in_flight)
                .into_iter()
                .partition(|entry| unsafe { (self.api.signal_load_scacquire)(entry.signal) } < 1);
            *in_flight = pending;
            done
        };
        if !done.is_empty() {
            tracing::trace!(reaped = done.len(), "hsa_dispatches_reaped");
        }
        for entry in done {
            self.release(entry);
        }
    }
}

fn check(api: &HsaApi, status: HsaStatus, op: &'static str) -> RuntimeResult<()> {
    if status == HSA_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(RuntimeError::new(op, status as u32, status_text(api, status)))
    }
}

fn c_name(name: &str, op: &'static str) -> RuntimeResult<CString> {
    CString::new(name).map_err(|_| RuntimeError::new(op, STATUS_INVALID_ARGUMENT, format!("`{name}` contains NUL")))
}

unsafe extern "C" fn collect_gpu_agent(agent: HsaAgent, data: *mut c_void) -> HsaStatus {
    let Some(api) = hsa_api() else {
        return HSA_STATUS_SUCCESS;
    };
    let mut device_type: i32 = 0;
    let status = (api.agent_get_info)(agent, HSA_AGENT_INFO_DEVICE, &mut device_type as *mut i32 as *mut c_void);
    if status == HSA_STATUS_SUCCESS && device_type == HSA_DEVICE_TYPE_GPU {
        (*(data as *mut Vec<HsaAgent>)).push(agent);
    }
    HSA_STATUS_SUCCESS
}

struct RegionQuery {
    flag: u32,
    found: Option<HsaRegion>,
}

unsafe extern "C" fn match_global_region(region: HsaRegion, data: *mut c_void) -> HsaStatus {
    let Some(api) = hsa_api() else {
        return HSA_STATUS_SUCCESS;
    };
    let query = &mut *(data as *mut RegionQuery);
    let mut segment: u32 = u32::MAX;
    (api.region_get_info)(region, HSA_REGION_INFO_SEGMENT, &mut segment as *mut u32 as *mut c_void);
    if segment != HSA_REGION_SEGMENT_GLOBAL {
        return HSA_STATUS_SUCCESS;
    }
    let mut flags: u32 = 0;
    (api.region_get_info)(region, HSA_REGION_INFO_GLOBAL_FLAGS, &mut flags as *mut u32 as *mut c_void);
    if flags & query.flag != 0 {
        query.found = Some(region);
        return HSA_STATUS_INFO_BREAK;
    }
    HSA_STATUS_SUCCESS
}

fn find_region(api: &HsaApi, agent: HsaAgent, flag: u32) -> RuntimeResult<Option<HsaRegion>> {
    let mut query = RegionQuery { flag, found: None };
    let status = unsafe {
        (api.agent_iterate_regions)(agent, match_global_region, &mut query as *mut RegionQuery as *mut c_void)
    };
    if status != HSA_STATUS_SUCCESS && status != HSA_STATUS_INFO_BREAK {
        check(api, status, "agent_iterate_regions")?;
    }
    Ok(query.found)
}

impl Runtime for HsaRuntime {
    fn name(&self) -> &str {
        "hsa"
    }

    fn create_executable(&self) -> RuntimeResult<ExecutableHandle> {
        let mut executable: HsaExecutable = 0;
        self.check(
            unsafe {
                (self.api.executable_create_alt)(
                    HSA_PROFILE_FULL,
                    HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT,
                    ptr::null(),
                    &mut executable,
                )
            },
            "executable_create",
        )?;
        Ok(ExecutableHandle(executable))
    }

    fn load_reader(&self, executable: ExecutableHandle, agent: AgentHandle, reader: ReaderHandle) -> RuntimeResult<()> {
        self.check(
            unsafe {
                (self.api.executable_load_agent_code_object)(
                    executable.0,
                    agent.0,
                    reader.0,
                    ptr::null(),
                    ptr::null_mut(),
                )
            },
            "executable_load_agent_code_object",
        )
    }

    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> RuntimeResult<()> {
        self.check(
            unsafe { (self.api.executable_load_code_object)(executable.0, agent.0, code_object.0, ptr::null()) },
            "executable_load_code_object",
        )
    }

    fn freeze(&self, executable: ExecutableHandle) -> RuntimeResult<()> {
        self.check(
            unsafe { (self.api.executable_freeze)(executable.0, ptr::null()) },
            "executable_freeze",
        )
    }

    fn destroy_executable(&self, executable: ExecutableHandle) -> RuntimeResult<()> {
        self.check(unsafe { (self.api.executable_destroy)(executable.0) }, "executable_destroy")
    }

    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        name: &str,
    ) -> RuntimeResult<Option<ExecutableSymbol>> {
        let c_name = c_name(name, "executable_get_symbol_by_name")?;
        let mut symbol: HsaExecutableSymbol = 0;
        let status = unsafe {
            (self.api.executable_get_symbol_by_name)(executable.0, c_name.as_ptr(), &agent.0, &mut symbol)
        };
        if status == STATUS_INVALID_SYMBOL_NAME {
            return Ok(None);
        }
        self.check(status, "executable_get_symbol_by_name")?;

        let kind: u32 = self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_TYPE)?;
        let resolved = match kind {
            HSA_SYMBOL_KIND_KERNEL => {
                let mut kernel = ExecutableSymbol::kernel(
                    name,
                    self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT)?,
                    self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE)?,
                    self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE)?,
                );
                kernel.kernarg_segment_size =
                    self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE)?;
                kernel
            }
            HSA_SYMBOL_KIND_VARIABLE => {
                let size: u32 = self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_VARIABLE_SIZE)?;
                ExecutableSymbol::variable(
                    name,
                    self.symbol_info(symbol, HSA_EXECUTABLE_SYMBOL_INFO_VARIABLE_ADDRESS)?,
                    u64::from(size),
                )
            }
            _ => return Ok(None),
        };
        Ok(Some(resolved))
    }

    fn define_global(&self, executable: ExecutableHandle, name: &str, address: u64) -> RuntimeResult<()> {
        let c_name = c_name(name, "executable_global_variable_define")?;
        self.check(
            unsafe {
                (self.api.executable_global_variable_define)(executable.0, c_name.as_ptr(), address as *mut c_void)
            },
            "executable_global_variable_define",
        )
    }

    fn create_reader_from_file(&self, path: &Path) -> RuntimeResult<ReaderHandle> {
        let file = File::open(path).map_err(|err| {
            RuntimeError::new(
                "code_object_reader_create_from_file",
                STATUS_INVALID_ARGUMENT,
                format!("{}: {err}", path.display()),
            )
        })?;
        let mut reader: HsaCodeObjectReader = 0;
        self.check(
            unsafe { (self.api.code_object_reader_create_from_file)(file.as_raw_fd(), &mut reader) },
            "code_object_reader_create_from_file",
        )?;
        // The descriptor must stay open for the reader's lifetime.
        self.readers.lock().insert(ReaderHandle(reader), file);
        Ok(ReaderHandle(reader))
    }

    fn destroy_reader(&self, reader: ReaderHandle) -> RuntimeResult<()> {
        let result = self.check(
            unsafe { (self.api.code_object_reader_destroy)(reader.0) },
            "code_object_reader_destroy",
        );
        self.readers.lock().remove(&reader);
        result
    }

    fn deserialize_code_object(&self, address: u64, size: usize) -> RuntimeResult<CodeObjectHandle> {
        let mut code_object: HsaCodeObject = 0;
        self.check(
            unsafe {
                (self.api.code_object_deserialize)(address as *mut c_void, size, ptr::null(), &mut code_object)
            },
            "code_object_deserialize",
        )?;
        Ok(CodeObjectHandle(code_object))
    }

    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> RuntimeResult<()> {
        self.check(unsafe { (self.api.code_object_destroy)(code_object.0) }, "code_object_destroy")
    }

    fn lock_memory(&self, agent: AgentHandle, host_address: u64, size: usize) -> RuntimeResult<u64> {
        let mut agents = [agent.0];
        let mut device_ptr: *mut c_void = ptr::null_mut();
        self.check(
            unsafe {
                (self.api.amd_memory_lock)(host_address as *mut c_void, size, agents.as_mut_ptr(), 1, &mut device_ptr)
            },
            "amd_memory_lock",
        )?;
        Ok(device_ptr as u64)
    }

    fn unlock_memory(&self, host_address: u64) -> RuntimeResult<()> {
        self.check(
            unsafe { (self.api.amd_memory_unlock)(host_address as *mut c_void) },
            "amd_memory_unlock",
        )
    }

    fn find_fine_grained_region(&self, agent: AgentHandle) -> RuntimeResult<Option<RegionHandle>> {
        Ok(find_region(self.api, agent.0, HSA_REGION_GLOBAL_FLAG_FINE_GRAINED)?.map(RegionHandle))
    }

    fn allocate(&self, region: RegionHandle, size: usize) -> RuntimeResult<u64> {
        let mut address: *mut c_void = ptr::null_mut();
        self.check(
            unsafe { (self.api.memory_allocate)(region.0, size, &mut address) },
            "memory_allocate",
        )?;
        Ok(address as u64)
    }

    fn free(&self, address: u64) -> RuntimeResult<()> {
        self.check(unsafe { (self.api.memory_free)(address as *mut c_void) }, "memory_free")
    }

    fn write_memory(&self, address: u64, bytes: &[u8]) -> RuntimeResult<()> {
        self.check(
            unsafe { (self.api.memory_copy)(address as *mut c_void, bytes.as_ptr() as *const c_void, bytes.len()) },
            "memory_copy",
        )
    }

    fn dispatch(
        &self,
        agent: AgentHandle,
        queue: QueueHandle,
        packet: &DispatchPacket,
        kernargs: &[u8],
        want_completion: bool,
    ) -> RuntimeResult<Option<CompletionHandle>> {
        let target = self.agent_queue(agent, "queue_dispatch")?;
        self.reap_completed();
        let queue_ptr = (if queue.0 == 0 { target.queue } else { queue.0 }) as *const HsaQueue;

        let mut kernarg_ptr: *mut c_void = ptr::null_mut();
        self.check(
            unsafe { (self.api.memory_allocate)(target.kernarg_region, kernargs.len().max(16), &mut kernarg_ptr) },
            "memory_allocate",
        )?;
        unsafe { ptr::copy_nonoverlapping(kernargs.as_ptr(), kernarg_ptr as *mut u8, kernargs.len()) };

        let mut signal: HsaSignal = 0;
        if let Err(err) = self.check(
            unsafe { (self.api.signal_create)(1, 0, ptr::null(), &mut signal) },
            "signal_create",
        ) {
            unsafe { (self.api.memory_free)(kernarg_ptr) };
            return Err(err);
        }

        let mut published = *packet;
        published.kernarg_address = kernarg_ptr as u64;
        published.completion_signal = signal;
        let header = published.header;
        let setup = published.setup;
        published.header = PACKET_TYPE_INVALID << PACKET_HEADER_TYPE;

        unsafe {
            let size = u64::from((*queue_ptr).size);
            let index = (self.api.queue_add_write_index_relaxed)(queue_ptr, 1);
            while index - (self.api.queue_load_read_index_scacquire)(queue_ptr) >= size {
                std::hint::spin_loop();
            }

            let slot = ((*queue_ptr).base_address as *mut DispatchPacket).add((index & (size - 1)) as usize);
            ptr::write_volatile(slot, published);
            // Publish header and setup together; the packet processor may
            // consume the slot as soon as the type is valid.
            (*(slot as *const AtomicU32)).store(u32::from(header) | (u32::from(setup) << 16), Ordering::Release);

            (self.api.signal_store_screlease)((*queue_ptr).doorbell_signal, index as i64);
        }

        if want_completion {
            self.signals.lock().leased.insert(signal);
        }
        self.in_flight.lock().push(InFlight {
            agent: agent.0,
            signal,
            kernargs: kernarg_ptr as u64,
        });
        Ok(want_completion.then_some(CompletionHandle(signal)))
    }

    fn synchronize(&self, agent: AgentHandle) -> RuntimeResult<()> {
        let pending: Vec<InFlight> = {
            let mut in_flight = self.in_flight.lock();
            let (mine, rest) = std::mem::take(&mut *in_flight)
                .into_iter()
                .partition(|entry| entry.agent == agent.0);
            *in_flight = rest;
            mine
        };

        for entry in pending {
            unsafe {
                (self.api.signal_wait_scacquire)(
                    entry.signal,
                    HSA_SIGNAL_CONDITION_LT,
                    1,
                    u64::MAX,
                    HSA_WAIT_STATE_BLOCKED,
                );
            }
            self.release(entry);
        }
        Ok(())
    }

    fn release_completion(&self, completion: CompletionHandle) -> RuntimeResult<()> {
        let mut signals = self.signals.lock();
        if !signals.leased.remove(&completion.0) {
            return Err(RuntimeError::new(
                "signal_destroy",
                STATUS_INVALID_ARGUMENT,
                format!("{completion} is not held"),
            ));
        }
        if signals.retained.remove(&completion.0) {
            unsafe { (self.api.signal_destroy)(completion.0) };
        }
        Ok(())
    }
}

impl Drop for HsaRuntime {
    fn drop(&mut self) {
        let agents: Vec<AgentHandle> = self.agents.iter().map(|a| AgentHandle(a.agent)).collect();
        for agent in agents {
            if let Err(err) = self.synchronize(agent) {
                tracing::warn!(%agent, error = %err, "failed to drain agent before shutdown");
            }
        }
        let signals = std::mem::take(&mut *self.signals.lock());
        for signal in signals.retained {
            unsafe { (self.api.signal_destroy)(signal) };
        }
        for agent in &self.agents {
            unsafe { (self.api.queue_destroy)(agent.queue as *mut HsaQueue) };
        }
        self.readers.lock().clear();
        unsafe { (self.api.shut_down)() };
    }
}
