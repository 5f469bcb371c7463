//! Runtime-loaded HSA function pointers via dlopen.
//!
//! Works with any ROCm install that provides `libhsa-runtime64.so`; nothing
//! is linked at build time.

use std::ffi::{c_char, c_int, c_void};
use std::sync::OnceLock;

use libloading::Library;

// ---------------------------------------------------------------------------
// Status codes and enums
// ---------------------------------------------------------------------------

pub type HsaStatus = c_int;
pub const HSA_STATUS_SUCCESS: HsaStatus = 0;
pub const HSA_STATUS_INFO_BREAK: HsaStatus = 1;

pub const HSA_PROFILE_FULL: c_int = 1;
pub const HSA_DEFAULT_FLOAT_ROUNDING_MODE_DEFAULT: c_int = 0;

pub const HSA_DEVICE_TYPE_GPU: c_int = 1;
pub const HSA_AGENT_INFO_DEVICE: c_int = 17;
pub const HSA_AGENT_INFO_QUEUE_MAX_SIZE: c_int = 14;

pub const HSA_REGION_INFO_SEGMENT: c_int = 0;
pub const HSA_REGION_INFO_GLOBAL_FLAGS: c_int = 1;
pub const HSA_REGION_SEGMENT_GLOBAL: u32 = 0;
pub const HSA_REGION_GLOBAL_FLAG_KERNARG: u32 = 1;
pub const HSA_REGION_GLOBAL_FLAG_FINE_GRAINED: u32 = 2;

pub const HSA_EXECUTABLE_SYMBOL_INFO_TYPE: c_int = 0;
pub const HSA_EXECUTABLE_SYMBOL_INFO_VARIABLE_ADDRESS: c_int = 21;
pub const HSA_EXECUTABLE_SYMBOL_INFO_VARIABLE_SIZE: c_int = 9;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_OBJECT: c_int = 22;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_KERNARG_SEGMENT_SIZE: c_int = 11;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_GROUP_SEGMENT_SIZE: c_int = 13;
pub const HSA_EXECUTABLE_SYMBOL_INFO_KERNEL_PRIVATE_SEGMENT_SIZE: c_int = 14;
pub const HSA_SYMBOL_KIND_VARIABLE: u32 = 0;
pub const HSA_SYMBOL_KIND_KERNEL: u32 = 1;

pub const HSA_QUEUE_TYPE_MULTIPLE: c_int = 0;
pub const HSA_SIGNAL_CONDITION_LT: c_int = 2;
pub const HSA_WAIT_STATE_BLOCKED: c_int = 0;

// Opaque handles
pub type HsaAgent = u64;
pub type HsaRegion = u64;
pub type HsaExecutable = u64;
pub type HsaExecutableSymbol = u64;
pub type HsaCodeObject = u64;
pub type HsaCodeObjectReader = u64;
pub type HsaLoadedCodeObject = u64;
pub type HsaSignal = u64;

/// `hsa_queue_t`
#[repr(C)]
#[derive(Debug)]
#[allow(dead_code)]
pub struct HsaQueue {
    pub queue_type: u32,
    pub features: u32,
    pub base_address: *mut c_void,
    pub doorbell_signal: HsaSignal,
    pub size: u32,
    pub reserved1: u32,
    pub id: u64,
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnInit = unsafe extern "C" fn() -> HsaStatus;
type FnShutDown = unsafe extern "C" fn() -> HsaStatus;
type FnStatusString = unsafe extern "C" fn(HsaStatus, *mut *const c_char) -> HsaStatus;
pub type AgentCallback = unsafe extern "C" fn(HsaAgent, *mut c_void) -> HsaStatus;
type FnIterateAgents = unsafe extern "C" fn(AgentCallback, *mut c_void) -> HsaStatus;
type FnAgentGetInfo = unsafe extern "C" fn(HsaAgent, c_int, *mut c_void) -> HsaStatus;
pub type RegionCallback = unsafe extern "C" fn(HsaRegion, *mut c_void) -> HsaStatus;
type FnAgentIterateRegions = unsafe extern "C" fn(HsaAgent, RegionCallback, *mut c_void) -> HsaStatus;
type FnRegionGetInfo = unsafe extern "C" fn(HsaRegion, c_int, *mut c_void) -> HsaStatus;

type FnExecutableCreateAlt =
    unsafe extern "C" fn(c_int, c_int, *const c_char, *mut HsaExecutable) -> HsaStatus;
type FnExecutableLoadAgentCodeObject = unsafe extern "C" fn(
    HsaExecutable,
    HsaAgent,
    HsaCodeObjectReader,
    *const c_char,
    *mut HsaLoadedCodeObject,
) -> HsaStatus;
type FnExecutableLoadCodeObject =
    unsafe extern "C" fn(HsaExecutable, HsaAgent, HsaCodeObject, *const c_char) -> HsaStatus;
type FnExecutableFreeze = unsafe extern "C" fn(HsaExecutable, *const c_char) -> HsaStatus;
type FnExecutableDestroy = unsafe extern "C" fn(HsaExecutable) -> HsaStatus;
type FnExecutableGetSymbolByName =
    unsafe extern "C" fn(HsaExecutable, *const c_char, *const HsaAgent, *mut HsaExecutableSymbol) -> HsaStatus;
type FnExecutableSymbolGetInfo = unsafe extern "C" fn(HsaExecutableSymbol, c_int, *mut c_void) -> HsaStatus;
type FnExecutableGlobalVariableDefine =
    unsafe extern "C" fn(HsaExecutable, *const c_char, *mut c_void) -> HsaStatus;

type FnCodeObjectReaderCreateFromFile = unsafe extern "C" fn(c_int, *mut HsaCodeObjectReader) -> HsaStatus;
type FnCodeObjectReaderDestroy = unsafe extern "C" fn(HsaCodeObjectReader) -> HsaStatus;
type FnCodeObjectDeserialize =
    unsafe extern "C" fn(*mut c_void, usize, *const c_char, *mut HsaCodeObject) -> HsaStatus;
type FnCodeObjectDestroy = unsafe extern "C" fn(HsaCodeObject) -> HsaStatus;

type FnAmdMemoryLock =
    unsafe extern "C" fn(*mut c_void, usize, *mut HsaAgent, c_int, *mut *mut c_void) -> HsaStatus;
type FnAmdMemoryUnlock = unsafe extern "C" fn(*mut c_void) -> HsaStatus;
type FnMemoryAllocate = unsafe extern "C" fn(HsaRegion, usize, *mut *mut c_void) -> HsaStatus;
type FnMemoryFree = unsafe extern "C" fn(*mut c_void) -> HsaStatus;
type FnMemoryCopy = unsafe extern "C" fn(*mut c_void, *const c_void, usize) -> HsaStatus;

type FnQueueCreate = unsafe extern "C" fn(
    HsaAgent,
    u32,
    c_int,
    *mut c_void,
    *mut c_void,
    u32,
    u32,
    *mut *mut HsaQueue,
) -> HsaStatus;
type FnQueueDestroy = unsafe extern "C" fn(*mut HsaQueue) -> HsaStatus;
type FnQueueAddWriteIndex = unsafe extern "C" fn(*const HsaQueue, u64) -> u64;
type FnQueueLoadReadIndex = unsafe extern "C" fn(*const HsaQueue) -> u64;

type FnSignalCreate = unsafe extern "C" fn(i64, u32, *const HsaAgent, *mut HsaSignal) -> HsaStatus;
type FnSignalDestroy = unsafe extern "C" fn(HsaSignal) -> HsaStatus;
type FnSignalStore = unsafe extern "C" fn(HsaSignal, i64);
type FnSignalLoad = unsafe extern "C" fn(HsaSignal) -> i64;
type FnSignalWait = unsafe extern "C" fn(HsaSignal, c_int, i64, u64, c_int) -> i64;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct HsaApi {
    _lib: Library,
    pub init: FnInit,
    pub shut_down: FnShutDown,
    pub status_string: FnStatusString,
    pub iterate_agents: FnIterateAgents,
    pub agent_get_info: FnAgentGetInfo,
    pub agent_iterate_regions: FnAgentIterateRegions,
    pub region_get_info: FnRegionGetInfo,
    pub executable_create_alt: FnExecutableCreateAlt,
    pub executable_load_agent_code_object: FnExecutableLoadAgentCodeObject,
    pub executable_load_code_object: FnExecutableLoadCodeObject,
    pub executable_freeze: FnExecutableFreeze,
    pub executable_destroy: FnExecutableDestroy,
    pub executable_get_symbol_by_name: FnExecutableGetSymbolByName,
    pub executable_symbol_get_info: FnExecutableSymbolGetInfo,
    pub executable_global_variable_define: FnExecutableGlobalVariableDefine,
    pub code_object_reader_create_from_file: FnCodeObjectReaderCreateFromFile,
    pub code_object_reader_destroy: FnCodeObjectReaderDestroy,
    pub code_object_deserialize: FnCodeObjectDeserialize,
    pub code_object_destroy: FnCodeObjectDestroy,
    pub amd_memory_lock: FnAmdMemoryLock,
    pub amd_memory_unlock: FnAmdMemoryUnlock,
    pub memory_allocate: FnMemoryAllocate,
    pub memory_free: FnMemoryFree,
    pub memory_copy: FnMemoryCopy,
    pub queue_create: FnQueueCreate,
    pub queue_destroy: FnQueueDestroy,
    pub queue_add_write_index_relaxed: FnQueueAddWriteIndex,
    pub queue_load_read_index_scacquire: FnQueueLoadReadIndex,
    pub signal_create: FnSignalCreate,
    pub signal_destroy: FnSignalDestroy,
    pub signal_store_screlease: FnSignalStore,
    pub signal_load_scacquire: FnSignalLoad,
    pub signal_wait_scacquire: FnSignalWait,
}

// Safety: the function pointers are process-global and the HSA runtime is
// internally synchronized.
unsafe impl Send for HsaApi {}
unsafe impl Sync for HsaApi {}

static HSA_API: OnceLock<Option<HsaApi>> = OnceLock::new();

impl HsaApi {
    fn try_load() -> Option<Self> {
        let lib = unsafe { Library::new("libhsa-runtime64.so.1") }
            .or_else(|_| unsafe { Library::new("libhsa-runtime64.so") })
            .ok()?;
        unsafe {
            let api = HsaApi {
                init: *lib.get::<FnInit>(b"hsa_init\0").ok()?,
                shut_down: *lib.get::<FnShutDown>(b"hsa_shut_down\0").ok()?,
                status_string: *lib.get::<FnStatusString>(b"hsa_status_string\0").ok()?,
                iterate_agents: *lib.get::<FnIterateAgents>(b"hsa_iterate_agents\0").ok()?,
                agent_get_info: *lib.get::<FnAgentGetInfo>(b"hsa_agent_get_info\0").ok()?,
                agent_iterate_regions: *lib.get::<FnAgentIterateRegions>(b"hsa_agent_iterate_regions\0").ok()?,
                region_get_info: *lib.get::<FnRegionGetInfo>(b"hsa_region_get_info\0").ok()?,
                executable_create_alt: *lib.get::<FnExecutableCreateAlt>(b"hsa_executable_create_alt\0").ok()?,
                executable_load_agent_code_object: *lib
                    .get::<FnExecutableLoadAgentCodeObject>(b"hsa_executable_load_agent_code_object\0")
                    .ok()?,
                executable_load_code_object: *lib
                    .get::<FnExecutableLoadCodeObject>(b"hsa_executable_load_code_object\0")
                    .ok()?,
                executable_freeze: *lib.get::<FnExecutableFreeze>(b"hsa_executable_freeze\0").ok()?,
                executable_destroy: *lib.get::<FnExecutableDestroy>(b"hsa_executable_destroy\0").ok()?,
                executable_get_symbol_by_name: *lib
                    .get::<FnExecutableGetSymbolByName>(b"hsa_executable_get_symbol_by_name\0")
                    .ok()?,
                executable_symbol_get_info: *lib
                    .get::<FnExecutableSymbolGetInfo>(b"hsa_executable_symbol_get_info\0")
                    .ok()?,
                executable_global_variable_define: *lib
                    .get::<FnExecutableGlobalVariableDefine>(b"hsa_executable_global_variable_define\0")
                    .ok()?,
                code_object_reader_create_from_file: *lib
                    .get::<FnCodeObjectReaderCreateFromFile>(b"hsa_code_object_reader_create_from_file\0")
                    .ok()?,
                code_object_reader_destroy: *lib
                    .get::<FnCodeObjectReaderDestroy>(b"hsa_code_object_reader_destroy\0")
                    .ok()?,
                code_object_deserialize: *lib.get::<FnCodeObjectDeserialize>(b"hsa_code_object_deserialize\0").ok()?,
                code_object_destroy: *lib.get::<FnCodeObjectDestroy>(b"hsa_code_object_destroy\0").ok()?,
                amd_memory_lock: *lib.get::<FnAmdMemoryLock>(b"hsa_amd_memory_lock\0").ok()?,
                amd_memory_unlock: *lib.get::<FnAmdMemoryUnlock>(b"hsa_amd_memory_unlock\0").ok()?,
                memory_allocate: *lib.get::<FnMemoryAllocate>(b"hsa_memory_allocate\0").ok()?,
                memory_free: *lib.get::<FnMemoryFree>(b"hsa_memory_free\0").ok()?,
                memory_copy: *lib.get::<FnMemoryCopy>(b"hsa_memory_copy\0").ok()?,
                queue_create: *lib.get::<FnQueueCreate>(b"hsa_queue_create\0").ok()?,
                queue_destroy: *lib.get::<FnQueueDestroy>(b"hsa_queue_destroy\0").ok()?,
                queue_add_write_index_relaxed: *lib
                    .get::<FnQueueAddWriteIndex>(b"hsa_queue_add_write_index_relaxed\0")
                    .ok()?,
                queue_load_read_index_scacquire: *lib
                    .get::<FnQueueLoadReadIndex>(b"hsa_queue_load_read_index_scacquire\0")
                    .ok()?,
                signal_create: *lib.get::<FnSignalCreate>(b"hsa_signal_create\0").ok()?,
                signal_destroy: *lib.get::<FnSignalDestroy>(b"hsa_signal_destroy\0").ok()?,
                signal_store_screlease: *lib.get::<FnSignalStore>(b"hsa_signal_store_screlease\0").ok()?,
                signal_load_scacquire: *lib.get::<FnSignalLoad>(b"hsa_signal_load_scacquire\0").ok()?,
                signal_wait_scacquire: *lib.get::<FnSignalWait>(b"hsa_signal_wait_scacquire\0").ok()?,
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// The runtime-loaded HSA API, or `None` if the library is not installed.
pub fn hsa_api() -> Option<&'static HsaApi> {
    HSA_API.get_or_init(HsaApi::try_load).as_ref()
}

/// Human-readable text for `status`.
pub fn status_text(api: &HsaApi, status: HsaStatus) -> String {
    let mut text: *const c_char = std::ptr::null();
    let rc = unsafe { (api.status_string)(status, &mut text) };
    if rc != HSA_STATUS_SUCCESS || text.is_null() {
        return format!("status {status:#x}");
    }
    unsafe { std::ffi::CStr::from_ptr(text) }.to_string_lossy().into_owned()
}
