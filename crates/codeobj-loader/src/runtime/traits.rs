//! Execution runtime collaborator
//!
//! The loader never talks to a device directly. Every step that touches an
//! accelerator goes through [`Runtime`], which mirrors the small subset of an
//! HSA-style runtime that module loading and kernel dispatch need.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                ModuleLoader                   │
//! └──────────────────────┬───────────────────────┘
//!                        │ Arc<dyn Runtime>
//!          ┌─────────────┴─────────────┐
//!          ▼                           ▼
//!   ┌──────────────┐           ┌──────────────┐
//!   │  Reference   │           │     HSA      │
//!   │  (in-process)│           │ (libloading) │
//!   └──────────────┘           └──────────────┘
//! ```

use std::path::Path;

use super::types::{
    AgentHandle, CodeObjectHandle, CompletionHandle, ExecutableHandle, ExecutableSymbol, QueueHandle,
    ReaderHandle, RegionHandle,
};
use crate::dispatch::DispatchPacket;
use crate::error::RuntimeError;

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Operations consumed from the execution runtime.
///
/// Addresses are plain `u64` values in the runtime's address space. Methods
/// take `&self`; implementations guard their own state.
pub trait Runtime: Send + Sync {
    /// Short runtime name used in logs
    fn name(&self) -> &str;

    // ===== Executables =====

    /// Create an empty, unfrozen executable.
    fn create_executable(&self) -> RuntimeResult<ExecutableHandle>;

    /// Load a code object from a file reader into `executable` for `agent`.
    fn load_reader(&self, executable: ExecutableHandle, agent: AgentHandle, reader: ReaderHandle) -> RuntimeResult<()>;

    /// Load a deserialized code object into `executable` for `agent`.
    fn load_code_object(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        code_object: CodeObjectHandle,
    ) -> RuntimeResult<()>;

    /// Make `executable` immutable and ready for dispatch.
    fn freeze(&self, executable: ExecutableHandle) -> RuntimeResult<()>;

    fn destroy_executable(&self, executable: ExecutableHandle) -> RuntimeResult<()>;

    /// Look up `name` in a frozen executable. `Ok(None)` means no such symbol.
    fn get_symbol(
        &self,
        executable: ExecutableHandle,
        agent: AgentHandle,
        name: &str,
    ) -> RuntimeResult<Option<ExecutableSymbol>>;

    /// Bind the external variable `name` of `executable` to `address`.
    /// Must be called before any code object referencing it is loaded.
    fn define_global(&self, executable: ExecutableHandle, name: &str, address: u64) -> RuntimeResult<()>;

    // ===== Code objects =====

    /// Open a code-object reader over the file at `path`.
    fn create_reader_from_file(&self, path: &Path) -> RuntimeResult<ReaderHandle>;

    fn destroy_reader(&self, reader: ReaderHandle) -> RuntimeResult<()>;

    /// Deserialize `size` bytes of serialized code object at `address`.
    fn deserialize_code_object(&self, address: u64, size: usize) -> RuntimeResult<CodeObjectHandle>;

    fn destroy_code_object(&self, code_object: CodeObjectHandle) -> RuntimeResult<()>;

    // ===== Memory =====

    /// Pin `size` bytes of host memory at `host_address` for direct access by
    /// `agent`, returning the agent-visible address.
    fn lock_memory(&self, agent: AgentHandle, host_address: u64, size: usize) -> RuntimeResult<u64>;

    fn unlock_memory(&self, host_address: u64) -> RuntimeResult<()>;

    /// The agent's global, fine-grained region, if it has one.
    fn find_fine_grained_region(&self, agent: AgentHandle) -> RuntimeResult<Option<RegionHandle>>;

    fn allocate(&self, region: RegionHandle, size: usize) -> RuntimeResult<u64>;

    fn free(&self, address: u64) -> RuntimeResult<()>;

    /// Copy `bytes` to runtime memory at `address` (previously allocated).
    fn write_memory(&self, address: u64, bytes: &[u8]) -> RuntimeResult<()>;

    // ===== Execution =====

    /// Submit a kernel dispatch packet on `queue`.
    ///
    /// The runtime copies `kernargs` into kernel-argument memory it owns and
    /// fills in the packet's argument address before publishing it. When
    /// `want_completion` is set a completion handle is returned.
    fn dispatch(
        &self,
        agent: AgentHandle,
        queue: QueueHandle,
        packet: &DispatchPacket,
        kernargs: &[u8],
        want_completion: bool,
    ) -> RuntimeResult<Option<CompletionHandle>>;

    /// Block until all work submitted to `agent` has completed.
    fn synchronize(&self, agent: AgentHandle) -> RuntimeResult<()>;

    /// The caller no longer holds `completion`. The runtime may reclaim the
    /// underlying signal once the dispatch has finished.
    fn release_completion(&self, completion: CompletionHandle) -> RuntimeResult<()> {
        let _ = completion;
        Ok(())
    }
}
