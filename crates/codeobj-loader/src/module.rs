//! Loaded modules and the symbols resolved from them

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::elf::ElfImage;
use crate::error::{ModuleError, Result};
use crate::runtime::{AgentHandle, CodeObjectHandle, ExecutableHandle, Runtime, SymbolKind};

/// Process-unique module identifier, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u64);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module{}", self.0)
    }
}

/// A kernel entry point resolved from a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    name: String,
    kernel_object: u64,
    group_segment_size: u32,
    private_segment_size: u32,
    kernarg_segment_size: u32,
}

impl FunctionSymbol {
    pub fn new(
        name: impl Into<String>,
        kernel_object: u64,
        group_segment_size: u32,
        private_segment_size: u32,
        kernarg_segment_size: u32,
    ) -> Self {
        Self {
            name: name.into(),
            kernel_object,
            group_segment_size,
            private_segment_size,
            kernarg_segment_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the kernel code descriptor
    pub fn kernel_object(&self) -> u64 {
        self.kernel_object
    }

    /// Static group (shared) segment bytes the kernel requires
    pub fn group_segment_size(&self) -> u32 {
        self.group_segment_size
    }

    /// Per-work-item private segment bytes
    pub fn private_segment_size(&self) -> u32 {
        self.private_segment_size
    }

    pub fn kernarg_segment_size(&self) -> u32 {
        self.kernarg_segment_size
    }
}

/// Address and byte size of a module global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalSymbol {
    pub address: u64,
    pub size: u64,
}

/// Where a module's image came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleSource {
    File(PathBuf),
    Memory,
}

impl fmt::Display for ModuleSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleSource::File(path) => write!(f, "{}", path.display()),
            ModuleSource::Memory => f.write_str("<memory>"),
        }
    }
}

/// Copy of a memory-loaded image in device-visible memory and the code
/// object deserialized from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DeviceImage {
    pub address: u64,
    pub size: usize,
    pub code_object: CodeObjectHandle,
}

/// Which runtime resources of a module an unload has already released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReleaseState {
    pub executable: bool,
    pub code_object: bool,
    pub device_image: bool,
}

/// One loaded, frozen device binary.
///
/// Must be released with [`crate::ModuleLoader::unload`]; dropping a module
/// without unloading leaves its executable alive in the runtime.
pub struct Module {
    id: ModuleId,
    agent: AgentHandle,
    executable: ExecutableHandle,
    source: ModuleSource,
    image: Vec<u8>,
    device_image: Option<DeviceImage>,
    functions: Mutex<Vec<Arc<FunctionSymbol>>>,
    released: Mutex<ReleaseState>,
}

impl Module {
    pub(crate) fn new(
        id: ModuleId,
        agent: AgentHandle,
        executable: ExecutableHandle,
        source: ModuleSource,
        image: Vec<u8>,
        device_image: Option<DeviceImage>,
    ) -> Self {
        Self {
            id,
            agent,
            executable,
            source,
            image,
            device_image,
            functions: Mutex::new(Vec::new()),
            released: Mutex::new(ReleaseState::default()),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Agent the module was loaded for.
    pub fn agent(&self) -> AgentHandle {
        self.agent
    }

    pub fn executable(&self) -> ExecutableHandle {
        self.executable
    }

    pub fn source(&self) -> &ModuleSource {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            ModuleSource::File(path) => Some(path),
            ModuleSource::Memory => None,
        }
    }

    /// Object image bytes retained for symbol-size queries.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Device-visible copy of a memory-loaded image: `(address, size)`.
    pub fn device_image(&self) -> Option<(u64, usize)> {
        self.device_image.map(|d| (d.address, d.size))
    }

    pub(crate) fn device_image_record(&self) -> Option<DeviceImage> {
        self.device_image
    }

    pub(crate) fn release_state(&self) -> MutexGuard<'_, ReleaseState> {
        self.released.lock()
    }

    fn ensure_executable(&self) -> Result<()> {
        if self.released.lock().executable {
            return Err(ModuleError::invalid_value(format!(
                "{} was partially unloaded; its executable is gone",
                self.id
            )));
        }
        Ok(())
    }

    /// Number of distinct functions resolved so far.
    pub fn function_count(&self) -> usize {
        self.functions.lock().len()
    }

    /// Names of resolved functions in first-lookup order.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.lock().iter().map(|f| f.name().to_string()).collect()
    }

    /// Look `name` up, reusing an earlier resolution when there is one.
    ///
    /// The function list stays locked across the runtime query so that
    /// concurrent first lookups of one name append a single record.
    pub(crate) fn resolve_function(
        &self,
        runtime: &dyn Runtime,
        agent: AgentHandle,
        name: &str,
    ) -> Result<Arc<FunctionSymbol>> {
        self.ensure_executable()?;
        let mut functions = self.functions.lock();
        if let Some(function) = functions.iter().find(|f| f.name() == name) {
            return Ok(Arc::clone(function));
        }

        let symbol = runtime
            .get_symbol(self.executable, agent, name)
            .map_err(|source| ModuleError::SymbolQuery {
                name: name.to_string(),
                source,
            })?
            .filter(|symbol| symbol.kind == SymbolKind::Kernel)
            .ok_or_else(|| ModuleError::SymbolNotFound(name.to_string()))?;

        let function = Arc::new(FunctionSymbol::new(
            name,
            symbol.address,
            symbol.group_segment_size,
            symbol.private_segment_size,
            symbol.kernarg_segment_size,
        ));
        functions.push(Arc::clone(&function));

        tracing::debug!(
            module = %self.id,
            kernel = name,
            kernel_object = function.kernel_object(),
            group_segment_size = function.group_segment_size(),
            private_segment_size = function.private_segment_size(),
            "function_resolved"
        );
        Ok(function)
    }

    /// Address of `name` and its declared size in the module image,
    /// falling back to the size the runtime reports.
    pub(crate) fn resolve_global(&self, runtime: &dyn Runtime, agent: AgentHandle, name: &str) -> Result<GlobalSymbol> {
        self.ensure_executable()?;
        let symbol = runtime
            .get_symbol(self.executable, agent, name)
            .map_err(|source| ModuleError::SymbolQuery {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| ModuleError::SymbolNotFound(name.to_string()))?;

        let declared = ElfImage::parse(&self.image)?.symbol_size(name)?;
        let size = if declared != 0 { declared } else { symbol.size };

        Ok(GlobalSymbol {
            address: symbol.address,
            size,
        })
    }

    /// Drop every resolved function record, returning how many there were.
    pub(crate) fn release_functions(&self) -> usize {
        let mut functions = self.functions.lock();
        let count = functions.len();
        functions.clear();
        count
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("executable", &self.executable)
            .field("source", &self.source)
            .field("image_len", &self.image.len())
            .field("device_image", &self.device_image)
            .field("functions", &self.function_count())
            .field("released", &*self.released.lock())
            .finish()
    }
}
