//! Error types for module loading and kernel launch

use std::fmt;
use std::path::PathBuf;

use crate::elf::ElfError;
use crate::module::Module;

/// Result type for loader operations
pub type Result<T> = std::result::Result<T, ModuleError>;

/// Status reported by a runtime collaborator call that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{op} failed with status {status:#x}: {message}")]
pub struct RuntimeError {
    /// Name of the collaborator operation (e.g. `executable_freeze`)
    pub op: &'static str,
    /// Raw status code reported by the runtime
    pub status: u32,
    pub message: String,
}

impl RuntimeError {
    pub fn new(op: &'static str, status: u32, message: impl Into<String>) -> Self {
        Self {
            op,
            status,
            message: message.into(),
        }
    }
}

/// Coarse classification of a [`ModuleError`], matching the status codes a
/// driver-style API would return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidValue,
    NotFound,
    InvalidContext,
    OutOfMemory,
    LoadFailure,
    NotInitialized,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::InvalidValue => "invalid value",
            ErrorKind::NotFound => "not found",
            ErrorKind::InvalidContext => "invalid context",
            ErrorKind::OutOfMemory => "out of memory",
            ErrorKind::LoadFailure => "load failure",
            ErrorKind::NotInitialized => "not initialized",
        };
        f.write_str(s)
    }
}

/// Errors returned across the public loader surface
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    /// A required argument was missing or malformed
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The code object file could not be opened or read
    #[error("code object file {path} could not be read: {source}")]
    FileNotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The image is not a well-formed object file
    #[error("malformed code object: {0}")]
    MalformedObject(#[from] ElfError),

    /// The device binary references a symbol the host image does not define
    #[error("undefined symbol `{0}` has no definition in the host image")]
    UnresolvedSymbol(String),

    /// The host image used for symbol resolution is unavailable
    #[error("host image {path} unavailable: {reason}")]
    HostImageUnavailable { path: PathBuf, reason: String },

    /// Named symbol is absent from the executable
    #[error("symbol `{0}` not found in module")]
    SymbolNotFound(String),

    /// Runtime-side symbol query failed
    #[error("symbol `{name}` could not be queried: {source}")]
    SymbolQuery {
        name: String,
        #[source]
        source: RuntimeError,
    },

    /// No current device is bound to the calling thread
    #[error("no current device bound to this thread")]
    InvalidContext,

    /// Device-visible memory could not be obtained
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A runtime step of loading (deserialize / load / freeze) failed
    #[error("code object load failed: {0}")]
    LoadFailed(#[source] RuntimeError),

    /// Runtime operation failed outside of loading
    #[error("runtime operation failed: {0}")]
    Runtime(#[source] RuntimeError),

    /// Structured arguments requested for a kernel without a known layout
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Neither structured arguments nor a raw argument buffer was supplied
    #[error("no kernel arguments supplied")]
    MissingKernelArgs,

    /// Launch configuration is not acceptable
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// Kernel argument metadata could not be parsed
    #[error("invalid kernel metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl ModuleError {
    /// Create an invalid value error
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Create an invalid launch configuration error
    pub fn invalid_launch(msg: impl Into<String>) -> Self {
        Self::InvalidLaunchConfig(msg.into())
    }

    /// Create an out-of-memory error
    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::OutOfMemory(msg.into())
    }

    /// Status class this error reports at the API boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModuleError::InvalidValue(_)
            | ModuleError::MissingKernelArgs
            | ModuleError::InvalidLaunchConfig(_)
            | ModuleError::Metadata(_) => ErrorKind::InvalidValue,
            ModuleError::FileNotFound { .. }
            | ModuleError::SymbolNotFound(_)
            | ModuleError::SymbolQuery { .. } => ErrorKind::NotFound,
            ModuleError::InvalidContext => ErrorKind::InvalidContext,
            ModuleError::OutOfMemory(_) => ErrorKind::OutOfMemory,
            ModuleError::MalformedObject(_)
            | ModuleError::UnresolvedSymbol(_)
            | ModuleError::HostImageUnavailable { .. }
            | ModuleError::LoadFailed(_)
            | ModuleError::Runtime(_) => ErrorKind::LoadFailure,
            ModuleError::NotInitialized(_) => ErrorKind::NotInitialized,
        }
    }
}

/// A failed [`crate::ModuleLoader::unload`], handing the module back.
///
/// Resources the failed attempt did release stay released; passing the
/// module to `unload` again resumes from the step that failed.
#[derive(Debug, thiserror::Error)]
#[error("{} could not be unloaded: {error}", .module.id())]
pub struct UnloadError {
    module: Box<Module>,
    #[source]
    error: ModuleError,
}

impl UnloadError {
    pub(crate) fn new(module: Module, error: ModuleError) -> Self {
        Self {
            module: Box::new(module),
            error,
        }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Take the module back to retry the unload.
    pub fn into_module(self) -> Module {
        *self.module
    }

    pub fn error(&self) -> &ModuleError {
        &self.error
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Discards the module; whatever it still holds stays alive in the runtime.
impl From<UnloadError> for ModuleError {
    fn from(err: UnloadError) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(ModuleError::invalid_value("x").kind(), ErrorKind::InvalidValue);
        assert_eq!(ModuleError::MissingKernelArgs.kind(), ErrorKind::InvalidValue);
        assert_eq!(ModuleError::SymbolNotFound("k".into()).kind(), ErrorKind::NotFound);
        assert_eq!(ModuleError::InvalidContext.kind(), ErrorKind::InvalidContext);
        assert_eq!(ModuleError::out_of_memory("region").kind(), ErrorKind::OutOfMemory);
        assert_eq!(ModuleError::UnresolvedSymbol("g".into()).kind(), ErrorKind::LoadFailure);
        assert_eq!(
            ModuleError::NotInitialized("layout".into()).kind(),
            ErrorKind::NotInitialized
        );
    }

    #[test]
    fn runtime_error_display_carries_op_and_status() {
        let err = RuntimeError::new("executable_freeze", 0x1001, "generic");
        assert_eq!(err.to_string(), "executable_freeze failed with status 0x1001: generic");

        let wrapped = ModuleError::LoadFailed(err);
        assert!(wrapped.to_string().contains("executable_freeze"));
        assert_eq!(wrapped.kind(), ErrorKind::LoadFailure);
    }
}
