//! Handles and records exchanged with an execution runtime

use std::fmt;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{:#x}"), self.0)
            }
        }
    };
}

handle_type!(
    /// An accelerator (HSA agent) the runtime can load code onto
    AgentHandle,
    "agent"
);
handle_type!(
    /// Execution context holding loaded code objects; immutable once frozen
    ExecutableHandle,
    "exe"
);
handle_type!(
    /// A code object deserialized from memory
    CodeObjectHandle,
    "co"
);
handle_type!(
    /// A code-object reader opened over a file
    ReaderHandle,
    "reader"
);
handle_type!(
    /// A memory region of an agent
    RegionHandle,
    "region"
);
handle_type!(
    /// Hardware command queue
    QueueHandle,
    "queue"
);
handle_type!(
    /// Completion signal produced by a dispatch
    CompletionHandle,
    "signal"
);

/// What a named executable symbol refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Kernel,
    Variable,
}

/// Result of looking a symbol up in a frozen executable.
///
/// For kernels `address` is the kernel object (code descriptor address);
/// for variables it is the variable's device address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableSymbol {
    pub name: String,
    pub kind: SymbolKind,
    pub address: u64,
    /// Variable size in bytes (zero for kernels)
    pub size: u64,
    pub kernarg_segment_size: u32,
    pub group_segment_size: u32,
    pub private_segment_size: u32,
}

impl ExecutableSymbol {
    pub fn kernel(name: impl Into<String>, kernel_object: u64, group: u32, private: u32) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Kernel,
            address: kernel_object,
            size: 0,
            kernarg_segment_size: 0,
            group_segment_size: group,
            private_segment_size: private,
        }
    }

    pub fn variable(name: impl Into<String>, address: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Variable,
            address,
            size,
            kernarg_segment_size: 0,
            group_segment_size: 0,
            private_segment_size: 0,
        }
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == SymbolKind::Kernel
    }
}
