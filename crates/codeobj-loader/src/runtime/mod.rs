//! Execution runtime abstraction

mod traits;
mod types;

pub use traits::{Runtime, RuntimeResult};
pub use types::{
    AgentHandle, CodeObjectHandle, CompletionHandle, ExecutableHandle, ExecutableSymbol, QueueHandle,
    ReaderHandle, RegionHandle, SymbolKind,
};
