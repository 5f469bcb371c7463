//! [`Runtime`](crate::runtime::Runtime) implementations
//!
//! - [`ReferenceRuntime`]: in-process, always available
//! - `HsaRuntime`: the HSA runtime bound at run time (feature `hsa`)

pub mod reference;

#[cfg(feature = "hsa")]
pub mod hsa;

pub use reference::{FaultPoint, ReferenceRuntime, RuntimeCall, SubmittedDispatch};

#[cfg(feature = "hsa")]
pub use hsa::HsaRuntime;
