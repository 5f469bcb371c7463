//! Binds a device binary's undefined globals to host storage
//!
//! For every undefined name in the device object's dynamic symbol table the
//! host definition is looked up, its memory pinned for the agent and the
//! agent-visible address defined as the global in the executable.

use codeobj_tracing::performance::record_symbol_binding;

use crate::error::{ModuleError, Result};
use crate::host::HostImage;
use crate::registry::PinnedGlobal;
use crate::runtime::{AgentHandle, ExecutableHandle, Runtime};

/// Resolve `undefined` against `host` into `executable`.
///
/// On success the returned pins are owned by the caller. On failure every
/// range pinned by this call has already been unpinned.
pub fn bind_host_globals(
    runtime: &dyn Runtime,
    host: &HostImage,
    agent: AgentHandle,
    executable: ExecutableHandle,
    undefined: &[&str],
) -> Result<Vec<PinnedGlobal>> {
    let mut pins = Vec::with_capacity(undefined.len());

    for &name in undefined {
        if let Err(err) = bind_one(runtime, host, agent, executable, name, &mut pins) {
            release_pins(runtime, &pins);
            return Err(err);
        }
    }

    tracing::debug!(%executable, bound = pins.len(), "host_globals_bound");
    Ok(pins)
}

fn bind_one(
    runtime: &dyn Runtime,
    host: &HostImage,
    agent: AgentHandle,
    executable: ExecutableHandle,
    name: &str,
    pins: &mut Vec<PinnedGlobal>,
) -> Result<()> {
    let symbol = host
        .lookup(name)
        .ok_or_else(|| ModuleError::UnresolvedSymbol(name.to_string()))?;

    let lock_size = usize::try_from(symbol.size.max(1))
        .map_err(|_| ModuleError::invalid_value(format!("host symbol `{name}` is too large to pin")))?;
    let device_address = runtime
        .lock_memory(agent, symbol.address, lock_size)
        .map_err(ModuleError::LoadFailed)?;

    pins.push(PinnedGlobal {
        name: name.to_string(),
        host_address: symbol.address,
        device_address,
        size: symbol.size,
    });

    runtime
        .define_global(executable, name, device_address)
        .map_err(ModuleError::LoadFailed)?;

    record_symbol_binding(name, symbol.address, device_address, symbol.size);
    Ok(())
}

/// Unpin `pins`, logging failures.
pub(crate) fn release_pins(runtime: &dyn Runtime, pins: &[PinnedGlobal]) {
    for pin in pins {
        if let Err(err) = runtime.unlock_memory(pin.host_address) {
            tracing::warn!(symbol = %pin.name, error = %err, "failed to unpin host global during rollback");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{FaultPoint, ReferenceRuntime};
    use crate::testing::ElfBuilder;

    fn host_with(values: &[u64; 2]) -> HostImage {
        // Bias so that the symbol values 0 and 8 land on the live array.
        let bias = values.as_ptr() as u64;
        let image = ElfBuilder::new()
            .elf_type(goblin::elf::header::ET_EXEC)
            .object("alpha", 0, 8)
            .object("beta", 8, 8)
            .build();
        HostImage::from_bytes("/host", &image, bias).unwrap()
    }

    #[test]
    fn binds_each_undefined_symbol() {
        let values = [1u64, 2];
        let host = host_with(&values);
        let runtime = ReferenceRuntime::new();
        let exe = runtime.create_executable().unwrap();

        let pins = bind_host_globals(&runtime, &host, AgentHandle(1), exe, &["alpha", "beta"]).unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[1].host_address, values.as_ptr() as u64 + 8);
        assert_eq!(runtime.pinned_count(), 2);
        assert_eq!(runtime.defined_global(exe, "beta"), Some(pins[1].device_address));
    }

    #[test]
    fn missing_host_symbol_rolls_back() {
        let values = [0u64; 2];
        let host = host_with(&values);
        let runtime = ReferenceRuntime::new();
        let exe = runtime.create_executable().unwrap();

        let err = bind_host_globals(&runtime, &host, AgentHandle(1), exe, &["alpha", "gamma"]).unwrap_err();
        assert!(matches!(err, ModuleError::UnresolvedSymbol(ref name) if name == "gamma"));
        assert_eq!(runtime.pinned_count(), 0);
    }

    #[test]
    fn define_failure_unpins_current_symbol_too() {
        let values = [0u64; 2];
        let host = host_with(&values);
        let runtime = ReferenceRuntime::new();
        let exe = runtime.create_executable().unwrap();
        runtime.inject_fault(FaultPoint::DefineGlobal);

        let err = bind_host_globals(&runtime, &host, AgentHandle(1), exe, &["alpha"]).unwrap_err();
        assert!(matches!(err, ModuleError::LoadFailed(_)));
        assert_eq!(runtime.pinned_count(), 0);
    }
}
