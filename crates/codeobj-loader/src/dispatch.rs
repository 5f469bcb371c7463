//! AQL kernel dispatch packet
//!
//! The packet is the 64-byte `hsa_kernel_dispatch_packet_t` consumed by the
//! command processor. Field order and widths are part of the hardware ABI.

use bytemuck::{Pod, Zeroable};

use crate::config::FlushMode;
use crate::error::{ModuleError, Result};
use crate::module::FunctionSymbol;

/// Bit offset of the packet type in the header.
pub const PACKET_HEADER_TYPE: u16 = 0;
/// Bit offset of the barrier flag in the header.
pub const PACKET_HEADER_BARRIER: u16 = 8;
/// Bit offset of the 2-bit acquire fence scope in the header.
pub const PACKET_HEADER_ACQUIRE_FENCE_SCOPE: u16 = 9;
/// Bit offset of the 2-bit release fence scope in the header.
pub const PACKET_HEADER_RELEASE_FENCE_SCOPE: u16 = 11;

pub const PACKET_TYPE_INVALID: u16 = 1;
pub const PACKET_TYPE_KERNEL_DISPATCH: u16 = 2;

pub const FENCE_SCOPE_NONE: u16 = 0;
pub const FENCE_SCOPE_AGENT: u16 = 1;
pub const FENCE_SCOPE_SYSTEM: u16 = 2;

/// Bit offset of the dimension count in `setup`.
pub const DISPATCH_SETUP_DIMENSIONS: u16 = 0;

/// Three-component geometry (work-items or work-groups).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }

    pub fn as_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }

    /// Component-wise product, `None` on overflow.
    pub fn checked_mul(self, other: Dim3) -> Option<Dim3> {
        Some(Dim3 {
            x: self.x.checked_mul(other.x)?,
            y: self.y.checked_mul(other.y)?,
            z: self.z.checked_mul(other.z)?,
        })
    }
}

impl From<[u32; 3]> for Dim3 {
    fn from([x, y, z]: [u32; 3]) -> Self {
        Self { x, y, z }
    }
}

/// `hsa_kernel_dispatch_packet_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DispatchPacket {
    pub header: u16,
    pub setup: u16,
    pub workgroup_size_x: u16,
    pub workgroup_size_y: u16,
    pub workgroup_size_z: u16,
    pub reserved0: u16,
    pub grid_size_x: u32,
    pub grid_size_y: u32,
    pub grid_size_z: u32,
    pub private_segment_size: u32,
    pub group_segment_size: u32,
    pub kernel_object: u64,
    pub kernarg_address: u64,
    pub reserved2: u64,
    pub completion_signal: u64,
}

const _: () = assert!(std::mem::size_of::<DispatchPacket>() == 64);

/// Header for a kernel dispatch: barrier always set, fence scopes per
/// `flush_mode` on both acquire and release.
pub fn dispatch_header(flush_mode: FlushMode) -> u16 {
    let scope = match flush_mode {
        FlushMode::Agent => FENCE_SCOPE_AGENT,
        FlushMode::System => FENCE_SCOPE_SYSTEM,
    };
    (PACKET_TYPE_KERNEL_DISPATCH << PACKET_HEADER_TYPE)
        | (1 << PACKET_HEADER_BARRIER)
        | (scope << PACKET_HEADER_ACQUIRE_FENCE_SCOPE)
        | (scope << PACKET_HEADER_RELEASE_FENCE_SCOPE)
}

impl DispatchPacket {
    /// Build the packet for one launch of `function`.
    ///
    /// `grid` is the total number of work-items per dimension. Every block
    /// dimension must be between 1 and 65535. The argument address and
    /// completion signal are left zero for the runtime to fill.
    pub fn for_kernel(
        function: &FunctionSymbol,
        grid: Dim3,
        block: Dim3,
        dynamic_shared_mem: usize,
        flush_mode: FlushMode,
    ) -> Result<Self> {
        let workgroup = |dim: u32, axis: &str| {
            if dim == 0 {
                return Err(ModuleError::invalid_value(format!("block {axis} dimension is zero")));
            }
            u16::try_from(dim)
                .map_err(|_| ModuleError::invalid_value(format!("block {axis} dimension {dim} exceeds {}", u16::MAX)))
        };

        let group_segment_size = u32::try_from(dynamic_shared_mem)
            .ok()
            .and_then(|shared| function.group_segment_size().checked_add(shared))
            .ok_or_else(|| {
                ModuleError::invalid_value(format!(
                    "group segment of {} bytes plus {dynamic_shared_mem} bytes of dynamic shared memory overflows",
                    function.group_segment_size()
                ))
            })?;

        let packet = DispatchPacket {
            header: dispatch_header(flush_mode),
            setup: 3 << DISPATCH_SETUP_DIMENSIONS,
            workgroup_size_x: workgroup(block.x, "x")?,
            workgroup_size_y: workgroup(block.y, "y")?,
            workgroup_size_z: workgroup(block.z, "z")?,
            reserved0: 0,
            grid_size_x: grid.x,
            grid_size_y: grid.y,
            grid_size_z: grid.z,
            private_segment_size: function.private_segment_size(),
            group_segment_size,
            kernel_object: function.kernel_object(),
            kernarg_address: 0,
            reserved2: 0,
            completion_signal: 0,
        };

        tracing::debug!(
            kernel = function.name(),
            header = packet.header,
            group_segment_size,
            private_segment_size = packet.private_segment_size,
            "dispatch_packet_built"
        );
        Ok(packet)
    }

    pub fn packet_type(&self) -> u16 {
        (self.header >> PACKET_HEADER_TYPE) & 0xff
    }

    pub fn has_barrier(&self) -> bool {
        (self.header >> PACKET_HEADER_BARRIER) & 1 == 1
    }

    pub fn acquire_fence_scope(&self) -> u16 {
        (self.header >> PACKET_HEADER_ACQUIRE_FENCE_SCOPE) & 0b11
    }

    pub fn release_fence_scope(&self) -> u16 {
        (self.header >> PACKET_HEADER_RELEASE_FENCE_SCOPE) & 0b11
    }

    pub fn dimensions(&self) -> u16 {
        (self.setup >> DISPATCH_SETUP_DIMENSIONS) & 0b11
    }

    pub fn workgroup_size(&self) -> Dim3 {
        Dim3::new(
            u32::from(self.workgroup_size_x),
            u32::from(self.workgroup_size_y),
            u32::from(self.workgroup_size_z),
        )
    }

    pub fn grid_size(&self) -> Dim3 {
        Dim3::new(self.grid_size_x, self.grid_size_y, self.grid_size_z)
    }

    /// Packet bytes in the layout the hardware reads.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    fn kernel() -> FunctionSymbol {
        FunctionSymbol::new("vadd", 0xdead_b000, 256, 32, 24)
    }

    #[test]
    fn field_offsets_match_abi() {
        assert_eq!(offset_of!(DispatchPacket, header), 0);
        assert_eq!(offset_of!(DispatchPacket, setup), 2);
        assert_eq!(offset_of!(DispatchPacket, workgroup_size_x), 4);
        assert_eq!(offset_of!(DispatchPacket, grid_size_x), 12);
        assert_eq!(offset_of!(DispatchPacket, private_segment_size), 24);
        assert_eq!(offset_of!(DispatchPacket, group_segment_size), 28);
        assert_eq!(offset_of!(DispatchPacket, kernel_object), 32);
        assert_eq!(offset_of!(DispatchPacket, kernarg_address), 40);
        assert_eq!(offset_of!(DispatchPacket, completion_signal), 56);
    }

    #[test]
    fn system_header_bits() {
        let header = dispatch_header(FlushMode::System);
        assert_eq!(header, 2 | (1 << 8) | (2 << 9) | (2 << 11));
    }

    #[test]
    fn agent_header_bits() {
        let header = dispatch_header(FlushMode::Agent);
        assert_eq!(header, 2 | (1 << 8) | (1 << 9) | (1 << 11));
    }

    #[test]
    fn packet_fields_from_symbol_and_geometry() {
        let packet = DispatchPacket::for_kernel(
            &kernel(),
            Dim3::new(128, 4, 1),
            Dim3::new(32, 2, 1),
            512,
            FlushMode::System,
        )
        .unwrap();

        assert_eq!(packet.packet_type(), PACKET_TYPE_KERNEL_DISPATCH);
        assert!(packet.has_barrier());
        assert_eq!(packet.acquire_fence_scope(), FENCE_SCOPE_SYSTEM);
        assert_eq!(packet.release_fence_scope(), FENCE_SCOPE_SYSTEM);
        assert_eq!(packet.dimensions(), 3);
        assert_eq!(packet.workgroup_size(), Dim3::new(32, 2, 1));
        assert_eq!(packet.grid_size(), Dim3::new(128, 4, 1));
        assert_eq!(packet.group_segment_size, 256 + 512);
        assert_eq!(packet.private_segment_size, 32);
        assert_eq!(packet.kernel_object, 0xdead_b000);
        assert_eq!(packet.kernarg_address, 0);
        assert_eq!(packet.as_bytes().len(), 64);
    }

    #[test]
    fn oversized_block_rejected() {
        let err = DispatchPacket::for_kernel(&kernel(), Dim3::linear(1 << 20), Dim3::linear(70_000), 0, FlushMode::System)
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidValue(_)));
    }

    #[test]
    fn zero_block_dimension_rejected() {
        for block in [Dim3::new(0, 1, 1), Dim3::new(64, 0, 1), Dim3::new(64, 1, 0)] {
            let err = DispatchPacket::for_kernel(&kernel(), Dim3::linear(64), block, 0, FlushMode::System).unwrap_err();
            assert!(matches!(err, ModuleError::InvalidValue(_)), "{block:?}");
        }
    }

    #[test]
    fn shared_memory_overflow_rejected() {
        let err = DispatchPacket::for_kernel(
            &kernel(),
            Dim3::linear(64),
            Dim3::linear(64),
            u32::MAX as usize,
            FlushMode::Agent,
        )
        .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidValue(_)));
    }
}
