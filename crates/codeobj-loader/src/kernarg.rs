//! Kernel argument layouts and packing
//!
//! A launch passes its arguments in one of two mutually exclusive forms:
//!
//! - **structured**: one byte slice per formal parameter; the packer places
//!   each at its round-up-to-alignment offset inside a zeroed buffer sized
//!   by the kernel's [`KernelArgLayout`].
//! - **extra buffer**: a five-word descriptor
//!   `[LAUNCH_PARAM_BUFFER_POINTER, ptr, LAUNCH_PARAM_BUFFER_SIZE, size, LAUNCH_PARAM_END]`
//!   pointing at caller-owned, already packed bytes.
//!
//! Layouts are derived once per kernel name from declared [`ArgInfo`]s and
//! cached in an [`ArgLayoutCache`].

use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::Pod;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ModuleError, Result};

/// Marker preceding the argument buffer pointer in an extra descriptor.
pub const LAUNCH_PARAM_BUFFER_POINTER: usize = 0x01;
/// Marker preceding the argument buffer size in an extra descriptor.
pub const LAUNCH_PARAM_BUFFER_SIZE: usize = 0x02;
/// Terminating marker of an extra descriptor.
pub const LAUNCH_PARAM_END: usize = 0x03;

/// One formal kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    pub size: usize,
    pub align: usize,
}

impl ArgInfo {
    pub fn new(size: usize, align: usize) -> Self {
        Self {
            name: None,
            type_name: None,
            size,
            align,
        }
    }

    /// Parameter with the size and alignment of `T`.
    pub fn of<T>() -> Self {
        Self::new(std::mem::size_of::<T>(), std::mem::align_of::<T>())
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Kernel metadata document:
/// `{"kernels":[{"name":"k","args":[{"name":"a","size":8,"align":8}]}]}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMetadata {
    pub kernels: Vec<KernelDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelDecl {
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgInfo>,
}

impl KernelMetadata {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Offsets and strides of a kernel's parameters in its packed buffer.
///
/// `total_size` is the end of the last parameter rounded up to the largest
/// parameter alignment, so the strides sum to exactly `total_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArgLayout {
    args: Vec<ArgInfo>,
    offsets: Vec<usize>,
    strides: Vec<usize>,
    total_size: usize,
}

impl KernelArgLayout {
    pub fn new(args: Vec<ArgInfo>) -> Result<Self> {
        let mut offsets = Vec::with_capacity(args.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;

        for (index, arg) in args.iter().enumerate() {
            if arg.align == 0 || !arg.align.is_power_of_two() {
                return Err(ModuleError::invalid_value(format!(
                    "argument {index} has alignment {} (must be a power of two)",
                    arg.align
                )));
            }
            max_align = max_align.max(arg.align);
            offset = align_up(offset, arg.align)
                .ok_or_else(|| ModuleError::invalid_value("argument layout overflows"))?;
            offsets.push(offset);
            offset = offset
                .checked_add(arg.size)
                .ok_or_else(|| ModuleError::invalid_value("argument layout overflows"))?;
        }

        let total_size =
            align_up(offset, max_align).ok_or_else(|| ModuleError::invalid_value("argument layout overflows"))?;

        let strides = offsets
            .iter()
            .enumerate()
            .map(|(i, &start)| offsets.get(i + 1).copied().unwrap_or(total_size) - start)
            .collect();

        Ok(Self {
            args,
            offsets,
            strides,
            total_size,
        })
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn args(&self) -> &[ArgInfo] {
        &self.args
    }

    pub fn offset(&self, index: usize) -> Option<usize> {
        self.offsets.get(index).copied()
    }

    /// Distance from this parameter's offset to the next one (or to the end).
    pub fn stride(&self, index: usize) -> Option<usize> {
        self.strides.get(index).copied()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    /// Copy `params` into a zeroed buffer at their layout offsets.
    ///
    /// The parameter count must match the layout and every slice must be
    /// exactly its parameter's size.
    pub fn pack(&self, params: &[&[u8]]) -> Result<Vec<u8>> {
        if params.len() != self.args.len() {
            return Err(ModuleError::invalid_value(format!(
                "kernel expects {} arguments, got {}",
                self.args.len(),
                params.len()
            )));
        }

        let mut buffer = vec![0u8; self.total_size];
        for (index, (param, arg)) in params.iter().zip(&self.args).enumerate() {
            if param.len() != arg.size {
                return Err(ModuleError::invalid_value(format!(
                    "argument {index} is {} bytes, layout expects {}",
                    param.len(),
                    arg.size
                )));
            }
            let offset = self.offsets[index];
            buffer[offset..offset + arg.size].copy_from_slice(param);
        }
        Ok(buffer)
    }
}

fn align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Per-kernel-name argument declarations and their computed layouts.
///
/// Reads take a shared lock. A missing layout is computed and inserted
/// under the layout write lock, and [`ArgLayoutCache::declare`] holds the
/// same lock while it swaps the declaration, so a layout is never cached
/// from a declaration that has already been replaced. Both locks are always
/// taken layouts first.
#[derive(Default)]
pub struct ArgLayoutCache {
    declared: RwLock<HashMap<String, Arc<[ArgInfo]>>>,
    layouts: RwLock<HashMap<String, Arc<KernelArgLayout>>>,
}

impl ArgLayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the formal parameters of `kernel`. Replaces any earlier
    /// declaration and drops its cached layout.
    pub fn declare(&self, kernel: &str, args: Vec<ArgInfo>) {
        let mut layouts = self.layouts.write();
        self.declared.write().insert(kernel.to_string(), args.into());
        layouts.remove(kernel);
    }

    /// Insert a precomputed layout directly.
    pub fn register(&self, kernel: &str, layout: KernelArgLayout) -> Arc<KernelArgLayout> {
        let layout = Arc::new(layout);
        self.layouts
            .write()
            .insert(kernel.to_string(), Arc::clone(&layout));
        layout
    }

    /// Cached layout for `kernel`, if one has been computed or registered.
    pub fn get(&self, kernel: &str) -> Option<Arc<KernelArgLayout>> {
        self.layouts.read().get(kernel).cloned()
    }

    /// Cached layout for `kernel`, computing it from the declared parameters
    /// on first use.
    pub fn get_or_compute(&self, kernel: &str) -> Result<Arc<KernelArgLayout>> {
        if let Some(layout) = self.get(kernel) {
            return Ok(layout);
        }

        let mut layouts = self.layouts.write();
        if let Some(layout) = layouts.get(kernel) {
            return Ok(Arc::clone(layout));
        }
        let args = self
            .declared
            .read()
            .get(kernel)
            .cloned()
            .ok_or_else(|| ModuleError::NotInitialized(format!("no argument layout known for kernel `{kernel}`")))?;

        let layout = Arc::new(KernelArgLayout::new(args.to_vec())?);
        layouts.insert(kernel.to_string(), Arc::clone(&layout));

        tracing::debug!(kernel, args = layout.len(), total_size = layout.total_size(), "kernarg_layout_cached");
        Ok(layout)
    }

    /// Declare every kernel in a metadata document.
    pub fn declare_metadata(&self, metadata: KernelMetadata) -> usize {
        let count = metadata.kernels.len();
        for decl in metadata.kernels {
            self.declare(&decl.name, decl.args);
        }
        count
    }

    /// Number of computed layouts.
    pub fn len(&self) -> usize {
        self.layouts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_declared(&self, kernel: &str) -> bool {
        self.declared.read().contains_key(kernel)
    }
}

/// Arguments for one launch.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelArgs<'a> {
    params: Option<&'a [&'a [u8]]>,
    extra: Option<&'a [usize]>,
}

impl<'a> KernelArgs<'a> {
    /// No arguments in either form; rejected at launch.
    pub fn none() -> Self {
        Self::default()
    }

    /// Structured arguments, one slice per formal parameter.
    pub fn params(params: &'a [&'a [u8]]) -> Self {
        Self {
            params: Some(params),
            extra: None,
        }
    }

    /// Extra-buffer descriptor.
    ///
    /// # Safety
    ///
    /// If `words` has the exact descriptor shape, the pointer word must be
    /// valid for reads of the size word's number of bytes for `'a`.
    pub unsafe fn extra(words: &'a [usize]) -> Self {
        Self {
            params: None,
            extra: Some(words),
        }
    }

    /// Add an extra-buffer descriptor alongside structured arguments.
    ///
    /// # Safety
    ///
    /// Same contract as [`KernelArgs::extra`].
    pub unsafe fn with_extra(mut self, words: &'a [usize]) -> Self {
        self.extra = Some(words);
        self
    }

    pub fn has_params(&self) -> bool {
        self.params.is_some()
    }

    pub fn has_extra(&self) -> bool {
        self.extra.is_some()
    }
}

/// Argument bytes ready for submission.
#[derive(Debug)]
pub enum PackedArgs<'a> {
    /// Packed by the loader from structured arguments
    Owned(Vec<u8>),
    /// Caller-owned buffer from an extra descriptor
    Borrowed(&'a [u8]),
}

impl PackedArgs<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PackedArgs::Owned(bytes) => bytes,
            PackedArgs::Borrowed(bytes) => bytes,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, PackedArgs::Owned(_))
    }
}

/// Validate a five-word extra descriptor, returning `(pointer, size)`.
pub fn parse_extra(words: &[usize]) -> Result<(usize, usize)> {
    match words {
        [LAUNCH_PARAM_BUFFER_POINTER, ptr, LAUNCH_PARAM_BUFFER_SIZE, size, LAUNCH_PARAM_END] => Ok((*ptr, *size)),
        _ => Err(ModuleError::invalid_value(format!(
            "extra argument descriptor must be [BUFFER_POINTER, ptr, BUFFER_SIZE, size, END], got {} words {:x?}",
            words.len(),
            words
        ))),
    }
}

/// Resolve `args` for `kernel` into submit-ready bytes.
pub fn pack_args<'a>(kernel: &str, args: &KernelArgs<'a>, cache: &ArgLayoutCache) -> Result<PackedArgs<'a>> {
    match (args.params, args.extra) {
        (Some(_), Some(_)) => Err(ModuleError::invalid_launch(
            "structured arguments and an extra buffer are mutually exclusive",
        )),
        (None, None) => Err(ModuleError::MissingKernelArgs),
        (Some(params), None) => {
            let layout = cache.get_or_compute(kernel)?;
            Ok(PackedArgs::Owned(layout.pack(params)?))
        }
        (None, Some(words)) => {
            let (ptr, size) = parse_extra(words)?;
            if size == 0 {
                return Ok(PackedArgs::Borrowed(&[]));
            }
            if ptr == 0 {
                return Err(ModuleError::invalid_value("extra argument buffer pointer is null"));
            }
            // SAFETY: guaranteed by the contract of `KernelArgs::extra`.
            let bytes = unsafe { std::slice::from_raw_parts(ptr as *const u8, size) };
            Ok(PackedArgs::Borrowed(bytes))
        }
    }
}

/// Reads parameters back out of a packed buffer at their layout offsets.
pub struct KernargReader<'a> {
    buffer: &'a [u8],
    layout: &'a KernelArgLayout,
}

impl<'a> KernargReader<'a> {
    pub fn new(buffer: &'a [u8], layout: &'a KernelArgLayout) -> Self {
        Self { buffer, layout }
    }

    /// Raw bytes of parameter `index`.
    pub fn arg(&self, index: usize) -> Option<&'a [u8]> {
        let offset = self.layout.offset(index)?;
        let size = self.layout.args().get(index)?.size;
        self.buffer.get(offset..offset + size)
    }

    /// Parameter `index` decoded as `T` (sizes must agree).
    pub fn read<T: Pod>(&self, index: usize) -> Option<T> {
        let bytes = self.arg(index)?;
        (bytes.len() == std::mem::size_of::<T>()).then(|| bytemuck::pod_read_unaligned(bytes))
    }

    pub fn read_u32(&self, index: usize) -> Option<u32> {
        self.read(index)
    }

    pub fn read_u64(&self, index: usize) -> Option<u64> {
        self.read(index)
    }

    pub fn read_f32(&self, index: usize) -> Option<f32> {
        self.read(index)
    }
}
