//! Symbol table of the host program image

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::LoaderConfig;
use crate::elf::{ElfImage, SymbolTable};
use crate::error::{ModuleError, Result};

/// A defined host symbol, relocated by the image's load bias.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostSymbol {
    pub address: u64,
    pub size: u64,
}

/// Defined symbols of the host program, by name.
///
/// The static symbol table takes precedence over the dynamic one; within a
/// table the first definition of a name wins.
#[derive(Debug, Clone)]
pub struct HostImage {
    path: PathBuf,
    load_bias: u64,
    symbols: HashMap<String, HostSymbol>,
}

impl HostImage {
    /// Read and index the host image named by `config`.
    pub fn load(config: &LoaderConfig) -> Result<Self> {
        let path = &config.host_image;
        let bytes = fs::read(path).map_err(|err| ModuleError::HostImageUnavailable {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let elf = ElfImage::parse(&bytes).map_err(|err| ModuleError::HostImageUnavailable {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        let bias = config.resolve_load_bias(elf.is_position_independent());
        Self::index(path, &elf, bias)
    }

    /// Index an in-memory host image.
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: &[u8], load_bias: u64) -> Result<Self> {
        let path = path.into();
        let elf = ElfImage::parse(bytes).map_err(|err| ModuleError::HostImageUnavailable {
            path: path.clone(),
            reason: err.to_string(),
        })?;
        Self::index(&path, &elf, load_bias)
    }

    fn index(path: &Path, elf: &ElfImage<'_>, load_bias: u64) -> Result<Self> {
        let mut symbols = HashMap::new();
        let tables = [elf.symbol_table()?, elf.dynamic_symbol_table()?];
        for table in tables.iter().flatten() {
            Self::collect(table, load_bias, &mut symbols);
        }

        tracing::debug!(
            path = %path.display(),
            symbols = symbols.len(),
            load_bias,
            "host_image_indexed"
        );
        Ok(Self {
            path: path.to_path_buf(),
            load_bias,
            symbols,
        })
    }

    fn collect(table: &SymbolTable<'_>, load_bias: u64, symbols: &mut HashMap<String, HostSymbol>) {
        for symbol in table.iter().filter(|s| !s.is_undefined() && !s.name.is_empty()) {
            symbols.entry(symbol.name.to_string()).or_insert(HostSymbol {
                address: load_bias.wrapping_add(symbol.value),
                size: symbol.size,
            });
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Option<HostSymbol> {
        self.symbols.get(name).copied()
    }
}
