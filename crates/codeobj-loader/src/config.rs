//! Loader configuration

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use codeobj_tracing::parse_flag;

/// Default host image: the running executable.
pub const DEFAULT_HOST_IMAGE: &str = "/proc/self/exe";

const ENV_OPT_FLUSH: &str = "CODEOBJ_OPT_FLUSH";
const ENV_HOST_IMAGE: &str = "CODEOBJ_HOST_IMAGE";
const ENV_HOST_LOAD_BIAS: &str = "CODEOBJ_HOST_LOAD_BIAS";

/// Fence scope applied at the acquire and release points of every dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum FlushMode {
    /// System-wide fences
    #[default]
    System,
    /// Agent-scoped fences (the "optimise flush" setting)
    Agent,
}

/// Settings shared by every load and launch of a [`crate::ModuleLoader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoaderConfig {
    pub flush_mode: FlushMode,
    /// Host program image whose symbol table resolves device externs
    pub host_image: PathBuf,
    /// Address at which the host image's virtual address zero is mapped.
    /// `None` means detect it for the running executable.
    pub host_load_bias: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::System,
            host_image: PathBuf::from(DEFAULT_HOST_IMAGE),
            host_load_bias: None,
        }
    }
}

impl LoaderConfig {
    /// Build a configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `CODEOBJ_OPT_FLUSH` - `1`/`true`/`yes` selects agent-scoped fences
    /// - `CODEOBJ_HOST_IMAGE` - host image path (default `/proc/self/exe`)
    /// - `CODEOBJ_HOST_LOAD_BIAS` - explicit load bias, decimal or `0x` hex
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(flag) = env::var(ENV_OPT_FLUSH) {
            if parse_flag(&flag) {
                config.flush_mode = FlushMode::Agent;
            }
        }

        if let Ok(path) = env::var(ENV_HOST_IMAGE) {
            if !path.trim().is_empty() {
                config.host_image = PathBuf::from(path);
            }
        }

        if let Ok(bias) = env::var(ENV_HOST_LOAD_BIAS) {
            config.host_load_bias = parse_address(&bias);
        }

        config
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_host_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_image = path.into();
        self
    }

    pub fn with_host_load_bias(mut self, bias: u64) -> Self {
        self.host_load_bias = Some(bias);
        self
    }

    /// Load bias to add to host symbol values.
    ///
    /// An explicit bias wins. Otherwise a position-independent image that is
    /// the running executable gets the base of its first mapping from
    /// `/proc/self/maps`; anything else is assumed unrelocated.
    pub(crate) fn resolve_load_bias(&self, position_independent: bool) -> u64 {
        if let Some(bias) = self.host_load_bias {
            return bias;
        }
        if !position_independent {
            return 0;
        }

        let Ok(image) = fs::canonicalize(&self.host_image) else {
            return 0;
        };
        let is_running_executable = fs::canonicalize(DEFAULT_HOST_IMAGE)
            .map(|exe| exe == image)
            .unwrap_or(false);
        if !is_running_executable {
            return 0;
        }

        match fs::read_to_string("/proc/self/maps") {
            Ok(maps) => mapping_base(&maps, &image).unwrap_or(0),
            Err(err) => {
                tracing::warn!(error = %err, "could not read /proc/self/maps; assuming zero load bias");
                0
            }
        }
    }
}

fn parse_address(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

/// Start address of the file-offset-zero mapping of `image` in a
/// `/proc/<pid>/maps` listing.
fn mapping_base(maps: &str, image: &Path) -> Option<u64> {
    maps.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let _perms = fields.next()?;
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let _inode = fields.next()?;
        let path = fields.next()?;

        if Path::new(path) != image || u64::from_str_radix(offset, 16).ok()? != 0 {
            return None;
        }
        let (start, _) = range.split_once('-')?;
        u64::from_str_radix(start, 16).ok()
    })
}
