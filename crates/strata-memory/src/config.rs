//! Process-wide memory configuration.
//!
//! Defaults can be overridden from the environment (`STRATA_*` variables)
//! or from a JSON document, then installed once with [`install`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use strata_vm::VmProvider;

use crate::error::MemoryError;

/// Default reservation of each scratch arena.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_SCRATCH_RESERVE: usize = 4 * 1024 * 1024 * 1024;
/// Default reservation of each scratch arena.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_SCRATCH_RESERVE: usize = 256 * 1024 * 1024;

/// Default capacity of arenas created through [`MemoryConfig`].
pub const DEFAULT_ARENA_CAPACITY: usize = 64 * 1024 * 1024;

/// Environment variable overriding [`MemoryConfig::scratch_reserve`].
pub const ENV_SCRATCH_RESERVE: &str = "STRATA_SCRATCH_RESERVE";
/// Environment variable overriding [`MemoryConfig::default_arena_capacity`].
pub const ENV_ARENA_CAPACITY: &str = "STRATA_ARENA_CAPACITY";
/// Environment variable selecting the heap provider.
pub const ENV_HEAP_VM: &str = "STRATA_HEAP_VM";

static CONFIG: RwLock<Option<MemoryConfig>> = parking_lot::const_rwlock(None);

/// Tunables for arenas and scratch arenas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Bytes of address space reserved by each scratch arena.
    pub scratch_reserve: usize,
    /// Capacity used by [`crate::Arena::with_config`].
    pub default_arena_capacity: usize,
    /// Back arenas with the heap instead of OS virtual memory.
    pub use_heap_provider: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            scratch_reserve: DEFAULT_SCRATCH_RESERVE,
            default_arena_capacity: DEFAULT_ARENA_CAPACITY,
            use_heap_provider: false,
        }
    }
}

impl MemoryConfig {
    /// Defaults overridden by `STRATA_*` environment variables.
    pub fn from_env() -> Result<Self, MemoryError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, MemoryError> {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_SCRATCH_RESERVE) {
            config.scratch_reserve = parse_size(&value)?;
        }
        if let Some(value) = lookup(ENV_ARENA_CAPACITY) {
            config.default_arena_capacity = parse_size(&value)?;
        }
        if let Some(value) = lookup(ENV_HEAP_VM) {
            config.use_heap_provider = parse_flag(&value)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, MemoryError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| MemoryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject sizes no arena could be created with.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.scratch_reserve == 0 {
            return Err(MemoryError::Config("scratch_reserve must be non-zero".into()));
        }
        if self.default_arena_capacity == 0 {
            return Err(MemoryError::Config(
                "default_arena_capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The provider arenas created from this configuration use.
    #[must_use]
    pub fn provider(&self) -> &'static dyn VmProvider {
        if self.use_heap_provider {
            strata_vm::heap_provider()
        } else {
            strata_vm::os_provider()
        }
    }
}

/// Install `config` for the whole process.
///
/// Scratch contexts that already exist keep the sizes they were created with.
pub fn install(config: MemoryConfig) {
    tracing::debug!(?config, "installing memory configuration");
    *CONFIG.write() = Some(config);
}

/// The installed configuration, or the defaults.
#[must_use]
pub fn current() -> MemoryConfig {
    CONFIG.read().clone().unwrap_or_default()
}

/// Parse a size string such as `"8G"`, `"512M"`, `"64K"` or `"4096"`.
pub fn parse_size(s: &str) -> Result<usize, MemoryError> {
    let s = s.trim();
    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix('K') {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        (s, 1)
    };

    let value: usize = num_str
        .trim()
        .parse()
        .map_err(|e| MemoryError::Config(format!("invalid size {s:?}: {e}")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| MemoryError::Config(format!("size {s:?} overflows")))
}

fn parse_flag(s: &str) -> Result<bool, MemoryError> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(MemoryError::Config(format!("invalid flag {other:?}"))),
    }
}
