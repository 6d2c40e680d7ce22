//! Process lifecycle.
//!
//! [`init`] records the platform constants and installs the memory
//! configuration; [`shutdown`] releases the scratch arenas of every thread.
//! Both are safe to call more than once.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use serde::Serialize;
use strata_memory::{config, scratch, MemoryConfig, MemoryError};

static PLATFORM: OnceLock<Platform> = OnceLock::new();

/// Constants of the machine the process runs on.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Platform {
    page_size: usize,
    core_count: usize,
    #[serde(skip)]
    start: Instant,
}

impl Platform {
    fn detect() -> Self {
        let core_count = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            page_size: strata_vm::page_size(),
            core_count,
            start: Instant::now(),
        }
    }

    /// Virtual-memory page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Logical cores available to the process.
    #[must_use]
    pub fn core_count(&self) -> usize {
        self.core_count
    }

    /// Monotonic time origin, taken at first initialization.
    #[must_use]
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Time since [`Platform::start`].
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Initialize from the `STRATA_*` environment variables.
pub fn init() -> Result<&'static Platform, MemoryError> {
    init_with(MemoryConfig::from_env()?)
}

/// Initialize with an explicit configuration.
///
/// The platform constants are detected once; the configuration is installed
/// on every call and applies to scratch contexts created afterwards.
pub fn init_with(config: MemoryConfig) -> Result<&'static Platform, MemoryError> {
    config.validate()?;
    config::install(config);
    let platform = platform();
    tracing::debug!(
        page_size = platform.page_size,
        core_count = platform.core_count,
        "strata runtime initialized"
    );
    Ok(platform)
}

/// The platform constants, detected on first use.
pub fn platform() -> &'static Platform {
    PLATFORM.get_or_init(Platform::detect)
}

/// Release every thread's outstanding scratch arenas.
///
/// Scratch guards still held anywhere become unusable. Threads that keep
/// running get fresh scratch contexts on their next request.
pub fn shutdown() {
    let released = scratch::teardown();
    let live = scratch::live_contexts();
    if live > 0 {
        tracing::warn!(live, "scratch contexts created during shutdown");
    }
    tracing::debug!(released, "strata runtime shut down");
}
