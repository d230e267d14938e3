//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()` only)
//! 3. Library defaults (`defaults.rs`)
//!
//! # Example
//!
//! ```rust,ignore
//! use rsched::config::SchedConfig;
//!
//! let config = SchedConfig::from_env()
//!     .max_coroutines(64)
//!     .poll_batch(32);
//! ```

pub mod defaults;

use rsched_core::env::{env_get, env_get_bool};
use rsched_core::error::{SchedError, SchedResult};
use rsched_core::wrid::WrIdLayout;

/// Per-worker scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    /// Coroutines hosted by the owning worker thread
    pub max_coroutines: usize,
    /// Width of the coroutine-id field in completion identifiers
    pub cor_id_bits: u32,
    /// Completions fetched per connection per drain pass
    pub poll_batch: usize,
    /// Force a notification on single ops when the connection requires one
    pub coalesce_singles: bool,
    /// Trace every post and completion at debug level
    pub debug_logging: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `RSCHED_MAX_COROUTINES` - Coroutines per worker
    /// - `RSCHED_COR_ID_BITS` - Coroutine-id field width (1..=16)
    /// - `RSCHED_POLL_BATCH` - Completions per connection poll
    /// - `RSCHED_COALESCE_SINGLES` - Coalesce single ops too (0/1)
    /// - `RSCHED_DEBUG` - Trace posts and completions (0/1)
    pub fn from_env() -> Self {
        Self {
            max_coroutines: env_get("RSCHED_MAX_COROUTINES", defaults::MAX_COROUTINES),
            cor_id_bits: env_get("RSCHED_COR_ID_BITS", defaults::COR_ID_BITS),
            poll_batch: env_get("RSCHED_POLL_BATCH", defaults::POLL_BATCH),
            coalesce_singles: env_get_bool("RSCHED_COALESCE_SINGLES", defaults::COALESCE_SINGLES),
            debug_logging: env_get_bool("RSCHED_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Library defaults only; the environment is ignored.
    pub fn new() -> Self {
        Self {
            max_coroutines: defaults::MAX_COROUTINES,
            cor_id_bits: defaults::COR_ID_BITS,
            poll_batch: defaults::POLL_BATCH,
            coalesce_singles: defaults::COALESCE_SINGLES,
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn max_coroutines(mut self, n: usize) -> Self {
        self.max_coroutines = n;
        self
    }

    pub fn cor_id_bits(mut self, bits: u32) -> Self {
        self.cor_id_bits = bits;
        self
    }

    pub fn poll_batch(mut self, n: usize) -> Self {
        self.poll_batch = n;
        self
    }

    pub fn coalesce_singles(mut self, enable: bool) -> Self {
        self.coalesce_singles = enable;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    /// Identifier layout for this configuration.
    pub fn layout(&self) -> SchedResult<WrIdLayout> {
        WrIdLayout::new(self.cor_id_bits)
    }

    /// Validate configuration and return the first problem found.
    pub fn validate(&self) -> SchedResult<()> {
        let layout = self.layout()?;
        if self.max_coroutines == 0 {
            return Err(SchedError::InvalidConfig("max_coroutines must be > 0"));
        }
        if self.max_coroutines > layout.max_coroutines() {
            return Err(SchedError::TooManyCoroutines {
                requested: self.max_coroutines,
                limit: layout.max_coroutines(),
            });
        }
        if self.poll_batch == 0 {
            return Err(SchedError::InvalidConfig("poll_batch must be > 0"));
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("rsched configuration:");
        eprintln!("  max_coroutines:    {}", self.max_coroutines);
        eprintln!("  cor_id_bits:       {}", self.cor_id_bits);
        eprintln!("  poll_batch:        {}", self.poll_batch);
        eprintln!("  coalesce_singles:  {}", self.coalesce_singles);
        eprintln!("  debug_logging:     {}", self.debug_logging);
    }
}
