//! Configuration for keystack layers
//!
//! Centralized configuration with sensible defaults.

use std::time::Duration;

use crate::error::{KeystackError, Result};

// =============================================================================
// Bloom Filter Layer
// =============================================================================

/// Configuration for [`BloomFilterDataInterface`](crate::bloom::BloomFilterDataInterface)
#[derive(Debug, Clone)]
pub struct BloomConfig {
    // -------------------------------------------------------------------------
    // Filter Sizing
    // -------------------------------------------------------------------------
    /// False-positive probability a freshly built filter is sized for
    pub target_fpp: f64,

    /// A filter whose estimated FPP exceeds `target_fpp * max_fpp_factor`
    /// is discarded and rebuilt
    pub max_fpp_factor: f64,

    /// Headroom for future writes: filters are sized for
    /// `appr_size * growth_factor` keys
    pub growth_factor: f64,

    /// Filters are never sized for fewer keys than this
    pub min_expected_keys: u64,

    // -------------------------------------------------------------------------
    // Rebuild Safety
    // -------------------------------------------------------------------------
    /// A rebuild aborts once it has seen more than
    /// `max(expected * size_violation_factor, size_violation_floor)` keys
    pub size_violation_factor: u64,

    pub size_violation_floor: u64,

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------
    /// How often a changed filter is written to the side store.
    /// `None` disables the background task (flush/close still persist).
    pub persist_interval: Option<Duration>,
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            target_fpp: 0.001,
            max_fpp_factor: 20.0,
            growth_factor: 2.0,
            min_expected_keys: 1024,
            size_violation_factor: 10,
            size_violation_floor: 10_000,
            persist_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl BloomConfig {
    pub fn builder() -> BloomConfigBuilder {
        BloomConfigBuilder::default()
    }

    /// Estimated FPP above which a filter is thrown away
    pub fn max_fpp(&self) -> f64 {
        self.target_fpp * self.max_fpp_factor
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.target_fpp > 0.0 && self.target_fpp < 1.0) {
            return Err(KeystackError::Config(format!(
                "target_fpp must be in (0, 1), got {}",
                self.target_fpp
            )));
        }
        if self.max_fpp_factor < 1.0 {
            return Err(KeystackError::Config(format!(
                "max_fpp_factor must be >= 1, got {}",
                self.max_fpp_factor
            )));
        }
        if self.growth_factor < 1.0 {
            return Err(KeystackError::Config(format!(
                "growth_factor must be >= 1, got {}",
                self.growth_factor
            )));
        }
        if self.size_violation_factor == 0 {
            return Err(KeystackError::Config(
                "size_violation_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for BloomConfig
#[derive(Default)]
pub struct BloomConfigBuilder {
    config: BloomConfig,
}

impl BloomConfigBuilder {
    pub fn target_fpp(mut self, fpp: f64) -> Self {
        self.config.target_fpp = fpp;
        self
    }

    pub fn max_fpp_factor(mut self, factor: f64) -> Self {
        self.config.max_fpp_factor = factor;
        self
    }

    pub fn growth_factor(mut self, factor: f64) -> Self {
        self.config.growth_factor = factor;
        self
    }

    pub fn min_expected_keys(mut self, keys: u64) -> Self {
        self.config.min_expected_keys = keys;
        self
    }

    pub fn size_violation_factor(mut self, factor: u64) -> Self {
        self.config.size_violation_factor = factor;
        self
    }

    pub fn size_violation_floor(mut self, floor: u64) -> Self {
        self.config.size_violation_floor = floor;
        self
    }

    /// Set the background persistence interval (`None` disables it)
    pub fn persist_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.persist_interval = interval;
        self
    }

    pub fn build(self) -> BloomConfig {
        self.config
    }
}

// =============================================================================
// Cached Layer
// =============================================================================

/// Configuration for [`CachedDataInterface`](crate::cache::CachedDataInterface)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    // -------------------------------------------------------------------------
    // Write Buffer
    // -------------------------------------------------------------------------
    /// Number of independently locked write-buffer shards
    pub write_shards: usize,

    /// Period of the background flush. `None` disables it (explicit
    /// `flush()`/`close()` and memory reclaim still flush).
    pub flush_interval: Option<Duration>,

    /// Bulk writes re-check closed/memory/stuck-flush every this many entries
    pub bulk_check_interval: usize,

    // -------------------------------------------------------------------------
    // Backpressure
    // -------------------------------------------------------------------------
    /// Longest a write waits for memory headroom before proceeding anyway
    pub memory_wait: Duration,

    /// Writes block once no flush has succeeded for
    /// `flush_interval * stuck_flush_factor`
    pub stuck_flush_factor: u32,

    /// Longest a write waits on a stuck flush before failing
    pub stuck_flush_max_wait: Duration,

    // -------------------------------------------------------------------------
    // Read Cache
    // -------------------------------------------------------------------------
    /// Maximum number of cached keys (including cached absences)
    pub read_cache_capacity: usize,

    /// Fill the read cache from the backend in the background on open
    pub warm_up: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            write_shards: 16,
            flush_interval: Some(Duration::from_secs(1)),
            bulk_check_interval: 100,
            memory_wait: Duration::from_secs(5),
            stuck_flush_factor: 10,
            stuck_flush_max_wait: Duration::from_secs(30),
            read_cache_capacity: 100_000,
            warm_up: true,
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Time without a successful flush after which writes block
    pub fn stuck_flush_threshold(&self) -> Option<Duration> {
        self.flush_interval
            .map(|interval| interval * self.stuck_flush_factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_shards == 0 {
            return Err(KeystackError::Config(
                "write_shards must be positive".to_string(),
            ));
        }
        if self.bulk_check_interval == 0 {
            return Err(KeystackError::Config(
                "bulk_check_interval must be positive".to_string(),
            ));
        }
        if self.flush_interval == Some(Duration::ZERO) {
            return Err(KeystackError::Config(
                "flush_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for CacheConfig
#[derive(Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn write_shards(mut self, shards: usize) -> Self {
        self.config.write_shards = shards;
        self
    }

    /// Set the background flush interval (`None` disables it)
    pub fn flush_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn bulk_check_interval(mut self, entries: usize) -> Self {
        self.config.bulk_check_interval = entries;
        self
    }

    pub fn memory_wait(mut self, wait: Duration) -> Self {
        self.config.memory_wait = wait;
        self
    }

    pub fn stuck_flush_factor(mut self, factor: u32) -> Self {
        self.config.stuck_flush_factor = factor;
        self
    }

    pub fn stuck_flush_max_wait(mut self, wait: Duration) -> Self {
        self.config.stuck_flush_max_wait = wait;
        self
    }

    pub fn read_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.read_cache_capacity = capacity;
        self
    }

    pub fn warm_up(mut self, enabled: bool) -> Self {
        self.config.warm_up = enabled;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}
