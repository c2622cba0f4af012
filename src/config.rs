//! Tunables for a cache attachment.
//!
//! Most callers just want [`CacheConfig::default`]. Larger deployments can
//! fold a [`CacheConfig`] into their own (`serde`-based) configuration file,
//! or let [`CacheConfig::from_env`] pick up overrides from the environment
//! without a recompile.

use serde::{Deserialize, Serialize};

/// Page size the source uses, and the only value this crate currently
/// accepts (see [`CacheConfig::page_size`]).
pub const PAGE_SIZE: usize = 4096;

/// Production default slot count: 12,800 pages * 4 KiB =~ 50 MiB.
pub const DEFAULT_CAPACITY: usize = 12_800;

/// Name of the POSIX shared memory object the source uses.
pub const DEFAULT_SEGMENT_NAME: &str = "/globalCache_shm";

const ENV_SEGMENT_NAME: &str = "SHARED_PAGE_CACHE_SEGMENT_NAME";
const ENV_CAPACITY: &str = "SHARED_PAGE_CACHE_CAPACITY";
const ENV_PAGE_SIZE: &str = "SHARED_PAGE_CACHE_PAGE_SIZE";

/// Configuration for one [`crate::Cache::initialize`] call.
///
/// `page_size` is present for forward documentation of the on-disk/shared
/// memory layout, but a value other than [`PAGE_SIZE`] is rejected at
/// attach time (`InvalidArgument`) rather than silently ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Identity of the named shared memory region, e.g. `/globalCache_shm`.
    pub segment_name: String,
    /// Number of page slots in the shared segment.
    pub capacity: usize,
    /// Page size in bytes; must equal [`PAGE_SIZE`].
    pub page_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            segment_name: DEFAULT_SEGMENT_NAME.to_string(),
            capacity: DEFAULT_CAPACITY,
            page_size: PAGE_SIZE,
        }
    }
}

impl CacheConfig {
    /// Start from [`CacheConfig::default`] and overlay `SHARED_PAGE_CACHE_*`
    /// environment variables, for operators who want to tune the cache
    /// without recompiling.
    pub fn from_env() -> Self {
        let mut config = CacheConfig::default();

        if let Ok(name) = std::env::var(ENV_SEGMENT_NAME) {
            config.segment_name = name;
        }
        if let Ok(capacity) = std::env::var(ENV_CAPACITY) {
            if let Ok(capacity) = capacity.parse() {
                config.capacity = capacity;
            } else {
                log::warn!(
                    "ignoring non-numeric {} = {:?}",
                    ENV_CAPACITY,
                    capacity
                );
            }
        }
        if let Ok(page_size) = std::env::var(ENV_PAGE_SIZE) {
            if let Ok(page_size) = page_size.parse() {
                config.page_size = page_size;
            } else {
                log::warn!(
                    "ignoring non-numeric {} = {:?}",
                    ENV_PAGE_SIZE,
                    page_size
                );
            }
        }

        config
    }

    /// A small configuration suitable for unit/integration tests: a
    /// caller-chosen unique segment name and a tiny capacity so the
    /// CLOCK sweep and eviction scenarios are easy to drive by hand.
    pub fn for_test(segment_name: impl Into<String>, capacity: usize) -> Self {
        CacheConfig {
            segment_name: segment_name.into(),
            capacity,
            page_size: PAGE_SIZE,
        }
    }

    /// Parses a `CacheConfig` out of a JSON document, for host applications
    /// that keep this crate's settings as one section of a larger on-disk
    /// config file rather than relying solely on environment overrides.
    pub fn from_json(data: &str) -> serde_json::Result<CacheConfig> {
        serde_json::from_str(data)
    }

    /// Renders this `CacheConfig` back to JSON, e.g. to persist operator
    /// overrides discovered via [`CacheConfig::from_env`].
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let config = CacheConfig::for_test("/sp_cache_cfg_test", 8);
        let json = config.to_json().unwrap();
        let parsed = CacheConfig::from_json(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
