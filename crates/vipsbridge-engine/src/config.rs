//! Library configuration (vips.toml / `VIPS_*` environment)
//!
//! The native operation cache and worker pool are process-wide native
//! state. The binding never manages them itself; it only passes limits
//! through a [`CachePolicy`] when a [`Vips`](crate::Vips) is created.
//!
//! ```toml
//! concurrency = 4
//! leak_check = true
//!
//! [cache]
//! max = 200
//! max_mem = 52428800
//! trace = false
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use vipsbridge_sdk::NativeApi;

use crate::error::{Result, VipsError};

/// Operation cache limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of cached operations (default: 100)
    #[serde(default = "default_cache_max")]
    pub max: i32,

    /// Maximum memory held by cached operations, in bytes (default: 100 MiB)
    #[serde(default = "default_cache_max_mem")]
    pub max_mem: u64,

    /// Maximum open files held by cached operations (default: 100)
    #[serde(default = "default_cache_max_files")]
    pub max_files: i32,

    /// Trace cache hits and misses through the log channel
    #[serde(default)]
    pub trace: bool,
}

fn default_cache_max() -> i32 {
    100
}

fn default_cache_max_mem() -> u64 {
    100 * 1024 * 1024
}

fn default_cache_max_files() -> i32 {
    100
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max: default_cache_max(),
            max_mem: default_cache_max_mem(),
            max_files: default_cache_max_files(),
            trace: false,
        }
    }
}

/// Binding configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VipsConfig {
    /// Operation cache limits
    #[serde(default)]
    pub cache: CacheConfig,

    /// Worker threads for evaluation; 0 lets the library decide
    #[serde(default)]
    pub concurrency: i32,

    /// Report image handles still alive at `report_leaks`
    #[serde(default)]
    pub leak_check: bool,

    /// Route native log messages to `tracing` (default: true)
    #[serde(default = "default_true")]
    pub log_bridge: bool,
}

impl Default for VipsConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            concurrency: 0,
            leak_check: false,
            log_bridge: true,
        }
    }
}

impl VipsConfig {
    /// Parse TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VipsConfig =
            toml::from_str(text).map_err(|e| VipsError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VipsError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Read `VIPS_CONCURRENCY`, `VIPS_CACHE_MAX`, `VIPS_CACHE_MAX_MEM`,
    /// `VIPS_CACHE_MAX_FILES`, `VIPS_CACHE_TRACE` and `VIPS_LEAK`
    pub fn from_env() -> Result<Self> {
        Self::from_vars(std::env::vars())
    }

    /// Same as [`from_env`](Self::from_env) over an explicit variable list
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| VipsError::Config(format!("{}: invalid value '{}'", key, value)))
        }

        fn flag(value: &str) -> bool {
            !matches!(value.trim(), "" | "0" | "false" | "no" | "off")
        }

        let mut config = VipsConfig::default();
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "VIPS_CONCURRENCY" => config.concurrency = parse(key, value)?,
                "VIPS_CACHE_MAX" => config.cache.max = parse(key, value)?,
                "VIPS_CACHE_MAX_MEM" => config.cache.max_mem = parse(key, value)?,
                "VIPS_CACHE_MAX_FILES" => config.cache.max_files = parse(key, value)?,
                "VIPS_CACHE_TRACE" => config.cache.trace = flag(value),
                "VIPS_LEAK" => config.leak_check = flag(value),
                _ => {}
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| VipsError::Config(e.to_string()))
    }

    /// Reject negative limits
    pub fn validate(&self) -> Result<()> {
        if self.concurrency < 0 {
            return Err(VipsError::Config(format!(
                "concurrency must be >= 0, got {}",
                self.concurrency
            )));
        }
        if self.cache.max < 0 {
            return Err(VipsError::Config(format!(
                "cache.max must be >= 0, got {}",
                self.cache.max
            )));
        }
        if self.cache.max_files < 0 {
            return Err(VipsError::Config(format!(
                "cache.max_files must be >= 0, got {}",
                self.cache.max_files
            )));
        }
        Ok(())
    }

    /// Cache limits as a policy to apply to a backend
    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            max: self.cache.max,
            max_mem: self.cache.max_mem,
            max_files: self.cache.max_files,
            trace: self.cache.trace,
        }
    }
}

/// Operation cache limits, pushed to the native side as one call sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub max: i32,
    pub max_mem: u64,
    pub max_files: i32,
    pub trace: bool,
}

impl CachePolicy {
    /// A policy that disables operation caching
    pub fn disabled() -> Self {
        Self {
            max: 0,
            max_mem: 0,
            max_files: 0,
            trace: false,
        }
    }

    pub fn apply(&self, api: &dyn NativeApi) {
        api.cache_set_max(self.max);
        api.cache_set_max_mem(self.max_mem);
        api.cache_set_max_files(self.max_files);
        api.cache_set_trace(self.trace);
        tracing::trace!(max = self.max, max_mem = self.max_mem, max_files = self.max_files, "cache policy applied");
    }
}
