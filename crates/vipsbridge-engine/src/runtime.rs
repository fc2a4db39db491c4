//! Runtime context
//!
//! [`Vips`] ties a native backend to the state the binding keeps on top of
//! it: the descriptor cache, the configuration and the log bridge. It is a
//! cheap, clonable handle; every image keeps one so that operations on the
//! image go back to the same backend.
//!
//! Several `Vips` values may wrap the same backend. They share one
//! [`BackendState`]: the descriptor cache and the count of runtimes that
//! asked for the log bridge. The bridge is removed when the last of them
//! drops.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use vipsbridge_sdk::{NativeApi, TypeId};

use crate::config::VipsConfig;
use crate::error::Result;
use crate::introspect::Introspector;
use crate::log;
use crate::operation::{CallResult, Operation, VOption};
use crate::value::Value;

// ============================================================================
// Per-backend state
// ============================================================================

/// Live backend states, keyed by the backend's address
static BACKENDS: Lazy<DashMap<usize, Weak<BackendState>>> = Lazy::new(DashMap::new);

/// State shared by every runtime over one backend.
struct BackendState {
    key: usize,
    introspector: Introspector,
    log_users: Mutex<usize>,
}

impl BackendState {
    fn key(api: &Arc<dyn NativeApi>) -> usize {
        Arc::as_ptr(api) as *const () as usize
    }

    /// The state for `api`, created on first use
    fn for_backend(api: &Arc<dyn NativeApi>) -> Arc<Self> {
        let key = Self::key(api);
        let mut entry = BACKENDS.entry(key).or_insert_with(Weak::new);
        if let Some(state) = entry.upgrade() {
            return state;
        }
        let state = Arc::new(Self {
            key,
            introspector: Introspector::new(),
            log_users: Mutex::new(0),
        });
        *entry = Arc::downgrade(&state);
        state
    }

    fn attach_log(&self, api: &dyn NativeApi) {
        let mut users = self.log_users.lock();
        if *users == 0 {
            log::install(api);
        }
        *users += 1;
    }

    fn detach_log(&self, api: &dyn NativeApi) {
        let mut users = self.log_users.lock();
        *users = users.saturating_sub(1);
        if *users == 0 {
            log::uninstall(api);
        }
    }
}

impl Drop for BackendState {
    fn drop(&mut self) {
        BACKENDS.remove_if(&self.key, |_, state| state.strong_count() == 0);
    }
}

// ============================================================================
// Vips
// ============================================================================

struct VipsInner {
    api: Arc<dyn NativeApi>,
    backend: Arc<BackendState>,
    config: VipsConfig,
    image_type: OnceCell<TypeId>,
    live_images: AtomicUsize,
}

/// Handle to an initialized native library.
#[derive(Clone)]
pub struct Vips {
    inner: Arc<VipsInner>,
}

impl Vips {
    /// Wrap a backend with the default configuration
    pub fn new(api: Arc<dyn NativeApi>) -> Self {
        let config = VipsConfig::default();
        Self::install(api, config)
    }

    /// Wrap a backend, validating and applying `config`
    pub fn with_config(api: Arc<dyn NativeApi>, config: VipsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::install(api, config))
    }

    /// Wrap a backend configured from `VIPS_*` environment variables
    pub fn from_env(api: Arc<dyn NativeApi>) -> Result<Self> {
        Self::with_config(api, VipsConfig::from_env()?)
    }

    fn install(api: Arc<dyn NativeApi>, config: VipsConfig) -> Self {
        config.cache_policy().apply(api.as_ref());
        api.concurrency_set(config.concurrency);
        let backend = BackendState::for_backend(&api);
        if config.log_bridge {
            backend.attach_log(api.as_ref());
        }

        let (major, minor, micro) = api.version();
        tracing::debug!(
            version = %format!("{}.{}.{}", major, minor, micro),
            concurrency = config.concurrency,
            cache_max = config.cache.max,
            "native library initialized"
        );

        Self {
            inner: Arc::new(VipsInner {
                api,
                backend,
                config,
                image_type: OnceCell::new(),
                live_images: AtomicUsize::new(0),
            }),
        }
    }

    /// The native backend
    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.inner.api
    }

    /// The descriptor cache, shared with every runtime over this backend
    pub fn introspector(&self) -> &Introspector {
        &self.inner.backend.introspector
    }

    /// Configuration in effect
    pub fn config(&self) -> &VipsConfig {
        &self.inner.config
    }

    /// `(major, minor, micro)` of the native library
    pub fn version(&self) -> (i32, i32, i32) {
        self.inner.api.version()
    }

    /// The native image type, looked up once
    pub fn image_type(&self) -> TypeId {
        *self
            .inner
            .image_type
            .get_or_init(|| self.inner.api.image_type())
    }

    /// Call an operation by name; see [`Operation::call`]
    pub fn call(&self, name: &str, args: &[Value], options: &VOption) -> Result<CallResult> {
        Operation::call(self, name, args, options)
    }

    /// Read and clear the native error buffer
    pub(crate) fn take_error(&self, context: &str) -> String {
        let api = &self.inner.api;
        let message = api.error_buffer();
        api.error_clear();
        let message = message.trim_end();
        if message.is_empty() {
            format!("{}: failed", context)
        } else {
            message.to_string()
        }
    }

    pub(crate) fn image_created(&self) {
        self.inner.live_images.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn image_released(&self) {
        self.inner.live_images.fetch_sub(1, Ordering::AcqRel);
    }

    /// Image handles that still hold a native reference
    pub fn live_images(&self) -> usize {
        self.inner.live_images.load(Ordering::Acquire)
    }

    /// Log any image handles still alive when leak checking is on; returns
    /// their count
    pub fn report_leaks(&self) -> usize {
        let live = self.live_images();
        if self.inner.config.leak_check && live > 0 {
            tracing::warn!(live_images = live, "image handles still hold native references");
        }
        live
    }
}

impl Drop for VipsInner {
    fn drop(&mut self) {
        if self.config.log_bridge {
            self.backend.detach_log(self.api.as_ref());
        }
    }
}

impl fmt::Debug for Vips {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vips")
            .field("descriptors", &self.introspector().cached_count())
            .field("live_images", &self.live_images())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use vipsbridge_sim::SimLibrary;

    #[test]
    fn test_config_applied_on_init() {
        let sim = Arc::new(SimLibrary::new());
        let config = VipsConfig {
            cache: CacheConfig {
                max: 7,
                max_mem: 1024,
                max_files: 3,
                trace: false,
            },
            concurrency: 2,
            ..VipsConfig::default()
        };
        let vips = Vips::with_config(sim.clone(), config).unwrap();
        assert_eq!(sim.cache_limits(), (7, 1024, 3));
        assert_eq!(sim.concurrency(), 2);
        assert_eq!(vips.version(), vipsbridge_sim::VERSION);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let sim = Arc::new(SimLibrary::new());
        let config = VipsConfig {
            concurrency: -1,
            ..VipsConfig::default()
        };
        assert!(Vips::with_config(sim, config).is_err());
    }

    #[test]
    fn test_take_error_clears_buffer() {
        let sim = Arc::new(SimLibrary::new());
        let vips = Vips::new(sim.clone());
        assert!(vips.api().operation_new("nope").is_none());
        assert!(vips.take_error("nope").contains("nope"));
        assert_eq!(vips.take_error("nope"), "nope: failed");
    }

    #[test]
    fn test_runtimes_share_descriptors() {
        let sim = Arc::new(SimLibrary::new());
        let first = Vips::new(sim.clone());
        let second = Vips::new(sim.clone());
        let described = first.introspector().describe(first.api(), "avg").unwrap();

        let calls = sim.native_calls();
        let again = second.introspector().describe(second.api(), "avg").unwrap();
        assert!(Arc::ptr_eq(&described, &again));
        assert_eq!(sim.native_calls(), calls);

        let other = Vips::new(Arc::new(SimLibrary::new()));
        assert_eq!(other.introspector().cached_count(), 0);
    }

    #[test]
    fn test_log_bridge_outlives_one_runtime() {
        let sim = Arc::new(SimLibrary::new());
        let first = Vips::new(sim.clone());
        let second = Vips::new(sim.clone());
        assert!(sim.has_log_handler());

        drop(first);
        assert!(sim.has_log_handler());
        drop(second);
        assert!(!sim.has_log_handler());

        let quiet = VipsConfig {
            log_bridge: false,
            ..VipsConfig::default()
        };
        let _silent = Vips::with_config(sim.clone(), quiet).unwrap();
        assert!(!sim.has_log_handler());
    }

    #[test]
    fn test_image_type_cached() {
        let sim = Arc::new(SimLibrary::new());
        let vips = Vips::new(sim.clone());
        let first = vips.image_type();
        let queries = sim.type_queries();
        assert_eq!(vips.image_type(), first);
        assert_eq!(sim.type_queries(), queries);
    }
}
