//! Native log channel to `tracing`
//!
//! Warnings and informational messages from the native library never turn
//! into errors. They are forwarded as `tracing` events from this module with
//! the native log domain as a field.

use std::sync::Arc;

use vipsbridge_sdk::{LogLevel, NativeApi};

/// Route the backend's log messages to `tracing`
pub fn install(api: &dyn NativeApi) {
    api.set_log_handler(Some(Arc::new(forward)));
}

/// Restore the backend's own log output
pub fn uninstall(api: &dyn NativeApi) {
    api.set_log_handler(None);
}

/// Emit one native message as a `tracing` event
pub fn forward(level: LogLevel, domain: &str, message: &str) {
    match level {
        LogLevel::Error | LogLevel::Critical => tracing::error!(domain, "{}", message),
        LogLevel::Warning => tracing::warn!(domain, "{}", message),
        LogLevel::Message | LogLevel::Info => tracing::info!(domain, "{}", message),
        LogLevel::Debug => tracing::debug!(domain, "{}", message),
    }
}
