//! vipsbridge SDK - the native library contract
//!
//! This crate holds the minimal types and the [`NativeApi`] trait that a
//! native image library backend implements. The engine programs against this
//! trait only, so the same marshaling and lifetime logic runs on top of the
//! dynamically loaded libvips backend (`vipsbridge-ffi`) and on top of the
//! in-process reference library (`vipsbridge-sim`).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vipsbridge_sdk::NativeApi;
//!
//! fn describe(api: &Arc<dyn NativeApi>, name: &str) {
//!     if let Some(op) = api.operation_new(name) {
//!         api.argument_map(op, &mut |arg| println!("{} {:?}", arg.name, arg.flags));
//!         api.object_unref(op);
//!     }
//! }
//! ```

pub mod api;
pub mod error;
pub mod progress;
pub mod types;

pub use api::NativeApi;
pub use error::{NativeError, NativeResult};
pub use progress::ProgressSignal;
pub use types::{
    ArgumentFlags, ArgumentInfo, BandFormat, LogHandler, LogLevel, ObjectPtr, PostCloseFn,
    TypeId, TypeKind, ValuePtr,
};
