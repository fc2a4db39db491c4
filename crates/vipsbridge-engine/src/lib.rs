//! vipsbridge Engine
//!
//! Dynamic, call-by-name bindings over a native image processing library:
//! - **Introspection**: argument tables read once per operation and cached (`introspect`)
//! - **Values**: managed values and the native slots they are marshaled through (`value`)
//! - **Invoker**: validation, constant promotion, build and output harvest (`operation`)
//! - **Images**: shared handles with post-close hooks and a mutation scope (`image`, `mutable`)
//! - **Runtime**: configuration, cache policy and the log bridge (`runtime`, `config`, `log`)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vipsbridge_engine::{Image, VOption, Vips};
//!
//! let vips = Vips::new(Arc::new(vipsbridge_sim::SimLibrary::new()));
//! let a = Image::black(&vips, 16, 16)?;
//! let b = a.call("linear", &[vec![1.0].into(), vec![10.0].into()], &VOption::new())?
//!     .into_image()?;
//! assert_eq!(a.add(&b)?.avg()?, 10.0);
//! ```

#![warn(rust_2018_idioms)]

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod handle;
pub mod image;
pub mod introspect;
pub mod log;
pub mod mutable;
pub mod operation;
pub mod runtime;
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{CacheConfig, CachePolicy, VipsConfig};
pub use error::{Result, VipsError};
pub use handle::ObjectHandle;
pub use image::{HookId, Image};
pub use introspect::{ArgumentSpec, Introspector, OperationDescriptor};
pub use mutable::MutableImage;
pub use operation::{match_image, CallResult, Operation, OptionValue, VOption};
pub use runtime::Vips;
pub use value::{EnumValue, Value, ValueBox};

pub use vipsbridge_sdk::{BandFormat, NativeApi, ProgressSignal};
