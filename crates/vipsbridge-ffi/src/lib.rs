//! vipsbridge libvips backend
//!
//! Implements [`NativeApi`](vipsbridge_sdk::NativeApi) over a libvips
//! shared library loaded at runtime. Nothing is linked at build time: the
//! library is opened with `dlopen`, every entry point is resolved into a
//! function table up front, and `vips_init` runs once per [`LibVips`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vipsbridge_engine::{Image, Vips};
//! use vipsbridge_ffi::LibVips;
//!
//! let vips = Vips::new(Arc::new(LibVips::open_default()?));
//! let img = Image::black(&vips, 64, 64)?;
//! ```

#![allow(clippy::missing_safety_doc)]

mod backend;
mod glib;
pub mod loader;
mod symbols;

pub use backend::{LibVips, DEFAULT_CANDIDATES};
pub use loader::{Library, LoadError};
