//! NativeApi trait: the native library as the binding sees it
//!
//! Every call the binding makes into the image library goes through this
//! trait. The methods mirror the library's C entry points one-to-one (object
//! reference counting, `GValue` setters/getters, argument table walk, cached
//! build, global error buffer) so that a backend is a thin adapter and the
//! marshaling logic lives in the engine.
//!
//! # Ownership conventions
//!
//! - `operation_new`, `cache_operation_build`, `image_new_from_memory` and
//!   `image_copy_memory` return pointers carrying one reference owned by the
//!   caller.
//! - `value_get_object` and `value_get_array_image` return *borrowed*
//!   pointers; the caller must `object_ref` anything it keeps.
//! - `value_set_object` and `value_set_array_image` take their own
//!   references; the caller keeps its share.
//! - `value_set_blob` takes ownership of the bytes.
//! - `value_unset` releases the payload and the slot itself.

use std::sync::Arc;

use crate::error::NativeResult;
use crate::progress::ProgressSignal;
use crate::types::{
    ArgumentInfo, BandFormat, LogHandler, ObjectPtr, PostCloseFn, TypeId, TypeKind, ValuePtr,
};

/// Abstract native image library.
///
/// Implementations must be safe to call from several threads at once; the
/// binding never calls into the same *mutable* object from two threads.
pub trait NativeApi: Send + Sync {
    // ========================================================================
    // Type System
    // ========================================================================

    /// Look up a type by its registered name
    fn type_from_name(&self, name: &str) -> Option<TypeId>;

    /// Registered name of a type
    fn type_name(&self, ty: TypeId) -> String;

    /// Fundamental category of a type
    fn type_kind(&self, ty: TypeId) -> TypeKind;

    /// Whether `ty` is `parent` or derives from it
    fn type_is_a(&self, ty: TypeId, parent: TypeId) -> bool;

    /// The image object type
    fn image_type(&self) -> TypeId;

    /// Decode an enum or flags nickname (flags accept `a|b` lists)
    fn enum_from_nick(&self, ty: TypeId, nick: &str) -> NativeResult<i32>;

    /// Nickname of an enum value
    fn enum_nick(&self, ty: TypeId, value: i32) -> Option<String>;

    // ========================================================================
    // Objects
    // ========================================================================

    /// Create a new, unbuilt operation. `None` if the name is unknown.
    fn operation_new(&self, name: &str) -> Option<ObjectPtr>;

    /// Increment the reference count
    fn object_ref(&self, obj: ObjectPtr);

    /// Decrement the reference count; the object is freed at zero
    fn object_unref(&self, obj: ObjectPtr);

    /// Current reference count (diagnostics only)
    fn object_ref_count(&self, obj: ObjectPtr) -> u32;

    /// Runtime type of an object
    fn object_type(&self, obj: ObjectPtr) -> TypeId;

    /// One-line description of an object's class (empty if it has none)
    fn object_description(&self, obj: ObjectPtr) -> String;

    /// Visit every declared argument of an operation, in declaration order
    fn argument_map(&self, op: ObjectPtr, visit: &mut dyn FnMut(ArgumentInfo));

    /// Copy `value` into the named property
    fn set_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()>;

    /// Copy the named property into `value` (which must already be initialized
    /// with the property's type)
    fn get_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()>;

    /// Build an operation through the operation cache.
    ///
    /// Returns the operation to read outputs from (possibly a previously
    /// cached instance) with a new reference, or `None` on failure with a
    /// message left in the error buffer.
    fn cache_operation_build(&self, op: ObjectPtr) -> Option<ObjectPtr>;

    /// Drop the extra references a build handed out on output objects
    fn object_unref_outputs(&self, op: ObjectPtr);

    // ========================================================================
    // Values
    // ========================================================================

    /// Allocate and initialize a value slot for `ty`
    fn value_init(&self, ty: TypeId) -> ValuePtr;

    /// Type a slot was initialized with
    fn value_type(&self, value: ValuePtr) -> TypeId;

    /// Release the payload and the slot
    fn value_unset(&self, value: ValuePtr);

    /// `g_value_set_boolean`
    fn value_set_bool(&self, value: ValuePtr, v: bool);
    /// `g_value_get_boolean`
    fn value_get_bool(&self, value: ValuePtr) -> bool;

    /// `g_value_set_int`
    fn value_set_int(&self, value: ValuePtr, v: i32);
    /// `g_value_get_int`
    fn value_get_int(&self, value: ValuePtr) -> i32;

    /// `g_value_set_uint64`
    fn value_set_uint64(&self, value: ValuePtr, v: u64);
    /// `g_value_get_uint64`
    fn value_get_uint64(&self, value: ValuePtr) -> u64;

    /// `g_value_set_double`
    fn value_set_double(&self, value: ValuePtr, v: f64);
    /// `g_value_get_double`
    fn value_get_double(&self, value: ValuePtr) -> f64;

    /// `g_value_set_string` (the native side duplicates the string)
    fn value_set_string(&self, value: ValuePtr, v: &str);
    /// `g_value_get_string`
    fn value_get_string(&self, value: ValuePtr) -> Option<String>;

    /// `g_value_set_enum`
    fn value_set_enum(&self, value: ValuePtr, v: i32);
    /// `g_value_get_enum`
    fn value_get_enum(&self, value: ValuePtr) -> i32;

    /// `g_value_set_flags`
    fn value_set_flags(&self, value: ValuePtr, v: u32);
    /// `g_value_get_flags`
    fn value_get_flags(&self, value: ValuePtr) -> u32;

    /// `vips_value_set_array_double` (copied)
    fn value_set_array_double(&self, value: ValuePtr, v: &[f64]);
    /// `vips_value_get_array_double`
    fn value_get_array_double(&self, value: ValuePtr) -> Vec<f64>;

    /// `vips_value_set_array_int` (copied)
    fn value_set_array_int(&self, value: ValuePtr, v: &[i32]);
    /// `vips_value_get_array_int`
    fn value_get_array_int(&self, value: ValuePtr) -> Vec<i32>;

    /// `vips_value_set_blob` (ownership transferred)
    fn value_set_blob(&self, value: ValuePtr, v: Vec<u8>);
    /// `vips_value_get_blob`
    fn value_get_blob(&self, value: ValuePtr) -> Vec<u8>;

    /// `g_value_set_object` (takes a reference)
    fn value_set_object(&self, value: ValuePtr, v: Option<ObjectPtr>);
    /// `g_value_get_object` (borrowed)
    fn value_get_object(&self, value: ValuePtr) -> Option<ObjectPtr>;

    /// `vips_value_set_array_image` (takes one reference per image)
    fn value_set_array_image(&self, value: ValuePtr, v: &[ObjectPtr]);
    /// `vips_value_get_array_image` (borrowed)
    fn value_get_array_image(&self, value: ValuePtr) -> Vec<ObjectPtr>;

    // ========================================================================
    // Error Buffer
    // ========================================================================

    /// Contents of the global error buffer
    fn error_buffer(&self) -> String;

    /// Empty the global error buffer
    fn error_clear(&self);

    // ========================================================================
    // Images
    // ========================================================================

    /// Wrap a copy of raw pixel memory as an image
    fn image_new_from_memory(
        &self,
        data: &[u8],
        width: i32,
        height: i32,
        bands: i32,
        format: BandFormat,
    ) -> Option<ObjectPtr>;

    /// Render an image to a packed pixel buffer
    fn image_write_to_memory(&self, image: ObjectPtr) -> Option<Vec<u8>>;

    /// Private, fully rendered copy of an image, safe to modify in place
    fn image_copy_memory(&self, image: ObjectPtr) -> Option<ObjectPtr>;

    /// Drop any pixels cached from this image so they are recomputed
    fn image_invalidate_all(&self, image: ObjectPtr);

    /// Type of a header field, `None` if absent
    fn image_get_typeof(&self, image: ObjectPtr, name: &str) -> Option<TypeId>;

    /// Read a header field into a freshly initialized slot
    fn image_get(&self, image: ObjectPtr, name: &str) -> Option<ValuePtr>;

    /// Write a header field (the slot is copied)
    fn image_set(&self, image: ObjectPtr, name: &str, value: ValuePtr);

    /// Remove a header field, returning whether it existed
    fn image_remove(&self, image: ObjectPtr, name: &str) -> bool;

    /// Names of all header fields
    fn image_get_fields(&self, image: ObjectPtr) -> Vec<String>;

    /// Name of the load operation able to read `filename`
    fn foreign_find_load(&self, filename: &str) -> Option<String>;

    /// Name of the save operation able to write `filename`
    fn foreign_find_save(&self, filename: &str) -> Option<String>;

    // ========================================================================
    // Signals
    // ========================================================================

    /// Run `callback` once when the object is finalized
    fn connect_postclose(&self, obj: ObjectPtr, callback: PostCloseFn) -> NativeResult<()>;

    /// Report evaluation progress of `image` to `signal`, and stop when
    /// the signal is killed
    fn attach_progress(&self, image: ObjectPtr, signal: Arc<ProgressSignal>);

    /// Route native log messages to `handler` (`None` restores the default)
    fn set_log_handler(&self, handler: Option<LogHandler>);

    // ========================================================================
    // Global State
    // ========================================================================

    /// Maximum number of operations kept in the operation cache
    fn cache_set_max(&self, max: i32);

    /// Maximum memory held by cached operations
    fn cache_set_max_mem(&self, max_mem: u64);

    /// Maximum number of open files held by cached operations
    fn cache_set_max_files(&self, max_files: i32);

    /// Trace cache hits and misses through the log channel
    fn cache_set_trace(&self, trace: bool);

    /// Number of worker threads used for evaluation (0 = library default)
    fn concurrency_set(&self, concurrency: i32);

    /// `(major, minor, micro)` version of the native library
    fn version(&self) -> (i32, i32, i32);
}
