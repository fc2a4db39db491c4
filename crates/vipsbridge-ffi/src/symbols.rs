//! Function table resolved from the loaded library

use std::ffi::{c_char, c_double, c_int, c_uint, c_ulong, c_void};

use crate::glib::{
    GCallback, GClosureNotify, GLogFunc, GObject, GParamSpec, GType, GValue, Gboolean,
    VipsArgumentMapFn,
};
use crate::loader::{Library, LoadError};

macro_rules! symbols {
    ($($name:ident: fn($($arg:ty),* $(,)?) $(-> $ret:ty)?;)*) => {
        /// Every entry point the backend calls, resolved once at load time
        pub(crate) struct Symbols {
            $(pub $name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
        }

        impl Symbols {
            pub(crate) fn load(lib: &Library) -> Result<Self, LoadError> {
                // SAFETY: each field type is the C prototype of the symbol
                // it is named after
                unsafe {
                    Ok(Self {
                        $($name: lib.get(stringify!($name))?,)*
                    })
                }
            }
        }
    };
}

symbols! {
    // GLib
    g_free: fn(*mut c_void);
    g_malloc: fn(usize) -> *mut c_void;
    g_strfreev: fn(*mut *mut c_char);
    g_log_set_handler: fn(*const c_char, c_uint, GLogFunc, *mut c_void) -> c_uint;
    g_log_remove_handler: fn(*const c_char, c_uint);

    // GType
    g_type_from_name: fn(*const c_char) -> GType;
    g_type_name: fn(GType) -> *const c_char;
    g_type_fundamental: fn(GType) -> GType;
    g_type_is_a: fn(GType, GType) -> Gboolean;

    // GValue
    g_value_init: fn(*mut GValue, GType) -> *mut GValue;
    g_value_unset: fn(*mut GValue);
    g_value_set_boolean: fn(*mut GValue, Gboolean);
    g_value_get_boolean: fn(*const GValue) -> Gboolean;
    g_value_set_int: fn(*mut GValue, c_int);
    g_value_get_int: fn(*const GValue) -> c_int;
    g_value_set_uint64: fn(*mut GValue, u64);
    g_value_get_uint64: fn(*const GValue) -> u64;
    g_value_set_double: fn(*mut GValue, c_double);
    g_value_get_double: fn(*const GValue) -> c_double;
    g_value_set_string: fn(*mut GValue, *const c_char);
    g_value_get_string: fn(*const GValue) -> *const c_char;
    g_value_set_enum: fn(*mut GValue, c_int);
    g_value_get_enum: fn(*const GValue) -> c_int;
    g_value_set_flags: fn(*mut GValue, c_uint);
    g_value_get_flags: fn(*const GValue) -> c_uint;
    g_value_set_object: fn(*mut GValue, *mut c_void);
    g_value_get_object: fn(*const GValue) -> *mut c_void;

    // GObject
    g_object_ref: fn(*mut c_void) -> *mut c_void;
    g_object_unref: fn(*mut c_void);
    g_object_set_property: fn(*mut GObject, *const c_char, *const GValue);
    g_object_get_property: fn(*mut GObject, *const c_char, *mut GValue);
    g_object_class_find_property: fn(*mut c_void, *const c_char) -> *mut GParamSpec;
    g_param_spec_get_blurb: fn(*mut GParamSpec) -> *const c_char;
    g_signal_connect_data: fn(*mut c_void, *const c_char, GCallback, *mut c_void, GClosureNotify, c_int) -> c_ulong;

    // libvips core
    vips_init: fn(*const c_char) -> c_int;
    vips_version: fn(c_int) -> c_int;
    vips_error_buffer: fn() -> *const c_char;
    vips_error_clear: fn();
    vips_enum_from_nick: fn(*const c_char, GType, *const c_char) -> c_int;
    vips_flags_from_nick: fn(*const c_char, GType, *const c_char) -> c_int;
    vips_enum_nick: fn(GType, c_int) -> *const c_char;
    vips_object_get_description: fn(*mut c_void) -> *const c_char;

    // Operations
    vips_operation_new: fn(*const c_char) -> *mut c_void;
    vips_argument_map: fn(*mut c_void, VipsArgumentMapFn, *mut c_void, *mut c_void) -> *mut c_void;
    vips_cache_operation_build: fn(*mut c_void) -> *mut c_void;
    vips_object_unref_outputs: fn(*mut c_void);

    // Boxed values
    vips_array_double_get_type: fn() -> GType;
    vips_array_int_get_type: fn() -> GType;
    vips_array_image_get_type: fn() -> GType;
    vips_blob_get_type: fn() -> GType;
    vips_value_set_array_double: fn(*mut GValue, *const c_double, c_int);
    vips_value_get_array_double: fn(*const GValue, *mut c_int) -> *const c_double;
    vips_value_set_array_int: fn(*mut GValue, *const c_int, c_int);
    vips_value_get_array_int: fn(*const GValue, *mut c_int) -> *const c_int;
    vips_value_set_blob_free: fn(*mut GValue, *mut c_void, usize);
    vips_value_get_blob: fn(*const GValue, *mut usize) -> *const c_void;
    vips_value_set_array_image: fn(*mut GValue, c_int);
    vips_value_get_array_image: fn(*const GValue, *mut c_int) -> *mut *mut c_void;

    // Images
    vips_image_get_type: fn() -> GType;
    vips_image_new_from_memory_copy: fn(*const c_void, usize, c_int, c_int, c_int, c_int) -> *mut c_void;
    vips_image_write_to_memory: fn(*mut c_void, *mut usize) -> *mut c_void;
    vips_image_copy_memory: fn(*mut c_void) -> *mut c_void;
    vips_image_invalidate_all: fn(*mut c_void);
    vips_image_get_typeof: fn(*const c_void, *const c_char) -> GType;
    vips_image_get: fn(*const c_void, *const c_char, *mut GValue) -> c_int;
    vips_image_set: fn(*mut c_void, *const c_char, *mut GValue);
    vips_image_remove: fn(*mut c_void, *const c_char) -> Gboolean;
    vips_image_get_fields: fn(*mut c_void) -> *mut *mut c_char;
    vips_image_set_progress: fn(*mut c_void, Gboolean);
    vips_image_set_kill: fn(*mut c_void, Gboolean);
    vips_foreign_find_load: fn(*const c_char) -> *const c_char;
    vips_foreign_find_save: fn(*const c_char) -> *const c_char;

    // Global state
    vips_cache_set_max: fn(c_int);
    vips_cache_set_max_mem: fn(usize);
    vips_cache_set_max_files: fn(c_int);
    vips_cache_set_trace: fn(Gboolean);
    vips_concurrency_set: fn(c_int);
}
