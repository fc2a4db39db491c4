//! GLib, GObject and libvips struct layouts the backend reads directly

use std::ffi::{c_char, c_int, c_uint, c_void};

pub(crate) type GType = usize;
pub(crate) type Gboolean = c_int;

// Fundamental type ids (`G_TYPE_MAKE_FUNDAMENTAL(n)` is `n << 2`)
pub(crate) const G_TYPE_BOOLEAN: GType = 5 << 2;
pub(crate) const G_TYPE_INT: GType = 6 << 2;
pub(crate) const G_TYPE_UINT64: GType = 11 << 2;
pub(crate) const G_TYPE_ENUM: GType = 12 << 2;
pub(crate) const G_TYPE_FLAGS: GType = 13 << 2;
pub(crate) const G_TYPE_DOUBLE: GType = 15 << 2;
pub(crate) const G_TYPE_STRING: GType = 16 << 2;
pub(crate) const G_TYPE_BOXED: GType = 18 << 2;
pub(crate) const G_TYPE_OBJECT: GType = 20 << 2;

// GLogLevelFlags
pub(crate) const G_LOG_FLAG_RECURSION: c_uint = 1 << 0;
pub(crate) const G_LOG_FLAG_FATAL: c_uint = 1 << 1;
pub(crate) const G_LOG_LEVEL_ERROR: c_uint = 1 << 2;
pub(crate) const G_LOG_LEVEL_CRITICAL: c_uint = 1 << 3;
pub(crate) const G_LOG_LEVEL_WARNING: c_uint = 1 << 4;
pub(crate) const G_LOG_LEVEL_MESSAGE: c_uint = 1 << 5;
pub(crate) const G_LOG_LEVEL_INFO: c_uint = 1 << 6;
pub(crate) const G_LOG_LEVEL_DEBUG: c_uint = 1 << 7;
pub(crate) const G_LOG_LEVEL_MASK: c_uint = !(G_LOG_FLAG_RECURSION | G_LOG_FLAG_FATAL);

/// `GValue`: a type tag and two words of payload
#[repr(C)]
#[derive(Default)]
pub(crate) struct GValue {
    pub g_type: GType,
    pub data: [u64; 2],
}

#[repr(C)]
pub(crate) struct GTypeClass {
    pub g_type: GType,
}

/// Leading fields of `GObject`
#[repr(C)]
pub(crate) struct GObject {
    pub g_class: *mut GTypeClass,
    pub ref_count: c_uint,
    pub qdata: *mut c_void,
}

/// Leading fields of `GParamSpec`
#[repr(C)]
pub(crate) struct GParamSpec {
    pub g_class: *mut GTypeClass,
    pub name: *const c_char,
    pub flags: c_uint,
    pub value_type: GType,
    pub owner_type: GType,
}

/// `VipsArgumentClass`
#[repr(C)]
pub(crate) struct VipsArgumentClass {
    pub pspec: *mut GParamSpec,
    pub object_class: *mut c_void,
    pub flags: c_uint,
    pub priority: c_int,
    pub offset: c_uint,
}

/// `VipsProgress`
#[repr(C)]
pub(crate) struct VipsProgress {
    pub im: *mut c_void,
    pub run: c_int,
    pub eta: c_int,
    pub tpels: i64,
    pub npels: i64,
    pub percent: c_int,
    pub start: *mut c_void,
}

pub(crate) type GCallback = unsafe extern "C" fn();
pub(crate) type GClosureNotify = unsafe extern "C" fn(data: *mut c_void, closure: *mut c_void);
pub(crate) type GLogFunc =
    unsafe extern "C" fn(domain: *const c_char, level: c_uint, message: *const c_char, data: *mut c_void);
pub(crate) type VipsArgumentMapFn = unsafe extern "C" fn(
    object: *mut c_void,
    pspec: *mut GParamSpec,
    argument_class: *mut VipsArgumentClass,
    argument_instance: *mut c_void,
    a: *mut c_void,
    b: *mut c_void,
) -> *mut c_void;

/// Borrowed C string to an owned `String`, `None` for null
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
pub(crate) unsafe fn to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_layouts_match_c() {
        assert_eq!(size_of::<GValue>(), 24);
        assert_eq!(offset_of!(GParamSpec, value_type), 24);
        assert_eq!(offset_of!(VipsArgumentClass, flags), 16);
        assert_eq!(offset_of!(VipsArgumentClass, offset), 24);
        assert_eq!(offset_of!(VipsProgress, percent), 32);
        assert_eq!(offset_of!(GObject, ref_count), 8);
    }

    #[test]
    fn test_log_mask_covers_levels() {
        for level in [
            G_LOG_LEVEL_ERROR,
            G_LOG_LEVEL_CRITICAL,
            G_LOG_LEVEL_WARNING,
            G_LOG_LEVEL_MESSAGE,
            G_LOG_LEVEL_INFO,
            G_LOG_LEVEL_DEBUG,
        ] {
            assert_ne!(G_LOG_LEVEL_MASK & level, 0);
        }
        assert_eq!(G_LOG_LEVEL_MASK & G_LOG_FLAG_FATAL, 0);
    }
}
