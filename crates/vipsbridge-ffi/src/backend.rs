//! `NativeApi` over a dynamically loaded libvips

use std::ffi::{c_char, c_int, c_uint, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use parking_lot::Mutex;
use vipsbridge_sdk::{
    ArgumentFlags, ArgumentInfo, BandFormat, LogHandler, LogLevel, NativeApi, NativeError,
    NativeResult, ObjectPtr, PostCloseFn, ProgressSignal, TypeId, TypeKind, ValuePtr,
};

use crate::glib::{self, GCallback, GObject, GParamSpec, GValue, VipsArgumentClass, VipsProgress};
use crate::loader::{Library, LoadError};
use crate::symbols::Symbols;

/// Sonames tried by [`LibVips::open_default`]
pub const DEFAULT_CANDIDATES: &[&str] = &[
    "libvips.so.42",
    "libvips.so",
    "libvips.42.dylib",
    "libvips.dylib",
];

const LOG_DOMAIN: &[u8] = b"VIPS\0";

/// Boxed array types registered by libvips
struct BoxedTypes {
    array_double: glib::GType,
    array_int: glib::GType,
    array_image: glib::GType,
    blob: glib::GType,
}

struct LogRoute {
    id: c_uint,
    // referenced by the native side through the handler's user data
    _handler: Box<LogHandler>,
}

/// Data handed to the `eval` signal
struct ProgressRoute {
    signal: Arc<ProgressSignal>,
    set_kill: unsafe extern "C" fn(*mut c_void, glib::Gboolean),
}

/// libvips loaded at runtime.
///
/// Owns the library handle; every pointer handed out stays valid only while
/// this value is alive.
pub struct LibVips {
    sym: Symbols,
    boxed: BoxedTypes,
    image_type: glib::GType,
    log: Mutex<Option<LogRoute>>,
    lib: Library,
}

impl LibVips {
    /// Load libvips from `path`, resolve its entry points and initialize it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        Self::init(Library::open(path)?)
    }

    /// Load libvips from the usual sonames
    pub fn open_default() -> Result<Self, LoadError> {
        Self::init(Library::open_first(DEFAULT_CANDIDATES)?)
    }

    fn init(lib: Library) -> Result<Self, LoadError> {
        let sym = Symbols::load(&lib)?;
        let argv0 = CString::new("vipsbridge").map_err(|e| LoadError::InitFailed(e.to_string()))?;

        // SAFETY: symbols resolved against their C prototypes
        unsafe {
            if (sym.vips_init)(argv0.as_ptr()) != 0 {
                let message = glib::to_string((sym.vips_error_buffer)()).unwrap_or_default();
                (sym.vips_error_clear)();
                return Err(LoadError::InitFailed(message.trim_end().to_string()));
            }

            let boxed = BoxedTypes {
                array_double: (sym.vips_array_double_get_type)(),
                array_int: (sym.vips_array_int_get_type)(),
                array_image: (sym.vips_array_image_get_type)(),
                blob: (sym.vips_blob_get_type)(),
            };
            let image_type = (sym.vips_image_get_type)();

            let this = Self {
                sym,
                boxed,
                image_type,
                log: Mutex::new(None),
                lib,
            };
            let (major, minor, micro) = this.version();
            tracing::debug!(path = this.lib.path(), major, minor, micro, "libvips initialized");
            Ok(this)
        }
    }

    /// Path the library was loaded from
    pub fn path(&self) -> &str {
        self.lib.path()
    }

    fn obj(ptr: ObjectPtr) -> *mut c_void {
        ptr.as_raw()
    }

    fn val(ptr: ValuePtr) -> *mut GValue {
        ptr.as_raw()
    }

    fn cstring(s: &str) -> NativeResult<CString> {
        CString::new(s).map_err(|_| NativeError::Backend(format!("interior NUL in \"{}\"", s)))
    }

    /// Class of an instance (`G_OBJECT_GET_CLASS`)
    unsafe fn class_of(obj: ObjectPtr) -> *mut glib::GTypeClass {
        (*obj.as_raw::<GObject>()).g_class
    }

    unsafe fn find_property(&self, obj: ObjectPtr, name: &str) -> NativeResult<*mut GParamSpec> {
        let c_name = Self::cstring(name)?;
        let pspec = (self.sym.g_object_class_find_property)(Self::class_of(obj).cast(), c_name.as_ptr());
        if pspec.is_null() {
            return Err(NativeError::UnknownProperty {
                type_name: self.type_name(self.object_type(obj)),
                name: name.to_string(),
            });
        }
        Ok(pspec)
    }

    unsafe fn check_slot(&self, value: ValuePtr, expected: glib::GType) -> NativeResult<()> {
        let got = (*Self::val(value)).g_type;
        if (self.sym.g_type_is_a)(got, expected) == 0 {
            return Err(NativeError::TypeMismatch {
                expected: self.type_name(TypeId(expected)),
                got: self.type_name(TypeId(got)),
            });
        }
        Ok(())
    }

    fn string_list(&self, list: *mut *mut c_char) -> Vec<String> {
        let mut out = Vec::new();
        if list.is_null() {
            return out;
        }
        // SAFETY: a NULL-terminated `gchar **` owned by us
        unsafe {
            let mut cursor = list;
            while !(*cursor).is_null() {
                if let Some(s) = glib::to_string(*cursor) {
                    out.push(s);
                }
                cursor = cursor.add(1);
            }
            (self.sym.g_strfreev)(list);
        }
        out
    }
}

impl Drop for LibVips {
    fn drop(&mut self) {
        self.set_log_handler(None);
    }
}

// ============================================================================
// Callbacks
// ============================================================================

unsafe extern "C" fn on_argument(
    _object: *mut c_void,
    pspec: *mut GParamSpec,
    argument_class: *mut VipsArgumentClass,
    _argument_instance: *mut c_void,
    a: *mut c_void,
    b: *mut c_void,
) -> *mut c_void {
    let visit = &mut *(a as *mut &mut dyn FnMut(ArgumentInfo));
    let sym = &*(b as *const Symbols);
    let class = &*argument_class;
    let spec = &*pspec;

    let info = ArgumentInfo {
        name: glib::to_string(spec.name).unwrap_or_default(),
        type_id: TypeId(spec.value_type),
        flags: ArgumentFlags::from_bits_truncate(class.flags),
        priority: class.priority,
        offset: class.offset,
        blurb: glib::to_string((sym.g_param_spec_get_blurb)(pspec)).unwrap_or_default(),
    };
    let _ = catch_unwind(AssertUnwindSafe(|| visit(info)));
    ptr::null_mut()
}

unsafe extern "C" fn on_postclose(_object: *mut c_void, data: *mut c_void) {
    let slot = &*(data as *const Mutex<Option<PostCloseFn>>);
    let callback = slot.lock().take();
    if let Some(callback) = callback {
        if catch_unwind(AssertUnwindSafe(callback)).is_err() {
            tracing::error!("post-close callback panicked");
        }
    }
}

unsafe extern "C" fn drop_postclose(data: *mut c_void, _closure: *mut c_void) {
    drop(Box::from_raw(data as *mut Mutex<Option<PostCloseFn>>));
}

unsafe extern "C" fn on_eval(image: *mut c_void, progress: *mut VipsProgress, data: *mut c_void) {
    let route = &*(data as *const ProgressRoute);
    let progress = &*progress;
    let go_on = route
        .signal
        .report(progress.percent.max(0) as u32, progress.eta.max(0) as u32);
    if !go_on {
        (route.set_kill)(image, 1);
    }
}

unsafe extern "C" fn drop_progress(data: *mut c_void, _closure: *mut c_void) {
    drop(Box::from_raw(data as *mut ProgressRoute));
}

unsafe extern "C" fn on_log(domain: *const c_char, level: c_uint, message: *const c_char, data: *mut c_void) {
    let handler = &*(data as *const LogHandler);
    let level = match level & glib::G_LOG_LEVEL_MASK {
        l if l & glib::G_LOG_LEVEL_ERROR != 0 => LogLevel::Error,
        l if l & glib::G_LOG_LEVEL_CRITICAL != 0 => LogLevel::Critical,
        l if l & glib::G_LOG_LEVEL_WARNING != 0 => LogLevel::Warning,
        l if l & glib::G_LOG_LEVEL_MESSAGE != 0 => LogLevel::Message,
        l if l & glib::G_LOG_LEVEL_INFO != 0 => LogLevel::Info,
        _ => LogLevel::Debug,
    };
    let domain = glib::to_string(domain).unwrap_or_default();
    let message = glib::to_string(message).unwrap_or_default();
    let _ = catch_unwind(AssertUnwindSafe(|| handler(level, &domain, &message)));
}

/// Cast a typed callback to the untyped `GCallback` signal connect expects
macro_rules! g_callback {
    ($f:expr) => {
        std::mem::transmute::<*const (), GCallback>($f as *const ())
    };
}

// ============================================================================
// NativeApi
// ============================================================================

// SAFETY (whole impl): every call goes through a symbol resolved against its
// C prototype, and every pointer argument comes from this library.
impl NativeApi for LibVips {
    fn type_from_name(&self, name: &str) -> Option<TypeId> {
        let c_name = Self::cstring(name).ok()?;
        let ty = unsafe { (self.sym.g_type_from_name)(c_name.as_ptr()) };
        (ty != 0).then_some(TypeId(ty))
    }

    fn type_name(&self, ty: TypeId) -> String {
        unsafe { glib::to_string((self.sym.g_type_name)(ty.0)) }.unwrap_or_else(|| "(invalid)".to_string())
    }

    fn type_kind(&self, ty: TypeId) -> TypeKind {
        let fundamental = unsafe { (self.sym.g_type_fundamental)(ty.0) };
        match fundamental {
            glib::G_TYPE_BOOLEAN => TypeKind::Bool,
            glib::G_TYPE_INT => TypeKind::Int,
            glib::G_TYPE_UINT64 => TypeKind::UInt64,
            glib::G_TYPE_DOUBLE => TypeKind::Double,
            glib::G_TYPE_STRING => TypeKind::String,
            glib::G_TYPE_ENUM => TypeKind::Enum,
            glib::G_TYPE_FLAGS => TypeKind::Flags,
            glib::G_TYPE_OBJECT => TypeKind::Object,
            glib::G_TYPE_BOXED => {
                let is = |parent| self.type_is_a(ty, TypeId(parent));
                if is(self.boxed.array_double) {
                    TypeKind::ArrayDouble
                } else if is(self.boxed.array_int) {
                    TypeKind::ArrayInt
                } else if is(self.boxed.array_image) {
                    TypeKind::ArrayImage
                } else if is(self.boxed.blob) {
                    TypeKind::Blob
                } else {
                    TypeKind::Unknown
                }
            }
            _ => TypeKind::Unknown,
        }
    }

    fn type_is_a(&self, ty: TypeId, parent: TypeId) -> bool {
        unsafe { (self.sym.g_type_is_a)(ty.0, parent.0) != 0 }
    }

    fn image_type(&self) -> TypeId {
        TypeId(self.image_type)
    }

    fn enum_from_nick(&self, ty: TypeId, nick: &str) -> NativeResult<i32> {
        let c_nick = Self::cstring(nick)?;
        let domain = LOG_DOMAIN.as_ptr().cast();
        let code = unsafe {
            match self.type_kind(ty) {
                TypeKind::Flags => (self.sym.vips_flags_from_nick)(domain, ty.0, c_nick.as_ptr()),
                _ => (self.sym.vips_enum_from_nick)(domain, ty.0, c_nick.as_ptr()),
            }
        };
        if code < 0 {
            unsafe { (self.sym.vips_error_clear)() };
            return Err(NativeError::UnknownNick {
                type_name: self.type_name(ty),
                nick: nick.to_string(),
            });
        }
        Ok(code)
    }

    fn enum_nick(&self, ty: TypeId, value: i32) -> Option<String> {
        let nick = unsafe { glib::to_string((self.sym.vips_enum_nick)(ty.0, value)) }?;
        (nick != "(null)").then_some(nick)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    fn operation_new(&self, name: &str) -> Option<ObjectPtr> {
        let c_name = Self::cstring(name).ok()?;
        ObjectPtr::from_raw(unsafe { (self.sym.vips_operation_new)(c_name.as_ptr()) })
    }

    fn object_ref(&self, obj: ObjectPtr) {
        unsafe { (self.sym.g_object_ref)(Self::obj(obj)) };
    }

    fn object_unref(&self, obj: ObjectPtr) {
        unsafe { (self.sym.g_object_unref)(Self::obj(obj)) };
    }

    fn object_ref_count(&self, obj: ObjectPtr) -> u32 {
        unsafe { ptr::read_volatile(&(*obj.as_raw::<GObject>()).ref_count) }
    }

    fn object_type(&self, obj: ObjectPtr) -> TypeId {
        unsafe { TypeId((*Self::class_of(obj)).g_type) }
    }

    fn object_description(&self, obj: ObjectPtr) -> String {
        unsafe { glib::to_string((self.sym.vips_object_get_description)(Self::obj(obj))) }
            .unwrap_or_default()
    }

    fn argument_map(&self, op: ObjectPtr, visit: &mut dyn FnMut(ArgumentInfo)) {
        let mut visit: &mut dyn FnMut(ArgumentInfo) = visit;
        let a = &mut visit as *mut &mut dyn FnMut(ArgumentInfo) as *mut c_void;
        let b = &self.sym as *const Symbols as *mut c_void;
        unsafe { (self.sym.vips_argument_map)(Self::obj(op), on_argument, a, b) };
    }

    fn set_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()> {
        unsafe {
            let pspec = self.find_property(obj, name)?;
            self.check_slot(value, (*pspec).value_type)?;
            let c_name = Self::cstring(name)?;
            (self.sym.g_object_set_property)(obj.as_raw(), c_name.as_ptr(), Self::val(value));
        }
        Ok(())
    }

    fn get_property(&self, obj: ObjectPtr, name: &str, value: ValuePtr) -> NativeResult<()> {
        unsafe {
            let pspec = self.find_property(obj, name)?;
            self.check_slot(value, (*pspec).value_type)?;
            let c_name = Self::cstring(name)?;
            (self.sym.g_object_get_property)(obj.as_raw(), c_name.as_ptr(), Self::val(value));
        }
        Ok(())
    }

    fn cache_operation_build(&self, op: ObjectPtr) -> Option<ObjectPtr> {
        ObjectPtr::from_raw(unsafe { (self.sym.vips_cache_operation_build)(Self::obj(op)) })
    }

    fn object_unref_outputs(&self, op: ObjectPtr) {
        unsafe { (self.sym.vips_object_unref_outputs)(Self::obj(op)) };
    }

    // ========================================================================
    // Values
    // ========================================================================

    fn value_init(&self, ty: TypeId) -> ValuePtr {
        let slot = Box::into_raw(Box::<GValue>::default());
        unsafe { (self.sym.g_value_init)(slot, ty.0) };
        match ValuePtr::from_raw(slot) {
            Some(ptr) => ptr,
            None => unreachable!("boxed GValue is never null"),
        }
    }

    fn value_type(&self, value: ValuePtr) -> TypeId {
        unsafe { TypeId((*Self::val(value)).g_type) }
    }

    fn value_unset(&self, value: ValuePtr) {
        unsafe {
            (self.sym.g_value_unset)(Self::val(value));
            drop(Box::from_raw(Self::val(value)));
        }
    }

    fn value_set_bool(&self, value: ValuePtr, v: bool) {
        unsafe { (self.sym.g_value_set_boolean)(Self::val(value), v as glib::Gboolean) }
    }

    fn value_get_bool(&self, value: ValuePtr) -> bool {
        unsafe { (self.sym.g_value_get_boolean)(Self::val(value)) != 0 }
    }

    fn value_set_int(&self, value: ValuePtr, v: i32) {
        unsafe { (self.sym.g_value_set_int)(Self::val(value), v) }
    }

    fn value_get_int(&self, value: ValuePtr) -> i32 {
        unsafe { (self.sym.g_value_get_int)(Self::val(value)) }
    }

    fn value_set_uint64(&self, value: ValuePtr, v: u64) {
        unsafe { (self.sym.g_value_set_uint64)(Self::val(value), v) }
    }

    fn value_get_uint64(&self, value: ValuePtr) -> u64 {
        unsafe { (self.sym.g_value_get_uint64)(Self::val(value)) }
    }

    fn value_set_double(&self, value: ValuePtr, v: f64) {
        unsafe { (self.sym.g_value_set_double)(Self::val(value), v) }
    }

    fn value_get_double(&self, value: ValuePtr) -> f64 {
        unsafe { (self.sym.g_value_get_double)(Self::val(value)) }
    }

    fn value_set_string(&self, value: ValuePtr, v: &str) {
        // strings with interior NULs are cut at the first NUL, as C sees them
        let bytes = v.split('\0').next().unwrap_or_default();
        if let Ok(c_value) = CString::new(bytes) {
            unsafe { (self.sym.g_value_set_string)(Self::val(value), c_value.as_ptr()) }
        }
    }

    fn value_get_string(&self, value: ValuePtr) -> Option<String> {
        unsafe { glib::to_string((self.sym.g_value_get_string)(Self::val(value))) }
    }

    fn value_set_enum(&self, value: ValuePtr, v: i32) {
        unsafe { (self.sym.g_value_set_enum)(Self::val(value), v) }
    }

    fn value_get_enum(&self, value: ValuePtr) -> i32 {
        unsafe { (self.sym.g_value_get_enum)(Self::val(value)) }
    }

    fn value_set_flags(&self, value: ValuePtr, v: u32) {
        unsafe { (self.sym.g_value_set_flags)(Self::val(value), v) }
    }

    fn value_get_flags(&self, value: ValuePtr) -> u32 {
        unsafe { (self.sym.g_value_get_flags)(Self::val(value)) }
    }

    fn value_set_array_double(&self, value: ValuePtr, v: &[f64]) {
        unsafe { (self.sym.vips_value_set_array_double)(Self::val(value), v.as_ptr(), v.len() as c_int) }
    }

    fn value_get_array_double(&self, value: ValuePtr) -> Vec<f64> {
        let mut n: c_int = 0;
        unsafe {
            let data = (self.sym.vips_value_get_array_double)(Self::val(value), &mut n);
            if data.is_null() || n <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(data, n as usize).to_vec()
        }
    }

    fn value_set_array_int(&self, value: ValuePtr, v: &[i32]) {
        unsafe { (self.sym.vips_value_set_array_int)(Self::val(value), v.as_ptr(), v.len() as c_int) }
    }

    fn value_get_array_int(&self, value: ValuePtr) -> Vec<i32> {
        let mut n: c_int = 0;
        unsafe {
            let data = (self.sym.vips_value_get_array_int)(Self::val(value), &mut n);
            if data.is_null() || n <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(data, n as usize).to_vec()
        }
    }

    fn value_set_blob(&self, value: ValuePtr, v: Vec<u8>) {
        unsafe {
            // the blob is released with g_free, so it must come from g_malloc
            let data = (self.sym.g_malloc)(v.len().max(1));
            ptr::copy_nonoverlapping(v.as_ptr(), data.cast::<u8>(), v.len());
            (self.sym.vips_value_set_blob_free)(Self::val(value), data, v.len());
        }
    }

    fn value_get_blob(&self, value: ValuePtr) -> Vec<u8> {
        let mut len = 0usize;
        unsafe {
            let data = (self.sym.vips_value_get_blob)(Self::val(value), &mut len);
            if data.is_null() {
                return Vec::new();
            }
            std::slice::from_raw_parts(data.cast::<u8>(), len).to_vec()
        }
    }

    fn value_set_object(&self, value: ValuePtr, v: Option<ObjectPtr>) {
        let obj = v.map_or(ptr::null_mut(), Self::obj);
        unsafe { (self.sym.g_value_set_object)(Self::val(value), obj) }
    }

    fn value_get_object(&self, value: ValuePtr) -> Option<ObjectPtr> {
        ObjectPtr::from_raw(unsafe { (self.sym.g_value_get_object)(Self::val(value)) })
    }

    fn value_set_array_image(&self, value: ValuePtr, v: &[ObjectPtr]) {
        unsafe {
            (self.sym.vips_value_set_array_image)(Self::val(value), v.len() as c_int);
            let mut n: c_int = 0;
            let slots = (self.sym.vips_value_get_array_image)(Self::val(value), &mut n);
            if slots.is_null() {
                return;
            }
            for (i, image) in v.iter().take(n.max(0) as usize).enumerate() {
                *slots.add(i) = (self.sym.g_object_ref)(Self::obj(*image));
            }
        }
    }

    fn value_get_array_image(&self, value: ValuePtr) -> Vec<ObjectPtr> {
        let mut n: c_int = 0;
        unsafe {
            let slots = (self.sym.vips_value_get_array_image)(Self::val(value), &mut n);
            if slots.is_null() || n <= 0 {
                return Vec::new();
            }
            std::slice::from_raw_parts(slots, n as usize)
                .iter()
                .filter_map(|p| ObjectPtr::from_raw(*p))
                .collect()
        }
    }

    // ========================================================================
    // Error Buffer
    // ========================================================================

    fn error_buffer(&self) -> String {
        unsafe { glib::to_string((self.sym.vips_error_buffer)()) }.unwrap_or_default()
    }

    fn error_clear(&self) {
        unsafe { (self.sym.vips_error_clear)() }
    }

    // ========================================================================
    // Images
    // ========================================================================

    fn image_new_from_memory(
        &self,
        data: &[u8],
        width: i32,
        height: i32,
        bands: i32,
        format: BandFormat,
    ) -> Option<ObjectPtr> {
        ObjectPtr::from_raw(unsafe {
            (self.sym.vips_image_new_from_memory_copy)(
                data.as_ptr().cast(),
                data.len(),
                width,
                height,
                bands,
                format as c_int,
            )
        })
    }

    fn image_write_to_memory(&self, image: ObjectPtr) -> Option<Vec<u8>> {
        let mut size = 0usize;
        unsafe {
            let data = (self.sym.vips_image_write_to_memory)(Self::obj(image), &mut size);
            if data.is_null() {
                return None;
            }
            let out = std::slice::from_raw_parts(data.cast::<u8>(), size).to_vec();
            (self.sym.g_free)(data);
            Some(out)
        }
    }

    fn image_copy_memory(&self, image: ObjectPtr) -> Option<ObjectPtr> {
        ObjectPtr::from_raw(unsafe { (self.sym.vips_image_copy_memory)(Self::obj(image)) })
    }

    fn image_invalidate_all(&self, image: ObjectPtr) {
        unsafe { (self.sym.vips_image_invalidate_all)(Self::obj(image)) }
    }

    fn image_get_typeof(&self, image: ObjectPtr, name: &str) -> Option<TypeId> {
        let c_name = Self::cstring(name).ok()?;
        let ty = unsafe { (self.sym.vips_image_get_typeof)(Self::obj(image), c_name.as_ptr()) };
        (ty != 0).then_some(TypeId(ty))
    }

    fn image_get(&self, image: ObjectPtr, name: &str) -> Option<ValuePtr> {
        let c_name = Self::cstring(name).ok()?;
        let slot = Box::into_raw(Box::<GValue>::default());
        unsafe {
            if (self.sym.vips_image_get)(Self::obj(image), c_name.as_ptr(), slot) != 0 {
                drop(Box::from_raw(slot));
                (self.sym.vips_error_clear)();
                return None;
            }
        }
        ValuePtr::from_raw(slot)
    }

    fn image_set(&self, image: ObjectPtr, name: &str, value: ValuePtr) {
        if let Ok(c_name) = Self::cstring(name) {
            unsafe { (self.sym.vips_image_set)(Self::obj(image), c_name.as_ptr(), Self::val(value)) }
        }
    }

    fn image_remove(&self, image: ObjectPtr, name: &str) -> bool {
        match Self::cstring(name) {
            Ok(c_name) => unsafe { (self.sym.vips_image_remove)(Self::obj(image), c_name.as_ptr()) != 0 },
            Err(_) => false,
        }
    }

    fn image_get_fields(&self, image: ObjectPtr) -> Vec<String> {
        let list = unsafe { (self.sym.vips_image_get_fields)(Self::obj(image)) };
        self.string_list(list)
    }

    fn foreign_find_load(&self, filename: &str) -> Option<String> {
        let c_name = Self::cstring(filename).ok()?;
        unsafe { glib::to_string((self.sym.vips_foreign_find_load)(c_name.as_ptr())) }
    }

    fn foreign_find_save(&self, filename: &str) -> Option<String> {
        let c_name = Self::cstring(filename).ok()?;
        unsafe { glib::to_string((self.sym.vips_foreign_find_save)(c_name.as_ptr())) }
    }

    // ========================================================================
    // Signals
    // ========================================================================

    fn connect_postclose(&self, obj: ObjectPtr, callback: PostCloseFn) -> NativeResult<()> {
        let data = Box::into_raw(Box::new(Mutex::new(Some(callback))));
        let id = unsafe {
            (self.sym.g_signal_connect_data)(
                Self::obj(obj),
                b"postclose\0".as_ptr().cast(),
                g_callback!(on_postclose as unsafe extern "C" fn(*mut c_void, *mut c_void)),
                data.cast(),
                drop_postclose,
                0,
            )
        };
        if id == 0 {
            unsafe { drop(Box::from_raw(data)) };
            return Err(NativeError::Backend(format!(
                "{}: no postclose signal",
                self.type_name(self.object_type(obj))
            )));
        }
        Ok(())
    }

    fn attach_progress(&self, image: ObjectPtr, signal: Arc<ProgressSignal>) {
        let route = Box::into_raw(Box::new(ProgressRoute {
            signal,
            set_kill: self.sym.vips_image_set_kill,
        }));
        unsafe {
            (self.sym.vips_image_set_progress)(Self::obj(image), 1);
            let id = (self.sym.g_signal_connect_data)(
                Self::obj(image),
                b"eval\0".as_ptr().cast(),
                g_callback!(on_eval as unsafe extern "C" fn(*mut c_void, *mut VipsProgress, *mut c_void)),
                route.cast(),
                drop_progress,
                0,
            );
            if id == 0 {
                drop(Box::from_raw(route));
                tracing::warn!("unable to connect eval signal");
            }
        }
    }

    fn set_log_handler(&self, handler: Option<LogHandler>) {
        let mut route = self.log.lock();
        if let Some(old) = route.take() {
            unsafe { (self.sym.g_log_remove_handler)(LOG_DOMAIN.as_ptr().cast(), old.id) };
        }
        if let Some(handler) = handler {
            let mut handler = Box::new(handler);
            let data = &mut *handler as *mut LogHandler as *mut c_void;
            let id = unsafe {
                (self.sym.g_log_set_handler)(
                    LOG_DOMAIN.as_ptr().cast(),
                    glib::G_LOG_LEVEL_MASK | glib::G_LOG_FLAG_FATAL | glib::G_LOG_FLAG_RECURSION,
                    on_log,
                    data,
                )
            };
            *route = Some(LogRoute {
                id,
                _handler: handler,
            });
        }
    }

    // ========================================================================
    // Global State
    // ========================================================================

    fn cache_set_max(&self, max: i32) {
        unsafe { (self.sym.vips_cache_set_max)(max) }
    }

    fn cache_set_max_mem(&self, max_mem: u64) {
        unsafe { (self.sym.vips_cache_set_max_mem)(max_mem as usize) }
    }

    fn cache_set_max_files(&self, max_files: i32) {
        unsafe { (self.sym.vips_cache_set_max_files)(max_files) }
    }

    fn cache_set_trace(&self, trace: bool) {
        unsafe { (self.sym.vips_cache_set_trace)(trace as glib::Gboolean) }
    }

    fn concurrency_set(&self, concurrency: i32) {
        unsafe { (self.sym.vips_concurrency_set)(concurrency) }
    }

    fn version(&self) -> (i32, i32, i32) {
        unsafe {
            (
                (self.sym.vips_version)(0),
                (self.sym.vips_version)(1),
                (self.sym.vips_version)(2),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library() {
        match LibVips::open("/nonexistent/libvips.so.42") {
            Err(LoadError::NotFound { .. }) => {}
            Err(other) => panic!("expected NotFound, got {}", other),
            Ok(_) => panic!("expected NotFound"),
        }
    }

    #[test]
    #[ignore = "needs libvips installed"]
    fn test_real_library_round_trip() {
        let vips = LibVips::open_default().unwrap();
        assert!(vips.version().0 >= 8);

        let img = vips
            .image_new_from_memory(&[1, 2, 3, 4], 2, 2, 1, BandFormat::UChar)
            .unwrap();
        assert_eq!(vips.image_write_to_memory(img).unwrap(), vec![1, 2, 3, 4]);

        let op = vips.operation_new("avg").unwrap();
        let mut names = Vec::new();
        vips.argument_map(op, &mut |arg| names.push(arg.name));
        assert!(names.contains(&"in".to_string()));
        assert!(names.contains(&"out".to_string()));
        vips.object_unref(op);
        vips.object_unref(img);
    }
}
