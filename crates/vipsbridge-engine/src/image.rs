//! Image handle
//!
//! [`Image`] is a shared handle on a native image. Clones share one native
//! reference; [`Image::release`] gives it up for every clone at once, after
//! which every method fails with `DisposedHandle`.
//!
//! Post-close hooks run when the *native* object is finalized, which may be
//! later than the release of this handle when something else (another
//! handle, a cached operation) still holds a reference.
//!
//! Lifecycle: `Created -> (Mutating)* -> Active -> Released`.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use vipsbridge_sdk::{BandFormat, ObjectPtr, ProgressSignal, TypeId};

use crate::error::{Result, VipsError};
use crate::handle::ObjectHandle;
use crate::mutable::MutableImage;
use crate::operation::{CallResult, Operation, VOption};
use crate::runtime::Vips;
use crate::value::{Value, ValueBox};

/// Identifies a registered post-close hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type Hook = Box<dyn FnOnce() + Send>;

/// Hooks of one image, shared with the native post-close callback.
#[derive(Default)]
struct HookList {
    next: AtomicU64,
    hooks: Mutex<Vec<(HookId, Hook)>>,
    connected: AtomicBool,
    fired: AtomicBool,
}

impl HookList {
    fn add(&self, hook: Hook) -> HookId {
        let id = HookId(self.next.fetch_add(1, Ordering::Relaxed));
        self.hooks.lock().push((id, hook));
        id
    }

    fn remove(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.lock();
        let before = hooks.len();
        hooks.retain(|(h, _)| *h != id);
        hooks.len() != before
    }

    /// Run every hook once, in registration order
    fn run(&self) {
        if self.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for (_, hook) in hooks {
            hook();
        }
    }
}

struct ImageInner {
    vips: Vips,
    handle: ObjectHandle,
    hooks: Arc<HookList>,
    mutating: AtomicBool,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        if self.handle.release() {
            self.vips.image_released();
        }
    }
}

/// Handle on a native image.
#[derive(Clone)]
pub struct Image {
    inner: Arc<ImageInner>,
}

/// Clears the mutation flag when a mutate scope ends, however it ends.
struct MutationGuard<'a>(&'a AtomicBool);

impl Drop for MutationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Image {
    fn wrap(vips: &Vips, handle: ObjectHandle) -> Self {
        vips.image_created();
        Self {
            inner: Arc::new(ImageInner {
                vips: vips.clone(),
                handle,
                hooks: Arc::new(HookList::default()),
                mutating: AtomicBool::new(false),
            }),
        }
    }

    /// Wrap a reference the caller owns
    pub(crate) fn from_owned(vips: &Vips, ptr: ObjectPtr) -> Self {
        Self::wrap(vips, ObjectHandle::new_owned(vips.api().clone(), ptr))
    }

    /// Share an image held elsewhere, taking a new reference
    pub fn adopt(vips: &Vips, ptr: ObjectPtr) -> Self {
        Self::wrap(vips, ObjectHandle::adopt(vips.api().clone(), ptr))
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Image from packed pixel memory (copied)
    pub fn new_from_memory(
        vips: &Vips,
        data: &[u8],
        width: i32,
        height: i32,
        bands: i32,
        format: BandFormat,
    ) -> Result<Self> {
        match vips
            .api()
            .image_new_from_memory(data, width, height, bands, format)
        {
            Some(ptr) => Ok(Self::from_owned(vips, ptr)),
            None => Err(VipsError::NativeOperation(
                vips.take_error("vips_image_new_from_memory"),
            )),
        }
    }

    /// Load a file through the loader the native library picks for it
    pub fn new_from_file(vips: &Vips, path: impl AsRef<Path>, options: &VOption) -> Result<Self> {
        let filename = path.as_ref().to_string_lossy().into_owned();
        let Some(loader) = vips.api().foreign_find_load(&filename) else {
            return Err(VipsError::NativeOperation(vips.take_error("VipsForeignLoad")));
        };
        tracing::debug!(%filename, %loader, "load");
        Operation::call(vips, &loader, &[Value::String(filename)], options)?.into_image()
    }

    /// All-zero image
    pub fn black(vips: &Vips, width: i32, height: i32) -> Result<Self> {
        Operation::call(
            vips,
            "black",
            &[Value::from(width), Value::from(height)],
            &VOption::new(),
        )?
        .into_image()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Native pointer, or `DisposedHandle` once released
    pub fn ptr(&self) -> Result<ObjectPtr> {
        self.inner.handle.get()
    }

    /// Runtime this image belongs to
    pub fn vips(&self) -> &Vips {
        &self.inner.vips
    }

    pub fn is_released(&self) -> bool {
        self.inner.handle.is_released()
    }

    /// Give up this handle's native reference; idempotent
    pub fn release(&self) {
        if self.inner.handle.release() {
            self.inner.vips.image_released();
        }
    }

    /// Native reference count (diagnostics only)
    pub fn ref_count(&self) -> u32 {
        self.inner.handle.ref_count()
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Packed pixels in the image's band format
    pub fn write_to_memory(&self) -> Result<Vec<u8>> {
        let ptr = self.ptr()?;
        self.vips()
            .api()
            .image_write_to_memory(ptr)
            .ok_or_else(|| VipsError::NativeOperation(self.vips().take_error("vips_image_write_to_memory")))
    }

    /// Save through the saver the native library picks for `path`
    pub fn write_to_file(&self, path: impl AsRef<Path>, options: &VOption) -> Result<()> {
        self.ptr()?;
        let filename = path.as_ref().to_string_lossy().into_owned();
        let Some(saver) = self.vips().api().foreign_find_save(&filename) else {
            return Err(VipsError::NativeOperation(self.vips().take_error("VipsForeignSave")));
        };
        tracing::debug!(%filename, %saver, "save");
        Operation::call(
            self.vips(),
            &saver,
            &[Value::from(self), Value::String(filename)],
            options,
        )?;
        Ok(())
    }

    // ========================================================================
    // Header
    // ========================================================================

    /// Read a header field
    pub fn get(&self, name: &str) -> Result<Value> {
        let ptr = self.ptr()?;
        let Some(raw) = self.vips().api().image_get(ptr, name) else {
            return Err(VipsError::NativeOperation(format!(
                "vips_image_get: field \"{}\" not found",
                name
            )));
        };
        ValueBox::from_raw(self.vips(), raw).get()
    }

    /// Type of a header field, `None` if absent
    pub fn get_typeof(&self, name: &str) -> Result<Option<TypeId>> {
        let ptr = self.ptr()?;
        Ok(self.vips().api().image_get_typeof(ptr, name))
    }

    /// Names of all header fields
    pub fn get_fields(&self) -> Result<Vec<String>> {
        let ptr = self.ptr()?;
        Ok(self.vips().api().image_get_fields(ptr))
    }

    fn int_field(&self, name: &str) -> Result<i32> {
        let value = self.get(name)?;
        value
            .as_int()
            .map(|v| v as i32)
            .ok_or_else(|| VipsError::argument_type(name, "int", value.type_name()))
    }

    pub fn width(&self) -> Result<i32> {
        self.int_field("width")
    }

    pub fn height(&self) -> Result<i32> {
        self.int_field("height")
    }

    pub fn bands(&self) -> Result<i32> {
        self.int_field("bands")
    }

    pub fn format(&self) -> Result<BandFormat> {
        let code = self.int_field("format")?;
        BandFormat::from_code(code)
            .ok_or_else(|| VipsError::argument_type("format", "VipsBandFormat", code.to_string()))
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Call an operation with this image as the first positional argument
    pub fn call(&self, name: &str, args: &[Value], options: &VOption) -> Result<CallResult> {
        self.ptr()?;
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Value::from(self));
        all.extend_from_slice(args);
        Operation::call(self.vips(), name, &all, options)
    }

    /// Pixel value at `(x, y)`, one element per band
    pub fn getpoint(&self, x: i32, y: i32) -> Result<Vec<f64>> {
        let value = self
            .call("getpoint", &[Value::from(x), Value::from(y)], &VOption::new())?
            .into_value()?;
        match value {
            Value::DoubleArray(v) => Ok(v),
            other => Err(VipsError::argument_type("out_array", "double array", other.type_name())),
        }
    }

    /// `n` bands starting at `band`
    pub fn extract_band(&self, band: i32, n: i32) -> Result<Image> {
        self.call(
            "extract_band",
            &[Value::from(band)],
            &VOption::new().set("n", n),
        )?
        .into_image()
    }

    /// Mean of all samples
    pub fn avg(&self) -> Result<f64> {
        self.call("avg", &[], &VOption::new())?.into_double()
    }

    /// Sum of two images
    pub fn add(&self, other: &Image) -> Result<Image> {
        self.call("add", &[Value::from(other)], &VOption::new())?
            .into_image()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Run `f` on a private copy of this image and return the copy.
    ///
    /// This image is never modified. Scopes do not nest: opening a second
    /// scope on the same image while one is open fails with
    /// `MutationInProgress`.
    pub fn mutate<F>(&self, f: F) -> Result<Image>
    where
        F: FnOnce(&mut MutableImage) -> Result<()>,
    {
        let ptr = self.ptr()?;
        if self.inner.mutating.swap(true, Ordering::AcqRel) {
            return Err(VipsError::MutationInProgress);
        }
        let _guard = MutationGuard(&self.inner.mutating);

        let Some(copy) = self.vips().api().image_copy_memory(ptr) else {
            return Err(VipsError::NativeOperation(self.vips().take_error("vips_image_copy_memory")));
        };
        let mut scope = MutableImage::new(Image::from_owned(self.vips(), copy));
        f(&mut scope)?;
        Ok(scope.into_image())
    }

    /// Whether a mutate scope is open on this image
    pub fn is_mutating(&self) -> bool {
        self.inner.mutating.load(Ordering::Acquire)
    }

    // ========================================================================
    // Signals
    // ========================================================================

    /// Register a hook to run once when the native image is finalized
    pub fn on_post_close(&self, hook: impl FnOnce() + Send + 'static) -> Result<HookId> {
        let ptr = self.ptr()?;
        let hooks = &self.inner.hooks;
        let id = hooks.add(Box::new(hook));
        if !hooks.connected.swap(true, Ordering::AcqRel) {
            let list = hooks.clone();
            if let Err(e) = self
                .vips()
                .api()
                .connect_postclose(ptr, Box::new(move || list.run()))
            {
                hooks.connected.store(false, Ordering::Release);
                hooks.remove(id);
                return Err(e.into());
            }
        }
        Ok(id)
    }

    /// Unregister a hook; returns whether it was still pending
    pub fn remove_post_close(&self, id: HookId) -> Result<bool> {
        self.ptr()?;
        Ok(self.inner.hooks.remove(id))
    }

    /// Drop cached pixels so later reads recompute
    pub fn invalidate(&self) -> Result<()> {
        let ptr = self.ptr()?;
        self.vips().api().image_invalidate_all(ptr);
        Ok(())
    }

    /// Report evaluation progress to `signal`; killing the signal stops
    /// evaluation at the next tile boundary
    pub fn set_progress(&self, signal: Arc<ProgressSignal>) -> Result<()> {
        let ptr = self.ptr()?;
        self.vips().api().attach_progress(ptr, signal);
        Ok(())
    }
}

impl PartialEq for Image {
    fn eq(&self, other: &Self) -> bool {
        self.inner.handle == other.inner.handle
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.handle.ptr() {
            Some(ptr) => write!(f, "Image({:?})", ptr),
            None => write!(f, "Image(released)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use vipsbridge_sim::SimLibrary;

    fn setup() -> (Arc<SimLibrary>, Vips) {
        let sim = Arc::new(SimLibrary::new());
        let vips = Vips::new(sim.clone());
        (sim, vips)
    }

    fn gradient(vips: &Vips) -> Image {
        let data: Vec<u8> = (0..12).collect();
        Image::new_from_memory(vips, &data, 2, 2, 3, BandFormat::UChar).unwrap()
    }

    #[test]
    fn test_header() {
        let (_sim, vips) = setup();
        let img = gradient(&vips);
        assert_eq!(img.width().unwrap(), 2);
        assert_eq!(img.height().unwrap(), 2);
        assert_eq!(img.bands().unwrap(), 3);
        assert_eq!(img.format().unwrap(), BandFormat::UChar);
        assert!(img.get_fields().unwrap().contains(&"bands".to_string()));
        assert!(img.get_typeof("nope").unwrap().is_none());
        assert!(matches!(img.get("nope"), Err(VipsError::NativeOperation(_))));
    }

    #[test]
    fn test_pixel_access() {
        let (_sim, vips) = setup();
        let img = gradient(&vips);
        assert_eq!(img.getpoint(1, 0).unwrap(), vec![3.0, 4.0, 5.0]);

        let band = img.extract_band(1, 1).unwrap();
        assert_eq!(band.bands().unwrap(), 1);
        assert_eq!(band.write_to_memory().unwrap(), vec![1, 4, 7, 10]);
        assert_eq!(img.avg().unwrap(), 5.5);
    }

    #[test]
    fn test_bad_memory_size() {
        let (_sim, vips) = setup();
        let err = Image::new_from_memory(&vips, &[0u8; 3], 2, 2, 1, BandFormat::UChar).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_release_then_use() {
        let (sim, vips) = setup();
        let img = gradient(&vips);
        let alias = img.clone();
        img.release();
        img.release();
        assert!(alias.is_released());
        assert!(matches!(alias.avg(), Err(VipsError::DisposedHandle)));
        assert!(matches!(alias.width(), Err(VipsError::DisposedHandle)));
        assert!(matches!(alias.on_post_close(|| {}), Err(VipsError::DisposedHandle)));
        assert!(matches!(alias.remove_post_close(HookId(0)), Err(VipsError::DisposedHandle)));
        assert!(matches!(alias.mutate(|_| Ok(())), Err(VipsError::DisposedHandle)));
        assert_eq!(vips.live_images(), 0);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_hooks_fire_once_in_order() {
        let (_sim, vips) = setup();
        let img = gradient(&vips);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = log.clone();
            img.on_post_close(move || log.lock().push(i)).unwrap();
        }
        img.release();
        img.release();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_removed_hook_does_not_fire() {
        let (_sim, vips) = setup();
        let img = gradient(&vips);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = img.on_post_close(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        assert!(img.remove_post_close(id).unwrap());
        assert!(!img.remove_post_close(id).unwrap());
        drop(img);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hooks_wait_for_native_finalization() {
        let (_sim, vips) = setup();
        let img = gradient(&vips);
        let other = Image::adopt(&vips, img.ptr().unwrap());
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        img.on_post_close(move || f.store(true, Ordering::SeqCst)).unwrap();

        img.release();
        assert!(!fired.load(Ordering::SeqCst));
        other.release();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_invalidate_and_progress() {
        let (sim, vips) = setup();
        let img = gradient(&vips);
        img.invalidate().unwrap();
        assert_eq!(sim.invalidations(img.ptr().unwrap()), 1);

        let signal = Arc::new(ProgressSignal::new());
        img.set_progress(signal.clone()).unwrap();
        img.avg().unwrap();
        assert_eq!(signal.percent(), 100);
        assert_eq!(signal.reports(), 2);
    }

    #[test]
    fn test_black() {
        let (_sim, vips) = setup();
        let img = Image::black(&vips, 3, 4).unwrap();
        assert_eq!((img.width().unwrap(), img.height().unwrap()), (3, 4));
        assert_eq!(img.avg().unwrap(), 0.0);
    }
}
