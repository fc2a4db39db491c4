//! Native object handle
//!
//! An [`ObjectHandle`] owns exactly one share of a native object's reference
//! count. The pointer is kept in an atomic so that `release` and `Drop` can
//! race without decrementing twice: whoever swaps the non-zero pointer out
//! is the one that calls `object_unref`.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use vipsbridge_sdk::{NativeApi, ObjectPtr};

use crate::error::{Result, VipsError};

/// One share of a native reference count.
pub struct ObjectHandle {
    ptr: AtomicUsize,
    api: Arc<dyn NativeApi>,
}

impl ObjectHandle {
    /// Wrap a pointer whose reference the caller already owns (a freshly
    /// created object, or a reference handed out by the native side)
    pub fn new_owned(api: Arc<dyn NativeApi>, ptr: ObjectPtr) -> Self {
        Self {
            ptr: AtomicUsize::new(ptr.addr()),
            api,
        }
    }

    /// Share an existing object, taking a new reference
    pub fn adopt(api: Arc<dyn NativeApi>, ptr: ObjectPtr) -> Self {
        api.object_ref(ptr);
        Self::new_owned(api, ptr)
    }

    /// The pointer, or `None` once released
    pub fn ptr(&self) -> Option<ObjectPtr> {
        ObjectPtr::new(self.ptr.load(Ordering::Acquire))
    }

    /// The pointer, or `DisposedHandle` once released
    pub fn get(&self) -> Result<ObjectPtr> {
        self.ptr().ok_or(VipsError::DisposedHandle)
    }

    /// Whether this handle has given up its reference
    pub fn is_released(&self) -> bool {
        self.ptr.load(Ordering::Acquire) == 0
    }

    /// API the handle belongs to
    pub fn api(&self) -> &Arc<dyn NativeApi> {
        &self.api
    }

    /// Native reference count (diagnostics only); 0 once released
    pub fn ref_count(&self) -> u32 {
        self.ptr().map(|p| self.api.object_ref_count(p)).unwrap_or(0)
    }

    /// Give up the reference. Returns `true` only for the call that
    /// actually decremented.
    pub fn release(&self) -> bool {
        match ObjectPtr::new(self.ptr.swap(0, Ordering::AcqRel)) {
            Some(ptr) => {
                self.api.object_unref(ptr);
                true
            }
            None => false,
        }
    }
}

impl Clone for ObjectHandle {
    fn clone(&self) -> Self {
        match self.ptr() {
            Some(ptr) => Self::adopt(self.api.clone(), ptr),
            None => Self {
                ptr: AtomicUsize::new(0),
                api: self.api.clone(),
            },
        }
    }
}

impl Drop for ObjectHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr.load(Ordering::Acquire) == other.ptr.load(Ordering::Acquire)
    }
}

impl Eq for ObjectHandle {}

impl Hash for ObjectHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr.load(Ordering::Acquire).hash(state);
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ptr() {
            Some(ptr) => write!(f, "ObjectHandle({:?})", ptr),
            None => write!(f, "ObjectHandle(released)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vipsbridge_sdk::BandFormat;
    use vipsbridge_sim::SimLibrary;

    fn setup() -> (Arc<SimLibrary>, Arc<dyn NativeApi>, ObjectPtr) {
        let sim = Arc::new(SimLibrary::new());
        let api: Arc<dyn NativeApi> = sim.clone();
        let ptr = api
            .image_new_from_memory(&[0u8; 4], 2, 2, 1, BandFormat::UChar)
            .unwrap();
        (sim, api, ptr)
    }

    #[test]
    fn test_release_is_idempotent() {
        let (sim, api, ptr) = setup();
        let handle = ObjectHandle::new_owned(api, ptr);
        assert_eq!(handle.ref_count(), 1);
        assert!(handle.release());
        assert!(!handle.release());
        assert!(handle.is_released());
        assert!(matches!(handle.get(), Err(VipsError::DisposedHandle)));
        drop(handle);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_aliases_survive_each_other() {
        let (sim, api, ptr) = setup();
        let a = ObjectHandle::new_owned(api.clone(), ptr);
        let b = ObjectHandle::adopt(api, ptr);
        let c = b.clone();
        assert_eq!(a.ref_count(), 3);
        assert_eq!(a, c);

        a.release();
        assert_eq!(b.ref_count(), 2);
        drop(b);
        assert_eq!(c.ref_count(), 1);
        drop(c);
        assert_eq!(sim.live_objects(), 0);
    }

    #[test]
    fn test_release_races_with_drop() {
        let (sim, api, ptr) = setup();
        let handle = Arc::new(ObjectHandle::new_owned(api, ptr));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || h.release())
            })
            .collect();
        let released: usize = threads
            .into_iter()
            .map(|t| t.join().unwrap() as usize)
            .sum();
        assert_eq!(released, 1);
        drop(handle);
        assert_eq!(sim.live_objects(), 0);
    }
}
