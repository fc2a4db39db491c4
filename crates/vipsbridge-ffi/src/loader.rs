//! Dynamic library loading
//!
//! Opens the shared library with `dlopen(RTLD_NOW | RTLD_LOCAL)` and
//! resolves symbols with `dlsym`. Symbol lookup through the library handle
//! also searches the libraries it depends on, so one handle on libvips
//! reaches the GLib and GObject entry points too.

use std::ffi::CString;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while bringing up the native library
#[derive(Debug, Error)]
pub enum LoadError {
    /// Library file not found or could not be loaded
    #[error("Library not found: {path}")]
    NotFound {
        /// Path that was attempted
        path: String,
    },

    /// Symbol not found in library
    #[error("Symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// `vips_init` failed
    #[error("Library initialization failed: {0}")]
    InitFailed(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    PlatformError(String),

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),
}

/// Handle on a loaded shared library
pub struct Library {
    handle: LibraryHandle,
    path: String,
}

impl Library {
    /// Load a shared library from `path` (a file path or a soname)
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LoadError> {
        let path_ref = path.as_ref();
        let path_str = path_ref
            .to_str()
            .ok_or_else(|| LoadError::InvalidPath(format!("{:?}", path_ref)))?;

        let handle = LibraryHandle::load(path_str)?;

        Ok(Library {
            handle,
            path: path_str.to_string(),
        })
    }

    /// Try each candidate in turn, returning the first that loads
    pub fn open_first(candidates: &[&str]) -> Result<Self, LoadError> {
        let mut tried = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match Self::open(candidate) {
                Ok(lib) => return Ok(lib),
                Err(e) => tried.push(e.to_string()),
            }
        }
        Err(LoadError::NotFound {
            path: tried.join("; "),
        })
    }

    /// Get a function pointer by name.
    ///
    /// # Safety
    ///
    /// `T` must be a function pointer type matching the symbol's signature,
    /// and the pointer must not outlive this library.
    pub unsafe fn get<T: Copy>(&self, symbol: &str) -> Result<T, LoadError> {
        self.handle.symbol(symbol, &self.path)
    }

    /// Path this library was loaded from
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Library").field("path", &self.path).finish()
    }
}

#[cfg(unix)]
type LibraryHandle = UnixLibrary;

#[cfg(not(unix))]
type LibraryHandle = UnsupportedLibrary;

// ============================================================================
// Unix Implementation (Linux, macOS, BSD)
// ============================================================================

#[cfg(unix)]
struct UnixLibrary {
    handle: *mut std::ffi::c_void,
}

#[cfg(unix)]
impl UnixLibrary {
    fn load(path: &str) -> Result<Self, LoadError> {
        let c_path = CString::new(path)
            .map_err(|e| LoadError::PlatformError(format!("Invalid path: {}", e)))?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };

        if handle.is_null() {
            return Err(LoadError::NotFound {
                path: format!("{}: {}", path, unsafe { last_error() }),
            });
        }

        Ok(UnixLibrary { handle })
    }

    unsafe fn symbol<T: Copy>(&self, name: &str, lib_path: &str) -> Result<T, LoadError> {
        let c_name = CString::new(name)
            .map_err(|e| LoadError::PlatformError(format!("Invalid symbol name: {}", e)))?;

        // Clear any previous errors
        libc::dlerror();

        let symbol = libc::dlsym(self.handle, c_name.as_ptr());
        if symbol.is_null() {
            return Err(LoadError::SymbolNotFound {
                symbol: name.to_string(),
                library: format!("{}: {}", lib_path, last_error()),
            });
        }

        Ok(std::mem::transmute_copy(&symbol))
    }
}

#[cfg(unix)]
unsafe fn last_error() -> String {
    let err_ptr = libc::dlerror();
    if err_ptr.is_null() {
        "unknown error".to_string()
    } else {
        std::ffi::CStr::from_ptr(err_ptr).to_string_lossy().into_owned()
    }
}

#[cfg(unix)]
impl Drop for UnixLibrary {
    fn drop(&mut self) {
        unsafe {
            libc::dlclose(self.handle);
        }
    }
}

#[cfg(unix)]
unsafe impl Send for UnixLibrary {}
#[cfg(unix)]
unsafe impl Sync for UnixLibrary {}

// ============================================================================
// Other platforms
// ============================================================================

#[cfg(not(unix))]
struct UnsupportedLibrary;

#[cfg(not(unix))]
impl UnsupportedLibrary {
    fn load(path: &str) -> Result<Self, LoadError> {
        Err(LoadError::PlatformError(format!(
            "dynamic loading is not supported on this platform ({})",
            path
        )))
    }

    unsafe fn symbol<T: Copy>(&self, name: &str, lib_path: &str) -> Result<T, LoadError> {
        Err(LoadError::SymbolNotFound {
            symbol: name.to_string(),
            library: lib_path.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_not_found() {
        let result = Library::open("/nonexistent/libvips.so");
        match result {
            Err(LoadError::NotFound { path }) => assert!(path.contains("/nonexistent/libvips.so")),
            other => panic!("Expected NotFound error, got {:?}", other.map(|l| l.path().to_string())),
        }
    }

    #[test]
    fn test_open_first_reports_every_candidate() {
        let err = Library::open_first(&["/nonexistent/a.so", "/nonexistent/b.so"]).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("a.so"));
        assert!(message.contains("b.so"));
    }

    #[test]
    fn test_interior_nul_rejected() {
        assert!(matches!(
            Library::open("bad\0path"),
            Err(LoadError::PlatformError(_))
        ));
    }
}
