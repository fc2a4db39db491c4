//! Plain data types shared by every native backend
//!
//! Pointers are carried as integers so that the types stay `Send + Sync`
//! and comparable; only a backend ever turns them back into real addresses.

use std::num::NonZeroUsize;
use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ============================================================================
// Runtime type identifiers
// ============================================================================

/// Runtime type identifier of the native type system (a `GType` in libvips).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TypeId(pub usize);

impl TypeId {
    /// The invalid type (`G_TYPE_INVALID`)
    pub const INVALID: TypeId = TypeId(0);

    /// Check whether this is a real type
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Fundamental category of a runtime type.
///
/// This is what the value box dispatches on: every type the native side can
/// put in a value slot falls into exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeKind {
    /// `gboolean`
    Bool,
    /// `gint`
    Int,
    /// `guint64`
    UInt64,
    /// `gdouble`
    Double,
    /// `gchararray`
    String,
    /// Enumeration (integer-coded, with nicknames)
    Enum,
    /// Flags (bit set, with nicknames)
    Flags,
    /// Boxed array of doubles
    ArrayDouble,
    /// Boxed array of ints
    ArrayInt,
    /// Boxed byte blob
    Blob,
    /// Reference-counted object
    Object,
    /// Boxed array of image references
    ArrayImage,
    /// Anything the binding cannot marshal
    Unknown,
}

impl TypeKind {
    /// Short name used in error messages
    pub const fn name(&self) -> &'static str {
        match self {
            TypeKind::Bool => "bool",
            TypeKind::Int => "int",
            TypeKind::UInt64 => "uint64",
            TypeKind::Double => "double",
            TypeKind::String => "string",
            TypeKind::Enum => "enum",
            TypeKind::Flags => "flags",
            TypeKind::ArrayDouble => "double array",
            TypeKind::ArrayInt => "int array",
            TypeKind::Blob => "blob",
            TypeKind::Object => "object",
            TypeKind::ArrayImage => "image array",
            TypeKind::Unknown => "unknown",
        }
    }
}

// ============================================================================
// Native pointers
// ============================================================================

/// Address of a live native object. Never null.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectPtr(NonZeroUsize);

impl ObjectPtr {
    /// Wrap a raw address, returning `None` for null
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wrap a raw C pointer, returning `None` for null
    #[inline]
    pub fn from_raw<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// Raw address
    #[inline]
    pub const fn addr(&self) -> usize {
        self.0.get()
    }

    /// Raw C pointer
    #[inline]
    pub fn as_raw<T>(&self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl std::fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectPtr({:#x})", self.0)
    }
}

/// Address of an initialized native value slot (a `GValue` in libvips).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ValuePtr(NonZeroUsize);

impl ValuePtr {
    /// Wrap a raw address, returning `None` for null
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        NonZeroUsize::new(addr).map(Self)
    }

    /// Wrap a raw C pointer, returning `None` for null
    #[inline]
    pub fn from_raw<T>(ptr: *mut T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    /// Raw address
    #[inline]
    pub const fn addr(&self) -> usize {
        self.0.get()
    }

    /// Raw C pointer
    #[inline]
    pub fn as_raw<T>(&self) -> *mut T {
        self.0.get() as *mut T
    }
}

impl std::fmt::Debug for ValuePtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ValuePtr({:#x})", self.0)
    }
}

// ============================================================================
// Argument table
// ============================================================================

bitflags! {
    /// Flags on an operation argument (`VipsArgumentFlags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArgumentFlags: u32 {
        const REQUIRED     = 1 << 0;
        const CONSTRUCT    = 1 << 1;
        const SET_ONCE     = 1 << 2;
        const SET_ALWAYS   = 1 << 3;
        const INPUT        = 1 << 4;
        const OUTPUT       = 1 << 5;
        const DEPRECATED   = 1 << 6;
        const MODIFY       = 1 << 7;
        const NON_HASHABLE = 1 << 8;
    }
}

/// One entry of an operation's argument table, as visited by
/// [`NativeApi::argument_map`](crate::NativeApi::argument_map).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentInfo {
    /// Property name
    pub name: String,
    /// Declared value type
    pub type_id: TypeId,
    /// Argument flags
    pub flags: ArgumentFlags,
    /// Ordering key for positional arguments
    pub priority: i32,
    /// Struct offset of the argument (identity only)
    pub offset: u32,
    /// Human-readable description
    pub blurb: String,
}

// ============================================================================
// Images
// ============================================================================

/// Sample format of image pixels (`VipsBandFormat`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum BandFormat {
    UChar = 0,
    Char = 1,
    UShort = 2,
    Short = 3,
    UInt = 4,
    Int = 5,
    Float = 6,
    Complex = 7,
    Double = 8,
    DpComplex = 9,
}

impl BandFormat {
    /// Size of one sample in bytes
    pub const fn sizeof(&self) -> usize {
        match self {
            BandFormat::UChar | BandFormat::Char => 1,
            BandFormat::UShort | BandFormat::Short => 2,
            BandFormat::UInt | BandFormat::Int | BandFormat::Float => 4,
            BandFormat::Complex | BandFormat::Double => 8,
            BandFormat::DpComplex => 16,
        }
    }

    /// Decode the integer code used on the native side
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => BandFormat::UChar,
            1 => BandFormat::Char,
            2 => BandFormat::UShort,
            3 => BandFormat::Short,
            4 => BandFormat::UInt,
            5 => BandFormat::Int,
            6 => BandFormat::Float,
            7 => BandFormat::Complex,
            8 => BandFormat::Double,
            9 => BandFormat::DpComplex,
            _ => return None,
        })
    }

    /// Nickname as used by the native enum type
    pub const fn nick(&self) -> &'static str {
        match self {
            BandFormat::UChar => "uchar",
            BandFormat::Char => "char",
            BandFormat::UShort => "ushort",
            BandFormat::Short => "short",
            BandFormat::UInt => "uint",
            BandFormat::Int => "int",
            BandFormat::Float => "float",
            BandFormat::Complex => "complex",
            BandFormat::Double => "double",
            BandFormat::DpComplex => "dpcomplex",
        }
    }
}

// ============================================================================
// Logging and signals
// ============================================================================

/// Severity of a message emitted by the native library's log channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Error,
    Critical,
    Warning,
    Message,
    Info,
    Debug,
}

/// Receives `(level, domain, message)` for every native log message.
pub type LogHandler = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

/// One-shot callback fired when a native object is finalized.
pub type PostCloseFn = Box<dyn FnOnce() + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_ptr_rejects_null() {
        assert!(ObjectPtr::new(0).is_none());
        let p = ObjectPtr::new(0x1000).unwrap();
        assert_eq!(p.addr(), 0x1000);
        assert_eq!(format!("{:?}", p), "ObjectPtr(0x1000)");
    }

    #[test]
    fn test_band_format_codes() {
        for code in 0..10 {
            let f = BandFormat::from_code(code).unwrap();
            assert_eq!(f as i32, code);
        }
        assert!(BandFormat::from_code(10).is_none());
        assert_eq!(BandFormat::UShort.sizeof(), 2);
        assert_eq!(BandFormat::Double.nick(), "double");
    }

    #[test]
    fn test_argument_flags_compose() {
        let flags = ArgumentFlags::REQUIRED | ArgumentFlags::CONSTRUCT | ArgumentFlags::INPUT;
        assert!(flags.contains(ArgumentFlags::INPUT));
        assert!(!flags.contains(ArgumentFlags::OUTPUT));
    }
}
