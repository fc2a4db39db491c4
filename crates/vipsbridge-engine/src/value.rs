//! Values crossing the native boundary
//!
//! [`Value`] is the closed set of managed shapes the binding accepts and
//! returns. [`ValueBox`] is a native value slot initialized with a type: it
//! checks a managed value against the slot's fundamental kind before any
//! native setter runs, and converts native payloads back into the inverse
//! managed shape.

use std::fmt;

use vipsbridge_sdk::{NativeApi, NativeError, TypeId, TypeKind, ValuePtr};

use crate::error::{Result, VipsError};
use crate::handle::ObjectHandle;
use crate::image::Image;
use crate::runtime::Vips;

/// Enum argument, either integer-coded or by nickname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EnumValue {
    Int(i32),
    Nick(String),
}

/// A managed value.
///
/// Images compare by native pointer identity.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    Enum(EnumValue),
    Flags(u32),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i32>),
    Blob(Vec<u8>),
    Image(Image),
    ImageArray(Vec<Image>),
    Object(ObjectHandle),
}

impl Value {
    /// Short name of the value's shape, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt64(_) => "uint64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Enum(_) => "enum",
            Value::Flags(_) => "flags",
            Value::DoubleArray(_) => "double array",
            Value::IntArray(_) => "int array",
            Value::Blob(_) => "blob",
            Value::Image(_) => "image",
            Value::ImageArray(_) => "image array",
            Value::Object(_) => "object",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Enum(EnumValue::Int(i)) => Some(*i as i64),
            _ => None,
        }
    }

    /// Numeric value as a double (ints widen)
    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_doubles(&self) -> Option<&[f64]> {
        match self {
            Value::DoubleArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ints(&self) -> Option<&[i32]> {
        match self {
            Value::IntArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&Image> {
        match self {
            Value::Image(i) => Some(i),
            _ => None,
        }
    }

    /// Take the image out of an image value
    pub fn into_image(self) -> Result<Image> {
        match self {
            Value::Image(i) => Ok(i),
            other => Err(VipsError::argument_type("result", "image", other.type_name())),
        }
    }

    /// Whether this value can stand in for an image through a constant image
    pub(crate) fn is_constant(&self) -> bool {
        matches!(self, Value::Double(_) | Value::Int(_) | Value::DoubleArray(_))
    }

    pub(crate) fn constants(&self) -> Vec<f64> {
        match self {
            Value::Double(d) => vec![*d],
            Value::Int(i) => vec![*i as f64],
            Value::DoubleArray(v) => v.clone(),
            _ => Vec::new(),
        }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v.into())
            }
        })*
    };
}

impl_from! {
    bool => Bool,
    i32 => Int,
    i64 => Int,
    u64 => UInt64,
    f64 => Double,
    String => String,
    &str => String,
    Vec<f64> => DoubleArray,
    Vec<i32> => IntArray,
    Vec<u8> => Blob,
    Image => Image,
    Vec<Image> => ImageArray,
    ObjectHandle => Object,
}

impl From<&[f64]> for Value {
    fn from(v: &[f64]) -> Self {
        Value::DoubleArray(v.to_vec())
    }
}

impl From<&Image> for Value {
    fn from(v: &Image) -> Self {
        Value::Image(v.clone())
    }
}

impl From<EnumValue> for Value {
    fn from(v: EnumValue) -> Self {
        Value::Enum(v)
    }
}

/// Whether a slot of `kind` accepts `value`, including the compatible
/// widenings (int into double, a scalar into an array, a nick into an enum).
pub(crate) fn accepts(kind: TypeKind, value: &Value) -> bool {
    match (kind, value) {
        (TypeKind::Bool, Value::Bool(_)) => true,
        (TypeKind::Int, Value::Int(i)) => i32::try_from(*i).is_ok(),
        (TypeKind::UInt64, Value::UInt64(_)) => true,
        (TypeKind::UInt64, Value::Int(i)) => *i >= 0,
        (TypeKind::Double, Value::Double(_) | Value::Int(_)) => true,
        (TypeKind::String, Value::String(_)) => true,
        (TypeKind::Enum, Value::Enum(_) | Value::String(_)) => true,
        (TypeKind::Enum, Value::Int(i)) => i32::try_from(*i).is_ok(),
        (TypeKind::Flags, Value::Flags(_) | Value::String(_)) => true,
        (TypeKind::Flags, Value::Int(i)) => u32::try_from(*i).is_ok(),
        (TypeKind::ArrayDouble, Value::DoubleArray(_) | Value::Double(_) | Value::IntArray(_)) => true,
        (TypeKind::ArrayDouble, Value::Int(_)) => true,
        (TypeKind::ArrayInt, Value::IntArray(_)) => true,
        (TypeKind::ArrayInt, Value::Int(i)) => i32::try_from(*i).is_ok(),
        (TypeKind::Blob, Value::Blob(_)) => true,
        (TypeKind::Object, Value::Image(_) | Value::Object(_)) => true,
        (TypeKind::ArrayImage, Value::ImageArray(_) | Value::Image(_)) => true,
        _ => false,
    }
}

/// Resolve an enum or flags nickname to its integer code.
///
/// Only the native type system is consulted. Values that carry no nickname
/// give `None`.
pub(crate) fn resolve_nick(
    api: &dyn NativeApi,
    ty: TypeId,
    kind: TypeKind,
    value: &Value,
) -> Result<Option<Value>> {
    let nick = match (kind, value) {
        (TypeKind::Enum | TypeKind::Flags, Value::String(s)) => s,
        (TypeKind::Enum, Value::Enum(EnumValue::Nick(s))) => s,
        _ => return Ok(None),
    };
    let code = api.enum_from_nick(ty, nick).map_err(|e| match e {
        NativeError::UnknownNick { type_name, nick } => {
            VipsError::argument_type("value", type_name, format!("'{}'", nick))
        }
        other => VipsError::Native(other),
    })?;
    Ok(Some(match kind {
        TypeKind::Flags => Value::Flags(code as u32),
        _ => Value::Enum(EnumValue::Int(code)),
    }))
}

// ============================================================================
// ValueBox
// ============================================================================

/// An initialized native value slot.
///
/// A slot is written at most once and released exactly once, explicitly or
/// on drop.
pub struct ValueBox {
    vips: Vips,
    ptr: ValuePtr,
    type_id: TypeId,
    kind: TypeKind,
    written: bool,
    disposed: bool,
}

impl ValueBox {
    /// Allocate a slot for `ty`
    pub fn init(vips: &Vips, ty: TypeId) -> Self {
        let kind = vips.api().type_kind(ty);
        Self::init_with_kind(vips, ty, kind)
    }

    /// Allocate a slot whose kind is already known (from a cached descriptor)
    pub fn init_with_kind(vips: &Vips, ty: TypeId, kind: TypeKind) -> Self {
        let ptr = vips.api().value_init(ty);
        Self {
            vips: vips.clone(),
            ptr,
            type_id: ty,
            kind,
            written: false,
            disposed: false,
        }
    }

    /// Take ownership of a slot the native side already initialized
    pub fn from_raw(vips: &Vips, ptr: ValuePtr) -> Self {
        let api = vips.api();
        let type_id = api.value_type(ptr);
        let kind = api.type_kind(type_id);
        Self {
            vips: vips.clone(),
            ptr,
            type_id,
            kind,
            written: true,
            disposed: false,
        }
    }

    pub fn ptr(&self) -> ValuePtr {
        self.ptr
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn is_released(&self) -> bool {
        self.disposed
    }

    fn live(&self) -> Result<ValuePtr> {
        if self.disposed {
            return Err(VipsError::DisposedHandle);
        }
        Ok(self.ptr)
    }

    /// Whether a value has been stored in the slot
    pub fn is_written(&self) -> bool {
        self.written
    }

    /// Store a managed value.
    ///
    /// The shape is checked against the slot kind before any native call. A
    /// slot accepts one successful `set`; later ones fail with
    /// [`VipsError::SlotAlreadyWritten`].
    pub fn set(&mut self, value: &Value) -> Result<()> {
        let ptr = self.live()?;
        if self.written {
            return Err(VipsError::SlotAlreadyWritten);
        }
        if !accepts(self.kind, value) {
            return Err(VipsError::argument_type(
                "value",
                self.kind.name(),
                value.type_name(),
            ));
        }

        let api = self.vips.api().clone();
        let resolved = resolve_nick(api.as_ref(), self.type_id, self.kind, value)?;
        let value = resolved.as_ref().unwrap_or(value);
        match (self.kind, value) {
            (TypeKind::Bool, Value::Bool(b)) => api.value_set_bool(ptr, *b),
            (TypeKind::Int, Value::Int(i)) => api.value_set_int(ptr, *i as i32),
            (TypeKind::UInt64, Value::UInt64(u)) => api.value_set_uint64(ptr, *u),
            (TypeKind::UInt64, Value::Int(i)) => api.value_set_uint64(ptr, *i as u64),
            (TypeKind::Double, Value::Double(d)) => api.value_set_double(ptr, *d),
            (TypeKind::Double, Value::Int(i)) => api.value_set_double(ptr, *i as f64),
            (TypeKind::String, Value::String(s)) => api.value_set_string(ptr, s),
            (TypeKind::Enum, Value::Enum(EnumValue::Int(i))) => api.value_set_enum(ptr, *i),
            (TypeKind::Enum, Value::Int(i)) => api.value_set_enum(ptr, *i as i32),
            (TypeKind::Flags, Value::Flags(f)) => api.value_set_flags(ptr, *f),
            (TypeKind::Flags, Value::Int(i)) => api.value_set_flags(ptr, *i as u32),
            (TypeKind::ArrayDouble, Value::DoubleArray(v)) => api.value_set_array_double(ptr, v),
            (TypeKind::ArrayDouble, Value::Double(d)) => api.value_set_array_double(ptr, &[*d]),
            (TypeKind::ArrayDouble, Value::Int(i)) => api.value_set_array_double(ptr, &[*i as f64]),
            (TypeKind::ArrayDouble, Value::IntArray(v)) => {
                let v: Vec<f64> = v.iter().map(|i| *i as f64).collect();
                api.value_set_array_double(ptr, &v)
            }
            (TypeKind::ArrayInt, Value::IntArray(v)) => api.value_set_array_int(ptr, v),
            (TypeKind::ArrayInt, Value::Int(i)) => api.value_set_array_int(ptr, &[*i as i32]),
            (TypeKind::Blob, Value::Blob(b)) => api.value_set_blob(ptr, b.clone()),
            (TypeKind::Object, Value::Image(img)) => api.value_set_object(ptr, Some(img.ptr()?)),
            (TypeKind::Object, Value::Object(h)) => api.value_set_object(ptr, Some(h.get()?)),
            (TypeKind::ArrayImage, Value::ImageArray(images)) => {
                let ptrs = images.iter().map(Image::ptr).collect::<Result<Vec<_>>>()?;
                api.value_set_array_image(ptr, &ptrs)
            }
            (TypeKind::ArrayImage, Value::Image(img)) => api.value_set_array_image(ptr, &[img.ptr()?]),
            (kind, value) => {
                return Err(VipsError::argument_type("value", kind.name(), value.type_name()))
            }
        }
        self.written = true;
        Ok(())
    }

    /// Read the slot back as a managed value. Object payloads come back as
    /// handles holding their own reference.
    pub fn get(&self) -> Result<Value> {
        let ptr = self.live()?;
        let api = self.vips.api();
        let value = match self.kind {
            TypeKind::Bool => Value::Bool(api.value_get_bool(ptr)),
            TypeKind::Int => Value::Int(api.value_get_int(ptr) as i64),
            TypeKind::UInt64 => Value::UInt64(api.value_get_uint64(ptr)),
            TypeKind::Double => Value::Double(api.value_get_double(ptr)),
            TypeKind::String => Value::String(api.value_get_string(ptr).unwrap_or_default()),
            TypeKind::Enum => Value::Enum(EnumValue::Int(api.value_get_enum(ptr))),
            TypeKind::Flags => Value::Flags(api.value_get_flags(ptr)),
            TypeKind::ArrayDouble => Value::DoubleArray(api.value_get_array_double(ptr)),
            TypeKind::ArrayInt => Value::IntArray(api.value_get_array_int(ptr)),
            TypeKind::Blob => Value::Blob(api.value_get_blob(ptr)),
            TypeKind::Object => {
                let obj = api
                    .value_get_object(ptr)
                    .ok_or(VipsError::Native(NativeError::InvalidPointer(0)))?;
                if api.type_is_a(api.object_type(obj), self.vips.image_type()) {
                    Value::Image(Image::adopt(&self.vips, obj))
                } else {
                    Value::Object(ObjectHandle::adopt(api.clone(), obj))
                }
            }
            TypeKind::ArrayImage => Value::ImageArray(
                api.value_get_array_image(ptr)
                    .into_iter()
                    .map(|p| Image::adopt(&self.vips, p))
                    .collect(),
            ),
            TypeKind::Unknown => {
                return Err(VipsError::argument_type(
                    "value",
                    "a known type",
                    api.type_name(self.type_id),
                ))
            }
        };
        Ok(value)
    }

    /// Free the native slot; later calls are no-ops
    pub fn release(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.vips.api().value_unset(self.ptr);
        }
    }
}

impl Drop for ValueBox {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for ValueBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueBox")
            .field("ptr", &self.ptr)
            .field("type_id", &self.type_id)
            .field("kind", &self.kind)
            .field("written", &self.written)
            .field("disposed", &self.disposed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use vipsbridge_sdk::{BandFormat, NativeApi};
    use vipsbridge_sim::{ids, SimLibrary};

    fn setup() -> (Arc<SimLibrary>, Vips) {
        let sim = Arc::new(SimLibrary::new());
        let vips = Vips::new(sim.clone());
        (sim, vips)
    }

    fn roundtrip(vips: &Vips, ty: TypeId, value: Value) -> Value {
        let mut b = ValueBox::init(vips, ty);
        b.set(&value).unwrap();
        b.get().unwrap()
    }

    #[test]
    fn test_bool_roundtrip() {
        let (_sim, vips) = setup();
        assert_eq!(roundtrip(&vips, ids::BOOL, Value::Bool(true)), Value::Bool(true));
    }

    #[test]
    fn test_scalar_roundtrips() {
        let (_sim, vips) = setup();
        let cases = vec![
            (ids::INT, Value::Int(-42)),
            (ids::UINT64, Value::UInt64(u64::MAX)),
            (ids::DOUBLE, Value::Double(2.5)),
            (ids::STRING, Value::String("héllo".to_string())),
            (ids::BAND_FORMAT, Value::Enum(EnumValue::Int(2))),
            (ids::FOREIGN_KEEP, Value::Flags(9)),
            (ids::ARRAY_DOUBLE, Value::DoubleArray(vec![1.0, -2.0])),
            (ids::ARRAY_INT, Value::IntArray(vec![3, 4, 5])),
            (ids::BLOB, Value::Blob(vec![0, 1, 255])),
        ];
        for (ty, value) in cases {
            assert_eq!(roundtrip(&vips, ty, value.clone()), value);
        }
    }

    #[test]
    fn test_image_roundtrip_keeps_identity() {
        let (sim, vips) = setup();
        let img = Image::new_from_memory(&vips, &[1u8; 4], 2, 2, 1, BandFormat::UChar).unwrap();
        assert_eq!(roundtrip(&vips, ids::IMAGE, Value::Image(img.clone())), Value::Image(img.clone()));

        let arr = Value::ImageArray(vec![img.clone(), img.clone()]);
        assert_eq!(roundtrip(&vips, ids::ARRAY_IMAGE, arr.clone()), arr);
        drop(arr);
        img.release();
        assert_eq!(sim.live_objects(), 0);
        assert_eq!(sim.live_values(), 0);
    }

    #[test]
    fn test_widenings() {
        let (_sim, vips) = setup();
        assert_eq!(roundtrip(&vips, ids::DOUBLE, Value::Int(3)), Value::Double(3.0));
        assert_eq!(
            roundtrip(&vips, ids::ARRAY_DOUBLE, Value::Double(1.5)),
            Value::DoubleArray(vec![1.5])
        );
        assert_eq!(
            roundtrip(&vips, ids::BAND_FORMAT, Value::String("ushort".to_string())),
            Value::Enum(EnumValue::Int(2))
        );
        assert_eq!(
            roundtrip(&vips, ids::FOREIGN_KEEP, Value::String("exif|icc".to_string())),
            Value::Flags(9)
        );
    }

    #[test]
    fn test_shape_mismatch_makes_no_native_call() {
        let (sim, vips) = setup();
        let mut b = ValueBox::init(&vips, ids::INT);
        let before = sim.native_calls();
        let err = b.set(&Value::String("x".to_string())).unwrap_err();
        assert!(matches!(err, VipsError::ArgumentType { .. }));
        assert!(b.set(&Value::Int(i64::MAX)).is_err());
        assert_eq!(sim.native_calls(), before);
    }

    #[test]
    fn test_bad_nick_is_argument_type() {
        let (_sim, vips) = setup();
        let mut b = ValueBox::init(&vips, ids::BAND_FORMAT);
        let err = b.set(&Value::Enum(EnumValue::Nick("bogus".to_string()))).unwrap_err();
        assert!(matches!(err, VipsError::ArgumentType { ref expected, .. } if expected == "VipsBandFormat"));
    }

    #[test]
    fn test_second_set_rejected() {
        let (sim, vips) = setup();
        let mut b = ValueBox::init(&vips, ids::INT);
        assert!(b.set(&Value::from("not an int")).is_err());
        assert!(!b.is_written());

        b.set(&Value::Int(1)).unwrap();
        let before = sim.native_calls();
        assert!(matches!(b.set(&Value::Int(2)), Err(VipsError::SlotAlreadyWritten)));
        assert_eq!(sim.native_calls(), before);
        assert_eq!(b.get().unwrap(), Value::Int(1));
    }

    #[test]
    fn test_release_once() {
        let (sim, vips) = setup();
        let mut b = ValueBox::init(&vips, ids::STRING);
        b.set(&Value::from("x")).unwrap();
        b.release();
        b.release();
        assert!(matches!(b.get(), Err(VipsError::DisposedHandle)));
        drop(b);
        assert_eq!(sim.live_values(), 0);
    }

    #[test]
    fn test_header_slot_from_raw() {
        let (sim, vips) = setup();
        let img = Image::new_from_memory(&vips, &[0u8; 6], 3, 2, 1, BandFormat::UChar).unwrap();
        let raw = vips.api().image_get(img.ptr().unwrap(), "width").unwrap();
        let b = ValueBox::from_raw(&vips, raw);
        assert_eq!(b.kind(), TypeKind::Int);
        assert_eq!(b.get().unwrap(), Value::Int(3));
        drop(b);
        drop(img);
        assert_eq!(sim.live_values(), 0);
    }
}
