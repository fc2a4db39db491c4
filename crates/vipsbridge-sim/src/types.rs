//! Type registry of the reference library
//!
//! Mirrors the small part of the GObject type system the binding relies on:
//! named types, a fundamental category, single inheritance for object types
//! and nickname tables for enums and flags.

use vipsbridge_sdk::{NativeError, NativeResult, TypeId, TypeKind};

pub(crate) struct TypeInfo {
    pub name: String,
    pub kind: TypeKind,
    pub parent: Option<TypeId>,
    pub values: Vec<(i32, &'static str)>,
}

/// Well-known type ids, fixed at registry construction.
pub mod ids {
    use vipsbridge_sdk::TypeId;

    pub const BOOL: TypeId = TypeId(1);
    pub const INT: TypeId = TypeId(2);
    pub const UINT64: TypeId = TypeId(3);
    pub const DOUBLE: TypeId = TypeId(4);
    pub const STRING: TypeId = TypeId(5);
    pub const ARRAY_DOUBLE: TypeId = TypeId(6);
    pub const ARRAY_INT: TypeId = TypeId(7);
    pub const BLOB: TypeId = TypeId(8);
    pub const ARRAY_IMAGE: TypeId = TypeId(9);
    pub const GOBJECT: TypeId = TypeId(10);
    pub const OBJECT: TypeId = TypeId(11);
    pub const IMAGE: TypeId = TypeId(12);
    pub const OPERATION: TypeId = TypeId(13);
    pub const BAND_FORMAT: TypeId = TypeId(14);
    pub const FOREIGN_KEEP: TypeId = TypeId(15);
    pub const FOREIGN_FLAGS: TypeId = TypeId(16);
    pub const INTERPRETATION: TypeId = TypeId(17);
    pub const POINTER: TypeId = TypeId(18);
}

pub(crate) struct TypeRegistry {
    types: Vec<TypeInfo>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        let scalar = |name: &str, kind| TypeInfo {
            name: name.to_string(),
            kind,
            parent: None,
            values: Vec::new(),
        };
        let object = |name: &str, parent| TypeInfo {
            name: name.to_string(),
            kind: TypeKind::Object,
            parent,
            values: Vec::new(),
        };

        let types = vec![
            scalar("gboolean", TypeKind::Bool),
            scalar("gint", TypeKind::Int),
            scalar("guint64", TypeKind::UInt64),
            scalar("gdouble", TypeKind::Double),
            scalar("gchararray", TypeKind::String),
            scalar("VipsArrayDouble", TypeKind::ArrayDouble),
            scalar("VipsArrayInt", TypeKind::ArrayInt),
            scalar("VipsBlob", TypeKind::Blob),
            scalar("VipsArrayImage", TypeKind::ArrayImage),
            object("GObject", None),
            object("VipsObject", Some(ids::GOBJECT)),
            object("VipsImage", Some(ids::OBJECT)),
            object("VipsOperation", Some(ids::OBJECT)),
            TypeInfo {
                name: "VipsBandFormat".to_string(),
                kind: TypeKind::Enum,
                parent: None,
                values: vec![
                    (0, "uchar"),
                    (1, "char"),
                    (2, "ushort"),
                    (3, "short"),
                    (4, "uint"),
                    (5, "int"),
                    (6, "float"),
                    (7, "complex"),
                    (8, "double"),
                    (9, "dpcomplex"),
                ],
            },
            TypeInfo {
                name: "VipsForeignKeep".to_string(),
                kind: TypeKind::Flags,
                parent: None,
                values: vec![
                    (0, "none"),
                    (1, "exif"),
                    (2, "xmp"),
                    (4, "iptc"),
                    (8, "icc"),
                    (16, "other"),
                    (31, "all"),
                ],
            },
            TypeInfo {
                name: "VipsForeignFlags".to_string(),
                kind: TypeKind::Flags,
                parent: None,
                values: vec![(0, "none"), (1, "partial"), (2, "bigendian"), (4, "sequential")],
            },
            TypeInfo {
                name: "VipsInterpretation".to_string(),
                kind: TypeKind::Enum,
                parent: None,
                values: vec![
                    (0, "error"),
                    (1, "multiband"),
                    (2, "b-w"),
                    (22, "srgb"),
                    (26, "grey16"),
                    (27, "matrix"),
                ],
            },
            scalar("gpointer", TypeKind::Unknown),
        ];

        Self { types }
    }

    fn info(&self, ty: TypeId) -> Option<&TypeInfo> {
        ty.0.checked_sub(1).and_then(|i| self.types.get(i))
    }

    pub fn from_name(&self, name: &str) -> Option<TypeId> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|i| TypeId(i + 1))
    }

    pub fn name(&self, ty: TypeId) -> String {
        self.info(ty)
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "invalid".to_string())
    }

    pub fn kind(&self, ty: TypeId) -> TypeKind {
        self.info(ty).map(|t| t.kind).unwrap_or(TypeKind::Unknown)
    }

    pub fn is_a(&self, ty: TypeId, parent: TypeId) -> bool {
        let mut current = Some(ty);
        while let Some(t) = current {
            if t == parent {
                return true;
            }
            current = self.info(t).and_then(|i| i.parent);
        }
        false
    }

    pub fn from_nick(&self, ty: TypeId, nick: &str) -> NativeResult<i32> {
        let info = self
            .info(ty)
            .filter(|i| matches!(i.kind, TypeKind::Enum | TypeKind::Flags))
            .ok_or_else(|| NativeError::TypeMismatch {
                expected: "enum or flags".to_string(),
                got: self.name(ty),
            })?;

        let lookup = |part: &str| {
            info.values
                .iter()
                .find(|(_, n)| n.eq_ignore_ascii_case(part.trim()))
                .map(|(v, _)| *v)
                .ok_or_else(|| NativeError::UnknownNick {
                    type_name: info.name.clone(),
                    nick: part.trim().to_string(),
                })
        };

        if info.kind == TypeKind::Flags {
            nick.split(['|', ':'])
                .filter(|p| !p.trim().is_empty())
                .try_fold(0i32, |acc, part| -> NativeResult<i32> { Ok(acc | lookup(part)?) })
        } else {
            lookup(nick)
        }
    }

    pub fn nick(&self, ty: TypeId, value: i32) -> Option<String> {
        self.info(ty)?
            .values
            .iter()
            .find(|(v, _)| *v == value)
            .map(|(_, n)| n.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_inheritance() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.from_name("VipsImage"), Some(ids::IMAGE));
        assert_eq!(reg.kind(ids::IMAGE), TypeKind::Object);
        assert!(reg.is_a(ids::IMAGE, ids::GOBJECT));
        assert!(!reg.is_a(ids::OPERATION, ids::IMAGE));
        assert_eq!(reg.kind(TypeId(999)), TypeKind::Unknown);
    }

    #[test]
    fn test_enum_and_flags_nicks() {
        let reg = TypeRegistry::new();
        assert_eq!(reg.from_nick(ids::BAND_FORMAT, "ushort").unwrap(), 2);
        assert_eq!(reg.from_nick(ids::FOREIGN_KEEP, "exif|icc").unwrap(), 9);
        assert!(reg.from_nick(ids::BAND_FORMAT, "bogus").is_err());
        assert_eq!(reg.nick(ids::BAND_FORMAT, 8).as_deref(), Some("double"));
    }
}
