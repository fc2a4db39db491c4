//! Error types for the native API boundary

/// Result type for native API calls
pub type NativeResult<T> = Result<T, NativeError>;

/// Failures reported by a native backend itself (as opposed to a failed
/// operation build, which is reported through the native error buffer).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NativeError {
    /// Type mismatch between a value slot and the requested accessor
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch {
        /// Expected type name
        expected: String,
        /// Actual type name
        got: String,
    },

    /// Object has no property with this name
    #[error("Object of type '{type_name}' has no property '{name}'")]
    UnknownProperty {
        /// Type name of the object
        type_name: String,
        /// Property that was addressed
        name: String,
    },

    /// Enum or flags nickname not defined by the type
    #[error("'{nick}' is not a valid value for {type_name}")]
    UnknownNick {
        /// Enum or flags type name
        type_name: String,
        /// Rejected nickname
        nick: String,
    },

    /// Pointer does not refer to a live native object or value
    #[error("Invalid native pointer {0:#x}")]
    InvalidPointer(usize),

    /// Any other backend failure
    #[error("{0}")]
    Backend(String),
}

impl From<String> for NativeError {
    fn from(s: String) -> Self {
        NativeError::Backend(s)
    }
}

impl From<&str> for NativeError {
    fn from(s: &str) -> Self {
        NativeError::Backend(s.to_string())
    }
}
