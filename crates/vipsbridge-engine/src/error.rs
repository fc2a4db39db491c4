//! Error types for the binding

use thiserror::Error;
use vipsbridge_sdk::NativeError;

/// Result type for binding operations
pub type Result<T> = std::result::Result<T, VipsError>;

/// Errors raised to the caller of an operation or handle method.
///
/// The first four variants are raised before anything is written to the
/// native side, so the caller can retry with corrected arguments.
#[derive(Debug, Error)]
pub enum VipsError {
    /// Wrong number of positional arguments
    #[error("{operation}: expected {expected} positional arguments, got {got}")]
    ArgumentCount {
        /// Operation name
        operation: String,
        /// Number of required inputs
        expected: usize,
        /// Number supplied
        got: usize,
    },

    /// Value shape does not fit the argument's type
    #[error("{argument}: expected {expected}, got {got}")]
    ArgumentType {
        /// Argument (or value slot) that rejected the value
        argument: String,
        /// Type the argument accepts
        expected: String,
        /// Shape that was supplied
        got: String,
    },

    /// Named option matches no argument of the operation
    #[error("{operation}: unknown argument '{argument}'")]
    UnknownArgument {
        /// Operation name
        operation: String,
        /// Option key
        argument: String,
    },

    /// Named option matches an optional input and an output at once
    #[error("{operation}: argument '{argument}' is both an input and an output")]
    AmbiguousArgument {
        /// Operation name
        operation: String,
        /// Option key
        argument: String,
    },

    /// Operation name unknown to the native type system
    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    /// Native build (or another native entry point) failed; the message is
    /// the content of the native error buffer
    #[error("{0}")]
    NativeOperation(String),

    /// Handle used after release
    #[error("Handle has already been released")]
    DisposedHandle,

    /// A value slot was written a second time
    #[error("Value slot has already been written")]
    SlotAlreadyWritten,

    /// A mutation scope is already open on this image
    #[error("Image is already being mutated")]
    MutationInProgress,

    /// A native primitive refused a call
    #[error("Native error: {0}")]
    Native(#[from] NativeError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VipsError {
    /// Whether the error was raised before any native mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            VipsError::ArgumentCount { .. }
                | VipsError::ArgumentType { .. }
                | VipsError::UnknownArgument { .. }
                | VipsError::AmbiguousArgument { .. }
        )
    }

    pub(crate) fn argument_type(
        argument: impl Into<String>,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> Self {
        VipsError::ArgumentType {
            argument: argument.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let e = VipsError::ArgumentCount {
            operation: "add".to_string(),
            expected: 2,
            got: 1,
        };
        assert_eq!(e.to_string(), "add: expected 2 positional arguments, got 1");
        assert!(e.is_validation());

        let e = VipsError::NativeOperation("avg: parameter in not set".to_string());
        assert_eq!(e.to_string(), "avg: parameter in not set");
        assert!(!e.is_validation());
    }

    #[test]
    fn test_from_native_error() {
        let e: VipsError = NativeError::InvalidPointer(0x40).into();
        assert!(matches!(e, VipsError::Native(NativeError::InvalidPointer(0x40))));
    }
}
