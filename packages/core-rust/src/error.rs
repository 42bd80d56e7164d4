//! Error types for chain construction and result streams.

use std::any::Any;
use std::sync::Arc;

/// Errors delivered through an observable's `error` notification.
///
/// Cloneable so a single failure can be fanned out to every subscriber of a
/// shared stream. Opaque causes are carried as `Arc<anyhow::Error>`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    #[error("link panicked: {message}")]
    Panicked { message: String },
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("internal error: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl LinkError {
    /// Wraps an arbitrary error as [`LinkError::Internal`].
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(Arc::new(err.into()))
    }

    /// Builds an [`LinkError::Internal`] from a plain message.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Internal(Arc::new(anyhow::anyhow!("{message}")))
    }

    /// Converts a caught panic payload into [`LinkError::Panicked`].
    #[must_use]
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Self::Panicked { message }
    }
}

impl From<anyhow::Error> for LinkError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(Arc::new(err))
    }
}

/// Errors raised synchronously while composing a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("cannot compose an empty chain of links")]
    EmptyChain,
    #[error("terminating link `{name}` at position {position} of {len} makes the rest of the chain unreachable")]
    UnreachableLink {
        name: String,
        position: usize,
        len: usize,
    },
}

/// Runs `f`, turning a panic into [`LinkError::Panicked`].
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, LinkError> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).map_err(LinkError::from_panic)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payload_str_is_preserved() {
        let err = catch_panic(|| panic!("boom")).unwrap_err();
        assert!(matches!(err, LinkError::Panicked { ref message } if message == "boom"));
    }

    #[test]
    fn panic_payload_string_is_preserved() {
        let code = 7;
        let err = catch_panic(|| panic!("failed with {code}")).unwrap_err();
        assert_eq!(err.to_string(), "link panicked: failed with 7");
    }

    #[test]
    fn catch_panic_passes_values_through() {
        assert_eq!(catch_panic(|| 41 + 1).unwrap(), 42);
    }

    #[test]
    fn internal_errors_clone_cheaply() {
        let err = LinkError::msg("connection reset");
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.to_string(), "internal error: connection reset");
    }

    #[test]
    fn composition_error_messages() {
        let err = CompositionError::UnreachableLink {
            name: "http".to_string(),
            position: 0,
            len: 2,
        };
        assert_eq!(
            err.to_string(),
            "terminating link `http` at position 0 of 2 makes the rest of the chain unreachable"
        );
    }
}
