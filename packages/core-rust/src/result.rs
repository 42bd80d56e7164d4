use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result emitted by a chain.
///
/// A completed attempt carries `data`, `errors`, or both (a partial result).
/// Error entries are opaque descriptors; the engine never interprets them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl FetchResult {
    /// A successful result.
    #[must_use]
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::default()
        }
    }

    /// A result reporting only errors.
    #[must_use]
    pub fn errors(errors: Vec<Value>) -> Self {
        Self {
            errors: Some(errors),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|errors| !errors.is_empty())
    }

    /// Whether this result represents a completed attempt.
    #[must_use]
    pub fn is_attempt(&self) -> bool {
        self.data.is_some() || self.errors.is_some()
    }
}
