//! The request object that flows through a chain, and its context side channel.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LinkError;

/// Variables keyed by name. Serialized with sorted keys.
pub type Variables = Map<String, Value>;

/// Transport metadata, passed through untouched by the engine.
pub type Extensions = Map<String, Value>;

/// A context record: the value read by [`Operation::get_context`].
pub type ContextMap = Map<String, Value>;

// ---------------------------------------------------------------------------
// QueryDocument
// ---------------------------------------------------------------------------

/// An already-parsed query document, shared by reference.
///
/// The AST is kept in its JSON shape (`{"kind": "Document", "definitions": [...]}`)
/// and is otherwise opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct QueryDocument(Arc<Value>);

impl QueryDocument {
    #[must_use]
    pub fn new(ast: Value) -> Self {
        Self(Arc::new(ast))
    }

    #[must_use]
    pub fn ast(&self) -> &Value {
        &self.0
    }

    /// Name of the first named operation definition, if any.
    #[must_use]
    pub fn operation_name(&self) -> Option<&str> {
        self.0
            .get("definitions")?
            .as_array()?
            .iter()
            .filter(|def| def.get("kind").and_then(Value::as_str) == Some("OperationDefinition"))
            .find_map(|def| def.get("name")?.get("value")?.as_str())
    }

    /// Canonical string form, stable across key insertion order.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        self.0.to_string()
    }
}

impl From<Value> for QueryDocument {
    fn from(ast: Value) -> Self {
        Self::new(ast)
    }
}

impl From<QueryDocument> for Value {
    fn from(document: QueryDocument) -> Self {
        Arc::unwrap_or_clone(document.0)
    }
}

// ---------------------------------------------------------------------------
// GraphQLRequest
// ---------------------------------------------------------------------------

/// Raw inputs to [`execute`](crate::execute::execute).
///
/// Only `query` is required. Unknown top-level keys are rejected when
/// deserializing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphQLRequest {
    pub query: QueryDocument,
    #[serde(default)]
    pub variables: Variables,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    #[serde(default)]
    pub extensions: Extensions,
    #[serde(default)]
    pub context: ContextMap,
}

impl GraphQLRequest {
    #[must_use]
    pub fn new(query: impl Into<QueryDocument>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            operation_name: None,
            extensions: Extensions::new(),
            context: ContextMap::new(),
        }
    }

    /// Parses a raw JSON request object.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::InvalidOperation`] when the value is not an
    /// object, lacks `query`, or carries keys other than `query`,
    /// `variables`, `operationName`, `extensions` and `context`.
    pub fn from_json(value: Value) -> Result<Self, LinkError> {
        serde_json::from_value(value).map_err(|err| LinkError::InvalidOperation {
            reason: err.to_string(),
        })
    }

    #[must_use]
    pub fn with_variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    #[must_use]
    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    #[must_use]
    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A write to the context: either a patch, or a function of the current
/// context that returns a patch. Both merge shallowly.
pub enum ContextUpdate {
    Patch(ContextMap),
    Transform(Box<dyn FnOnce(&ContextMap) -> ContextMap + Send>),
}

impl ContextUpdate {
    pub fn transform(f: impl FnOnce(&ContextMap) -> ContextMap + Send + 'static) -> Self {
        Self::Transform(Box::new(f))
    }
}

impl From<ContextMap> for ContextUpdate {
    fn from(patch: ContextMap) -> Self {
        Self::Patch(patch)
    }
}

impl fmt::Debug for ContextUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Patch(patch) => f.debug_tuple("Patch").field(patch).finish(),
            Self::Transform(_) => f.write_str("Transform(..)"),
        }
    }
}

/// The single context record of one execution, shared by every clone of
/// its [`Operation`].
#[derive(Clone, Default)]
struct SharedContext(Arc<RwLock<ContextMap>>);

impl SharedContext {
    fn new(initial: ContextMap) -> Self {
        Self(Arc::new(RwLock::new(initial)))
    }

    fn snapshot(&self) -> ContextMap {
        self.0.read().clone()
    }

    fn apply(&self, update: ContextUpdate) -> ContextMap {
        // The transform runs without the lock held so it may read the
        // operation's context itself.
        let patch = match update {
            ContextUpdate::Patch(patch) => patch,
            ContextUpdate::Transform(f) => f(&self.snapshot()),
        };
        let mut context = self.0.write();
        context.extend(patch);
        context.clone()
    }
}

// ---------------------------------------------------------------------------
// Operation
// ---------------------------------------------------------------------------

/// The request flowing through a chain.
///
/// `query`, `variables`, `operation_name` and `extensions` are the request
/// payload; a link may change its own copy before forwarding it. The
/// context is not part of the payload: every clone of an operation refers to
/// the same per-execution context.
#[derive(Clone)]
pub struct Operation {
    pub query: QueryDocument,
    pub variables: Variables,
    pub operation_name: Option<String>,
    pub extensions: Extensions,
    context: SharedContext,
}

impl Operation {
    /// Builds the operation for one execution, allocating its context.
    ///
    /// A missing `operation_name` defaults to the document's first named
    /// operation.
    #[must_use]
    pub fn from_request(request: GraphQLRequest) -> Self {
        let operation_name = request
            .operation_name
            .or_else(|| request.query.operation_name().map(str::to_string));
        Self {
            query: request.query,
            variables: request.variables,
            operation_name,
            extensions: request.extensions,
            context: SharedContext::new(request.context),
        }
    }

    /// Snapshot of the current context. Later writes do not affect it.
    #[must_use]
    pub fn get_context(&self) -> ContextMap {
        self.context.snapshot()
    }

    /// Shallow-merges `update` into the context and returns the result.
    pub fn set_context(&self, update: impl Into<ContextUpdate>) -> ContextMap {
        self.context.apply(update.into())
    }

    /// Shorthand for `set_context(ContextUpdate::transform(f))`.
    pub fn update_context(&self, f: impl FnOnce(&ContextMap) -> ContextMap + Send + 'static) -> ContextMap {
        self.context.apply(ContextUpdate::transform(f))
    }

    /// Reads a single context entry.
    #[must_use]
    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.context.0.read().get(key).cloned()
    }

    /// Stable fingerprint of query, variables and operation name.
    #[must_use]
    pub fn to_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.query.fingerprint(),
            Value::Object(self.variables.clone()),
            self.operation_name.as_deref().unwrap_or_default()
        )
    }

    /// Operation name for logs, `"anonymous"` when unnamed.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.operation_name.as_deref().unwrap_or("anonymous")
    }

    /// Whether `other` shares this operation's context instance.
    #[must_use]
    pub fn shares_context_with(&self, other: &Operation) -> bool {
        Arc::ptr_eq(&self.context.0, &other.context.0)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("operation_name", &self.operation_name)
            .field("variables", &self.variables)
            .field("extensions", &self.extensions)
            .field("context", &self.get_context())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn document(name: &str) -> QueryDocument {
        QueryDocument::new(json!({
            "kind": "Document",
            "definitions": [
                { "kind": "FragmentDefinition", "name": { "kind": "Name", "value": "Parts" } },
                { "kind": "OperationDefinition", "operation": "query",
                  "name": { "kind": "Name", "value": name } }
            ]
        }))
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn operation_name_defaults_to_document() {
        let op = Operation::from_request(GraphQLRequest::new(document("HeroQuery")));
        assert_eq!(op.operation_name.as_deref(), Some("HeroQuery"));
        assert_eq!(op.display_name(), "HeroQuery");
    }

    #[test]
    fn explicit_operation_name_wins() {
        let op = Operation::from_request(GraphQLRequest::new(document("HeroQuery")).with_operation_name("Other"));
        assert_eq!(op.operation_name.as_deref(), Some("Other"));
    }

    #[test]
    fn anonymous_document_has_no_name() {
        let op = Operation::from_request(GraphQLRequest::new(json!({"kind": "Document", "definitions": []})));
        assert!(op.operation_name.is_none());
        assert_eq!(op.display_name(), "anonymous");
    }

    #[test]
    fn initial_context_comes_from_request() {
        let request = GraphQLRequest::new(document("Q")).with_context(object(json!({"token": "abc"})));
        let op = Operation::from_request(request);
        assert_eq!(op.get_context(), object(json!({"token": "abc"})));
    }

    #[test]
    fn set_context_merges_shallowly() {
        let request = GraphQLRequest::new(document("Q")).with_context(object(json!({"a": 1, "nested": {"x": 1}})));
        let op = Operation::from_request(request);
        let merged = op.set_context(object(json!({"b": 2, "nested": {"y": 2}})));
        assert_eq!(merged, object(json!({"a": 1, "b": 2, "nested": {"y": 2}})));
    }

    #[test]
    fn update_context_sees_current_values() {
        let op = Operation::from_request(GraphQLRequest::new(document("Q")).with_context(object(json!({"count": 1}))));
        op.update_context(|ctx| {
            let next = ctx.get("count").and_then(Value::as_i64).unwrap_or(0) + 1;
            object(json!({ "count": next }))
        });
        assert_eq!(op.context_value("count"), Some(json!(2)));
    }

    #[test]
    fn snapshots_are_not_mutated_by_later_writes() {
        let op = Operation::from_request(GraphQLRequest::new(document("Q")));
        op.set_context(object(json!({"phase": "before"})));
        let snapshot = op.get_context();
        op.set_context(object(json!({"phase": "after"})));
        assert_eq!(snapshot.get("phase"), Some(&json!("before")));
        assert_eq!(op.context_value("phase"), Some(json!("after")));
    }

    #[test]
    fn clones_share_one_context() {
        let op = Operation::from_request(GraphQLRequest::new(document("Q")));
        let mut copy = op.clone();
        copy.variables.insert("changed".to_string(), json!(true));
        copy.set_context(object(json!({"seen": true})));
        assert!(op.shares_context_with(&copy));
        assert_eq!(op.context_value("seen"), Some(json!(true)));
        assert!(op.variables.is_empty());
    }

    #[test]
    fn separate_executions_get_separate_contexts() {
        let request = GraphQLRequest::new(document("Q"));
        let a = Operation::from_request(request.clone());
        let b = Operation::from_request(request);
        a.set_context(object(json!({"only": "a"})));
        assert!(!a.shares_context_with(&b));
        assert!(b.get_context().is_empty());
    }

    #[test]
    fn to_key_ignores_variable_insertion_order() {
        let mut first = Variables::new();
        first.insert("a".to_string(), json!(1));
        first.insert("b".to_string(), json!(2));
        let mut second = Variables::new();
        second.insert("b".to_string(), json!(2));
        second.insert("a".to_string(), json!(1));

        let a = Operation::from_request(GraphQLRequest::new(document("Q")).with_variables(first));
        let b = Operation::from_request(GraphQLRequest::new(document("Q")).with_variables(second));
        assert_eq!(a.to_key(), b.to_key());
    }

    #[test]
    fn to_key_distinguishes_variables_and_names() {
        let base = Operation::from_request(GraphQLRequest::new(document("Q")));
        let renamed = Operation::from_request(GraphQLRequest::new(document("Q")).with_operation_name("R"));
        let with_vars = Operation::from_request(
            GraphQLRequest::new(document("Q")).with_variables(object(json!({"id": 1}))),
        );
        assert_ne!(base.to_key(), renamed.to_key());
        assert_ne!(base.to_key(), with_vars.to_key());
    }

    #[test]
    fn to_key_ignores_context() {
        let a = Operation::from_request(GraphQLRequest::new(document("Q")));
        let b = Operation::from_request(GraphQLRequest::new(document("Q")).with_context(object(json!({"x": 1}))));
        assert_eq!(a.to_key(), b.to_key());
    }

    #[test]
    fn from_json_accepts_known_keys() {
        let request = GraphQLRequest::from_json(json!({
            "query": {"kind": "Document", "definitions": []},
            "variables": {"id": 5},
            "operationName": "Named",
            "extensions": {"persistedQuery": {"version": 1}},
            "context": {"headers": {}}
        }))
        .unwrap();
        assert_eq!(request.operation_name.as_deref(), Some("Named"));
        assert_eq!(request.variables.get("id"), Some(&json!(5)));
    }

    #[test]
    fn from_json_rejects_unknown_keys() {
        let err = GraphQLRequest::from_json(json!({
            "query": {"kind": "Document", "definitions": []},
            "qeury": "typo"
        }))
        .unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation { ref reason } if reason.contains("qeury")));
    }

    #[test]
    fn from_json_requires_query() {
        let err = GraphQLRequest::from_json(json!({"variables": {}})).unwrap_err();
        assert!(matches!(err, LinkError::InvalidOperation { .. }));
    }
}
