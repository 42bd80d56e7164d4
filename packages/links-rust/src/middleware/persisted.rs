//! Persisted-query middleware.
//!
//! Adds `extensions.persistedQuery = {"version": 1, "sha256Hash": ...}` and
//! sets `includeQuery: false` in the context so the transport may send only
//! the hash. If the server answers that it does not know the hash, the
//! operation is forwarded once more with `includeQuery: true`. A server that
//! reports persisted queries as unsupported disables hashing for the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use linkchain_core::{FetchObservable, FetchResult, Link, NextLink, Observable, Operation, RequestHandler};
use quick_cache::sync::Cache;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Context key telling the transport whether to send the full document.
pub const INCLUDE_QUERY_CONTEXT_KEY: &str = "includeQuery";

const PERSISTED_QUERY_VERSION: u64 = 1;
const NOT_FOUND_MESSAGE: &str = "PersistedQueryNotFound";
const NOT_FOUND_CODE: &str = "PERSISTED_QUERY_NOT_FOUND";
const NOT_SUPPORTED_MESSAGE: &str = "PersistedQueryNotSupported";
const NOT_SUPPORTED_CODE: &str = "PERSISTED_QUERY_NOT_SUPPORTED";

/// How a result relates to the persisted-query protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashOutcome {
    Accepted,
    NotFound,
    NotSupported,
}

fn classify(result: &FetchResult) -> HashOutcome {
    let Some(errors) = &result.errors else {
        return HashOutcome::Accepted;
    };
    let matches = |message: &str, code: &str| {
        errors.iter().any(|error| {
            error.get("message").and_then(Value::as_str) == Some(message)
                || error.pointer("/extensions/code").and_then(Value::as_str) == Some(code)
        })
    };
    if matches(NOT_SUPPORTED_MESSAGE, NOT_SUPPORTED_CODE) {
        HashOutcome::NotSupported
    } else if matches(NOT_FOUND_MESSAGE, NOT_FOUND_CODE) {
        HashOutcome::NotFound
    } else {
        HashOutcome::Accepted
    }
}

/// Middleware implementing automatic persisted queries.
#[derive(Clone)]
pub struct PersistedQueryLink {
    hashes: Arc<Cache<String, String>>,
    supported: Arc<AtomicBool>,
}

impl PersistedQueryLink {
    /// `capacity` bounds the number of document hashes kept.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            hashes: Arc::new(Cache::new(capacity)),
            supported: Arc::new(AtomicBool::new(true)),
        }
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("persisted-query")
    }

    /// Hex SHA-256 of the document's canonical form.
    #[must_use]
    pub fn hash_of(&self, operation: &Operation) -> String {
        let fingerprint = operation.query.fingerprint();
        if let Some(hash) = self.hashes.get(&fingerprint) {
            return hash;
        }
        let hash = hex::encode(Sha256::digest(fingerprint.as_bytes()));
        self.hashes.insert(fingerprint, hash.clone());
        hash
    }

    /// Whether hashes are still being sent.
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }
}

fn include_query(operation: &Operation, include: bool) {
    let mut patch = Map::new();
    patch.insert(INCLUDE_QUERY_CONTEXT_KEY.to_string(), Value::Bool(include));
    operation.set_context(patch);
}

impl RequestHandler for PersistedQueryLink {
    fn request(&self, mut operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let Some(forward) = forward else {
            return Observable::empty();
        };
        if !self.is_supported() {
            return forward.call(operation);
        }

        let hash = self.hash_of(&operation);
        operation.extensions.insert(
            "persistedQuery".to_string(),
            json!({ "version": PERSISTED_QUERY_VERSION, "sha256Hash": hash }),
        );
        include_query(&operation, false);

        let supported = Arc::clone(&self.supported);
        let retry_forward = forward.clone();
        let retry_operation = operation.clone();
        forward.call(operation).flat_map(move |result: FetchResult| {
            match classify(&result) {
                HashOutcome::Accepted => return Observable::of(result),
                HashOutcome::NotFound => {
                    debug!(operation = retry_operation.display_name(), "persisted query not found, sending document");
                }
                HashOutcome::NotSupported => {
                    if supported.swap(false, Ordering::SeqCst) {
                        warn!("server does not support persisted queries, disabling");
                    }
                }
            }
            let mut full = retry_operation.clone();
            if !supported.load(Ordering::SeqCst) {
                full.extensions.remove("persistedQuery");
            }
            include_query(&full, true);
            retry_forward.call(full)
        })
    }
}
