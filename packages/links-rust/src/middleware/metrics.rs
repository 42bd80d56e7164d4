//! Metrics middleware for operations.
//!
//! Records duration, result count and outcome on a `tracing` span per
//! subscription. Each operation also gets a `requestId` context entry so
//! later links can correlate their own logs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use linkchain_core::{
    FetchObservable, FetchResult, Link, NextLink, Notification, Observable, Operation, RequestHandler, Subscriber,
    Teardown,
};
use serde_json::{Map, Value};
use tracing::{info_span, Span};

/// Context key holding the request id assigned by [`MetricsLink`].
pub const REQUEST_ID_CONTEXT_KEY: &str = "requestId";

/// Middleware that instruments operations with timing and outcome via `tracing` spans.
#[derive(Debug, Clone, Default)]
pub struct MetricsLink;

impl MetricsLink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("metrics")
    }
}

impl RequestHandler for MetricsLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let request_id = match operation.context_value(REQUEST_ID_CONTEXT_KEY) {
            Some(Value::String(id)) => id,
            _ => {
                let id = uuid::Uuid::new_v4().to_string();
                let mut patch = Map::new();
                patch.insert(REQUEST_ID_CONTEXT_KEY.to_string(), Value::String(id.clone()));
                operation.set_context(patch);
                id
            }
        };
        let name = operation.display_name().to_string();

        let span = info_span!(
            "operation",
            operation = %name,
            request_id = %request_id,
            results = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let results = match forward {
            Some(forward) => span.in_scope(|| forward.call(operation)),
            None => Observable::empty(),
        };

        Observable::new(move |subscriber: Subscriber<FetchResult>| {
            let probe = Arc::new(Probe {
                span: span.clone(),
                start: Instant::now(),
                results: AtomicUsize::new(0),
                finished: AtomicBool::new(false),
            });
            let observed = Arc::clone(&probe);
            let inner = span.in_scope(|| {
                results.subscribe(move |notification: Notification<FetchResult>| {
                    match &notification {
                        Notification::Next(_) => {
                            observed.results.fetch_add(1, Ordering::Relaxed);
                        }
                        Notification::Error(_) => observed.finish("error"),
                        Notification::Complete => observed.finish("ok"),
                    }
                    subscriber.notify(notification);
                })
            });
            Teardown::from(inner).and(Teardown::new(move || probe.finish("cancelled")))
        })
    }
}

/// Per-subscription measurements.
struct Probe {
    span: Span,
    start: Instant,
    results: AtomicUsize,
    finished: AtomicBool,
}

impl Probe {
    fn finish(&self, outcome: &'static str) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let duration_ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let results = self.results.load(Ordering::Relaxed);
        self.span.record("duration_ms", duration_ms);
        self.span.record("outcome", outcome);
        self.span.record("results", results);

        let _entered = self.span.enter();
        tracing::info!(duration_ms, results, outcome, "operation complete");
    }
}
