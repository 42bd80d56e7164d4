//! Timeout middleware for operations.
//!
//! Errors with `LinkError::Timeout` when the rest of the chain has not
//! terminated in time. The limit is read from the operation's `timeoutMs`
//! context entry, falling back to the link's default.

use std::time::Duration;

use linkchain_core::{
    FetchObservable, FetchResult, Link, LinkError, NextLink, Notification, Observable, Operation, RequestHandler,
    Subscriber, Teardown,
};
use serde_json::Value;
use tracing::debug;

use crate::future::spawn_on_current;

/// Context key overriding the timeout for a single operation.
pub const TIMEOUT_CONTEXT_KEY: &str = "timeoutMs";

/// Middleware that enforces per-operation timeouts.
#[derive(Debug, Clone)]
pub struct TimeoutLink {
    default_timeout: Duration,
}

impl TimeoutLink {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("timeout")
    }

    fn timeout_for(&self, operation: &Operation) -> Duration {
        operation
            .context_value(TIMEOUT_CONTEXT_KEY)
            .as_ref()
            .and_then(Value::as_u64)
            .map_or(self.default_timeout, Duration::from_millis)
    }
}

impl RequestHandler for TimeoutLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let Some(forward) = forward else {
            return Observable::empty();
        };
        let timeout = self.timeout_for(&operation);
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let name = operation.display_name().to_string();
        let results = forward.call(operation);

        Observable::new(move |subscriber: Subscriber<FetchResult>| {
            let expiry = subscriber.clone();
            let name = name.clone();
            let timer = spawn_on_current(&subscriber, async move {
                tokio::time::sleep(timeout).await;
                debug!(operation = %name, timeout_ms, "operation timed out");
                expiry.error(LinkError::Timeout { timeout_ms });
            });
            if subscriber.is_closed() {
                return timer;
            }
            let relay = subscriber.clone();
            let inner = results.subscribe(move |notification: Notification<FetchResult>| relay.notify(notification));
            timer.and(Teardown::from(inner))
        })
    }
}
