//! Error-inspection middleware.
//!
//! Calls a handler for every result carrying GraphQL errors and for every
//! error notification. The handler may edit the result, or return a new
//! observable (typically `forward.call(operation)`) to retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use linkchain_core::{
    FetchObservable, FetchResult, Link, LinkError, NextLink, Notification, Observable, Operation, RequestHandler,
    Subscriber, Subscription, Teardown,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

/// What the error handler sees.
#[derive(Debug)]
pub struct ErrorResponse {
    /// Error entries of the result, if the result carried any.
    pub graphql_errors: Option<Vec<Value>>,
    /// The error notification, if the stream errored.
    pub network_error: Option<LinkError>,
    /// The result being inspected. Set to `None` to drop it, or edit it in
    /// place to change what is emitted.
    pub response: Option<FetchResult>,
    pub operation: Operation,
    pub forward: NextLink,
}

type Handler = Arc<dyn Fn(&mut ErrorResponse) -> Option<FetchObservable> + Send + Sync>;

/// Middleware that routes errors through a handler.
///
/// When the handler returns an observable, the remaining notifications of the
/// original stream (other than its completion) are still relayed and the
/// downstream completes when the replacement does. A network error the
/// handler does not replace is delivered unchanged.
pub struct ErrorLink {
    handler: Handler,
}

impl ErrorLink {
    #[must_use]
    pub fn new(handler: impl Fn(&mut ErrorResponse) -> Option<FetchObservable> + Send + Sync + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("on-error")
    }
}

impl RequestHandler for ErrorLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let Some(forward) = forward else {
            return Observable::error(LinkError::msg("on-error link needs a following link"));
        };
        let handler = Arc::clone(&self.handler);
        Observable::new(move |subscriber: Subscriber<FetchResult>| {
            let retrying = Arc::new(AtomicBool::new(false));
            let retried: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
            let run = ErrorRun {
                handler: Arc::clone(&handler),
                operation: operation.clone(),
                forward: forward.clone(),
                subscriber: subscriber.clone(),
                retrying: Arc::clone(&retrying),
                retried: Arc::clone(&retried),
            };
            let primary = forward
                .call(operation.clone())
                .subscribe(move |notification: Notification<FetchResult>| run.on_notification(notification));
            Teardown::from(primary).and(Teardown::new(move || {
                let replacement = retried.lock().take();
                if let Some(subscription) = replacement {
                    subscription.unsubscribe();
                }
            }))
        })
    }
}

struct ErrorRun {
    handler: Handler,
    operation: Operation,
    forward: NextLink,
    subscriber: Subscriber<FetchResult>,
    retrying: Arc<AtomicBool>,
    retried: Arc<Mutex<Option<Subscription>>>,
}

impl ErrorRun {
    fn on_notification(&self, notification: Notification<FetchResult>) {
        match notification {
            Notification::Next(result) if result.has_errors() => {
                let mut response = self.response(result.errors.clone(), None, Some(result));
                if let Some(replacement) = (self.handler)(&mut response) {
                    self.switch_to(replacement);
                } else if let Some(result) = response.response {
                    self.subscriber.next(result);
                }
            }
            Notification::Next(result) => self.subscriber.next(result),
            Notification::Error(err) => {
                let mut response = self.response(None, Some(err.clone()), None);
                match (self.handler)(&mut response) {
                    Some(replacement) => self.switch_to(replacement),
                    None => self.subscriber.error(err),
                }
            }
            Notification::Complete => {
                if !self.retrying.load(Ordering::SeqCst) {
                    self.subscriber.complete();
                }
            }
        }
    }

    fn response(
        &self,
        graphql_errors: Option<Vec<Value>>,
        network_error: Option<LinkError>,
        response: Option<FetchResult>,
    ) -> ErrorResponse {
        ErrorResponse {
            graphql_errors,
            network_error,
            response,
            operation: self.operation.clone(),
            forward: self.forward.clone(),
        }
    }

    fn switch_to(&self, replacement: FetchObservable) {
        if self.subscriber.is_closed() {
            return;
        }
        debug!(operation = self.operation.display_name(), "error handler replaced the result stream");
        self.retrying.store(true, Ordering::SeqCst);
        let relay = self.subscriber.clone();
        let subscription = replacement.subscribe(move |notification: Notification<FetchResult>| relay.notify(notification));
        let previous = self.retried.lock().replace(subscription);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }
    }
}

/// Shorthand for `ErrorLink::new(handler).into_link()`.
#[must_use]
pub fn on_error(handler: impl Fn(&mut ErrorResponse) -> Option<FetchObservable> + Send + Sync + 'static) -> Link {
    ErrorLink::new(handler).into_link()
}
