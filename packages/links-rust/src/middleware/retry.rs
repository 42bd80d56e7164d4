//! Retry middleware with exponential back-off.
//!
//! Re-subscribes to the rest of the chain after an error notification,
//! waiting [`RetryConfig::delay_for`] between attempts. Values already
//! emitted by a failed attempt are not retracted.

use std::sync::Arc;

use linkchain_core::{
    FetchObservable, FetchResult, Link, LinkError, NextLink, Notification, Observable, Operation, RequestHandler,
    Subscriber, Subscription, Teardown,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::RetryConfig;

type RetryPredicate = Arc<dyn Fn(&LinkError, u32, &Operation) -> bool + Send + Sync>;

/// Middleware that retries failed attempts.
pub struct RetryLink {
    config: RetryConfig,
    retry_if: RetryPredicate,
}

impl RetryLink {
    /// Retries every error until `config.max_attempts` is reached.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_if: Arc::new(|_, _, _| true),
        }
    }

    /// Only retries when `predicate(error, attempt, operation)` holds.
    #[must_use]
    pub fn retry_if(mut self, predicate: impl Fn(&LinkError, u32, &Operation) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Arc::new(predicate);
        self
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("retry")
    }
}

impl RequestHandler for RetryLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let Some(forward) = forward else {
            return Observable::error(LinkError::msg("retry link needs a following link"));
        };
        let config = self.config.clone();
        let retry_if = Arc::clone(&self.retry_if);
        Observable::new(move |subscriber: Subscriber<FetchResult>| {
            let run = Arc::new(RetryRun {
                operation: operation.clone(),
                forward: forward.clone(),
                subscriber,
                config: config.clone(),
                retry_if: Arc::clone(&retry_if),
                current: Mutex::new(None),
                timer: Mutex::new(None),
            });
            run.attempt(1);
            Teardown::new(move || run.cancel())
        })
    }
}

/// State of one subscription to a retry link.
struct RetryRun {
    operation: Operation,
    forward: NextLink,
    subscriber: Subscriber<FetchResult>,
    config: RetryConfig,
    retry_if: RetryPredicate,
    current: Mutex<Option<Subscription>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl RetryRun {
    fn attempt(self: &Arc<Self>, attempt: u32) {
        if self.subscriber.is_closed() {
            return;
        }
        let run = Arc::clone(self);
        let subscription = self
            .forward
            .call(self.operation.clone())
            .subscribe(move |notification: Notification<FetchResult>| match notification {
                Notification::Error(err) => run.on_error(err, attempt),
                other => run.subscriber.notify(other),
            });
        *self.current.lock() = Some(subscription);
        if self.subscriber.is_closed() {
            self.cancel();
        }
    }

    fn on_error(self: &Arc<Self>, err: LinkError, attempt: u32) {
        if attempt >= self.config.max_attempts || !(self.retry_if)(&err, attempt, &self.operation) {
            if attempt > 1 {
                warn!(
                    operation = self.operation.display_name(),
                    attempts = attempt,
                    error = %err,
                    "giving up after retries"
                );
            }
            self.subscriber.error(err);
            return;
        }

        let delay = self.config.delay_for(attempt);
        debug!(
            operation = self.operation.display_name(),
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err,
            "retrying operation"
        );
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(runtime_err) => {
                self.subscriber.error(LinkError::internal(runtime_err));
                return;
            }
        };
        let run = Arc::clone(self);
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            run.attempt(attempt + 1);
        });
        *self.timer.lock() = Some(task);
    }

    fn cancel(&self) {
        let timer = self.timer.lock().take();
        if let Some(timer) = timer {
            timer.abort();
        }
        let current = self.current.lock().take();
        if let Some(subscription) = current {
            subscription.unsubscribe();
        }
    }
}
