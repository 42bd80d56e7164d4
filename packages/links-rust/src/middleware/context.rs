//! Context-setting middleware.
//!
//! Merges a computed patch into the operation's context before forwarding.
//! The patch may be computed synchronously or by a future (e.g. a token
//! fetch); in the async case forwarding waits for the future to resolve.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use linkchain_core::{
    ContextMap, FetchObservable, FetchResult, Link, LinkError, NextLink, Notification, Observable, Operation,
    RequestHandler, Subscriber, Subscription, Teardown,
};
use parking_lot::Mutex;

use crate::future::spawn_on_current;

type SyncSetter = Arc<dyn Fn(&Operation, &ContextMap) -> ContextMap + Send + Sync>;
type AsyncSetter = Arc<dyn Fn(Operation, ContextMap) -> BoxFuture<'static, Result<ContextMap, LinkError>> + Send + Sync>;

enum Setter {
    Sync(SyncSetter),
    Async(AsyncSetter),
}

/// Middleware that patches the context, then forwards.
pub struct SetContextLink {
    setter: Setter,
}

impl SetContextLink {
    /// `setter` receives the operation and its current context and returns
    /// the entries to merge.
    #[must_use]
    pub fn new(setter: impl Fn(&Operation, &ContextMap) -> ContextMap + Send + Sync + 'static) -> Self {
        Self {
            setter: Setter::Sync(Arc::new(setter)),
        }
    }

    /// Like [`SetContextLink::new`], but the patch comes from a future.
    ///
    /// The future runs once per subscription. If it fails, the error is
    /// delivered downstream and the operation is not forwarded.
    #[must_use]
    pub fn new_async<F, Fut>(setter: F) -> Self
    where
        F: Fn(Operation, ContextMap) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ContextMap, LinkError>> + Send + 'static,
    {
        Self {
            setter: Setter::Async(Arc::new(
                move |operation: Operation, context: ContextMap| -> BoxFuture<'static, Result<ContextMap, LinkError>> {
                    Box::pin(setter(operation, context))
                },
            )),
        }
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("set-context")
    }
}

impl RequestHandler for SetContextLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        match &self.setter {
            Setter::Sync(setter) => {
                let patch = setter(&operation, &operation.get_context());
                operation.set_context(patch);
                match forward {
                    Some(forward) => forward.call(operation),
                    None => Observable::empty(),
                }
            }
            Setter::Async(setter) => {
                let setter = Arc::clone(setter);
                Observable::new(move |subscriber: Subscriber<FetchResult>| {
                    let inner: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
                    let slot = Arc::clone(&inner);
                    let pending = setter(operation.clone(), operation.get_context());
                    let operation = operation.clone();
                    let forward = forward.clone();
                    let downstream = subscriber.clone();
                    let task = spawn_on_current(&subscriber, async move {
                        let patch = match pending.await {
                            Ok(patch) => patch,
                            Err(err) => {
                                downstream.error(err);
                                return;
                            }
                        };
                        if downstream.is_closed() {
                            return;
                        }
                        operation.set_context(patch);
                        let Some(forward) = forward else {
                            downstream.complete();
                            return;
                        };
                        let relay = downstream.clone();
                        let subscription = forward
                            .call(operation)
                            .subscribe(move |notification: Notification<FetchResult>| relay.notify(notification));
                        *slot.lock() = Some(subscription);
                        if downstream.is_closed() {
                            let stale = slot.lock().take();
                            if let Some(subscription) = stale {
                                subscription.unsubscribe();
                            }
                        }
                    });
                    task.and(Teardown::new(move || {
                        let live = inner.lock().take();
                        if let Some(subscription) = live {
                            subscription.unsubscribe();
                        }
                    }))
                })
            }
        }
    }
}

/// Shorthand for `SetContextLink::new(setter).into_link()`.
#[must_use]
pub fn set_context(setter: impl Fn(&Operation, &ContextMap) -> ContextMap + Send + Sync + 'static) -> Link {
    SetContextLink::new(setter).into_link()
}
