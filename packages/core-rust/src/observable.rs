//! Minimal lazy push-stream used to deliver link results.
//!
//! An [`Observable`] captures a producer function. Nothing runs until
//! [`Observable::subscribe`] is called; every subscription runs the producer
//! again with a fresh [`Subscriber`]. The producer returns a [`Teardown`]
//! that releases its resources when the subscription ends, whether by
//! completion, error, or [`Subscription::unsubscribe`].
//!
//! # Notification contract
//!
//! A subscriber receives zero or more `Next` notifications followed by at
//! most one terminal notification (`Error` or `Complete`). After a terminal
//! notification or an unsubscribe, every further notification is dropped.
//! Notifications for one subscriber must be issued sequentially and never
//! re-entrantly from inside that subscriber's own observer.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{catch_panic, LinkError};

// ---------------------------------------------------------------------------
// Notification / Observer
// ---------------------------------------------------------------------------

/// A single signal pushed from a producer to an observer.
#[derive(Debug, Clone)]
pub enum Notification<T> {
    Next(T),
    Error(LinkError),
    Complete,
}

/// Receiver side of a subscription.
///
/// Implemented for every `FnMut(Notification<T>)` closure, which is how all
/// operators in this module subscribe upstream.
pub trait Observer<T>: Send {
    fn notify(&mut self, notification: Notification<T>);
}

impl<T, F> Observer<T> for F
where
    F: FnMut(Notification<T>) + Send,
{
    fn notify(&mut self, notification: Notification<T>) {
        self(notification);
    }
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

/// Cleanup returned by a producer, run exactly once when its subscription ends.
#[must_use = "dropping a Teardown without returning it skips the producer's cleanup"]
pub struct Teardown(Option<Box<dyn FnOnce() + Send>>);

impl Teardown {
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cleanup)))
    }

    /// Teardown with nothing to release.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Unsubscribes every subscription in `subscriptions`.
    pub fn all(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let subscriptions: Vec<Subscription> = subscriptions.into_iter().collect();
        Self::new(move || {
            for subscription in subscriptions {
                subscription.unsubscribe();
            }
        })
    }

    /// Runs `self`, then `next`.
    pub fn and(self, next: Teardown) -> Self {
        Self::new(move || {
            self.run();
            next.run();
        })
    }

    fn run(mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::noop()
    }
}

impl From<Subscription> for Teardown {
    fn from(subscription: Subscription) -> Self {
        Self::new(move || subscription.unsubscribe())
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Teardown").field(&self.0.is_some()).finish()
    }
}

// ---------------------------------------------------------------------------
// Subscriber / Subscription
// ---------------------------------------------------------------------------

struct SubscriberState<T> {
    closed: AtomicBool,
    observer: Mutex<Option<Box<dyn Observer<T>>>>,
    cleanup: Mutex<Option<Teardown>>,
}

impl<T> SubscriberState<T> {
    fn run_cleanup(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            cleanup.run();
        }
    }

    fn attach_cleanup(&self, teardown: Teardown) {
        if self.closed.load(Ordering::SeqCst) {
            teardown.run();
            return;
        }
        *self.cleanup.lock() = Some(teardown);
        // The subscription may have closed between the check and the store.
        if self.closed.load(Ordering::SeqCst) {
            self.run_cleanup();
        }
    }

    fn terminate(&self, notification: Notification<T>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let observer = self.observer.lock().take();
        if let Some(mut observer) = observer {
            observer.notify(notification);
        }
        self.run_cleanup();
    }
}

trait Closeable: Send + Sync {
    fn close(&self);
    fn is_closed(&self) -> bool;
}

impl<T> Closeable for SubscriberState<T> {
    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // The observer may be mid-delivery on this thread (an operator
        // cancelling its own upstream), so only drop it when uncontended.
        if let Some(mut slot) = self.observer.try_lock() {
            slot.take();
        }
        self.run_cleanup();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Producer-side handle used to push notifications to one subscription.
pub struct Subscriber<T> {
    state: Arc<SubscriberState<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Send + 'static> Subscriber<T> {
    fn new(observer: Box<dyn Observer<T>>) -> Self {
        Self {
            state: Arc::new(SubscriberState {
                closed: AtomicBool::new(false),
                observer: Mutex::new(Some(observer)),
                cleanup: Mutex::new(None),
            }),
        }
    }

    /// Delivers a value unless the subscription has already ended.
    pub fn next(&self, value: T) {
        if self.state.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut slot = self.state.observer.lock();
        if let Some(observer) = slot.as_mut() {
            observer.notify(Notification::Next(value));
        }
    }

    /// Ends the subscription with an error.
    pub fn error(&self, err: LinkError) {
        self.state.terminate(Notification::Error(err));
    }

    /// Ends the subscription successfully.
    pub fn complete(&self) {
        self.state.terminate(Notification::Complete);
    }

    /// Routes any notification to the matching method.
    pub fn notify(&self, notification: Notification<T>) {
        match notification {
            Notification::Next(value) => self.next(value),
            Notification::Error(err) => self.error(err),
            Notification::Complete => self.complete(),
        }
    }

    /// Whether the subscription has terminated or been cancelled.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            state: Arc::clone(&self.state) as Arc<dyn Closeable>,
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("closed", &self.state.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Consumer-side handle used to cancel a subscription.
///
/// Dropping a `Subscription` does not cancel it; call
/// [`Subscription::unsubscribe`].
#[derive(Clone)]
pub struct Subscription {
    state: Arc<dyn Closeable>,
}

impl Subscription {
    /// Stops delivery and runs the producer's teardown. Idempotent.
    pub fn unsubscribe(&self) {
        self.state.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Observable
// ---------------------------------------------------------------------------

type Producer<T> = dyn Fn(Subscriber<T>) -> Teardown + Send + Sync;

/// Lazy, cancellable, push-based stream of `T` values.
pub struct Observable<T> {
    producer: Arc<Producer<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            producer: Arc::clone(&self.producer),
        }
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable").finish_non_exhaustive()
    }
}

impl<T: Send + 'static> Observable<T> {
    /// Creates an observable from a producer run once per subscription.
    #[must_use]
    pub fn new<F>(producer: F) -> Self
    where
        F: Fn(Subscriber<T>) -> Teardown + Send + Sync + 'static,
    {
        Self {
            producer: Arc::new(producer),
        }
    }

    /// Emits one value, then completes.
    #[must_use]
    pub fn of(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::new(move |subscriber| {
            subscriber.next(value.clone());
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Emits each value in order, then completes.
    #[must_use]
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Clone + Sync,
    {
        let values: Arc<[T]> = values.into_iter().collect();
        Self::new(move |subscriber| {
            for value in values.iter() {
                if subscriber.is_closed() {
                    return Teardown::noop();
                }
                subscriber.next(value.clone());
            }
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Completes immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(|subscriber| {
            subscriber.complete();
            Teardown::noop()
        })
    }

    /// Never emits and never terminates.
    #[must_use]
    pub fn never() -> Self {
        Self::new(|_| Teardown::noop())
    }

    /// Errors immediately.
    #[must_use]
    pub fn error(err: LinkError) -> Self {
        Self::new(move |subscriber| {
            subscriber.error(err.clone());
            Teardown::noop()
        })
    }

    /// Runs the producer for a new, independent subscription.
    ///
    /// A panic raised by the producer is delivered to `observer` as
    /// [`LinkError::Panicked`].
    pub fn subscribe(&self, observer: impl Observer<T> + 'static) -> Subscription {
        let subscriber = Subscriber::new(Box::new(observer));
        let producer = Arc::clone(&self.producer);
        let handle = subscriber.clone();
        let teardown = match catch_panic(move || producer(handle)) {
            Ok(teardown) => teardown,
            Err(err) => {
                subscriber.error(err);
                Teardown::noop()
            }
        };
        subscriber.state.attach_cleanup(teardown);
        subscriber.subscription()
    }

    /// Subscribes with separate callbacks for each notification kind.
    pub fn subscribe_with<N, E, C>(&self, mut next: N, mut error: E, mut complete: C) -> Subscription
    where
        N: FnMut(T) + Send + 'static,
        E: FnMut(LinkError) + Send + 'static,
        C: FnMut() + Send + 'static,
    {
        self.subscribe(move |notification: Notification<T>| match notification {
            Notification::Next(value) => next(value),
            Notification::Error(err) => error(err),
            Notification::Complete => complete(),
        })
    }

    /// Subscribes to values only; an error is logged rather than dropped.
    pub fn subscribe_next(&self, next: impl FnMut(T) + Send + 'static) -> Subscription {
        self.subscribe_with(
            next,
            |err| warn!(error = %err, "unhandled error in observable stream"),
            || {},
        )
    }

    /// Transforms each value.
    pub fn map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> U + Send + Sync + 'static,
    {
        self.try_map(move |value| Ok(f(value)))
    }

    /// Transforms each value; an `Err` ends the stream with that error.
    pub fn try_map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Result<U, LinkError> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream: Subscriber<U>| {
            let f = Arc::clone(&f);
            let subscription = source.subscribe(move |notification: Notification<T>| {
                match notification {
                    Notification::Next(value) => match catch_panic(|| f(value)).and_then(|r| r) {
                        Ok(mapped) => downstream.next(mapped),
                        Err(err) => downstream.error(err),
                    },
                    Notification::Error(err) => downstream.error(err),
                    Notification::Complete => downstream.complete(),
                }
            });
            Teardown::from(subscription)
        })
    }

    /// Drops values for which `predicate` returns false.
    pub fn filter<P>(&self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Observable::new(move |downstream: Subscriber<T>| {
            let predicate = Arc::clone(&predicate);
            let subscription = source.subscribe(move |notification: Notification<T>| {
                match notification {
                    Notification::Next(value) => match catch_panic(|| predicate(&value)) {
                        Ok(true) => downstream.next(value),
                        Ok(false) => {}
                        Err(err) => downstream.error(err),
                    },
                    other => downstream.notify(other),
                }
            });
            Teardown::from(subscription)
        })
    }

    /// Calls `f` for every notification without altering the stream.
    pub fn inspect<F>(&self, f: F) -> Self
    where
        F: Fn(&Notification<T>) + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream: Subscriber<T>| {
            let f = Arc::clone(&f);
            let subscription = source.subscribe(move |notification: Notification<T>| {
                match catch_panic(|| f(&notification)) {
                    Ok(()) => downstream.notify(notification),
                    Err(err) => downstream.error(err),
                }
            });
            Teardown::from(subscription)
        })
    }

    /// Maps each value to an inner observable and merges their notifications.
    ///
    /// Completes once the source and every inner observable have completed.
    /// The first error from any of them ends the stream and cancels the rest.
    pub fn flat_map<U, F>(&self, f: F) -> Observable<U>
    where
        U: Send + 'static,
        F: Fn(T) -> Observable<U> + Send + Sync + 'static,
    {
        let source = self.clone();
        let f = Arc::new(f);
        Observable::new(move |downstream: Subscriber<U>| {
            let f = Arc::clone(&f);
            // One slot for the outer source plus one per live inner stream.
            let active = Arc::new(AtomicUsize::new(1));
            // Inner streams still running, keyed by spawn order. Each removes
            // itself when it terminates.
            let inners: Arc<Mutex<HashMap<u64, Subscription>>> = Arc::new(Mutex::new(HashMap::new()));

            let outer_active = Arc::clone(&active);
            let outer_inners = Arc::clone(&inners);
            let mut next_inner: u64 = 0;
            let outer = source.subscribe(move |notification: Notification<T>| match notification {
                Notification::Next(value) => {
                    if downstream.is_closed() {
                        return;
                    }
                    let inner = match catch_panic(|| f(value)) {
                        Ok(inner) => inner,
                        Err(err) => {
                            downstream.error(err);
                            return;
                        }
                    };
                    let id = next_inner;
                    next_inner += 1;
                    outer_active.fetch_add(1, Ordering::SeqCst);
                    let inner_downstream = downstream.clone();
                    let inner_active = Arc::clone(&outer_active);
                    let finished = Arc::clone(&outer_inners);
                    let subscription = inner.subscribe(move |notification: Notification<U>| match notification {
                        Notification::Next(value) => inner_downstream.next(value),
                        Notification::Error(err) => {
                            finished.lock().remove(&id);
                            inner_downstream.error(err);
                        }
                        Notification::Complete => {
                            finished.lock().remove(&id);
                            if inner_active.fetch_sub(1, Ordering::SeqCst) == 1 {
                                inner_downstream.complete();
                            }
                        }
                    });
                    // A subscription is closed before its observer sees the
                    // terminal notification, so checking under the lock
                    // cannot leave a finished inner behind.
                    {
                        let mut live = outer_inners.lock();
                        if !subscription.is_closed() {
                            live.insert(id, subscription.clone());
                        }
                    }
                    // Teardown may have drained the map before the insert.
                    if downstream.is_closed() {
                        subscription.unsubscribe();
                    }
                }
                Notification::Error(err) => downstream.error(err),
                Notification::Complete => {
                    if outer_active.fetch_sub(1, Ordering::SeqCst) == 1 {
                        downstream.complete();
                    }
                }
            });

            Teardown::new(move || {
                outer.unsubscribe();
                let live = std::mem::take(&mut *inners.lock());
                Teardown::all(live.into_values()).run();
            })
        })
    }

    /// Replaces an error with the observable returned by `handler`.
    pub fn catch_error<F>(&self, handler: F) -> Self
    where
        F: Fn(LinkError) -> Observable<T> + Send + Sync + 'static,
    {
        let source = self.clone();
        let handler = Arc::new(handler);
        Observable::new(move |downstream: Subscriber<T>| {
            let handler = Arc::clone(&handler);
            let fallback: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
            let fallback_slot = Arc::clone(&fallback);
            let primary = source.subscribe(move |notification: Notification<T>| match notification {
                Notification::Error(err) => {
                    let replacement = match catch_panic(|| handler(err)) {
                        Ok(replacement) => replacement,
                        Err(panic) => {
                            downstream.error(panic);
                            return;
                        }
                    };
                    if downstream.is_closed() {
                        return;
                    }
                    let relay = downstream.clone();
                    let subscription =
                        replacement.subscribe(move |notification: Notification<T>| relay.notify(notification));
                    *fallback_slot.lock() = Some(subscription);
                }
                other => downstream.notify(other),
            });
            Teardown::new(move || {
                primary.unsubscribe();
                let replacement = fallback.lock().take();
                if let Some(subscription) = replacement {
                    subscription.unsubscribe();
                }
            })
        })
    }

    /// Merges the notifications of several observables into one stream.
    ///
    /// All sources are subscribed at once. An empty list completes
    /// immediately.
    pub fn merge(sources: impl IntoIterator<Item = Observable<T>>) -> Self {
        Observable::from_values(sources).flat_map(|source| source)
    }

    /// Adapts the observable into a [`Stream`]; dropping the stream unsubscribes.
    #[must_use]
    pub fn into_stream(self) -> ObservableStream<T> {
        let shared = Arc::new(StreamShared {
            queue: Mutex::new(VecDeque::new()),
            done: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        let sink = Arc::clone(&shared);
        let subscription = self.subscribe(move |notification: Notification<T>| {
            match notification {
                Notification::Next(value) => sink.queue.lock().push_back(Ok(value)),
                Notification::Error(err) => {
                    sink.queue.lock().push_back(Err(err));
                    sink.done.store(true, Ordering::SeqCst);
                }
                Notification::Complete => sink.done.store(true, Ordering::SeqCst),
            }
            sink.waker.wake();
        });
        ObservableStream {
            shared,
            subscription,
        }
    }

    /// Resolves with the first value, or `None` if the stream completes empty.
    ///
    /// # Errors
    ///
    /// Returns the stream's error if it fails before emitting.
    pub async fn first(&self) -> Result<Option<T>, LinkError> {
        let mut stream = self.clone().into_stream();
        stream.next().await.transpose()
    }

    /// Resolves with every value once the stream completes.
    ///
    /// # Errors
    ///
    /// Returns the stream's error; values emitted before it are discarded.
    pub async fn collect(&self) -> Result<Vec<T>, LinkError> {
        let mut stream = self.clone().into_stream();
        let mut values = Vec::new();
        while let Some(item) = stream.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// ObservableStream
// ---------------------------------------------------------------------------

struct StreamShared<T> {
    queue: Mutex<VecDeque<Result<T, LinkError>>>,
    done: AtomicBool,
    waker: AtomicWaker,
}

/// [`Stream`] view over a subscription, produced by [`Observable::into_stream`].
///
/// Yields `Ok` per value and a final `Err` if the observable errors.
pub struct ObservableStream<T> {
    shared: Arc<StreamShared<T>>,
    subscription: Subscription,
}

impl<T> Stream for ObservableStream<T> {
    type Item = Result<T, LinkError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.shared.waker.register(cx.waker());
        if let Some(item) = self.shared.queue.lock().pop_front() {
            return Poll::Ready(Some(item));
        }
        if self.shared.done.load(Ordering::SeqCst) {
            // A value may have been queued right before `done` was set.
            return Poll::Ready(self.shared.queue.lock().pop_front());
        }
        Poll::Pending
    }
}

impl<T> Drop for ObservableStream<T> {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl<T> fmt::Debug for ObservableStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservableStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Records every notification as a readable string.
    fn record<T: fmt::Debug + Send + 'static>(
        observable: &Observable<T>,
    ) -> (Arc<Mutex<Vec<String>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let subscription = observable.subscribe(move |notification: Notification<T>| {
            sink.lock().push(match notification {
                Notification::Next(value) => format!("next:{value:?}"),
                Notification::Error(err) => format!("error:{err}"),
                Notification::Complete => "complete".to_string(),
            });
        });
        (log, subscription)
    }

    /// Producer whose emissions are driven manually by the test.
    fn manual<T: Send + 'static>() -> (Observable<T>, Arc<Mutex<Option<Subscriber<T>>>>, Arc<AtomicBool>) {
        let slot: Arc<Mutex<Option<Subscriber<T>>>> = Arc::new(Mutex::new(None));
        let cleaned = Arc::new(AtomicBool::new(false));
        let producer_slot = Arc::clone(&slot);
        let producer_cleaned = Arc::clone(&cleaned);
        let observable = Observable::new(move |subscriber| {
            *producer_slot.lock() = Some(subscriber);
            let cleaned = Arc::clone(&producer_cleaned);
            Teardown::new(move || cleaned.store(true, Ordering::SeqCst))
        });
        (observable, slot, cleaned)
    }

    #[test]
    fn producer_runs_once_per_subscription() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let observable = Observable::new(move |subscriber: Subscriber<u32>| {
            counter.fetch_add(1, Ordering::SeqCst);
            subscriber.next(1);
            subscriber.complete();
            Teardown::noop()
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let (first, _) = record(&observable);
        let (second, _) = record(&observable);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(*first.lock(), vec!["next:1", "complete"]);
        assert_eq!(*second.lock(), vec!["next:1", "complete"]);
    }

    #[test]
    fn notifications_after_terminal_are_dropped() {
        let observable = Observable::new(|subscriber: Subscriber<u32>| {
            subscriber.next(1);
            subscriber.complete();
            subscriber.next(2);
            subscriber.error(LinkError::msg("late"));
            subscriber.complete();
            Teardown::noop()
        });
        let (log, subscription) = record(&observable);
        assert_eq!(*log.lock(), vec!["next:1", "complete"]);
        assert!(subscription.is_closed());
    }

    #[test]
    fn synchronous_completion_runs_teardown() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cleaned);
        let observable = Observable::new(move |subscriber: Subscriber<u32>| {
            subscriber.complete();
            let flag = Arc::clone(&flag);
            Teardown::new(move || flag.store(true, Ordering::SeqCst))
        });
        let _ = record(&observable);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn chained_teardowns_run_in_order_once() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&order), Arc::clone(&order));
        let observable = Observable::new(move |_: Subscriber<u32>| {
            let (first, second) = (Arc::clone(&first), Arc::clone(&second));
            Teardown::new(move || first.lock().push("timer")).and(Teardown::new(move || second.lock().push("inner")))
        });
        let (_, subscription) = record(&observable);
        subscription.unsubscribe();
        subscription.unsubscribe();
        assert_eq!(*order.lock(), vec!["timer", "inner"]);
    }

    #[test]
    fn unsubscribe_runs_teardown_and_silences_producer() {
        let (observable, slot, cleaned) = manual::<u32>();
        let (log, subscription) = record(&observable);

        subscription.unsubscribe();
        subscription.unsubscribe();
        assert!(cleaned.load(Ordering::SeqCst));

        let subscriber = slot.lock().take().unwrap();
        subscriber.next(1);
        subscriber.complete();
        assert!(log.lock().is_empty());
    }

    #[test]
    fn producer_panic_becomes_error() {
        let observable = Observable::new(|_: Subscriber<u32>| -> Teardown { panic!("producer exploded") });
        let (log, _) = record(&observable);
        assert_eq!(*log.lock(), vec!["error:link panicked: producer exploded"]);
    }

    #[test]
    fn map_and_filter_transform_lazily() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let derived = Observable::from_values(vec![1, 2, 3, 4])
            .map(move |v| {
                counter.fetch_add(1, Ordering::SeqCst);
                v * 10
            })
            .filter(|v| *v != 20);
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        let (log, _) = record(&derived);
        assert_eq!(*log.lock(), vec!["next:10", "next:30", "next:40", "complete"]);
    }

    #[test]
    fn map_panic_errors_and_cancels_upstream() {
        let (source, slot, cleaned) = manual::<u32>();
        let derived = source.map(|v| if v == 2 { panic!("bad value") } else { v });
        let (log, _) = record(&derived);

        let subscriber = slot.lock().clone().unwrap();
        subscriber.next(1);
        subscriber.next(2);
        subscriber.next(3);
        assert_eq!(*log.lock(), vec!["next:1", "error:link panicked: bad value"]);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn try_map_error_terminates() {
        let derived = Observable::from_values(vec![1, 2, 3]).try_map(|v| {
            if v < 2 {
                Ok(v)
            } else {
                Err(LinkError::msg("too big"))
            }
        });
        let (log, _) = record(&derived);
        assert_eq!(*log.lock(), vec!["next:1", "error:internal error: too big"]);
    }

    #[test]
    fn unsubscribe_propagates_through_operators() {
        let (source, _slot, cleaned) = manual::<u32>();
        let derived = source.map(|v| v + 1).filter(|_| true).inspect(|_| {});
        let (_, subscription) = record(&derived);
        assert!(!cleaned.load(Ordering::SeqCst));
        subscription.unsubscribe();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn flat_map_completes_after_all_inners() {
        let (inner, slot, _) = manual::<u32>();
        let derived = Observable::from_values(vec![1u32, 2]).flat_map(move |v| {
            if v == 1 {
                inner.clone()
            } else {
                Observable::of(v * 100)
            }
        });
        let (log, _) = record(&derived);
        assert_eq!(*log.lock(), vec!["next:200"]);

        let subscriber = slot.lock().clone().unwrap();
        subscriber.next(7);
        subscriber.complete();
        assert_eq!(*log.lock(), vec!["next:200", "next:7", "complete"]);
    }

    #[test]
    fn merge_cancels_every_source_on_unsubscribe() {
        let (a, _, a_cleaned) = manual::<u32>();
        let (b, _, b_cleaned) = manual::<u32>();
        let merged = Observable::merge(vec![a, b]);
        let (_, subscription) = record(&merged);
        subscription.unsubscribe();
        assert!(a_cleaned.load(Ordering::SeqCst));
        assert!(b_cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn merge_errors_cancel_siblings() {
        let (pending, _, cleaned) = manual::<u32>();
        let merged = Observable::merge(vec![pending, Observable::error(LinkError::msg("down"))]);
        let (log, _) = record(&merged);
        assert_eq!(*log.lock(), vec!["error:internal error: down"]);
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn flat_map_releases_finished_inners() {
        let (source, outer, outer_cleaned) = manual::<u32>();
        let pending: Arc<Mutex<Vec<Subscriber<u32>>>> = Arc::new(Mutex::new(Vec::new()));
        let tracked: Arc<Mutex<Vec<std::sync::Weak<SubscriberState<u32>>>>> = Arc::new(Mutex::new(Vec::new()));
        let (inner_pending, inner_tracked) = (Arc::clone(&pending), Arc::clone(&tracked));
        let derived = source.flat_map(move |v| {
            let pending = Arc::clone(&inner_pending);
            let tracked = Arc::clone(&inner_tracked);
            Observable::new(move |subscriber: Subscriber<u32>| {
                tracked.lock().push(Arc::downgrade(&subscriber.state));
                subscriber.next(v);
                pending.lock().push(subscriber);
                Teardown::noop()
            })
        });
        let (log, subscription) = record(&derived);
        let live = || tracked.lock().iter().filter(|state| state.strong_count() > 0).count();

        let outer = outer.lock().clone().unwrap();
        for v in 0..50 {
            outer.next(v);
        }
        assert_eq!(live(), 50);

        let finished = std::mem::take(&mut *pending.lock());
        for subscriber in finished {
            subscriber.complete();
        }
        assert_eq!(live(), 0);
        assert!(!subscription.is_closed());
        assert!(!outer_cleaned.load(Ordering::SeqCst));
        assert_eq!(log.lock().len(), 50);
    }

    #[test]
    fn flat_map_stays_open_while_an_inner_never_ends() {
        let derived = Observable::from_values(vec![1u32, 2]).flat_map(|v| {
            if v == 1 {
                Observable::never()
            } else {
                Observable::of(v)
            }
        });
        let (log, subscription) = record(&derived);
        assert_eq!(*log.lock(), vec!["next:2"]);
        assert!(!subscription.is_closed());
        subscription.unsubscribe();
        assert!(subscription.is_closed());
    }

    #[test]
    fn merge_of_nothing_completes() {
        let (log, _) = record(&Observable::<u32>::merge(Vec::new()));
        assert_eq!(*log.lock(), vec!["complete"]);
    }

    #[test]
    fn catch_error_switches_to_replacement() {
        let failing = Observable::new(|subscriber: Subscriber<u32>| {
            subscriber.next(1);
            subscriber.error(LinkError::msg("flaky"));
            Teardown::noop()
        });
        let recovered = failing.catch_error(|_| Observable::of(99));
        let (log, _) = record(&recovered);
        assert_eq!(*log.lock(), vec!["next:1", "next:99", "complete"]);
    }

    #[test]
    fn catch_error_unsubscribe_reaches_replacement() {
        let (replacement, _, cleaned) = manual::<u32>();
        let recovered = Observable::error(LinkError::msg("x")).catch_error(move |_| replacement.clone());
        let (_, subscription) = record(&recovered);
        subscription.unsubscribe();
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stream_adapter_yields_values_then_ends() {
        let values = Observable::from_values(vec![1, 2, 3]).collect().await.unwrap();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(Observable::<u32>::empty().first().await.unwrap(), None);
    }

    #[tokio::test]
    async fn stream_adapter_surfaces_errors() {
        let err = Observable::<u32>::error(LinkError::Timeout { timeout_ms: 5 })
            .collect()
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout { timeout_ms: 5 }));
    }

    #[tokio::test]
    async fn dropping_stream_unsubscribes() {
        let (source, _, cleaned) = manual::<u32>();
        let stream = source.into_stream();
        assert!(!cleaned.load(Ordering::SeqCst));
        drop(stream);
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
