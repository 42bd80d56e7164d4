//! Bridges from futures into observables.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use linkchain_core::{LinkError, Observable, Subscriber, Teardown};

/// Runs a fresh future from `make` for each subscription on the current tokio
/// runtime, emitting its output once and completing.
///
/// Unsubscribing aborts the spawned task. Subscribing outside a runtime
/// errors with [`LinkError::Internal`].
pub fn observable_from_future<T, F, Fut>(make: F) -> Observable<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, LinkError>> + Send + 'static,
{
    let make = Arc::new(make);
    Observable::new(move |subscriber: Subscriber<T>| {
        let future = make();
        let downstream = subscriber.clone();
        spawn_on_current(&subscriber, async move {
            match future.await {
                Ok(value) => {
                    downstream.next(value);
                    downstream.complete();
                }
                Err(err) => downstream.error(err),
            }
        })
    })
}

/// Emits `()` once after `delay`, then completes.
#[must_use]
pub fn timer(delay: Duration) -> Observable<()> {
    observable_from_future(move || async move {
        tokio::time::sleep(delay).await;
        Ok(())
    })
}

/// Spawns `task` and returns a teardown that aborts it.
///
/// Without a runtime the subscriber is errored and nothing is spawned.
pub(crate) fn spawn_on_current<T, Fut>(subscriber: &Subscriber<T>, task: Fut) -> Teardown
where
    T: Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(task);
            Teardown::new(move || task.abort())
        }
        Err(err) => {
            subscriber.error(LinkError::internal(err));
            Teardown::noop()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn emits_future_output_then_completes() {
        let observable = observable_from_future(|| async { Ok::<_, LinkError>(7) });
        assert_eq!(observable.collect().await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn future_error_becomes_error_notification() {
        let observable =
            observable_from_future(|| async { Err::<u8, _>(LinkError::msg("backend down")) });
        let err = observable.collect().await.unwrap_err();
        assert!(err.to_string().contains("backend down"));
    }

    #[tokio::test]
    async fn each_subscription_runs_a_new_future() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let observable = observable_from_future(move || {
            let counter = Arc::clone(&counter);
            async move { Ok::<_, LinkError>(counter.fetch_add(1, Ordering::SeqCst)) }
        });
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(observable.collect().await.unwrap(), vec![0]);
        assert_eq!(observable.collect().await.unwrap(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_aborts_pending_future() {
        let finished = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&finished);
        let observable = observable_from_future(move || {
            let flag = Arc::clone(&flag);
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, LinkError>(())
            }
        });
        let subscription = observable.subscribe(|_: linkchain_core::Notification<()>| {});
        tokio::time::sleep(Duration::from_secs(1)).await;
        subscription.unsubscribe();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_after_delay() {
        let start = tokio::time::Instant::now();
        timer(Duration::from_millis(250)).collect().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn subscribing_outside_runtime_errors() {
        let observable = observable_from_future(|| async { Ok::<_, LinkError>(1) });
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = Arc::clone(&seen);
        observable.subscribe(move |notification: linkchain_core::Notification<i32>| {
            if let linkchain_core::Notification::Error(err) = notification {
                *sink.lock() = Some(err.to_string());
            }
        });
        assert!(seen.lock().is_some());
    }
}
