//! In-flight deduplication middleware.
//!
//! Concurrent subscriptions to operations with the same key share one
//! upstream subscription. Late joiners only see notifications delivered
//! after they joined. The upstream is cancelled when its last subscriber
//! leaves. Once the upstream terminates or is cancelled, the next request
//! with the same key starts a fresh one. An operation whose context sets `forceFetch: true` bypasses
//! sharing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use linkchain_core::{
    FetchObservable, FetchResult, Link, NextLink, Notification, Observable, Operation, RequestHandler, Subscriber,
    Subscription, Teardown,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

/// Context key that disables sharing for one operation.
pub const FORCE_FETCH_CONTEXT_KEY: &str = "forceFetch";

/// Listeners of one in-flight operation.
///
/// Once `closed` is set the entry takes no new listeners: either the
/// upstream terminated or its last listener left.
struct Listeners {
    closed: bool,
    entries: Vec<(u64, Subscriber<FetchResult>)>,
}

/// One upstream subscription and everyone listening to it.
struct Inflight {
    next_id: AtomicU64,
    listeners: Mutex<Listeners>,
    upstream: Mutex<Option<Subscription>>,
}

impl Inflight {
    /// Fresh entry whose first listener, id 0, is `leader`.
    fn leading(leader: Subscriber<FetchResult>) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Listeners {
                closed: false,
                entries: vec![(0, leader)],
            }),
            upstream: Mutex::new(None),
        })
    }

    /// Adds a listener, or returns `None` if the entry is closed.
    fn join(&self, subscriber: Subscriber<FetchResult>) -> Option<u64> {
        let mut listeners = self.listeners.lock();
        if listeners.closed {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        listeners.entries.push((id, subscriber));
        Some(id)
    }

    /// Removes a listener. Returns `true` if this closed the entry, in
    /// which case the caller owns cancelling the upstream.
    fn leave(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        listeners.entries.retain(|(listener, _)| *listener != id);
        if listeners.closed || !listeners.entries.is_empty() {
            return false;
        }
        listeners.closed = true;
        true
    }

    fn broadcast(&self, notification: Notification<FetchResult>) {
        match notification {
            Notification::Next(result) => {
                let targets: Vec<Subscriber<FetchResult>> =
                    self.listeners.lock().entries.iter().map(|(_, subscriber)| subscriber.clone()).collect();
                for target in targets {
                    target.next(result.clone());
                }
            }
            terminal => {
                let targets = {
                    let mut listeners = self.listeners.lock();
                    listeners.closed = true;
                    std::mem::take(&mut listeners.entries)
                };
                for (_, target) in targets {
                    target.notify(terminal.clone());
                }
            }
        }
    }
}

type InflightTable = DashMap<String, Arc<Inflight>>;

/// Middleware sharing identical in-flight operations.
#[derive(Default, Clone)]
pub struct DedupLink {
    inflight: Arc<InflightTable>,
}

impl DedupLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_link(self) -> Link {
        Link::from_handler(self).named("dedup")
    }

    /// Number of operations currently shared.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }
}

fn forget(table: &InflightTable, key: &str, inflight: &Arc<Inflight>) {
    table.remove_if(key, |_, current| Arc::ptr_eq(current, inflight));
}

impl RequestHandler for DedupLink {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        let Some(forward) = forward else {
            return Observable::empty();
        };
        if operation.context_value(FORCE_FETCH_CONTEXT_KEY) == Some(Value::Bool(true)) {
            return forward.call(operation);
        }

        let key = operation.to_key();
        let table = Arc::clone(&self.inflight);
        Observable::new(move |subscriber: Subscriber<FetchResult>| {
            // Joining happens under the shard lock so a closing entry is
            // never joined after its listeners were drained.
            let (inflight, id, leader) = match table.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    let joined = entry.get().join(subscriber.clone());
                    match joined {
                        Some(id) => (Arc::clone(entry.get()), id, false),
                        None => {
                            let fresh = Inflight::leading(subscriber);
                            entry.insert(Arc::clone(&fresh));
                            (fresh, 0, true)
                        }
                    }
                }
                Entry::Vacant(entry) => {
                    let fresh = Inflight::leading(subscriber);
                    entry.insert(Arc::clone(&fresh));
                    (fresh, 0, true)
                }
            };

            if leader {
                let relay = Arc::clone(&inflight);
                let relay_table = Arc::clone(&table);
                let relay_key = key.clone();
                let upstream = forward.call(operation.clone()).subscribe(move |notification: Notification<FetchResult>| {
                    if !matches!(notification, Notification::Next(_)) {
                        forget(&relay_table, &relay_key, &relay);
                    }
                    relay.broadcast(notification);
                });
                *inflight.upstream.lock() = Some(upstream);
            } else {
                trace!(operation = operation.display_name(), "joined in-flight operation");
            }

            let table = Arc::clone(&table);
            let key = key.clone();
            Teardown::new(move || {
                if inflight.leave(id) {
                    forget(&table, &key, &inflight);
                    let upstream = inflight.upstream.lock().take();
                    if let Some(upstream) = upstream {
                        upstream.unsubscribe();
                    }
                }
            })
        })
    }
}
