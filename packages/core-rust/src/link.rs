//! The handler contract: `(operation, forward?) -> Observable<FetchResult>`.
//!
//! A [`Link`] wraps one [`RequestHandler`]. Middleware calls the
//! [`NextLink`] it receives to continue the chain; a terminating link never
//! does and produces results itself. The last link of a chain receives
//! `None` in place of a `NextLink`.

use std::fmt;
use std::sync::Arc;

use crate::error::{catch_panic, LinkError};
use crate::observable::Observable;
use crate::operation::{GraphQLRequest, Operation};
use crate::result::FetchResult;

/// Observable of chain results.
pub type FetchObservable = Observable<FetchResult>;

// ---------------------------------------------------------------------------
// NextLink
// ---------------------------------------------------------------------------

/// The rest of the chain, bound for one link invocation.
///
/// Callable any number of times with any operation.
#[derive(Clone)]
pub struct NextLink(Arc<dyn Fn(Operation) -> FetchObservable + Send + Sync>);

impl NextLink {
    #[must_use]
    pub fn new(forward: impl Fn(Operation) -> FetchObservable + Send + Sync + 'static) -> Self {
        Self(Arc::new(forward))
    }

    /// Runs the rest of the chain for `operation`.
    #[must_use]
    pub fn call(&self, operation: Operation) -> FetchObservable {
        (self.0)(operation)
    }
}

impl fmt::Debug for NextLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NextLink(..)")
    }
}

// ---------------------------------------------------------------------------
// RequestHandler
// ---------------------------------------------------------------------------

/// The single function shape every link implements.
///
/// Implementations must not keep per-operation state across calls: one
/// handler serves many executions, possibly concurrently.
pub trait RequestHandler: Send + Sync {
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable;
}

impl<F> RequestHandler for F
where
    F: Fn(Operation, Option<NextLink>) -> FetchObservable + Send + Sync,
{
    fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        self(operation, forward)
    }
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

/// A composable, reusable handler value.
///
/// Cloning is cheap. Combinators never mutate their operands.
#[derive(Clone)]
pub struct Link {
    handler: Arc<dyn RequestHandler>,
    terminating: bool,
    name: Arc<str>,
}

impl Link {
    /// Wraps a middleware closure.
    #[must_use]
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(Operation, Option<NextLink>) -> FetchObservable + Send + Sync + 'static,
    {
        Self::from_handler(handler)
    }

    /// Wraps a closure that produces results without forwarding.
    ///
    /// The link is marked terminating, which lets [`from`](crate::compose::from)
    /// reject chains where it is not last.
    #[must_use]
    pub fn terminating<F>(handler: F) -> Self
    where
        F: Fn(Operation) -> FetchObservable + Send + Sync + 'static,
    {
        Self::terminating_handler(move |operation: Operation, _forward: Option<NextLink>| handler(operation))
    }

    /// Wraps any [`RequestHandler`] as middleware.
    #[must_use]
    pub fn from_handler(handler: impl RequestHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
            terminating: false,
            name: Arc::from("anonymous"),
        }
    }

    /// Wraps any [`RequestHandler`] that never forwards.
    #[must_use]
    pub fn terminating_handler(handler: impl RequestHandler + 'static) -> Self {
        Self {
            terminating: true,
            ..Self::from_handler(handler)
        }
    }

    /// Terminating link that completes without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::terminating(|_| Observable::empty()).named("empty")
    }

    /// Forwards the operation unchanged; completes empty at the end of a chain.
    #[must_use]
    pub fn passthrough() -> Self {
        Self::new(|operation, forward| match forward {
            Some(forward) => forward.call(operation),
            None => Observable::empty(),
        })
        .named("passthrough")
    }

    /// Sets the label used in logs and composition errors.
    #[must_use]
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this link is marked as producing results without forwarding.
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.terminating
    }

    pub(crate) fn with_terminating(mut self, terminating: bool) -> Self {
        self.terminating = terminating;
        self
    }

    /// Invokes the handler.
    ///
    /// A panic in the handler body becomes an observable that errors with
    /// [`LinkError::Panicked`] on subscription.
    #[must_use]
    pub fn request(&self, operation: Operation, forward: Option<NextLink>) -> FetchObservable {
        catch_panic(|| self.handler.request(operation, forward)).unwrap_or_else(|err: LinkError| {
            tracing::debug!(link = %self.name, error = %err, "link handler panicked");
            Observable::error(err)
        })
    }

    /// Runs this link as a whole chain against `request`.
    #[must_use]
    pub fn execute(&self, request: GraphQLRequest) -> FetchObservable {
        crate::execute::execute(self, request)
    }
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("name", &self.name)
            .field("terminating", &self.terminating)
            .finish_non_exhaustive()
    }
}
