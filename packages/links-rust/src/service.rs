//! Terminating link backed by a `tower::Service`.

use std::fmt;
use std::sync::Arc;

use linkchain_core::{FetchObservable, FetchResult, Link, LinkError, NextLink, Operation, RequestHandler};
use parking_lot::Mutex;
use tower::{BoxError, Service, ServiceExt};

use crate::future::observable_from_future;

/// Adapts a `tower::Service<Operation>` into a terminating link.
///
/// Every subscription clones the service and drives one `oneshot` call, so
/// readiness is respected per request. Service errors surface as
/// [`LinkError::Internal`].
pub struct ServiceLink<S> {
    service: Arc<Mutex<S>>,
}

impl<S> ServiceLink<S>
where
    S: Service<Operation, Response = FetchResult> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    #[must_use]
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(Mutex::new(service)),
        }
    }

    /// Wraps the service as a terminating [`Link`] named `service`.
    #[must_use]
    pub fn into_link(self) -> Link {
        Link::terminating_handler(self).named("service")
    }
}

impl<S> RequestHandler for ServiceLink<S>
where
    S: Service<Operation, Response = FetchResult> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
{
    fn request(&self, operation: Operation, _forward: Option<NextLink>) -> FetchObservable {
        let service = Arc::clone(&self.service);
        observable_from_future(move || {
            let svc = service.lock().clone();
            let operation = operation.clone();
            async move {
                svc.oneshot(operation).await.map_err(|err| {
                    let err: BoxError = err.into();
                    LinkError::internal(anyhow::anyhow!(err))
                })
            }
        })
    }
}

impl<S> fmt::Debug for ServiceLink<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceLink").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use linkchain_core::GraphQLRequest;
    use serde_json::json;

    use super::*;

    fn request() -> GraphQLRequest {
        GraphQLRequest::new(json!({"kind": "Document", "definitions": []}))
            .with_variables(json!({"msg": "hi"}).as_object().cloned().unwrap_or_default())
    }

    #[tokio::test]
    async fn service_response_becomes_single_result() {
        let link = ServiceLink::new(tower::service_fn(|op: Operation| async move {
            Ok::<_, Infallible>(FetchResult::data(json!({ "echo": op.variables["msg"] })))
        }))
        .into_link();

        assert!(link.is_terminating());
        assert_eq!(link.name(), "service");
        let results = link.execute(request()).collect().await.unwrap();
        assert_eq!(results, vec![FetchResult::data(json!({"echo": "hi"}))]);
    }

    #[tokio::test]
    async fn service_error_becomes_internal_error() {
        let link = ServiceLink::new(tower::service_fn(|_op: Operation| async move {
            Err::<FetchResult, _>(std::io::Error::other("connection refused"))
        }))
        .into_link();

        let err = link.execute(request()).collect().await.unwrap_err();
        assert!(matches!(err, LinkError::Internal(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    /// Service that is not ready until polled twice.
    #[derive(Clone, Default)]
    struct WarmingService {
        polls: usize,
    }

    impl Service<Operation> for WarmingService {
        type Response = FetchResult;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<FetchResult, Infallible>> + Send>>;

        fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            self.polls += 1;
            if self.polls < 2 {
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _op: Operation) -> Self::Future {
            Box::pin(async { Ok(FetchResult::data(json!({"ready": true}))) })
        }
    }

    #[tokio::test]
    async fn waits_for_service_readiness() {
        let link = ServiceLink::new(WarmingService::default()).into_link();
        let results = link.execute(request()).collect().await.unwrap();
        assert_eq!(results, vec![FetchResult::data(json!({"ready": true}))]);
    }
}
