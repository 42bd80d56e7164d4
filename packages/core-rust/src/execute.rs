//! Execution driver: runs a composed chain against one request.

use tracing::debug;

use crate::link::{FetchObservable, Link};
use crate::operation::{GraphQLRequest, Operation};

/// Builds the operation for `request` and invokes `chain` with no `forward`.
///
/// The returned observable is not subscribed; results flow only once the
/// caller subscribes. A panic in a handler body is delivered as an error
/// notification, so this function never panics on its handlers' behalf.
#[must_use]
pub fn execute(chain: &Link, request: GraphQLRequest) -> FetchObservable {
    let operation = Operation::from_request(request);
    debug!(
        operation = operation.display_name(),
        chain = chain.name(),
        "executing operation"
    );
    chain.request(operation, None)
}
