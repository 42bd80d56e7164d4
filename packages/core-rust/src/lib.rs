//! `linkchain` Core — lazy observables, operations, links, chain composition and execution.

pub mod compose;
pub mod error;
pub mod execute;
pub mod link;
pub mod observable;
pub mod operation;
pub mod result;

pub use compose::{concat, from, split};
pub use error::{CompositionError, LinkError};
pub use execute::execute;
pub use link::{FetchObservable, Link, NextLink, RequestHandler};
pub use observable::{Notification, Observable, ObservableStream, Observer, Subscriber, Subscription, Teardown};
pub use operation::{ContextMap, ContextUpdate, Extensions, GraphQLRequest, Operation, QueryDocument, Variables};
pub use result::FetchResult;
