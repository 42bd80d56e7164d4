//! Middleware links for the operation pipeline.
//!
//! - [`context`]: Context patching before forwarding, sync or async
//! - [`error`]: Error inspection with optional retry by the handler
//! - [`retry`]: Exponential back-off retry
//! - [`timeout`]: Per-operation timeout enforcement
//! - [`metrics`]: Operation timing and outcome via `tracing` spans
//! - [`dedup`]: Sharing of identical in-flight operations
//! - [`persisted`]: Automatic persisted queries
//! - [`pipeline`]: Composes the links into a single chain

pub mod context;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod persisted;
pub mod pipeline;
pub mod retry;
pub mod timeout;

pub use context::{set_context, SetContextLink};
pub use dedup::DedupLink;
pub use error::{on_error, ErrorLink, ErrorResponse};
pub use metrics::MetricsLink;
pub use persisted::PersistedQueryLink;
pub use pipeline::{build_pipeline, PipelineError};
pub use retry::RetryLink;
pub use timeout::TimeoutLink;
