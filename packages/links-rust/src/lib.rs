//! `linkchain` Links — middleware links, tower service bridge, and pipeline assembly
//! on top of `linkchain-core`.

pub mod config;
pub mod future;
pub mod logging;
pub mod middleware;
pub mod service;

pub use config::{ConfigError, PipelineConfig, RetryConfig};
pub use future::{observable_from_future, timer};
pub use logging::{init_tracing, LogFormat};
pub use middleware::{build_pipeline, PipelineError};
pub use service::ServiceLink;
