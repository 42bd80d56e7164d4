//! Pipeline composition: combines the middleware links into a single chain.

use linkchain_core::{from, CompositionError, Link};

use super::dedup::DedupLink;
use super::metrics::MetricsLink;
use super::persisted::PersistedQueryLink;
use super::retry::RetryLink;
use super::timeout::TimeoutLink;
use crate::config::{ConfigError, PipelineConfig};

/// Failure to assemble a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Composition(#[from] CompositionError),
}

/// Build the operation pipeline by placing middleware links in front of `terminating`.
///
/// Link order (outermost to innermost):
/// 1. `MetricsLink` -- one span per execution, covering every retry
/// 2. `TimeoutLink` -- bounds the whole execution, retries included
/// 3. `RetryLink` -- re-runs the inner links on error
/// 4. `PersistedQueryLink` -- only when `config.persisted_queries`
/// 5. `DedupLink` -- only when `config.dedup`
///
/// # Errors
///
/// Returns [`PipelineError::Config`] for an invalid config and
/// [`PipelineError::Composition`] when `terminating` cannot end the chain.
pub fn build_pipeline(terminating: Link, config: &PipelineConfig) -> Result<Link, PipelineError> {
    config.validate()?;

    let mut links = vec![
        MetricsLink::new().into_link(),
        TimeoutLink::new(config.default_timeout()).into_link(),
        RetryLink::new(config.retry.clone()).into_link(),
    ];
    if config.persisted_queries {
        links.push(PersistedQueryLink::new(config.persisted_hash_capacity).into_link());
    }
    if config.dedup {
        links.push(DedupLink::new().into_link());
    }
    links.push(terminating);

    let chain = from(links)?;
    tracing::debug!(chain = chain.name(), "pipeline assembled");
    Ok(chain)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
