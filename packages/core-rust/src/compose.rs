//! Chain composition: `concat`, `from` and `split`.
//!
//! Every combinator is a pure construction step. No handler runs and no
//! operation or context is allocated until a chain is executed.

use std::sync::Arc;

use tracing::warn;

use crate::error::CompositionError;
use crate::link::{Link, NextLink};
use crate::operation::Operation;

/// Sequential composition: `first` runs with a `forward` that continues into
/// `second`, which in turn receives the composite's own `forward`.
///
/// Associative. When `first` is marked terminating, `second` would be
/// unreachable; a warning is logged and `first` is returned as is.
#[must_use]
pub fn concat(first: &Link, second: &Link) -> Link {
    if first.is_terminating() {
        warn!(
            first = first.name(),
            second = second.name(),
            "concat on a terminating link has no effect"
        );
        return first.clone();
    }

    let name = format!("{} -> {}", first.name(), second.name());
    let terminating = second.is_terminating();
    let (first, second) = (first.clone(), second.clone());
    Link::new(move |operation: Operation, forward: Option<NextLink>| {
        let second = second.clone();
        let into_second = NextLink::new(move |next_operation| second.request(next_operation, forward.clone()));
        first.request(operation, Some(into_second))
    })
    .named(name)
    .with_terminating(terminating)
}

/// Reduces `links` left to right with [`concat`].
///
/// # Errors
///
/// Returns [`CompositionError::EmptyChain`] for an empty sequence and
/// [`CompositionError::UnreachableLink`] when a link marked terminating is
/// followed by another link.
pub fn from(links: impl IntoIterator<Item = Link>) -> Result<Link, CompositionError> {
    let links: Vec<Link> = links.into_iter().collect();
    let len = links.len();
    if let Some(position) = links.iter().take(len.saturating_sub(1)).position(Link::is_terminating) {
        return Err(CompositionError::UnreachableLink {
            name: links[position].name().to_string(),
            position,
            len,
        });
    }
    links
        .into_iter()
        .reduce(|chain, link| concat(&chain, &link))
        .ok_or(CompositionError::EmptyChain)
}

/// Per-invocation branch: evaluates `test` once and delegates entirely to
/// `left` (true) or `right` (false), both with the inherited `forward`.
#[must_use]
pub fn split<P>(test: P, left: &Link, right: &Link) -> Link
where
    P: Fn(&Operation) -> bool + Send + Sync + 'static,
{
    let name = format!("split({} | {})", left.name(), right.name());
    let terminating = left.is_terminating() && right.is_terminating();
    let test = Arc::new(test);
    let (left, right) = (left.clone(), right.clone());
    Link::new(move |operation: Operation, forward: Option<NextLink>| {
        if test(&operation) {
            left.request(operation, forward)
        } else {
            right.request(operation, forward)
        }
    })
    .named(name)
    .with_terminating(terminating)
}

impl Link {
    /// `concat(self, next)`.
    #[must_use]
    pub fn concat(&self, next: &Link) -> Link {
        concat(self, next)
    }

    /// `concat(self, split(test, left, right))`.
    #[must_use]
    pub fn split<P>(&self, test: P, left: &Link, right: &Link) -> Link
    where
        P: Fn(&Operation) -> bool + Send + Sync + 'static,
    {
        concat(self, &split(test, left, right))
    }

    /// See [`from`].
    ///
    /// # Errors
    ///
    /// Same as [`from`].
    pub fn from_links(links: impl IntoIterator<Item = Link>) -> Result<Link, CompositionError> {
        from(links)
    }
}
