//! Native stack growth for the recursive parser and evaluator.
//!
//! Nesting in a snippet becomes native recursion, both while parsing and
//! while polling nested evaluation futures. Each recursive step checks the
//! remaining stack and continues on a fresh heap segment when it runs low,
//! so deep snippets hit the configured limits instead of the guard page.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;

/// Stack that must remain before a recursive step runs in place.
const RED_ZONE: usize = 256 * 1024;

/// Size of each additional stack segment.
const SEGMENT: usize = 4 * 1024 * 1024;

/// Runs `f`, first moving to a new stack segment if the current one is low.
pub(crate) fn guarded<R>(f: impl FnOnce() -> R) -> R {
    stacker::maybe_grow(RED_ZONE, SEGMENT, f)
}

/// Future that polls its inner future under [`guarded`].
#[must_use = "futures do nothing unless polled"]
pub(crate) struct Guarded<'a, T> {
    inner: BoxFuture<'a, T>,
}

impl<T> Future for Guarded<'_, T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let inner = &mut self.inner;
        guarded(|| inner.as_mut().poll(cx))
    }
}

/// Wraps a recursive evaluation step.
pub(crate) fn grow<T>(inner: BoxFuture<'_, T>) -> Guarded<'_, T> {
    Guarded { inner }
}
