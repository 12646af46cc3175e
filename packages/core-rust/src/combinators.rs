//! Async building blocks shared by the dispatch engine.
//!
//! - [`catch_fault`]: run a future, capturing its error or panic as a [`Fault`]
//! - [`iterate`]: strictly sequential async iteration
//! - [`join_caught`] / [`join_faults`]: structured fan-out and join
//! - [`until_cancelled`]: race a future against a cancellation token

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::future::{self, Either, Ready};
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::fault::Fault;

/// Returned by [`until_cancelled`] when the token fired first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Runs `fut` to completion, converting both an `Err` and a panic into a `Fault`.
///
/// # Errors
///
/// Returns the captured fault when the future fails or panics.
pub async fn catch_fault<F, T>(fut: F) -> Result<T, Fault>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(Fault::new(err)),
        Err(panic) => Err(Fault::from_panic(panic)),
    }
}

/// Awaits `f(item)` for each item in order, stopping at the first error.
///
/// # Errors
///
/// Returns the first error produced by `f`.
pub async fn iterate<I, F, Fut>(items: I, mut f: F) -> anyhow::Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    for item in items {
        f(item).await?;
    }
    Ok(())
}

/// Polls every future concurrently and returns each outcome in input order.
///
/// Futures are first polled in input order. One failure never prevents the
/// others from running to completion.
pub async fn join_caught<I, F, T>(futures: I) -> Vec<Result<T, Fault>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<T>>,
{
    future::join_all(futures.into_iter().map(catch_fault)).await
}

/// Like [`join_caught`], keeping only the faults.
pub async fn join_faults<I, F>(futures: I) -> Vec<Fault>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = anyhow::Result<()>>,
{
    join_caught(futures)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}

/// Races `fut` against `token`. Cancellation wins ties.
///
/// # Errors
///
/// Returns [`Cancelled`] if the token is (or becomes) cancelled before `fut`
/// completes. `fut` is dropped in that case.
pub async fn until_cancelled<F>(token: &CancellationToken, fut: F) -> Result<F::Output, Cancelled>
where
    F: Future,
{
    if token.is_cancelled() {
        return Err(Cancelled);
    }
    let cancelled = std::pin::pin!(token.cancelled());
    let fut = std::pin::pin!(fut);
    match future::select(cancelled, fut).await {
        Either::Left(((), _)) => Err(Cancelled),
        Either::Right((output, _)) => Ok(output),
    }
}

/// An already completed, successful future.
#[must_use]
pub fn completed() -> Ready<anyhow::Result<()>> {
    future::ready(Ok(()))
}

/// Lifts a plain result into a ready future.
pub fn from_result<T>(result: anyhow::Result<T>) -> Ready<anyhow::Result<T>> {
    future::ready(result)
}
