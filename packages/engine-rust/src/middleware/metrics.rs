//! Dispatch timing and outcome via `tracing` spans.

use std::task::{Context, Poll};
use std::time::Instant;

use futures_util::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::dispatch::{Dispatch, HandlerResponse};
use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps each dispatch in a `dispatch` span carrying its
/// duration and outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Dispatch> for MetricsService<S>
where
    S: Service<Dispatch, Response = HandlerResponse, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = HandlerResponse;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<HandlerResponse, DispatchError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Dispatch) -> Self::Future {
        let message_type = request.envelope.type_name();
        let kind = request.envelope.kind();

        let span = info_span!(
            "dispatch",
            message_type,
            kind = ?kind,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                let outcome = match &result {
                    Ok(HandlerResponse::Completed(_)) => "completed",
                    Ok(HandlerResponse::Faulted(_)) => "faulted",
                    Err(_) => "unrouted",
                };

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                tracing::debug!(message_type, duration_ms, outcome, "dispatch complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
