//! Re-dispatch of faults classified as transient.

use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::combinators::until_cancelled;
use courier_core::{Cancelled, Fault, TransientErrorDetectionStrategy};
use futures_util::future::BoxFuture;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::dispatch::{Dispatch, HandlerResponse, RetryPolicy};
use crate::error::DispatchError;

// ---------------------------------------------------------------------------
// RetryLayer
// ---------------------------------------------------------------------------

/// Tower layer that retries faulted dispatches the strategy deems transient.
///
/// Attempts stop at [`RetryPolicy::max_attempts`]. Nothing is retried once the
/// dispatch token is cancelled, and a fault caused by cancellation is never
/// transient.
#[derive(Clone)]
pub struct RetryLayer {
    strategy: Arc<dyn TransientErrorDetectionStrategy>,
    policy: RetryPolicy,
}

impl RetryLayer {
    #[must_use]
    pub fn new(strategy: Arc<dyn TransientErrorDetectionStrategy>, policy: RetryPolicy) -> Self {
        Self { strategy, policy }
    }
}

impl<S> Layer<S> for RetryLayer {
    type Service = RetryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RetryService {
            inner,
            strategy: self.strategy.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl std::fmt::Debug for RetryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryLayer")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RetryService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RetryService<S> {
    inner: S,
    strategy: Arc<dyn TransientErrorDetectionStrategy>,
    policy: RetryPolicy,
}

impl<S> RetryService<S> {
    fn should_retry(&self, fault: &Fault, attempt: u32, request: &Dispatch) -> bool {
        attempt < self.policy.max_attempts
            && !request.token.is_cancelled()
            && !fault.is::<Cancelled>()
            && self.strategy.is_transient(fault)
    }
}

impl<S> Service<Dispatch> for RetryService<S>
where
    S: Service<Dispatch, Response = HandlerResponse, Error = DispatchError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = HandlerResponse;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<HandlerResponse, DispatchError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Dispatch) -> Self::Future {
        // The instance polled ready serves the first attempt.
        let fresh = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, fresh);
        let mut this = Self {
            inner,
            strategy: self.strategy.clone(),
            policy: self.policy.clone(),
        };

        Box::pin(async move {
            let mut attempt = 1;
            let mut response = this.inner.call(request.clone()).await?;
            loop {
                let retry = match &response {
                    HandlerResponse::Faulted(fault) => {
                        let retry = this.should_retry(fault, attempt, &request);
                        if !retry && attempt > 1 {
                            warn!(
                                message_type = request.envelope.type_name(),
                                attempts = attempt,
                                error = %fault,
                                "giving up on dispatch"
                            );
                        }
                        retry
                    }
                    HandlerResponse::Completed(_) => false,
                };
                if !retry {
                    return Ok(response);
                }

                let backoff = this.policy.backoff_for(attempt);
                debug!(
                    message_type = request.envelope.type_name(),
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    "retrying transient fault"
                );
                if until_cancelled(&request.token, tokio::time::sleep(backoff))
                    .await
                    .is_err()
                {
                    return Ok(response);
                }

                attempt += 1;
                response = this.inner.ready().await?.call(request.clone()).await?;
            }
        })
    }
}

impl<S> std::fmt::Debug for RetryService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryService")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
