//! Pipeline composition: wraps a `MessageProcessor` in the middleware stack.

use std::sync::Arc;

use courier_core::{NoneTransient, TransientErrorDetectionStrategy};
use tower::ServiceBuilder;

use super::metrics::{MetricsLayer, MetricsService};
use super::retry::{RetryLayer, RetryService};
use crate::dispatch::MessageProcessor;

/// The service a `CommandBroker` normally drives.
pub type DispatchPipeline = RetryService<MetricsService<MessageProcessor>>;

/// Build the dispatch pipeline around `processor`.
///
/// Layer order (outermost to innermost):
/// 1. `RetryLayer` -- re-dispatch transient faults
/// 2. `MetricsLayer` -- one span per attempt (closest to the processor)
///
/// The transient-error strategy is resolved from the processor's services
/// (`dyn TransientErrorDetectionStrategy`), falling back to [`NoneTransient`].
/// The retry policy comes from the processor's `DispatchConfig`.
#[must_use]
pub fn build_dispatch_pipeline(processor: MessageProcessor) -> DispatchPipeline {
    let strategy = processor
        .services()
        .get::<dyn TransientErrorDetectionStrategy>()
        .unwrap_or_else(|| Arc::new(NoneTransient));
    let policy = processor.config().retry.clone();

    ServiceBuilder::new()
        .layer(RetryLayer::new(strategy, policy))
        .layer(MetricsLayer)
        .service(processor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
