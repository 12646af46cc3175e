//! Tower middleware layers for the dispatch pipeline.
//!
//! - [`retry`]: re-dispatch of transient faults with capped exponential backoff
//! - [`metrics`]: dispatch timing and outcome via `tracing` spans
//! - [`pipeline`]: composes the layers around a `MessageProcessor`

pub mod metrics;
pub mod pipeline;
pub mod retry;

pub use metrics::{MetricsLayer, MetricsService};
pub use pipeline::{build_dispatch_pipeline, DispatchPipeline};
pub use retry::{RetryLayer, RetryService};
