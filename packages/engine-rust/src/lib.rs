//! Courier engine: handler resolution, the filter pipeline, the event hub,
//! command queueing and the worker-pool broker.
//!
//! A typical setup registers handlers, builds a `MessageProcessor`, wraps it
//! in the middleware pipeline and hands that to a `CommandBroker`:
//!
//! ```no_run
//! # async fn run(handlers: courier_engine::HandlerRegistry) -> anyhow::Result<()> {
//! use std::sync::Arc;
//!
//! use courier_engine::{
//!     build_dispatch_pipeline, CommandBroker, CommandQueue, InMemoryCommandQueue,
//!     MessageProcessor,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let processor = MessageProcessor::builder().provider(handlers).build();
//! let config = processor.config().clone();
//! let queue: Arc<dyn CommandQueue> = Arc::new(InMemoryCommandQueue::unbounded());
//! let broker = CommandBroker::from_config(build_dispatch_pipeline(processor), queue, &config)?;
//! let report = broker.run(CancellationToken::new()).await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod middleware;
pub mod store;

pub use dispatch::{
    Dispatch, DispatchConfig, Filter, Handler, HandlerContext, HandlerProvider, HandlerRegistry,
    HandlerResponse, Interceptor, LogFormat, MessageProcessor, RetryPolicy, ServiceRegistry,
};
pub use error::{BrokerError, ConfigError, DispatchError, PublishError, QueueError};
pub use messaging::{CommandBroker, CommandQueue, InMemoryCommandQueue, MessageHub};
pub use middleware::{build_dispatch_pipeline, DispatchPipeline};
pub use store::{InMemoryEventStore, InMemoryQueryContext};
