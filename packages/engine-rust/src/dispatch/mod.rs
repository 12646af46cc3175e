//! Handler resolution and execution.
//!
//! A dispatch flows through these parts:
//!
//! 1. **Registration** (`handler`): `HandlerRegistry` builds one
//!    `HandlerDescriptor` per handler, with its filters sorted by order
//! 2. **Resolution** (`handler`): a `HandlerSelector` picks the descriptor(s)
//!    for the message's runtime type
//! 3. **Pipeline** (`pipeline`): pre-hooks, handler, exception hooks and
//!    post-hooks, with `Interceptor`s observing the outer boundary
//! 4. **Processor** (`processor`): `MessageProcessor` ties the above to the
//!    event hub and implements `tower::Service<Dispatch>`

pub mod config;
pub mod context;
pub mod filter;
pub mod handler;
pub mod interceptor;
mod pipeline;
pub mod processor;
pub mod registry;

pub use config::{DispatchConfig, LogFormat, RetryPolicy};
pub use context::{HandlerContext, HandlerRequest, HandlerResponse, Items};
pub use filter::{Filter, TimingFilter};
pub use handler::{
    DefaultHandlerSelector, Handler, HandlerDescriptor, HandlerProvider, HandlerRegistry,
    HandlerSelector,
};
pub use interceptor::{CompositeInterceptor, Interceptor, TracingInterceptor};
pub use processor::{Dispatch, MessageProcessor, ProcessorBuilder};
pub use registry::ServiceRegistry;
