//! The filter pipeline around a single handler invocation.
//!
//! ```text
//! interceptors.on_executing
//!   pre-hooks (ascending order)        -- push each completed filter
//!   handler                            -- skipped if a result is already set
//!   exception hooks (LIFO, if faulted) -- stop once one marks it handled
//!   post-hooks (LIFO)                  -- pop until the stack is empty
//! interceptors.on_exception / on_executed
//! ```

use std::sync::Arc;

use courier_core::combinators::catch_fault;

use super::context::{HandlerContext, HandlerResponse};
use super::filter::Filter;
use super::interceptor::{CompositeInterceptor, Interceptor};

pub(crate) struct FilterPipeline {
    interceptors: CompositeInterceptor,
}

impl FilterPipeline {
    pub(crate) fn new(interceptors: CompositeInterceptor) -> Self {
        Self { interceptors }
    }

    pub(crate) fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }

    /// Runs the context's descriptor through its filters and handler.
    ///
    /// Never fails: errors and panics from hooks and the handler are captured
    /// into the returned response.
    pub(crate) async fn execute(&self, ctx: &mut HandlerContext) -> HandlerResponse {
        self.interceptors.on_executing(ctx);

        let descriptor = ctx.descriptor().clone();
        let mut entered: Vec<&Arc<dyn Filter>> = Vec::with_capacity(descriptor.filters().len());

        for filter in descriptor.filters() {
            let outcome = catch_fault(filter.on_executing(ctx)).await;
            match outcome {
                Ok(()) => {
                    entered.push(filter);
                    if ctx.has_result() {
                        break;
                    }
                }
                Err(fault) => {
                    ctx.record_exception(fault);
                    break;
                }
            }
        }

        if !ctx.has_result() && ctx.exception().is_none() {
            let outcome = catch_fault(descriptor.invoke(ctx)).await;
            match outcome {
                Ok(value) => ctx.set_result(value),
                Err(fault) => ctx.record_exception(fault),
            }
        }

        if ctx.exception().is_some() {
            for filter in entered.iter().rev() {
                let outcome = catch_fault(filter.on_exception(ctx)).await;
                if let Err(fault) = outcome {
                    ctx.record_exception(fault);
                    break;
                }
                if ctx.is_exception_handled() {
                    break;
                }
            }
        }

        while let Some(filter) = entered.pop() {
            let outcome = catch_fault(filter.on_executed(ctx)).await;
            if let Err(fault) = outcome {
                ctx.record_exception(fault);
                break;
            }
        }

        let response = ctx.response();
        if let HandlerResponse::Faulted(fault) = &response {
            self.interceptors.on_exception(ctx, fault);
        }
        self.interceptors.on_executed(ctx, &response);
        response
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
