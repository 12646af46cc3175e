use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::context::HandlerContext;

/// Cross-cutting behavior wrapped around a handler.
///
/// Pre-hooks run in ascending [`order`](Filter::order); post-hooks and
/// exception hooks run in reverse, over exactly the filters whose pre-hook
/// completed. A pre-hook that sets a result skips the remaining pre-hooks and
/// the handler body.
#[async_trait]
pub trait Filter: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Sort key; lower runs first. Ties keep declaration order.
    fn order(&self) -> i32 {
        0
    }

    async fn on_executing(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_executed(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called with the captured fault in `ctx.exception()`. Call
    /// [`HandlerContext::mark_exception_handled`] to recover.
    async fn on_exception(&self, _ctx: &mut HandlerContext) -> anyhow::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TimingFilter
// ---------------------------------------------------------------------------

const TIMING_STACK: &str = "courier.timing";

/// Logs how long the wrapped handler (and any inner filters) took.
///
/// Start instants live on a stack in the context's items, so nested timing
/// filters pair up correctly.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimingFilter {
    order: i32,
}

impl TimingFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_order(order: i32) -> Self {
        Self { order }
    }
}

#[async_trait]
impl Filter for TimingFilter {
    fn name(&self) -> &'static str {
        "timing"
    }

    fn order(&self) -> i32 {
        self.order
    }

    async fn on_executing(&self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        ctx.items_mut()
            .get_or_insert_with(TIMING_STACK, Vec::<Instant>::new)
            .ok_or_else(|| anyhow::anyhow!("item `{TIMING_STACK}` holds a foreign type"))?
            .push(Instant::now());
        Ok(())
    }

    async fn on_executed(&self, ctx: &mut HandlerContext) -> anyhow::Result<()> {
        let started = ctx
            .items_mut()
            .get_mut::<Vec<Instant>>(TIMING_STACK)
            .and_then(Vec::pop);
        if let Some(started) = started {
            #[allow(clippy::cast_possible_truncation)]
            let elapsed_ms = started.elapsed().as_millis() as u64;
            debug!(
                message_type = ctx.descriptor().message_type_name(),
                handler = ctx.descriptor().handler_type_name(),
                elapsed_ms,
                faulted = ctx.exception().is_some() && !ctx.is_exception_handled(),
                "handler timed"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
