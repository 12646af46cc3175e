//! Process-wide dispatch observers.
//!
//! Interceptors see every dispatch at its outermost boundary. They observe
//! only: they cannot change the result or the control flow.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use courier_core::Fault;
use tracing::{debug, warn};

use super::context::{HandlerContext, HandlerResponse};

/// Observer notified around every handler dispatch.
pub trait Interceptor: Send + Sync {
    /// Before the first pre-hook runs.
    fn on_executing(&self, _ctx: &HandlerContext) {}

    /// After the last post-hook ran, with the final response.
    fn on_executed(&self, _ctx: &HandlerContext, _response: &HandlerResponse) {}

    /// When the dispatch ends faulted, before [`on_executed`](Interceptor::on_executed).
    fn on_exception(&self, _ctx: &HandlerContext, _fault: &Fault) {}
}

// ---------------------------------------------------------------------------
// CompositeInterceptor
// ---------------------------------------------------------------------------

/// Fans each notification out to a list of interceptors, in order.
///
/// A panic inside one interceptor is caught and logged, and never reaches
/// the dispatch or the interceptors after it.
#[derive(Default, Clone)]
pub struct CompositeInterceptor {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl CompositeInterceptor {
    #[must_use]
    pub fn new(interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    pub fn add(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl Interceptor for CompositeInterceptor {
    fn on_executing(&self, ctx: &HandlerContext) {
        for interceptor in &self.interceptors {
            isolate("on_executing", || interceptor.on_executing(ctx));
        }
    }

    fn on_executed(&self, ctx: &HandlerContext, response: &HandlerResponse) {
        for interceptor in &self.interceptors {
            isolate("on_executed", || interceptor.on_executed(ctx, response));
        }
    }

    fn on_exception(&self, ctx: &HandlerContext, fault: &Fault) {
        for interceptor in &self.interceptors {
            isolate("on_exception", || interceptor.on_exception(ctx, fault));
        }
    }
}

/// A panicking observer is logged and skipped; the rest still run.
fn isolate(hook: &'static str, notify: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(notify)) {
        warn!(hook, error = %Fault::from_panic(payload), "interceptor panicked");
    }
}

impl std::fmt::Debug for CompositeInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeInterceptor")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TracingInterceptor
// ---------------------------------------------------------------------------

/// Emits one structured log line per dispatch boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

impl Interceptor for TracingInterceptor {
    fn on_executing(&self, ctx: &HandlerContext) {
        debug!(
            message_type = ctx.descriptor().message_type_name(),
            handler = ctx.descriptor().handler_type_name(),
            "dispatch executing"
        );
    }

    fn on_executed(&self, ctx: &HandlerContext, response: &HandlerResponse) {
        debug!(
            message_type = ctx.descriptor().message_type_name(),
            handler = ctx.descriptor().handler_type_name(),
            completed = response.is_completed(),
            "dispatch executed"
        );
    }

    fn on_exception(&self, ctx: &HandlerContext, fault: &Fault) {
        warn!(
            message_type = ctx.descriptor().message_type_name(),
            handler = ctx.descriptor().handler_type_name(),
            error = %fault,
            "dispatch faulted"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courier_core::{Command, Message, Payload};
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::dispatch::{Handler, HandlerRegistry, MessageProcessor, ServiceRegistry};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Ship {
        crates: u32,
    }
    impl Message for Ship {}
    impl Command for Ship {}

    struct ShipHandler;

    #[async_trait]
    impl Handler<Ship> for ShipHandler {
        async fn handle(
            &self,
            message: &Ship,
            _ctx: &HandlerContext,
        ) -> anyhow::Result<Option<Payload>> {
            anyhow::ensure!(message.crates > 0, "nothing to ship");
            Ok(Some(Payload::new(message.crates)))
        }
    }

    struct Named {
        name: &'static str,
        log: Log,
    }

    impl Named {
        fn arc(name: &'static str, log: &Log) -> Arc<dyn Interceptor> {
            Arc::new(Self {
                name,
                log: log.clone(),
            })
        }

        fn record(&self, hook: &str) {
            self.log.lock().push(format!("{}:{hook}", self.name));
        }
    }

    impl Interceptor for Named {
        fn on_executing(&self, _ctx: &HandlerContext) {
            self.record("executing");
        }

        fn on_executed(&self, _ctx: &HandlerContext, _response: &HandlerResponse) {
            self.record("executed");
        }

        fn on_exception(&self, _ctx: &HandlerContext, _fault: &Fault) {
            self.record("exception");
        }
    }

    struct Panicking;

    impl Interceptor for Panicking {
        fn on_executing(&self, _ctx: &HandlerContext) {
            panic!("observer blew up");
        }

        fn on_executed(&self, _ctx: &HandlerContext, _response: &HandlerResponse) {
            panic!("observer blew up again");
        }
    }

    fn processor(interceptors: Vec<Arc<dyn Interceptor>>) -> MessageProcessor {
        let services = Arc::new(ServiceRegistry::new());
        for interceptor in interceptors {
            services.add::<dyn Interceptor>(interceptor).unwrap();
        }
        let mut handlers = HandlerRegistry::new();
        handlers.command::<Ship, _>(ShipHandler).unwrap();
        MessageProcessor::builder()
            .provider(handlers)
            .services(services)
            .build()
    }

    async fn ship(processor: &MessageProcessor, crates: u32) -> HandlerResponse {
        processor
            .send(Ship { crates }, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[test]
    fn composite_tracks_its_members() {
        let log = Log::default();
        let mut composite = CompositeInterceptor::default();
        assert!(composite.is_empty());
        composite.add(Named::arc("a", &log));
        composite.add(Named::arc("b", &log));
        assert_eq!(composite.len(), 2);
        assert_eq!(
            CompositeInterceptor::new(vec![Named::arc("c", &log)]).len(),
            1
        );
    }

    #[tokio::test]
    async fn notifications_fan_out_in_registration_order() {
        let log = Log::default();
        let processor = processor(vec![Named::arc("first", &log), Named::arc("second", &log)]);

        assert!(ship(&processor, 3).await.is_completed());
        assert_eq!(
            *log.lock(),
            vec![
                "first:executing",
                "second:executing",
                "first:executed",
                "second:executed",
            ]
        );

        log.lock().clear();
        assert!(ship(&processor, 0).await.is_faulted());
        assert_eq!(
            *log.lock(),
            vec![
                "first:executing",
                "second:executing",
                "first:exception",
                "second:exception",
                "first:executed",
                "second:executed",
            ]
        );
    }

    #[tokio::test]
    async fn panicking_interceptor_does_not_disturb_dispatch() {
        let log = Log::default();
        let processor = processor(vec![Arc::new(Panicking), Named::arc("after", &log)]);

        let response = ship(&processor, 4).await;
        assert_eq!(response.value_as::<u32>(), Some(&4));
        assert_eq!(*log.lock(), vec!["after:executing", "after:executed"]);
    }
}
