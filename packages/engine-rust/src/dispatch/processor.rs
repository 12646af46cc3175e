use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::{Command, Envelope, Event, Fault, MessageKind};
use futures_util::future::{join_all, BoxFuture};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, error};

use super::config::DispatchConfig;
use super::context::{HandlerContext, HandlerRequest, HandlerResponse};
use super::handler::{DefaultHandlerSelector, HandlerDescriptor, HandlerProvider, HandlerSelector};
use super::interceptor::{CompositeInterceptor, Interceptor};
use super::pipeline::FilterPipeline;
use super::registry::ServiceRegistry;
use crate::error::{DispatchError, PublishError, SubscriberFault};
use crate::messaging::MessageHub;

// ---------------------------------------------------------------------------
// MessageProcessor
// ---------------------------------------------------------------------------

/// Entry point for dispatching commands and publishing events.
///
/// Cheap to clone; every clone shares the same handlers, hub, and services.
/// Handlers receive the processor through their context and may send
/// further commands or publish events from inside a dispatch.
#[derive(Clone)]
pub struct MessageProcessor {
    inner: Arc<ProcessorInner>,
}

struct ProcessorInner {
    selector: Arc<dyn HandlerSelector>,
    pipeline: FilterPipeline,
    hub: Arc<MessageHub>,
    services: Arc<ServiceRegistry>,
    config: Arc<DispatchConfig>,
}

impl MessageProcessor {
    #[must_use]
    pub fn builder() -> ProcessorBuilder {
        ProcessorBuilder::default()
    }

    /// Dispatches one message.
    ///
    /// A command goes to its single handler. An event is published as by
    /// [`publish_envelope`](Self::publish_envelope), with recipient failures
    /// reported as a faulted response.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] when the message cannot be routed. Handler
    /// failures are not errors: they come back as [`HandlerResponse::Faulted`].
    pub async fn process(
        &self,
        envelope: Envelope,
        token: &CancellationToken,
    ) -> Result<HandlerResponse, DispatchError> {
        if envelope.kind() == MessageKind::Event {
            return match self.publish_envelope(envelope, token).await {
                Ok(_) => Ok(HandlerResponse::Completed(None)),
                Err(PublishError::Dispatch(err)) => Err(err),
                Err(err) => Ok(HandlerResponse::Faulted(Fault::new(err.into()))),
            };
        }

        self.inner.services.freeze();
        let request = self.request(envelope, token);
        let descriptor = match self.inner.selector.select_handler(&request) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(
                    message_type = request.envelope().type_name(),
                    error = %err,
                    "command could not be routed"
                );
                return Err(err);
            }
        };
        debug!(
            message_type = descriptor.message_type_name(),
            handler = descriptor.handler_type_name(),
            "dispatching command"
        );
        Ok(self.execute(request, descriptor).await)
    }

    /// Dispatches a typed command.
    ///
    /// # Errors
    ///
    /// See [`process`](Self::process).
    pub async fn send<C: Command>(
        &self,
        command: C,
        token: &CancellationToken,
    ) -> Result<HandlerResponse, DispatchError> {
        self.process(Envelope::command(command), token).await
    }

    /// Publishes a typed event. Returns the number of recipients reached.
    ///
    /// # Errors
    ///
    /// See [`publish_envelope`](Self::publish_envelope).
    pub async fn publish<E: Event>(
        &self,
        event: E,
        token: &CancellationToken,
    ) -> Result<usize, PublishError> {
        self.publish_envelope(Envelope::event(event), token).await
    }

    /// Runs every registered handler for the event through its pipeline, then
    /// delivers the event to the hub's subscribers under its event name.
    ///
    /// Recipients are isolated: a failing handler or subscriber does not stop
    /// the others. Returns the number of recipients reached.
    ///
    /// # Errors
    ///
    /// [`PublishError::Faulted`] aggregating every failed recipient, or
    /// [`PublishError::Dispatch`] if the envelope is not an event.
    pub async fn publish_envelope(
        &self,
        envelope: Envelope,
        token: &CancellationToken,
    ) -> Result<usize, PublishError> {
        if envelope.kind() != MessageKind::Event {
            let err = DispatchError::KindMismatch {
                message_type: envelope.type_name(),
                expected: MessageKind::Event,
                actual: envelope.kind(),
            };
            error!(error = %err, "publish rejected");
            return Err(err.into());
        }

        self.inner.services.freeze();
        let event_name = envelope.event_name().unwrap_or(envelope.type_name());
        let payload = envelope.payload();
        let request = self.request(envelope, token);
        let descriptors = self.inner.selector.select_event_handlers(&request)?;

        let executions: Vec<_> = descriptors
            .iter()
            .map(|descriptor| {
                let processor = self.clone();
                let request = request.clone();
                let descriptor = descriptor.clone();
                async move {
                    let name = descriptor.handler_type_name();
                    (name, processor.execute(request, descriptor).await)
                }
            })
            .collect();
        let responses = join_all(executions).await;

        let mut attempted = responses.len();
        let mut failures: Vec<SubscriberFault> = responses
            .into_iter()
            .filter_map(|(name, response)| match response {
                HandlerResponse::Faulted(fault) => Some(SubscriberFault {
                    subscriber: name.to_string(),
                    fault,
                }),
                HandlerResponse::Completed(_) => None,
            })
            .collect();

        match self.inner.hub.publish(event_name, payload).await {
            Ok(reached) => attempted += reached,
            Err(PublishError::Faulted {
                attempted: reached,
                failures: hub_failures,
                ..
            }) => {
                attempted += reached;
                failures.extend(hub_failures);
            }
            Err(err @ PublishError::Dispatch(_)) => return Err(err),
        }

        if failures.is_empty() {
            debug!(event_name, recipients = attempted, "event published");
            Ok(attempted)
        } else {
            Err(PublishError::Faulted {
                event_name: event_name.to_string(),
                attempted,
                failures,
            })
        }
    }

    /// The hub events are delivered to.
    #[must_use]
    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.inner.hub
    }

    #[must_use]
    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.inner.services
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    fn request(&self, envelope: Envelope, token: &CancellationToken) -> Arc<HandlerRequest> {
        Arc::new(HandlerRequest::new(
            envelope,
            self.clone(),
            token.clone(),
            self.inner.config.clone(),
        ))
    }

    async fn execute(
        &self,
        request: Arc<HandlerRequest>,
        descriptor: Arc<HandlerDescriptor>,
    ) -> HandlerResponse {
        let mut ctx = HandlerContext::new(request, descriptor);
        self.inner.pipeline.execute(&mut ctx).await
    }
}

impl std::fmt::Debug for MessageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageProcessor")
            .field("hub", &self.inner.hub)
            .field("interceptors", &self.inner.pipeline.interceptor_count())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ProcessorBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`MessageProcessor`].
///
/// Anything not set explicitly is resolved from the [`ServiceRegistry`] once,
/// at [`build`](Self::build) time:
///
/// | Concern      | Registry key                | Fallback                    |
/// |--------------|-----------------------------|-----------------------------|
/// | selector     | `dyn HandlerSelector`       | [`DefaultHandlerSelector`]  |
/// | providers    | `dyn HandlerProvider` (all) | none                        |
/// | hub          | `MessageHub`                | a fresh hub                 |
/// | interceptors | `dyn Interceptor` (all)     | none                        |
/// | config       | `DispatchConfig`            | `DispatchConfig::default()` |
#[derive(Default)]
pub struct ProcessorBuilder {
    providers: Vec<Arc<dyn HandlerProvider>>,
    selector: Option<Arc<dyn HandlerSelector>>,
    services: Option<Arc<ServiceRegistry>>,
    config: Option<DispatchConfig>,
}

impl ProcessorBuilder {
    /// Adds a handler provider, typically a populated `HandlerRegistry`.
    #[must_use]
    pub fn provider(mut self, provider: impl HandlerProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Uses `selector` instead of merging the providers.
    #[must_use]
    pub fn selector(mut self, selector: Arc<dyn HandlerSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    #[must_use]
    pub fn services(mut self, services: Arc<ServiceRegistry>) -> Self {
        self.services = Some(services);
        self
    }

    #[must_use]
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn build(self) -> MessageProcessor {
        let services = self.services.unwrap_or_default();

        let selector: Arc<dyn HandlerSelector> = match self
            .selector
            .or_else(|| services.get::<dyn HandlerSelector>())
        {
            Some(selector) => selector,
            None => {
                let merged = DefaultHandlerSelector::new();
                for provider in services
                    .get_all::<dyn HandlerProvider>()
                    .iter()
                    .chain(&self.providers)
                {
                    merged.add_provider(provider.as_ref());
                }
                Arc::new(merged)
            }
        };

        let hub = services.get::<MessageHub>().unwrap_or_default();
        let interceptors = CompositeInterceptor::new(services.get_all::<dyn Interceptor>());
        let config = self
            .config
            .or_else(|| services.get::<DispatchConfig>().map(|config| (*config).clone()))
            .unwrap_or_default();

        MessageProcessor {
            inner: Arc::new(ProcessorInner {
                selector,
                pipeline: FilterPipeline::new(interceptors),
                hub,
                services,
                config: Arc::new(config),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatch (tower request)
// ---------------------------------------------------------------------------

/// Request type of the processor's [`tower::Service`] implementation.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub envelope: Envelope,
    pub token: CancellationToken,
}

impl Dispatch {
    #[must_use]
    pub fn new(envelope: Envelope, token: CancellationToken) -> Self {
        Self { envelope, token }
    }
}

impl Service<Dispatch> for MessageProcessor {
    type Response = HandlerResponse;
    type Error = DispatchError;
    type Future = BoxFuture<'static, Result<HandlerResponse, DispatchError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Dispatch) -> Self::Future {
        let processor = self.clone();
        Box::pin(async move { processor.process(request.envelope, &request.token).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_core::{Message, Payload, SourceId};
    use tower::ServiceExt;

    use super::*;
    use crate::dispatch::{Handler, HandlerRegistry};
    use crate::error::ConfigError;
    use crate::messaging::callback;

    #[derive(Debug)]
    struct PlaceOrder {
        order: SourceId,
        total: u32,
    }
    impl Message for PlaceOrder {}
    impl Command for PlaceOrder {}

    #[derive(Debug)]
    struct ShipOrder(SourceId);
    impl Message for ShipOrder {}
    impl Command for ShipOrder {}

    #[derive(Debug, Clone)]
    struct OrderPlaced {
        order: SourceId,
        total: u32,
    }
    impl Message for OrderPlaced {}
    impl Event for OrderPlaced {
        fn source_id(&self) -> SourceId {
            self.order
        }
    }

    #[derive(Debug)]
    struct Unrouted;
    impl Message for Unrouted {}
    impl Command for Unrouted {}

    /// Publishes `OrderPlaced` and replies with the order total.
    struct Checkout;

    #[async_trait]
    impl Handler<PlaceOrder> for Checkout {
        async fn handle(
            &self,
            message: &PlaceOrder,
            ctx: &HandlerContext,
        ) -> anyhow::Result<Option<Payload>> {
            ctx.processor()
                .publish(
                    OrderPlaced {
                        order: message.order,
                        total: message.total,
                    },
                    ctx.token(),
                )
                .await?;
            Ok(Some(Payload::new(message.total)))
        }
    }

    /// Reacts to `OrderPlaced` by sending `ShipOrder`.
    struct ShippingSaga;

    #[async_trait]
    impl Handler<OrderPlaced> for ShippingSaga {
        async fn handle(
            &self,
            event: &OrderPlaced,
            ctx: &HandlerContext,
        ) -> anyhow::Result<Option<Payload>> {
            let response = ctx.processor().send(ShipOrder(event.order), ctx.token()).await?;
            response.into_result()?;
            Ok(None)
        }
    }

    struct Shipping {
        shipped: Arc<parking_lot::Mutex<Vec<SourceId>>>,
    }

    #[async_trait]
    impl Handler<ShipOrder> for Shipping {
        async fn handle(
            &self,
            message: &ShipOrder,
            _ctx: &HandlerContext,
        ) -> anyhow::Result<Option<Payload>> {
            self.shipped.lock().push(message.0);
            Ok(None)
        }
    }

    struct FailingProjection;

    #[async_trait]
    impl Handler<OrderPlaced> for FailingProjection {
        async fn handle(&self, _: &OrderPlaced, _: &HandlerContext) -> anyhow::Result<Option<Payload>> {
            anyhow::bail!("projection store offline")
        }
    }

    fn shop(shipped: &Arc<parking_lot::Mutex<Vec<SourceId>>>) -> HandlerRegistry {
        let mut handlers = HandlerRegistry::new();
        handlers
            .command::<PlaceOrder, _>(Checkout)
            .unwrap()
            .command::<ShipOrder, _>(Shipping {
                shipped: shipped.clone(),
            })
            .unwrap()
            .event::<OrderPlaced, _>(ShippingSaga);
        handlers
    }

    #[tokio::test]
    async fn command_chain_publishes_event_and_sends_follow_up() {
        let shipped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let processor = MessageProcessor::builder().provider(shop(&shipped)).build();

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        processor.hub().subscribe(
            "OrderPlaced",
            "mailer",
            callback(move |payload| {
                let counter = counter.clone();
                async move {
                    anyhow::ensure!(payload.is::<OrderPlaced>(), "unexpected payload");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let order = SourceId::new();
        let response = processor
            .send(PlaceOrder { order, total: 42 }, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.value_as::<u32>(), Some(&42));
        assert_eq!(*shipped.lock(), vec![order]);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrouted_command_is_a_dispatch_error() {
        let processor = MessageProcessor::builder().build();
        let err = processor
            .send(Unrouted, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::NoHandler {
                message_type: "Unrouted"
            }
        ));
    }

    #[tokio::test]
    async fn publishing_a_command_envelope_is_rejected() {
        let processor = MessageProcessor::builder().build();
        let err = processor
            .publish_envelope(Envelope::command(Unrouted), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PublishError::Dispatch(DispatchError::KindMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn event_without_recipients_is_a_no_op() {
        let processor = MessageProcessor::builder().build();
        let reached = processor
            .publish(
                OrderPlaced {
                    order: SourceId::new(),
                    total: 1,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reached, 0);
    }

    #[tokio::test]
    async fn failing_event_handler_is_isolated_and_reported() {
        let shipped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut projections = HandlerRegistry::new();
        projections.event::<OrderPlaced, _>(FailingProjection);
        let processor = MessageProcessor::builder()
            .provider(shop(&shipped))
            .provider(projections)
            .build();

        let event = OrderPlaced {
            order: SourceId::new(),
            total: 7,
        };
        let err = processor
            .publish(event.clone(), &CancellationToken::new())
            .await
            .unwrap_err();

        // The saga still ran and shipped the order.
        assert_eq!(*shipped.lock(), vec![event.order]);
        match err {
            PublishError::Faulted {
                attempted,
                failures,
                ..
            } => {
                assert_eq!(attempted, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].subscriber, "FailingProjection");
            }
            other @ PublishError::Dispatch(_) => panic!("unexpected error {other}"),
        }

        // Through `process`, the same failure is a faulted response.
        let response = processor
            .process(Envelope::event(event), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.is_faulted());
    }

    #[tokio::test]
    async fn first_dispatch_freezes_services() {
        let services = Arc::new(ServiceRegistry::new());
        let processor = MessageProcessor::builder()
            .services(services.clone())
            .build();
        services.add(Arc::new(DispatchConfig::default())).unwrap();

        let _ = processor.send(Unrouted, &CancellationToken::new()).await;
        assert!(services.is_frozen());
        assert_eq!(
            services.add(Arc::new(DispatchConfig::default())),
            Err(ConfigError::Frozen)
        );
    }

    #[tokio::test]
    async fn builder_resolves_collaborators_from_services() {
        let services = Arc::new(ServiceRegistry::new());
        let hub = Arc::new(MessageHub::new());
        let shipped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        services.add(hub.clone()).unwrap();
        services
            .add::<dyn HandlerProvider>(Arc::new(shop(&shipped)))
            .unwrap();
        services
            .add(Arc::new(DispatchConfig {
                degree_of_parallelism: 2,
                ..DispatchConfig::default()
            }))
            .unwrap();

        let processor = MessageProcessor::builder().services(services).build();
        assert!(Arc::ptr_eq(processor.hub(), &hub));
        assert_eq!(processor.config().degree_of_parallelism, 2);

        let response = processor
            .send(ShipOrder(SourceId::new()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.is_completed());
        assert_eq!(shipped.lock().len(), 1);
    }

    #[tokio::test]
    async fn processor_is_a_tower_service() {
        let shipped = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let processor = MessageProcessor::builder().provider(shop(&shipped)).build();

        let response = processor
            .oneshot(Dispatch::new(
                Envelope::command(ShipOrder(SourceId::new())),
                CancellationToken::new(),
            ))
            .await
            .unwrap();
        assert!(response.is_completed());
        assert_eq!(shipped.lock().len(), 1);
    }
}
