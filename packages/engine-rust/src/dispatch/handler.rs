//! Handler registration and resolution.

use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use courier_core::message::short_type_name;
use courier_core::{Command, Event, Message, MessageKind, Payload};
use dashmap::DashMap;
use futures_util::future::{self, BoxFuture};

use super::context::{HandlerContext, HandlerRequest};
use super::filter::Filter;
use crate::error::{ConfigError, DispatchError};

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

/// Handles messages of type `M`.
///
/// A command handler may reply with a value; event handlers usually return
/// `Ok(None)`. The context gives access to the owning processor, so handlers
/// can raise follow-up commands and events.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync + 'static {
    async fn handle(&self, message: &M, ctx: &HandlerContext) -> anyhow::Result<Option<Payload>>;
}

/// Object-safe invoker hiding the concrete message and handler types.
trait ErasedHandler: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a HandlerContext)
        -> BoxFuture<'a, anyhow::Result<Option<Payload>>>;
}

struct TypedHandler<M, H> {
    handler: H,
    _message: PhantomData<fn(&M)>,
}

impl<M, H> ErasedHandler for TypedHandler<M, H>
where
    M: Message,
    H: Handler<M>,
{
    fn invoke<'a>(
        &'a self,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, anyhow::Result<Option<Payload>>> {
        match ctx.message::<M>() {
            Some(message) => self.handler.handle(message, ctx),
            None => Box::pin(future::ready(Err(anyhow::anyhow!(
                "{} cannot handle a {}",
                short_type_name::<H>(),
                ctx.envelope().type_name()
            )))),
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerDescriptor
// ---------------------------------------------------------------------------

/// Everything needed to invoke one handler: the message type it accepts, its
/// filters sorted by [`Filter::order`], and the erased invoker.
///
/// Built once at registration and shared read-only by every dispatch.
pub struct HandlerDescriptor {
    message_type: TypeId,
    message_type_name: &'static str,
    kind: MessageKind,
    handler_type_name: &'static str,
    filters: Vec<Arc<dyn Filter>>,
    invoker: Box<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    /// Describes a command handler.
    #[must_use]
    pub fn for_command<C, H>(handler: H, filters: Vec<Arc<dyn Filter>>) -> Self
    where
        C: Command,
        H: Handler<C>,
    {
        Self::build::<C, H>(MessageKind::Command, handler, filters)
    }

    /// Describes an event handler.
    #[must_use]
    pub fn for_event<E, H>(handler: H, filters: Vec<Arc<dyn Filter>>) -> Self
    where
        E: Event,
        H: Handler<E>,
    {
        Self::build::<E, H>(MessageKind::Event, handler, filters)
    }

    fn build<M, H>(kind: MessageKind, handler: H, mut filters: Vec<Arc<dyn Filter>>) -> Self
    where
        M: Message,
        H: Handler<M>,
    {
        // Stable: equal orders keep declaration order.
        filters.sort_by_key(|filter| filter.order());
        Self {
            message_type: TypeId::of::<M>(),
            message_type_name: short_type_name::<M>(),
            kind,
            handler_type_name: short_type_name::<H>(),
            filters,
            invoker: Box::new(TypedHandler::<M, H> {
                handler,
                _message: PhantomData,
            }),
        }
    }

    #[must_use]
    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    #[must_use]
    pub fn message_type_name(&self) -> &'static str {
        self.message_type_name
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    #[must_use]
    pub fn handler_type_name(&self) -> &'static str {
        self.handler_type_name
    }

    /// Filters in execution order of their pre-hooks.
    #[must_use]
    pub fn filters(&self) -> &[Arc<dyn Filter>] {
        &self.filters
    }

    pub(crate) fn invoke<'a>(
        &'a self,
        ctx: &'a HandlerContext,
    ) -> BoxFuture<'a, anyhow::Result<Option<Payload>>> {
        self.invoker.invoke(ctx)
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filters: Vec<&str> = self.filters.iter().map(|filter| filter.name()).collect();
        f.debug_struct("HandlerDescriptor")
            .field("message_type", &self.message_type_name)
            .field("kind", &self.kind)
            .field("handler", &self.handler_type_name)
            .field("filters", &filters)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HandlerProvider
// ---------------------------------------------------------------------------

/// Source of handler descriptors.
pub trait HandlerProvider: Send + Sync {
    /// Command handlers keyed by message type. Empty when none are registered.
    fn handler_mapping(&self) -> HashMap<TypeId, Arc<HandlerDescriptor>>;

    /// Event handlers keyed by event type, in registration order.
    fn event_handler_mapping(&self) -> HashMap<TypeId, Vec<Arc<HandlerDescriptor>>> {
        HashMap::new()
    }
}

/// Explicit handler registration.
///
/// ```
/// use courier_core::{Command, Message, Payload};
/// use courier_engine::dispatch::{Handler, HandlerContext, HandlerRegistry};
///
/// #[derive(Debug)]
/// struct Ping;
/// impl Message for Ping {}
/// impl Command for Ping {}
///
/// struct Pong;
///
/// #[async_trait::async_trait]
/// impl Handler<Ping> for Pong {
///     async fn handle(&self, _: &Ping, _: &HandlerContext) -> anyhow::Result<Option<Payload>> {
///         Ok(Some(Payload::new("pong")))
///     }
/// }
///
/// let mut handlers = HandlerRegistry::new();
/// handlers.command::<Ping, _>(Pong).unwrap();
/// assert_eq!(handlers.command_count(), 1);
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    commands: HashMap<TypeId, Arc<HandlerDescriptor>>,
    events: HashMap<TypeId, Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for command `C`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateHandler`] if `C` already has a handler.
    pub fn command<C, H>(&mut self, handler: H) -> Result<&mut Self, ConfigError>
    where
        C: Command,
        H: Handler<C>,
    {
        self.command_with::<C, H>(handler, Vec::new())
    }

    /// Registers the handler for command `C` wrapped in `filters`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateHandler`] if `C` already has a handler.
    pub fn command_with<C, H>(
        &mut self,
        handler: H,
        filters: Vec<Arc<dyn Filter>>,
    ) -> Result<&mut Self, ConfigError>
    where
        C: Command,
        H: Handler<C>,
    {
        let key = TypeId::of::<C>();
        if self.commands.contains_key(&key) {
            return Err(ConfigError::DuplicateHandler {
                message_type: short_type_name::<C>(),
            });
        }
        self.commands.insert(
            key,
            Arc::new(HandlerDescriptor::for_command::<C, H>(handler, filters)),
        );
        Ok(self)
    }

    /// Adds a handler for event `E`. Events may have any number of handlers.
    pub fn event<E, H>(&mut self, handler: H) -> &mut Self
    where
        E: Event,
        H: Handler<E>,
    {
        self.event_with::<E, H>(handler, Vec::new())
    }

    /// Adds a handler for event `E` wrapped in `filters`.
    pub fn event_with<E, H>(&mut self, handler: H, filters: Vec<Arc<dyn Filter>>) -> &mut Self
    where
        E: Event,
        H: Handler<E>,
    {
        self.events
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Arc::new(HandlerDescriptor::for_event::<E, H>(handler, filters)));
        self
    }

    #[must_use]
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn event_handler_count(&self) -> usize {
        self.events.values().map(Vec::len).sum()
    }
}

impl HandlerProvider for HandlerRegistry {
    fn handler_mapping(&self) -> HashMap<TypeId, Arc<HandlerDescriptor>> {
        self.commands.clone()
    }

    fn event_handler_mapping(&self) -> HashMap<TypeId, Vec<Arc<HandlerDescriptor>>> {
        self.events.clone()
    }
}

// ---------------------------------------------------------------------------
// HandlerSelector
// ---------------------------------------------------------------------------

/// Picks the descriptors for an incoming message.
pub trait HandlerSelector: Send + Sync {
    /// Exactly one descriptor for the command's runtime type.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoHandler`] or [`DispatchError::AmbiguousHandler`].
    fn select_handler(
        &self,
        request: &HandlerRequest,
    ) -> Result<Arc<HandlerDescriptor>, DispatchError>;

    /// Every descriptor for the event's runtime type, possibly none.
    ///
    /// # Errors
    ///
    /// Implementations may reject an event they cannot route.
    fn select_event_handlers(
        &self,
        request: &HandlerRequest,
    ) -> Result<Arc<[Arc<HandlerDescriptor>]>, DispatchError>;
}

enum Resolution {
    Unique(Arc<HandlerDescriptor>),
    Ambiguous(Vec<&'static str>),
}

/// Selector over the merged mappings of one or more providers.
///
/// A command type contributed by more than one provider resolves to
/// [`DispatchError::AmbiguousHandler`] instead of picking one silently.
#[derive(Default)]
pub struct DefaultHandlerSelector {
    commands: DashMap<TypeId, Resolution>,
    events: DashMap<TypeId, Arc<[Arc<HandlerDescriptor>]>>,
}

impl DefaultHandlerSelector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a selector from `providers`, merged in order.
    pub fn from_providers<'a, I>(providers: I) -> Self
    where
        I: IntoIterator<Item = &'a dyn HandlerProvider>,
    {
        let selector = Self::new();
        for provider in providers {
            selector.add_provider(provider);
        }
        selector
    }

    /// Merges the mappings of `provider` into the cache.
    pub fn add_provider(&self, provider: &dyn HandlerProvider) {
        for (type_id, descriptor) in provider.handler_mapping() {
            let name = descriptor.handler_type_name();
            self.commands
                .entry(type_id)
                .and_modify(|resolution| {
                    *resolution = match resolution {
                        Resolution::Unique(existing) => {
                            Resolution::Ambiguous(vec![existing.handler_type_name(), name])
                        }
                        Resolution::Ambiguous(names) => {
                            let mut names = std::mem::take(names);
                            names.push(name);
                            Resolution::Ambiguous(names)
                        }
                    };
                })
                .or_insert_with(|| Resolution::Unique(descriptor.clone()));
        }

        for (type_id, descriptors) in provider.event_handler_mapping() {
            let mut merged = self
                .events
                .get(&type_id)
                .map(|existing| existing.to_vec())
                .unwrap_or_default();
            merged.extend(descriptors);
            self.events.insert(type_id, merged.into());
        }
    }

    /// Resolves the command handler for `message_type`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NoHandler`] or [`DispatchError::AmbiguousHandler`].
    pub fn resolve(
        &self,
        message_type: TypeId,
        type_name: &'static str,
    ) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        match self.commands.get(&message_type).as_deref() {
            Some(Resolution::Unique(descriptor)) => Ok(descriptor.clone()),
            Some(Resolution::Ambiguous(handlers)) => Err(DispatchError::AmbiguousHandler {
                message_type: type_name,
                handlers: handlers.clone(),
            }),
            None => Err(DispatchError::NoHandler {
                message_type: type_name,
            }),
        }
    }

    /// Every event handler for `message_type`, in registration order.
    #[must_use]
    pub fn resolve_events(&self, message_type: TypeId) -> Arc<[Arc<HandlerDescriptor>]> {
        self.events
            .get(&message_type)
            .map_or_else(|| Arc::from(Vec::new()), |entry| entry.value().clone())
    }
}

impl HandlerSelector for DefaultHandlerSelector {
    fn select_handler(
        &self,
        request: &HandlerRequest,
    ) -> Result<Arc<HandlerDescriptor>, DispatchError> {
        let envelope = request.envelope();
        self.resolve(envelope.type_id(), envelope.type_name())
    }

    fn select_event_handlers(
        &self,
        request: &HandlerRequest,
    ) -> Result<Arc<[Arc<HandlerDescriptor>]>, DispatchError> {
        Ok(self.resolve_events(request.envelope().type_id()))
    }
}

impl std::fmt::Debug for DefaultHandlerSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultHandlerSelector")
            .field("commands", &self.commands.len())
            .field("events", &self.events.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use courier_core::SourceId;

    use super::*;

    #[derive(Debug)]
    struct Deposit;
    impl Message for Deposit {}
    impl Command for Deposit {}

    #[derive(Debug)]
    struct Withdraw;
    impl Message for Withdraw {}
    impl Command for Withdraw {}

    #[derive(Debug)]
    struct Deposited(SourceId);
    impl Message for Deposited {}
    impl Event for Deposited {
        fn source_id(&self) -> SourceId {
            self.0
        }
    }

    struct DepositHandler;

    #[async_trait]
    impl Handler<Deposit> for DepositHandler {
        async fn handle(&self, _: &Deposit, _: &HandlerContext) -> anyhow::Result<Option<Payload>> {
            Ok(None)
        }
    }

    struct AuditDeposit;

    #[async_trait]
    impl Handler<Deposit> for AuditDeposit {
        async fn handle(&self, _: &Deposit, _: &HandlerContext) -> anyhow::Result<Option<Payload>> {
            Ok(None)
        }
    }

    struct Projection;

    #[async_trait]
    impl Handler<Deposited> for Projection {
        async fn handle(
            &self,
            _: &Deposited,
            _: &HandlerContext,
        ) -> anyhow::Result<Option<Payload>> {
            Ok(None)
        }
    }

    struct Named(&'static str, i32);

    #[async_trait]
    impl Filter for Named {
        fn name(&self) -> &'static str {
            self.0
        }

        fn order(&self) -> i32 {
            self.1
        }
    }

    #[test]
    fn duplicate_command_registration_is_rejected() {
        let mut handlers = HandlerRegistry::new();
        handlers.command::<Deposit, _>(DepositHandler).unwrap();
        let err = handlers.command::<Deposit, _>(AuditDeposit).err().unwrap();
        assert_eq!(
            err,
            ConfigError::DuplicateHandler {
                message_type: "Deposit"
            }
        );
    }

    #[test]
    fn empty_registry_yields_empty_mapping() {
        let handlers = HandlerRegistry::new();
        assert!(handlers.handler_mapping().is_empty());
        assert!(handlers.event_handler_mapping().is_empty());
    }

    #[test]
    fn descriptor_sorts_filters_stably() {
        let filters: Vec<Arc<dyn Filter>> = vec![
            Arc::new(Named("late", 10)),
            Arc::new(Named("first-zero", 0)),
            Arc::new(Named("early", -5)),
            Arc::new(Named("second-zero", 0)),
        ];
        let descriptor = HandlerDescriptor::for_command::<Deposit, _>(DepositHandler, filters);
        let names: Vec<&str> = descriptor.filters().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["early", "first-zero", "second-zero", "late"]);
        assert_eq!(descriptor.kind(), MessageKind::Command);
        assert_eq!(descriptor.message_type_name(), "Deposit");
        assert_eq!(descriptor.handler_type_name(), "DepositHandler");
    }

    #[test]
    fn selector_resolves_unique_and_missing_handlers() {
        let mut handlers = HandlerRegistry::new();
        handlers.command::<Deposit, _>(DepositHandler).unwrap();
        let selector = DefaultHandlerSelector::from_providers([&handlers as &dyn HandlerProvider]);

        let found = selector.resolve(TypeId::of::<Deposit>(), "Deposit").unwrap();
        assert_eq!(found.handler_type_name(), "DepositHandler");

        let missing = selector.resolve(TypeId::of::<Withdraw>(), "Withdraw");
        assert!(matches!(
            missing,
            Err(DispatchError::NoHandler {
                message_type: "Withdraw"
            })
        ));
    }

    #[test]
    fn selector_flags_handlers_from_two_providers_as_ambiguous() {
        let mut first = HandlerRegistry::new();
        first.command::<Deposit, _>(DepositHandler).unwrap();
        let mut second = HandlerRegistry::new();
        second.command::<Deposit, _>(AuditDeposit).unwrap();

        let selector = DefaultHandlerSelector::new();
        selector.add_provider(&first);
        selector.add_provider(&second);

        match selector.resolve(TypeId::of::<Deposit>(), "Deposit") {
            Err(DispatchError::AmbiguousHandler { handlers, .. }) => {
                assert_eq!(handlers, vec!["DepositHandler", "AuditDeposit"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn event_handlers_accumulate_across_providers() {
        let mut first = HandlerRegistry::new();
        first.event::<Deposited, _>(Projection);
        let mut second = HandlerRegistry::new();
        second
            .event::<Deposited, _>(Projection)
            .event::<Deposited, _>(Projection);
        assert_eq!(second.event_handler_count(), 2);

        let selector = DefaultHandlerSelector::from_providers([
            &first as &dyn HandlerProvider,
            &second as &dyn HandlerProvider,
        ]);
        assert_eq!(selector.resolve_events(TypeId::of::<Deposited>()).len(), 3);
        assert!(selector.resolve_events(TypeId::of::<Deposit>()).is_empty());
    }
}
