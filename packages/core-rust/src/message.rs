//! Message model: commands, events, and the type-erased `Envelope` that carries
//! them through the dispatch pipeline and the command queue.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SourceId
// ---------------------------------------------------------------------------

/// Identifier of the entity that raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceId(Uuid);

impl SourceId {
    /// Generates a fresh random source id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SourceId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SourceId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Message traits
// ---------------------------------------------------------------------------

/// Root trait of everything that can be dispatched.
pub trait Message: Any + Send + Sync + fmt::Debug {}

/// Requested work. Routed to exactly one handler.
pub trait Command: Message {}

/// A fact that happened. Fanned out to zero or more handlers and hub subscribers.
///
/// Events are immutable once constructed: the dispatcher only ever hands out
/// shared references.
pub trait Event: Message {
    /// Identifier of the entity that raised this event.
    fn source_id(&self) -> SourceId;

    /// Name under which the event is published on the message hub.
    /// Defaults to the unqualified type name.
    fn event_name(&self) -> &'static str
    where
        Self: Sized,
    {
        short_type_name::<Self>()
    }
}

/// Distinguishes the two message families inside an `Envelope`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
}

/// Returns the last path segment of `T`'s type name, ignoring generic arguments.
#[must_use]
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opaque, cheaply clonable value.
///
/// Used as the message hub payload and as the success value of a handler.
#[derive(Clone)]
pub struct Payload {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl Payload {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps an already shared value without copying it.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            type_name: short_type_name::<T>(),
            value,
        }
    }

    /// Borrows the value as `T`, if that is its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Returns `true` if the value is a `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    /// Unqualified type name of the wrapped value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Type-erased message as it travels through queues and the dispatch pipeline.
///
/// Handler selection is keyed on [`Envelope::type_id`], the exact runtime type
/// of the wrapped message.
#[derive(Clone)]
pub struct Envelope {
    type_id: TypeId,
    type_name: &'static str,
    kind: MessageKind,
    event_name: Option<&'static str>,
    source_id: Option<SourceId>,
    body: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    /// Wraps a command.
    pub fn command<C: Command>(command: C) -> Self {
        Self {
            type_id: TypeId::of::<C>(),
            type_name: short_type_name::<C>(),
            kind: MessageKind::Command,
            event_name: None,
            source_id: None,
            body: Arc::new(command),
        }
    }

    /// Wraps an event, capturing its name and source id.
    pub fn event<E: Event>(event: E) -> Self {
        Self {
            type_id: TypeId::of::<E>(),
            type_name: short_type_name::<E>(),
            kind: MessageKind::Event,
            event_name: Some(event.event_name()),
            source_id: Some(event.source_id()),
            body: Arc::new(event),
        }
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    #[must_use]
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Hub name of the event. `None` for commands.
    #[must_use]
    pub fn event_name(&self) -> Option<&'static str> {
        self.event_name
    }

    /// Source id of the event. `None` for commands.
    #[must_use]
    pub fn source_id(&self) -> Option<SourceId> {
        self.source_id
    }

    /// Borrows the message as `T`, if that is its concrete type.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.body.downcast_ref::<T>()
    }

    /// Returns the message body as an opaque payload sharing the same allocation.
    #[must_use]
    pub fn payload(&self) -> Payload {
        Payload {
            type_name: self.type_name,
            value: Arc::clone(&self.body),
        }
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .field("event_name", &self.event_name)
            .field("source_id", &self.source_id)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct CreateAccount {
        owner: String,
    }

    impl Message for CreateAccount {}
    impl Command for CreateAccount {}

    #[derive(Debug)]
    struct AccountCreated {
        id: SourceId,
    }

    impl Message for AccountCreated {}
    impl Event for AccountCreated {
        fn source_id(&self) -> SourceId {
            self.id
        }
    }

    #[test]
    fn short_type_name_strips_path_and_generics() {
        assert_eq!(short_type_name::<CreateAccount>(), "CreateAccount");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
    }

    #[test]
    fn command_envelope_downcasts_to_concrete_type() {
        let env = Envelope::command(CreateAccount {
            owner: "ada".to_string(),
        });
        assert_eq!(env.kind(), MessageKind::Command);
        assert_eq!(env.type_id(), TypeId::of::<CreateAccount>());
        assert!(env.event_name().is_none());
        assert_eq!(
            env.downcast_ref::<CreateAccount>().map(|c| c.owner.as_str()),
            Some("ada")
        );
        assert!(env.downcast_ref::<AccountCreated>().is_none());
    }

    #[test]
    fn event_envelope_carries_name_and_source() {
        let id = SourceId::new();
        let env = Envelope::event(AccountCreated { id });
        assert_eq!(env.kind(), MessageKind::Event);
        assert_eq!(env.event_name(), Some("AccountCreated"));
        assert_eq!(env.source_id(), Some(id));
    }

    #[test]
    fn envelope_names_match_short_type_names() {
        let command = Envelope::command(CreateAccount {
            owner: "linus".to_string(),
        });
        let event = Envelope::event(AccountCreated { id: SourceId::new() });
        assert_eq!(command.type_name(), "CreateAccount");
        assert_eq!(event.type_name(), "AccountCreated");
        assert_eq!(Payload::new(7_u8).type_name(), "u8");
    }

    #[test]
    fn payload_shares_envelope_body() {
        let env = Envelope::command(CreateAccount {
            owner: "grace".to_string(),
        });
        let payload = env.payload();
        assert!(payload.is::<CreateAccount>());
        assert_eq!(payload.type_name(), env.type_name());
        assert!(std::ptr::eq(
            payload.downcast_ref::<CreateAccount>().unwrap(),
            env.downcast_ref::<CreateAccount>().unwrap()
        ));
    }

    #[test]
    fn source_id_display_matches_uuid() {
        let uuid = Uuid::new_v4();
        let id = SourceId::from(uuid);
        assert_eq!(id.to_string(), uuid.to_string());
        assert_eq!(id.as_uuid(), &uuid);
    }
}
