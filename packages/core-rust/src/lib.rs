//! Courier core: message model, captured faults, async combinators, and
//! transient-error classification shared by the dispatch engine.

pub mod combinators;
pub mod fault;
pub mod message;
pub mod retry;
pub mod traits;

pub use combinators::Cancelled;
pub use fault::{Fault, Panicked};
pub use message::{Command, Envelope, Event, Message, MessageKind, Payload, SourceId};
pub use retry::{AllTransient, NoneTransient, TransientByType, TransientErrorDetectionStrategy};
pub use traits::{EventStore, Keyed, QueryContext, StoredEvent};
