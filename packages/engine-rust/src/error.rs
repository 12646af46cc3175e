//! Error types for the dispatch engine.
//!
//! Handler failures are not errors at this level: they are captured as a
//! [`Fault`] inside a `HandlerResponse`. The types here cover configuration
//! mistakes, queue state, broker lifecycle, and aggregated publish failures.

use courier_core::{Fault, MessageKind};

/// A message could not be routed to a handler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for {message_type}")]
    NoHandler { message_type: &'static str },
    #[error("ambiguous handler registration for {message_type}: {handlers:?}")]
    AmbiguousHandler {
        message_type: &'static str,
        handlers: Vec<&'static str>,
    },
    #[error("{message_type} is a {actual:?} but was dispatched as a {expected:?}")]
    KindMismatch {
        message_type: &'static str,
        expected: MessageKind,
        actual: MessageKind,
    },
}

/// The engine was configured incorrectly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration is frozen once the first message has been dispatched")]
    Frozen,
    #[error("a handler is already registered for {message_type}")]
    DuplicateHandler { message_type: &'static str },
    #[error("degree of parallelism must be at least 1")]
    InvalidParallelism,
}

/// Queue state errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue operation cancelled")]
    Cancelled,
    #[error("queue is completed and accepts no further commands")]
    Completed,
}

/// Broker lifecycle errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is already running")]
    AlreadyStarted,
    #[error("broker has stopped and cannot be restarted")]
    Stopped,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One failed recipient of a publish.
#[derive(Debug, Clone)]
pub struct SubscriberFault {
    /// Subscriber id or handler type name.
    pub subscriber: String,
    pub fault: Fault,
}

/// A publish completed but at least one recipient failed, or the event could
/// not be routed at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("{} of {attempted} recipient(s) of `{event_name}` failed", failures.len())]
    Faulted {
        event_name: String,
        attempted: usize,
        failures: Vec<SubscriberFault>,
    },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl PublishError {
    /// Captured recipient faults, in invocation order. Empty for routing errors.
    #[must_use]
    pub fn failures(&self) -> &[SubscriberFault] {
        match self {
            Self::Faulted { failures, .. } => failures,
            Self::Dispatch(_) => &[],
        }
    }
}
