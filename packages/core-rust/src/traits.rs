//! Contracts for collaborators that live outside the dispatch core.
//!
//! Handlers reach storage only through these traits; the dispatcher itself
//! never touches them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::message::{Event, SourceId};

/// An event as persisted by an [`EventStore`]: opaque JSON payload keyed by
/// its source id and event name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub source_id: SourceId,
    pub event_name: String,
    pub payload: serde_json::Value,
}

impl StoredEvent {
    /// Serializes a domain event into its stored form.
    ///
    /// # Errors
    ///
    /// Returns an error if the event cannot be serialized to JSON.
    pub fn from_event<E: Event + Serialize>(event: &E) -> anyhow::Result<Self> {
        Ok(Self {
            source_id: event.source_id(),
            event_name: event.event_name().to_string(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// Append-only event persistence keyed by source id.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends an event under `event_name` to its source's stream.
    async fn store(
        &self,
        source_id: SourceId,
        event_name: &str,
        payload: serde_json::Value,
        token: &CancellationToken,
    ) -> anyhow::Result<()>;

    /// Loads every event of a source in append order.
    async fn load(
        &self,
        source_id: SourceId,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<StoredEvent>>;
}

/// A value that can be looked up by key through a [`QueryContext`].
pub trait Keyed: Clone + Send + Sync + 'static {
    type Key: PartialEq + Send + Sync;

    fn key(&self) -> Self::Key;
}

/// Read access to typed collections for the duration of one unit of work.
///
/// Acquired per unit of work and released on drop.
pub trait QueryContext: Send {
    /// Returns every stored `T`.
    fn query<T: Keyed>(&self) -> Vec<T>;

    /// Returns the `T` with the given key, if any.
    fn find<T: Keyed>(&self, key: &T::Key) -> Option<T>;
}
