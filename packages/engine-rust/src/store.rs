//! In-memory implementations of the collaborator contracts.
//!
//! Handlers are given these at construction time; the dispatch core never
//! touches storage.

use std::any::{Any, TypeId};
use std::collections::HashMap;

use async_trait::async_trait;
use courier_core::{Cancelled, EventStore, Keyed, QueryContext, SourceId, StoredEvent};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// InMemoryEventStore
// ---------------------------------------------------------------------------

/// Append-only event streams keyed by source id.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: DashMap<SourceId, Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sources with at least one stored event.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.streams.len()
    }

    /// Total number of stored events across all sources.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.streams.iter().map(|stream| stream.value().len()).sum()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store(
        &self,
        source_id: SourceId,
        event_name: &str,
        payload: serde_json::Value,
        token: &CancellationToken,
    ) -> anyhow::Result<()> {
        if token.is_cancelled() {
            return Err(Cancelled.into());
        }
        self.streams.entry(source_id).or_default().push(StoredEvent {
            source_id,
            event_name: event_name.to_string(),
            payload,
        });
        Ok(())
    }

    async fn load(
        &self,
        source_id: SourceId,
        token: &CancellationToken,
    ) -> anyhow::Result<Vec<StoredEvent>> {
        if token.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(self
            .streams
            .get(&source_id)
            .map(|stream| stream.value().clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// InMemoryQueryContext
// ---------------------------------------------------------------------------

/// Typed collections held for one unit of work.
#[derive(Default)]
pub struct InMemoryQueryContext {
    collections: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl InMemoryQueryContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `item`, replacing any stored `T` with the same key.
    pub fn insert<T: Keyed>(&mut self, item: T) -> &mut Self {
        let collection = self
            .collections
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Vec::<T>::new()));
        if let Some(items) = collection.downcast_mut::<Vec<T>>() {
            let key = item.key();
            match items.iter_mut().find(|existing| existing.key() == key) {
                Some(existing) => *existing = item,
                None => items.push(item),
            }
        }
        self
    }

    fn collection<T: Keyed>(&self) -> &[T] {
        self.collections
            .get(&TypeId::of::<T>())
            .and_then(|collection| collection.downcast_ref::<Vec<T>>())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

impl QueryContext for InMemoryQueryContext {
    fn query<T: Keyed>(&self) -> Vec<T> {
        self.collection::<T>().to_vec()
    }

    fn find<T: Keyed>(&self, key: &T::Key) -> Option<T> {
        self.collection::<T>()
            .iter()
            .find(|item| item.key() == *key)
            .cloned()
    }
}

impl std::fmt::Debug for InMemoryQueryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueryContext")
            .field("collections", &self.collections.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
