//! Per-dispatch state: the incoming request, the mutable context filters and
//! handlers share, and the immutable response.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use courier_core::{Envelope, Fault, Payload};
use tokio_util::sync::CancellationToken;

use super::config::DispatchConfig;
use super::handler::HandlerDescriptor;
use super::processor::MessageProcessor;

// ---------------------------------------------------------------------------
// HandlerRequest
// ---------------------------------------------------------------------------

/// One incoming message together with everything needed to dispatch it.
///
/// Created when a dispatch starts and dropped when it ends; every handler
/// context created for the message shares it.
pub struct HandlerRequest {
    envelope: Envelope,
    processor: MessageProcessor,
    token: CancellationToken,
    config: Arc<DispatchConfig>,
}

impl HandlerRequest {
    pub(crate) fn new(
        envelope: Envelope,
        processor: MessageProcessor,
        token: CancellationToken,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            envelope,
            processor,
            token,
            config,
        }
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// The processor that owns this dispatch. Handlers use it to raise
    /// follow-up commands and events.
    #[must_use]
    pub fn processor(&self) -> &MessageProcessor {
        &self.processor
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

impl fmt::Debug for HandlerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRequest")
            .field("envelope", &self.envelope)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// String-keyed bag of typed values filters use to talk to each other.
#[derive(Default)]
pub struct Items {
    values: HashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl Items {
    /// Stores `value` under `key`, replacing whatever was there.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: &'static str, value: T) {
        self.values.insert(key, Box::new(value));
    }

    #[must_use]
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    /// Returns the `T` stored under `key`, inserting `init()` first if the key
    /// is vacant. `None` if the key holds a value of another type.
    pub fn get_or_insert_with<T, F>(&mut self, key: &'static str, init: F) -> Option<&mut T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.values
            .entry(key)
            .or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
    }

    /// Removes and returns the value under `key` if it is a `T`.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Debug for Items {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerContext
// ---------------------------------------------------------------------------

/// Mutable state of one dispatch attempt.
///
/// Filters may set the result to short-circuit the handler, and exception
/// hooks may mark a captured fault as handled by supplying a replacement
/// result.
pub struct HandlerContext {
    request: Arc<HandlerRequest>,
    descriptor: Arc<HandlerDescriptor>,
    items: Items,
    /// `Some(None)` is a completed dispatch without a value.
    result: Option<Option<Payload>>,
    exception: Option<Fault>,
    exception_handled: bool,
}

impl HandlerContext {
    pub(crate) fn new(request: Arc<HandlerRequest>, descriptor: Arc<HandlerDescriptor>) -> Self {
        Self {
            request,
            descriptor,
            items: Items::default(),
            result: None,
            exception: None,
            exception_handled: false,
        }
    }

    #[must_use]
    pub fn request(&self) -> &HandlerRequest {
        &self.request
    }

    #[must_use]
    pub fn envelope(&self) -> &Envelope {
        self.request.envelope()
    }

    /// The message being dispatched, if it is a `T`.
    #[must_use]
    pub fn message<T: Any>(&self) -> Option<&T> {
        self.request.envelope().downcast_ref::<T>()
    }

    #[must_use]
    pub fn processor(&self) -> &MessageProcessor {
        self.request.processor()
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        self.request.token()
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<HandlerDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn items(&self) -> &Items {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut Items {
        &mut self.items
    }

    /// Sets the dispatch result. Set from a pre-hook, this skips the remaining
    /// pre-hooks and the handler.
    pub fn set_result(&mut self, value: Option<Payload>) {
        self.result = Some(value);
    }

    #[must_use]
    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    /// The current result value, if a result with a value has been set.
    #[must_use]
    pub fn result(&self) -> Option<&Payload> {
        self.result.as_ref().and_then(Option::as_ref)
    }

    /// The fault captured from the handler or a failing hook.
    #[must_use]
    pub fn exception(&self) -> Option<&Fault> {
        self.exception.as_ref()
    }

    #[must_use]
    pub fn is_exception_handled(&self) -> bool {
        self.exception_handled
    }

    /// Marks the captured fault as handled; the dispatch completes with
    /// `replacement` instead of faulting.
    pub fn mark_exception_handled(&mut self, replacement: Option<Payload>) {
        self.exception_handled = true;
        self.result = Some(replacement);
    }

    /// Records a new fault, superseding any earlier one and its handled state.
    pub(crate) fn record_exception(&mut self, fault: Fault) {
        self.exception = Some(fault);
        self.exception_handled = false;
    }

    /// Freezes the context into its outcome.
    pub(crate) fn response(&self) -> HandlerResponse {
        match &self.exception {
            Some(fault) if !self.exception_handled => HandlerResponse::Faulted(fault.clone()),
            _ => HandlerResponse::Completed(self.result.clone().flatten()),
        }
    }
}

impl fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerContext")
            .field("message_type", &self.descriptor.message_type_name())
            .field("handler", &self.descriptor.handler_type_name())
            .field("items", &self.items)
            .field("has_result", &self.has_result())
            .field("exception", &self.exception)
            .field("exception_handled", &self.exception_handled)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HandlerResponse
// ---------------------------------------------------------------------------

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub enum HandlerResponse {
    /// The handler (or a short-circuiting filter) completed, optionally with a value.
    Completed(Option<Payload>),
    /// The dispatch failed and no exception hook handled it.
    Faulted(Fault),
}

impl HandlerResponse {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    #[must_use]
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Faulted(_))
    }

    #[must_use]
    pub fn value(&self) -> Option<&Payload> {
        match self {
            Self::Completed(value) => value.as_ref(),
            Self::Faulted(_) => None,
        }
    }

    /// The completed value as a `T`.
    #[must_use]
    pub fn value_as<T: Any>(&self) -> Option<&T> {
        self.value().and_then(Payload::downcast_ref::<T>)
    }

    #[must_use]
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Completed(_) => None,
        }
    }

    /// Converts into a plain `Result`.
    ///
    /// # Errors
    ///
    /// Returns the captured fault of a faulted response.
    pub fn into_result(self) -> Result<Option<Payload>, Fault> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Faulted(fault) => Err(fault),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
