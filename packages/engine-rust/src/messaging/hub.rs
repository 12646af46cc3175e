use std::fmt;
use std::future::Future;
use std::sync::Arc;

use courier_core::combinators::join_caught;
use courier_core::Payload;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::error::{PublishError, SubscriberFault};

// ---------------------------------------------------------------------------
// SubscriberId / Callback
// ---------------------------------------------------------------------------

/// Identifies the owner of one or more subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(Arc<str>);

impl SubscriberId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriberId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for SubscriberId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Subscriber callback. Identity (for de-duplication) is the `Arc` pointer.
pub type Callback = Arc<dyn Fn(Payload) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Wraps an async closure into a [`Callback`].
pub fn callback<F, Fut>(f: F) -> Callback
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

#[derive(Clone)]
struct Subscription {
    subscriber: SubscriberId,
    callback: Callback,
}

// ---------------------------------------------------------------------------
// MessageHub
// ---------------------------------------------------------------------------

/// Name-keyed publish/subscribe hub.
///
/// `publish` works on a snapshot of the subscription list taken when it is
/// called: subscriptions added or removed while callbacks run affect only
/// later publishes. Every callback runs even if others fail or panic.
#[derive(Default)]
pub struct MessageHub {
    subscriptions: DashMap<String, Vec<Subscription>>,
}

impl MessageHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `event_name` on behalf of `subscriber`.
    ///
    /// Returns `false` if this exact (subscriber, callback) pair is already
    /// registered under the name.
    pub fn subscribe(
        &self,
        event_name: impl Into<String>,
        subscriber: impl Into<SubscriberId>,
        callback: Callback,
    ) -> bool {
        let subscriber = subscriber.into();
        let mut list = self.subscriptions.entry(event_name.into()).or_default();
        let duplicate = list
            .iter()
            .any(|s| s.subscriber == subscriber && Arc::ptr_eq(&s.callback, &callback));
        if duplicate {
            return false;
        }
        list.push(Subscription {
            subscriber,
            callback,
        });
        true
    }

    /// Removes every subscription `subscriber` holds under `event_name`.
    /// Returns how many were removed.
    pub fn unsubscribe(&self, event_name: &str, subscriber: &str) -> usize {
        let removed = match self.subscriptions.get_mut(event_name) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|s| s.subscriber.as_str() != subscriber);
                before - list.len()
            }
            None => 0,
        };
        self.subscriptions
            .remove_if(event_name, |_, list| list.is_empty());
        removed
    }

    /// Removes `subscriber` from every event name. Returns how many
    /// subscriptions were removed.
    pub fn unsubscribe_all(&self, subscriber: &str) -> usize {
        let mut removed = 0;
        self.subscriptions.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.subscriber.as_str() != subscriber);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    /// Delivers `payload` to every subscriber of `event_name`.
    ///
    /// Callbacks start in registration order and run concurrently; the call
    /// returns once all have finished. Returns the number of callbacks
    /// invoked.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Faulted`] listing every callback that failed
    /// or panicked. The remaining callbacks still ran.
    pub async fn publish(&self, event_name: &str, payload: Payload) -> Result<usize, PublishError> {
        let snapshot = match self.subscriptions.get(event_name) {
            Some(list) => list.value().clone(),
            None => Vec::new(),
        };
        if snapshot.is_empty() {
            return Ok(0);
        }

        let outcomes = join_caught(snapshot.iter().map(|subscription| {
            let callback = subscription.callback.clone();
            let payload = payload.clone();
            async move { callback(payload).await }
        }))
        .await;

        let attempted = snapshot.len();
        let failures: Vec<SubscriberFault> = snapshot
            .into_iter()
            .zip(outcomes)
            .filter_map(|(subscription, outcome)| {
                outcome.err().map(|fault| SubscriberFault {
                    subscriber: subscription.subscriber.to_string(),
                    fault,
                })
            })
            .collect();

        if failures.is_empty() {
            debug!(event_name, subscribers = attempted, "published");
            return Ok(attempted);
        }
        for failure in &failures {
            warn!(
                event_name,
                subscriber = %failure.subscriber,
                error = %failure.fault,
                "subscriber faulted"
            );
        }
        Err(PublishError::Faulted {
            event_name: event_name.to_string(),
            attempted,
            failures,
        })
    }

    /// Number of subscriptions under `event_name`.
    #[must_use]
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.subscriptions.get(event_name).map_or(0, |list| list.len())
    }

    /// Event names that currently have at least one subscription.
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .subscriptions
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MessageHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHub")
            .field("event_names", &self.event_names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use courier_core::Panicked;
    use proptest::prelude::*;
    use tokio::sync::Notify;

    use super::*;

    fn counting(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        callback(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_no_op() {
        let hub = MessageHub::new();
        assert_eq!(hub.publish("Nothing", Payload::new(())).await.unwrap(), 0);
        assert!(hub.event_names().is_empty());
    }

    #[tokio::test]
    async fn subscribe_publish_unsubscribe_round_trip() {
        let hub = MessageHub::new();
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = received.clone();
        let cb = callback(move |payload| {
            let sink = sink.clone();
            async move {
                let value = *payload
                    .downcast_ref::<u32>()
                    .ok_or_else(|| anyhow::anyhow!("unexpected payload"))?;
                sink.lock().push(value);
                Ok(())
            }
        });

        assert!(hub.subscribe("Tick", "clock", cb.clone()));
        assert_eq!(hub.publish("Tick", Payload::new(1_u32)).await.unwrap(), 1);
        assert_eq!(hub.unsubscribe("Tick", "clock"), 1);
        assert_eq!(hub.publish("Tick", Payload::new(2_u32)).await.unwrap(), 0);

        assert_eq!(*received.lock(), vec![1]);
        assert_eq!(hub.subscriber_count("Tick"), 0);
        assert!(hub.event_names().is_empty());
    }

    #[test]
    fn duplicate_subscription_is_rejected() {
        let hub = MessageHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let cb = counting(&counter);

        assert!(hub.subscribe("Tick", "a", cb.clone()));
        assert!(!hub.subscribe("Tick", "a", cb.clone()));
        // Same callback under another subscriber, or another callback, is distinct.
        assert!(hub.subscribe("Tick", "b", cb));
        assert!(hub.subscribe("Tick", "a", counting(&counter)));
        assert_eq!(hub.subscriber_count("Tick"), 3);
    }

    #[test]
    fn unsubscribe_all_spans_event_names() {
        let hub = MessageHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe("A", "audit", counting(&counter));
        hub.subscribe("B", "audit", counting(&counter));
        hub.subscribe("B", "mailer", counting(&counter));

        assert_eq!(hub.unsubscribe_all("audit"), 2);
        assert_eq!(hub.unsubscribe_all("audit"), 0);
        assert_eq!(hub.unsubscribe("B", "nobody"), 0);
        assert_eq!(hub.event_names(), vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn failing_and_panicking_subscribers_do_not_stop_others() {
        let hub = MessageHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe("Order", "first", counting(&counter));
        hub.subscribe(
            "Order",
            "broken",
            callback(|_| async { anyhow::bail!("smtp down") }),
        );
        let explode = true;
        hub.subscribe(
            "Order",
            "panicky",
            callback(move |_| async move {
                if explode {
                    panic!("boom");
                }
                Ok(())
            }),
        );
        hub.subscribe("Order", "last", counting(&counter));

        let err = hub.publish("Order", Payload::new(())).await.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        match err {
            PublishError::Faulted {
                attempted,
                failures,
                ..
            } => {
                assert_eq!(attempted, 4);
                let names: Vec<&str> = failures.iter().map(|f| f.subscriber.as_str()).collect();
                assert_eq!(names, vec!["broken", "panicky"]);
                assert!(failures[1].fault.is::<Panicked>());
            }
            other @ PublishError::Dispatch(_) => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn unsubscribe_during_publish_does_not_affect_snapshot() {
        let hub = Arc::new(MessageHub::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());

        let (entered_cb, release_cb) = (entered.clone(), release.clone());
        hub.subscribe(
            "Slow",
            "gate",
            callback(move |_| {
                let (entered, release) = (entered_cb.clone(), release_cb.clone());
                async move {
                    entered.notify_one();
                    release.notified().await;
                    Ok(())
                }
            }),
        );
        hub.subscribe("Slow", "late", counting(&counter));

        let publisher = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.publish("Slow", Payload::new(())).await })
        };

        entered.notified().await;
        assert_eq!(hub.unsubscribe("Slow", "late"), 1);
        release.notify_one();

        assert_eq!(publisher.await.unwrap().unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count("Slow"), 1);
    }

    proptest! {
        #[test]
        fn every_subscriber_runs_once_whatever_fails(
            outcomes in proptest::collection::vec(any::<bool>(), 0..24)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let hub = MessageHub::new();
            let calls: Vec<Arc<AtomicUsize>> =
                outcomes.iter().map(|_| Arc::new(AtomicUsize::new(0))).collect();

            for (index, (succeeds, calls)) in outcomes.iter().zip(&calls).enumerate() {
                let (succeeds, calls) = (*succeeds, calls.clone());
                hub.subscribe(
                    "Prop",
                    format!("sub-{index}"),
                    callback(move |_| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            anyhow::ensure!(succeeds, "subscriber failed");
                            Ok(())
                        }
                    }),
                );
            }

            let result = runtime.block_on(hub.publish("Prop", Payload::new(())));
            let expected_failures = outcomes.iter().filter(|ok| !**ok).count();

            for calls in &calls {
                prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
            }
            match result {
                Ok(attempted) => {
                    prop_assert_eq!(expected_failures, 0);
                    prop_assert_eq!(attempted, outcomes.len());
                }
                Err(err) => prop_assert_eq!(err.failures().len(), expected_failures),
            }
        }
    }
}
