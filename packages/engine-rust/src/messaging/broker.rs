//! Bounded worker pool draining a [`CommandQueue`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use courier_core::combinators::catch_fault;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info, warn};

use super::queue::CommandQueue;
use crate::dispatch::{Dispatch, DispatchConfig, HandlerResponse};
use crate::error::{BrokerError, ConfigError, DispatchError, QueueError};

// ---------------------------------------------------------------------------
// BrokerState / BrokerStats
// ---------------------------------------------------------------------------

/// Broker lifecycle. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Idle,
    Running,
    /// Every loop drained the completed queue.
    Completed,
    /// At least one loop stopped on cancellation.
    Cancelled,
}

/// Point-in-time broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Commands taken off the queue and handed to the dispatch service.
    pub started: u64,
    /// Dispatches that returned, successfully or not.
    pub completed: u64,
    /// Completed dispatches that faulted or failed to route.
    pub faulted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    faulted: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> BrokerStats {
        BrokerStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
        }
    }
}

/// Final outcome of a broker run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerReport {
    pub outcome: BrokerState,
    pub stats: BrokerStats,
}

// ---------------------------------------------------------------------------
// CommandBroker
// ---------------------------------------------------------------------------

/// Runs a fixed number of consumer loops, each receiving from the shared
/// queue and dispatching through its own clone of the service.
///
/// A loop exits when the queue is completed and drained, or when the token
/// is cancelled. Cancellation is observed while waiting on the queue and
/// between dispatches; a running dispatch is never aborted. A faulted
/// dispatch is logged and counted and the loop carries on.
pub struct CommandBroker<S, Q: ?Sized = dyn CommandQueue> {
    service: S,
    queue: Arc<Q>,
    parallelism: usize,
    state: Arc<ArcSwap<BrokerState>>,
    started: AtomicBool,
    counters: Arc<Counters>,
}

impl<S, Q> CommandBroker<S, Q>
where
    S: Service<Dispatch, Response = HandlerResponse, Error = DispatchError>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
    Q: CommandQueue + ?Sized + 'static,
{
    /// Creates an idle broker with `parallelism` consumer loops.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParallelism`] if `parallelism` is zero.
    pub fn new(service: S, queue: Arc<Q>, parallelism: usize) -> Result<Self, ConfigError> {
        if parallelism == 0 {
            return Err(ConfigError::InvalidParallelism);
        }
        Ok(Self {
            service,
            queue,
            parallelism,
            state: Arc::new(ArcSwap::from_pointee(BrokerState::Idle)),
            started: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Creates a broker sized by [`DispatchConfig::degree_of_parallelism`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParallelism`] if the configured degree is zero.
    pub fn from_config(
        service: S,
        queue: Arc<Q>,
        config: &DispatchConfig,
    ) -> Result<Self, ConfigError> {
        Self::new(service, queue, config.degree_of_parallelism)
    }

    /// Spawns the consumer loops.
    ///
    /// # Errors
    ///
    /// [`BrokerError::AlreadyStarted`] while running, [`BrokerError::Stopped`]
    /// once the broker has reached a terminal state.
    pub fn start(&self, token: CancellationToken) -> Result<BrokerHandle, BrokerError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(match **self.state.load() {
                BrokerState::Completed | BrokerState::Cancelled => BrokerError::Stopped,
                BrokerState::Idle | BrokerState::Running => BrokerError::AlreadyStarted,
            });
        }
        self.state.store(Arc::new(BrokerState::Running));
        info!(parallelism = self.parallelism, "command broker started");

        let lifecycle = Arc::new(Lifecycle {
            live: AtomicUsize::new(self.parallelism),
            cancelled: AtomicBool::new(false),
            state: self.state.clone(),
        });
        let workers = (0..self.parallelism)
            .map(|worker| {
                let guard = LoopGuard {
                    lifecycle: lifecycle.clone(),
                    exit: LoopExit::Cancelled,
                };
                tokio::spawn(consume_loop(
                    worker,
                    self.service.clone(),
                    self.queue.clone(),
                    token.clone(),
                    self.counters.clone(),
                    guard,
                ))
            })
            .collect();

        Ok(BrokerHandle {
            workers,
            token,
            state: self.state.clone(),
            counters: self.counters.clone(),
        })
    }

    /// Starts the broker and waits for every loop to exit.
    ///
    /// # Errors
    ///
    /// See [`CommandBroker::start`].
    pub async fn run(&self, token: CancellationToken) -> Result<BrokerReport, BrokerError> {
        Ok(self.start(token)?.wait().await)
    }

    /// Completes the underlying queue; loops exit once it is drained.
    pub fn complete(&self) {
        self.queue.complete();
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        **self.state.load()
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }

    #[must_use]
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<Q> {
        &self.queue
    }
}

impl<S, Q: ?Sized> std::fmt::Debug for CommandBroker<S, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBroker")
            .field("parallelism", &self.parallelism)
            .field("state", &**self.state.load())
            .field("stats", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// BrokerHandle
// ---------------------------------------------------------------------------

/// Handle to a started broker.
///
/// Dropping the handle detaches the loops; the broker still reaches its
/// terminal state when the last loop exits.
#[derive(Debug)]
pub struct BrokerHandle {
    workers: Vec<JoinHandle<()>>,
    token: CancellationToken,
    state: Arc<ArcSwap<BrokerState>>,
    counters: Arc<Counters>,
}

impl BrokerHandle {
    /// Requests cancellation. Running dispatches finish first.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.counters.snapshot()
    }

    /// Waits until every consumer loop has exited.
    pub async fn wait(self) -> BrokerReport {
        for exit in join_all(self.workers).await {
            if let Err(join_error) = exit {
                error!(error = %join_error, "consumer loop aborted");
            }
        }
        // The last loop to exit stores the terminal state.
        let outcome = match **self.state.load() {
            BrokerState::Completed => BrokerState::Completed,
            BrokerState::Idle | BrokerState::Running | BrokerState::Cancelled => {
                BrokerState::Cancelled
            }
        };

        let stats = self.counters.snapshot();
        info!(
            outcome = ?outcome,
            started = stats.started,
            completed = stats.completed,
            faulted = stats.faulted,
            "command broker stopped"
        );
        BrokerReport { outcome, stats }
    }
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Exhausted,
    Cancelled,
}

/// Shared by the loops of one run.
struct Lifecycle {
    live: AtomicUsize,
    cancelled: AtomicBool,
    state: Arc<ArcSwap<BrokerState>>,
}

/// Owned by one loop. Dropped on every exit path, including a panic or an
/// aborted task, which count as cancellation.
struct LoopGuard {
    lifecycle: Arc<Lifecycle>,
    exit: LoopExit,
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        let lifecycle = &self.lifecycle;
        if self.exit == LoopExit::Cancelled {
            lifecycle.cancelled.store(true, Ordering::Release);
        }
        if lifecycle.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let outcome = if lifecycle.cancelled.load(Ordering::Acquire) {
                BrokerState::Cancelled
            } else {
                BrokerState::Completed
            };
            lifecycle.state.store(Arc::new(outcome));
        }
    }
}

async fn consume_loop<S, Q>(
    worker: usize,
    service: S,
    queue: Arc<Q>,
    token: CancellationToken,
    counters: Arc<Counters>,
    mut guard: LoopGuard,
) where
    S: Service<Dispatch, Response = HandlerResponse, Error = DispatchError> + Send,
    S::Future: Send,
    Q: CommandQueue + ?Sized,
{
    guard.exit = drain(worker, service, &*queue, &token, &counters).await;
}

async fn drain<S, Q>(
    worker: usize,
    mut service: S,
    queue: &Q,
    token: &CancellationToken,
    counters: &Counters,
) -> LoopExit
where
    S: Service<Dispatch, Response = HandlerResponse, Error = DispatchError> + Send,
    S::Future: Send,
    Q: CommandQueue + ?Sized,
{
    loop {
        if token.is_cancelled() {
            debug!(worker, "consumer loop cancelled");
            return LoopExit::Cancelled;
        }
        let envelope = match queue.receive(token).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) | Err(QueueError::Completed) => {
                debug!(worker, "queue drained");
                return LoopExit::Exhausted;
            }
            Err(QueueError::Cancelled) => {
                debug!(worker, "consumer loop cancelled");
                return LoopExit::Cancelled;
            }
        };

        counters.started.fetch_add(1, Ordering::Relaxed);
        let message_type = envelope.type_name();
        let request = Dispatch::new(envelope, token.clone());
        let outcome = catch_fault(async {
            let ready = service.ready().await?;
            Ok::<_, anyhow::Error>(ready.call(request).await?)
        })
        .await;
        counters.completed.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(HandlerResponse::Completed(_)) => {}
            Ok(HandlerResponse::Faulted(fault)) | Err(fault) => {
                counters.faulted.fetch_add(1, Ordering::Relaxed);
                warn!(worker, message_type, error = %fault, "command faulted");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
