use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use courier_core::combinators::until_cancelled;
use courier_core::Envelope;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;

/// FIFO of commands awaiting dispatch.
///
/// After [`complete`](CommandQueue::complete), `send` fails and `receive`
/// yields `Ok(None)` once the remaining commands are drained.
#[async_trait]
pub trait CommandQueue: Send + Sync {
    /// Enqueues a command.
    async fn send(&self, envelope: Envelope, token: &CancellationToken) -> Result<(), QueueError>;

    /// Waits for the next command. `Ok(None)` means completed and drained.
    async fn receive(&self, token: &CancellationToken) -> Result<Option<Envelope>, QueueError>;

    /// Stops accepting commands. Idempotent.
    fn complete(&self);

    fn is_completed(&self) -> bool;
}

#[derive(Clone)]
enum QueueSender {
    Unbounded(mpsc::UnboundedSender<Envelope>),
    Bounded(mpsc::Sender<Envelope>),
}

enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
    Bounded(mpsc::Receiver<Envelope>),
}

impl QueueReceiver {
    async fn recv(&mut self) -> Option<Envelope> {
        match self {
            Self::Unbounded(rx) => rx.recv().await,
            Self::Bounded(rx) => rx.recv().await,
        }
    }
}

/// In-process [`CommandQueue`] over a tokio channel.
///
/// The unbounded variant accepts every send immediately. The bounded variant
/// makes `send` wait for capacity, which pushes back on producers when the
/// consumers fall behind.
pub struct InMemoryCommandQueue {
    /// Dropped on completion so the channel closes once drained.
    sender: RwLock<Option<QueueSender>>,
    receiver: Mutex<QueueReceiver>,
    completed: AtomicBool,
    pending: AtomicUsize,
    capacity: Option<usize>,
}

impl InMemoryCommandQueue {
    #[must_use]
    pub fn unbounded() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self::from_parts(QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx), None)
    }

    /// A queue holding at most `capacity` commands (minimum 1).
    #[must_use]
    pub fn bounded(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self::from_parts(
            QueueSender::Bounded(tx),
            QueueReceiver::Bounded(rx),
            Some(capacity),
        )
    }

    fn from_parts(sender: QueueSender, receiver: QueueReceiver, capacity: Option<usize>) -> Self {
        Self {
            sender: RwLock::new(Some(sender)),
            receiver: Mutex::new(receiver),
            completed: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Commands enqueued but not yet received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `None` for an unbounded queue.
    #[must_use]
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

impl Default for InMemoryCommandQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl std::fmt::Debug for InMemoryCommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCommandQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("completed", &self.is_completed())
            .finish()
    }
}

#[async_trait]
impl CommandQueue for InMemoryCommandQueue {
    async fn send(&self, envelope: Envelope, token: &CancellationToken) -> Result<(), QueueError> {
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let sender = self.sender.read().clone().ok_or(QueueError::Completed)?;

        // `pending` is raised before the command becomes visible to receivers.
        match sender {
            QueueSender::Unbounded(tx) => {
                self.pending.fetch_add(1, Ordering::AcqRel);
                tx.send(envelope).map_err(|_| {
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    QueueError::Completed
                })
            }
            QueueSender::Bounded(tx) => match until_cancelled(token, tx.reserve()).await {
                Ok(Ok(permit)) => {
                    self.pending.fetch_add(1, Ordering::AcqRel);
                    permit.send(envelope);
                    Ok(())
                }
                Ok(Err(_)) => Err(QueueError::Completed),
                Err(_) => Err(QueueError::Cancelled),
            },
        }
    }

    async fn receive(&self, token: &CancellationToken) -> Result<Option<Envelope>, QueueError> {
        let mut receiver = until_cancelled(token, self.receiver.lock())
            .await
            .map_err(|_| QueueError::Cancelled)?;
        let next = until_cancelled(token, receiver.recv())
            .await
            .map_err(|_| QueueError::Cancelled)?;
        if next.is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(next)
    }

    fn complete(&self) {
        self.completed.store(true, Ordering::Release);
        self.sender.write().take();
    }

    fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
