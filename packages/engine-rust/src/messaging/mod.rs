//! Event fan-out and queued command execution.
//!
//! - [`hub`]: name-keyed publish/subscribe with per-subscriber fault capture
//! - [`queue`]: the `CommandQueue` contract and its in-memory channel
//! - [`broker`]: a fixed pool of consumer loops draining a queue

pub mod broker;
pub mod hub;
pub mod queue;

pub use broker::{BrokerHandle, BrokerReport, BrokerState, BrokerStats, CommandBroker};
pub use hub::{callback, Callback, MessageHub, SubscriberId};
pub use queue::{CommandQueue, InMemoryCommandQueue};
