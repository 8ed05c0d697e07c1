//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern**: a pub/sub mechanism for
//! distributing events to any number of consumers (loading indicators,
//! feature gates, analytics, tests).
//!
//! ## Delivery
//!
//! - **Broadcast**: every live subscription receives a copy of every message
//!   published after it subscribed.
//! - **In order**: a single publisher's messages arrive in publication order.
//! - **No replay**: a subscription never sees messages published before it
//!   existed. Subscribe before triggering work whose outcome you care about.
//!
//! Deduplication is the publisher's responsibility. The purchasing ledger
//! publishes at most one outcome per transaction, so consumers see each
//! outcome exactly once.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe();
/// orchestrator.buy(&product_id)?;
///
/// match subscription.recv_timeout(Duration::from_secs(5)) {
///     Ok(outcome) => render(outcome),
///     Err(std::sync::mpsc::RecvTimeoutError::Timeout) => keep_waiting(),
///     Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => shut_down(),
/// }
/// ```
///
/// ## Thread Safety
///
/// Subscriptions are designed for single-threaded consumption. Each
/// subscription should be drained by one thread (see
/// [`crate::SubscriptionRunner`]).
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Collect every message that is already queued, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ## Architecture Role
///
/// ```text
/// Gateway → TransactionLedger (entitlement write) → Event Bus (publish) → Subscribers
///                                                                          ├─ Loading UI
///                                                                          ├─ Feature unlocks
///                                                                          └─ Tests
/// ```
///
/// Entitlement is **written first**, then the outcome is **published**, so a
/// subscriber reacting to a success outcome always observes the product as
/// owned.
///
/// ## Error Handling
///
/// `publish()` can fail (e.g. the bus lock is poisoned). Failures are surfaced
/// to the publisher, which logs them; entitlement is already persisted so a
/// lost notification never loses ownership.
///
/// ## Thread Safety
///
/// The trait requires `Send + Sync`; multiple threads may publish concurrently.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
