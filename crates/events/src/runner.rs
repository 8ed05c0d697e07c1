//! Drives a [`Subscription`] into an [`EventHandler`].

use std::thread;

use tracing::debug;

use crate::{EventHandler, Subscription};

/// Pairs a subscription with the handler that consumes it.
#[derive(Debug)]
pub struct SubscriptionRunner<M, H> {
    subscription: Subscription<M>,
    handler: H,
}

impl<M, H> SubscriptionRunner<M, H>
where
    H: EventHandler<M>,
{
    pub fn new(subscription: Subscription<M>, handler: H) -> Self {
        Self {
            subscription,
            handler,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Handle every message already queued and return how many were handled.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        while let Ok(message) = self.subscription.try_recv() {
            self.handler.handle(&message);
            handled += 1;
        }
        handled
    }

    /// Move the runner onto a dedicated thread.
    ///
    /// The thread exits once the bus behind the subscription is dropped and
    /// yields the number of handled messages.
    pub fn spawn(self) -> thread::JoinHandle<usize>
    where
        M: Send + 'static,
        H: Send + 'static,
    {
        thread::spawn(move || {
            let mut handled = 0;
            while let Ok(message) = self.subscription.recv() {
                self.handler.handle(&message);
                handled += 1;
            }
            debug!(handled, "subscription closed");
            handled
        })
    }
}
