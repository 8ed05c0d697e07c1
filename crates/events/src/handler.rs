use std::sync::Arc;

/// Consumes messages of a single, typed payload.
///
/// Handlers replace string-keyed notification dispatch: a subscriber states
/// the payload type it understands and the compiler enforces it. Handlers
/// must not block for long; they run on the thread draining the
/// subscription.
pub trait EventHandler<M>: Send + Sync {
    fn handle(&self, message: &M);
}

impl<M, H> EventHandler<M> for Arc<H>
where
    H: EventHandler<M> + ?Sized,
{
    fn handle(&self, message: &M) {
        (**self).handle(message)
    }
}
