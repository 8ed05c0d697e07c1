/// Presentation-layer loading signal.
///
/// Fire-and-forget: the purchasing core never waits on, or reads anything
/// back from, the indicator.
pub trait LoadingIndicator: Send + Sync {
    fn show_loading(&self);
    fn hide_loading(&self);
}

/// Indicator for headless use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLoadingIndicator;

impl LoadingIndicator for NoopLoadingIndicator {
    fn show_loading(&self) {}
    fn hide_loading(&self) {}
}
