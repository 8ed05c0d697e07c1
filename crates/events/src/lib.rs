//! Event publishing/subscription mechanics.
//!
//! Purchase outcomes leave the purchasing core through an [`EventBus`]; UI
//! and feature-gate code consume them through a [`Subscription`], optionally
//! driven by a [`SubscriptionRunner`] into a typed [`EventHandler`].

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod runner;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use handler::EventHandler;
pub use in_memory_bus::{BusError, InMemoryEventBus};
pub use runner::SubscriptionRunner;
