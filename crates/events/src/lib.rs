//! `orderflow-events`: notification events and their in-process fan-out.
//!
//! The engine publishes an [`EventEnvelope`] after a transition or sweep action
//! commits. Delivery is fire-and-forget; nothing in the engine waits on it.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
