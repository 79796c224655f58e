//! Cooperative runtime glue: typed event bus, periodic refresh scheduler and
//! the shutdown chain. Everything here runs on the single tokio worker the
//! binary starts.

pub mod events;
pub mod scheduler;
pub mod signal;

pub use events::{Event, EventBus, EventType};
