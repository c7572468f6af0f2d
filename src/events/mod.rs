//! Event Publication Module
//!
//! Session lifecycle notifications for observers.
//!
//! # Components
//!
//! - [`Event`], [`EventKind`]: published records and their names
//! - [`EventFilter`]: name patterns, session and predicate selection
//! - [`EventBus`]: non-blocking fan-out with bounded history and replay

pub mod bus;
pub mod event;

pub use bus::{EventBus, Subscription, DEFAULT_HISTORY_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER};
pub use event::{Event, EventFilter, EventKind};
