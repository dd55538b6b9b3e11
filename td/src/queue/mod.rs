//! The per-namespace task queue: a `taskstore`-backed actor plus the
//! commands it accepts.

mod messages;
mod store;

pub use messages::{QueueCommand, QueueResponse};
pub use store::{QueueEvent, QueueStore};
