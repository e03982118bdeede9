//! Pure protocol state machine - no I/O, no async
//!
//! [`MutexCore`] consumes protocol events (caller requests, inbound
//! messages) and returns the messages that must be sent in response. The
//! async runtime in [`crate::node`] owns the I/O; keeping the transitions
//! pure makes the protocol testable without a network.

mod mutex;

pub use mutex::{MutexCore, Outbound, Phase, StateError, Step};
