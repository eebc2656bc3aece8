//! Callback-driven non-blocking socket adapter for readiness-based event
//! reactors.
//!
//! An [`EventSocket`] owns exactly one socket descriptor and turns reactor
//! readiness and timer events into buffered reads, opportunistic write
//! draining, bounded connect retry, accept spawning, and idle reaping. The
//! reactor itself is an injected collaborator behind the [`Reactor`] trait.
//!
//! # Architecture
//!
//! - **reactor**: the consumed subscription interface (readable, writable,
//!   timer) with cancellable handles
//! - **EventSocket**: the per-connection aggregate and its lifecycle
//! - **buffer**: read accumulation with an overflow ceiling, and the FIFO
//!   write queue with partial-send continuation
//! - **testing**: a deterministic reactor double, fired by hand from tests
//!
//! The model is strictly single-threaded cooperative: every continuation
//! runs serialized on one logical thread, and suspension is always expressed
//! by scheduling a future continuation rather than blocking.

mod buffer;
mod conn;
mod error;
pub mod reactor;
pub mod testing;

pub use buffer::RebufferMode;
pub use conn::{
    AcceptCallback, CloseCallback, Deadline, ErrorCallback, EventSocket, EventSocketBuilder,
    ReadCallback, WriteDrainedCallback,
};
pub use error::{Error, Result};
pub use reactor::{EventHandle, EventHandler, Reactor, Rearm};
