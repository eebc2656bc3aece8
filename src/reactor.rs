//! Consumed interface of the external readiness/timer reactor.
//!
//! The adapter never owns an event loop. It is handed a [`Reactor`] at
//! construction and expresses every suspension as a readiness subscription or
//! a timer, returning control immediately. All continuations run serialized
//! on one logical thread, so nothing here is `Send`.

use std::os::fd::RawFd;
use std::time::Duration;

/// Decision returned by a continuation to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Keep the subscription armed. For a timer, fire again after the same
    /// delay.
    Keep,
    /// Leave the subscription registered but inert until it is explicitly
    /// re-armed or cancelled.
    Disarm,
}

/// Continuation invoked when the subscribed condition holds.
pub type EventHandler = Box<dyn FnMut() -> Rearm>;

/// Cancellable handle to one subscription.
///
/// Handles are exclusively owned by the connection, and a handler closure
/// may own the connection right back (the read subscription keeps an
/// otherwise-unretained connection alive). Cancelling every handle on close
/// is what breaks that cycle, so a reactor must drop the handler closure
/// when its subscription is cancelled.
pub trait EventHandle {
    /// Cancel the subscription permanently, releasing the reactor's
    /// reference to the handler closure. Idempotent, and safe to call
    /// after the underlying event already fired.
    fn cancel(&self);

    /// Whether the subscription is currently armed.
    fn is_pending(&self) -> bool;

    /// Re-arm a disarmed subscription. No-op when cancelled or already
    /// pending.
    fn rearm(&self);
}

/// Readiness and timer subscription primitives.
///
/// Injected per connection, never consumed as a process-wide singleton, so
/// tests can substitute a deterministic double (see [`crate::testing`]).
pub trait Reactor {
    /// Subscribe to "`fd` can be read without blocking".
    fn subscribe_readable(&self, fd: RawFd, handler: EventHandler) -> Box<dyn EventHandle>;

    /// Subscribe to "`fd` can be written without blocking".
    fn subscribe_writable(&self, fd: RawFd, handler: EventHandler) -> Box<dyn EventHandle>;

    /// Run `handler` after `delay`. A zero delay schedules the handler for
    /// the next reactor turn, which is how deferred notifications give the
    /// reactor priority over application processing.
    fn schedule_after(&self, delay: Duration, handler: EventHandler) -> Box<dyn EventHandle>;
}
