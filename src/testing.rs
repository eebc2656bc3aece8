//! Deterministic reactor double for tests.
//!
//! [`TestReactor`] records every subscription and fires nothing on its own;
//! a test drives readiness and timers by hand with [`fire_readable`],
//! [`fire_writable`], and [`run_pending_timers`], which makes the relative
//! order of continuations fully controlled by the test.
//!
//! [`fire_readable`]: TestReactor::fire_readable
//! [`fire_writable`]: TestReactor::fire_writable
//! [`run_pending_timers`]: TestReactor::run_pending_timers

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::reactor::{EventHandle, EventHandler, Reactor, Rearm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interest {
    Readable(RawFd),
    Writable(RawFd),
    Timer,
}

struct Subscription {
    id: u64,
    interest: Interest,
    delay: Duration,
    handler: Option<EventHandler>,
    armed: bool,
    cancelled: bool,
}

#[derive(Default)]
struct State {
    subs: Vec<Subscription>,
    next_id: u64,
}

/// Manually driven [`Reactor`] implementation.
#[derive(Clone, Default)]
pub struct TestReactor {
    state: Rc<RefCell<State>>,
}

impl TestReactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every armed readable subscription for `fd` once; returns how
    /// many handlers ran.
    pub fn fire_readable(&self, fd: RawFd) -> usize {
        self.fire(|interest| interest == Interest::Readable(fd))
    }

    /// Fire every armed writable subscription for `fd` once.
    pub fn fire_writable(&self, fd: RawFd) -> usize {
        self.fire(|interest| interest == Interest::Writable(fd))
    }

    /// Fire every armed timer once, in subscription order, ignoring the
    /// configured delays; a handler returning [`Rearm::Keep`] stays armed
    /// for the next call.
    pub fn run_pending_timers(&self) -> usize {
        self.fire(|interest| interest == Interest::Timer)
    }

    /// Number of timers currently armed.
    pub fn armed_timer_count(&self) -> usize {
        self.count_armed(|interest| interest == Interest::Timer)
    }

    /// Delays of the currently armed timers, in subscription order.
    pub fn armed_timer_delays(&self) -> Vec<Duration> {
        self.state
            .borrow()
            .subs
            .iter()
            .filter(|s| !s.cancelled && s.armed && s.interest == Interest::Timer)
            .map(|s| s.delay)
            .collect()
    }

    /// Whether `fd` has an armed writable subscription.
    pub fn writable_armed(&self, fd: RawFd) -> bool {
        self.count_armed(|interest| interest == Interest::Writable(fd)) > 0
    }

    /// Whether `fd` has an armed readable subscription.
    pub fn readable_armed(&self, fd: RawFd) -> bool {
        self.count_armed(|interest| interest == Interest::Readable(fd)) > 0
    }

    fn count_armed(&self, pred: impl Fn(Interest) -> bool) -> usize {
        self.state
            .borrow()
            .subs
            .iter()
            .filter(|s| !s.cancelled && s.armed && pred(s.interest))
            .count()
    }

    fn fire(&self, pred: impl Fn(Interest) -> bool) -> usize {
        let due: Vec<u64> = self
            .state
            .borrow()
            .subs
            .iter()
            .filter(|s| !s.cancelled && s.armed && pred(s.interest))
            .map(|s| s.id)
            .collect();

        let mut fired = 0;
        for id in due {
            // Take the handler out and release the borrow: handlers
            // re-enter the reactor to subscribe, cancel, and re-arm.
            let mut handler = {
                let mut state = self.state.borrow_mut();
                let Some(sub) = state.subs.iter_mut().find(|s| s.id == id) else {
                    continue;
                };
                if sub.cancelled || !sub.armed {
                    continue;
                }
                let Some(handler) = sub.handler.take() else {
                    continue;
                };
                sub.armed = false;
                handler
            };
            let rearm = handler();
            fired += 1;
            let mut state = self.state.borrow_mut();
            if let Some(sub) = state.subs.iter_mut().find(|s| s.id == id) {
                if sub.cancelled {
                    // The handler cancelled its own subscription; let the
                    // closure and its captures go.
                    continue;
                }
                sub.handler = Some(handler);
                // A handler that re-armed itself mid-fire stays armed.
                if rearm == Rearm::Keep {
                    sub.armed = true;
                }
            }
        }
        fired
    }

    fn subscribe(&self, interest: Interest, delay: Duration, handler: EventHandler) -> Box<dyn EventHandle> {
        let mut state = self.state.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        state.subs.push(Subscription {
            id,
            interest,
            delay,
            handler: Some(handler),
            armed: true,
            cancelled: false,
        });
        Box::new(TestHandle {
            id,
            state: Rc::downgrade(&self.state),
        })
    }
}

impl Reactor for TestReactor {
    fn subscribe_readable(&self, fd: RawFd, handler: EventHandler) -> Box<dyn EventHandle> {
        self.subscribe(Interest::Readable(fd), Duration::ZERO, handler)
    }

    fn subscribe_writable(&self, fd: RawFd, handler: EventHandler) -> Box<dyn EventHandle> {
        self.subscribe(Interest::Writable(fd), Duration::ZERO, handler)
    }

    fn schedule_after(&self, delay: Duration, handler: EventHandler) -> Box<dyn EventHandle> {
        self.subscribe(Interest::Timer, delay, handler)
    }
}

struct TestHandle {
    id: u64,
    state: Weak<RefCell<State>>,
}

impl TestHandle {
    fn with_sub(&self, f: impl FnOnce(&mut Subscription)) {
        if let Some(state) = self.state.upgrade() {
            let mut state = state.borrow_mut();
            if let Some(sub) = state.subs.iter_mut().find(|s| s.id == self.id) {
                f(sub);
            }
        }
    }
}

impl EventHandle for TestHandle {
    fn cancel(&self) {
        self.with_sub(|sub| {
            sub.cancelled = true;
            sub.armed = false;
            // Drop the closure so anything it captured is released.
            sub.handler = None;
        });
    }

    fn is_pending(&self) -> bool {
        let mut pending = false;
        self.with_sub(|sub| pending = !sub.cancelled && sub.armed);
        pending
    }

    fn rearm(&self) {
        self.with_sub(|sub| {
            if !sub.cancelled {
                sub.armed = true;
            }
        });
    }
}
