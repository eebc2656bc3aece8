//! Non-blocking connect sequencer with timeout-bounded polling retry.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use socket2::SockAddr;

use crate::error::{Error, Result};
use crate::reactor::Rearm;

use super::{Inner, attach_connected, close_inner, guard, write};

/// Poll granularity while a non-blocking connect is pending.
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Deadline for [`crate::EventSocket::connect`].
#[derive(Debug, Clone, Copy)]
pub enum Deadline {
    /// Use the builder's configured connect timeout, if any.
    Default,
    /// Retry indefinitely; only an external `close()` stops the attempts.
    None,
    /// Give up this long after the call.
    After(Duration),
    /// Give up at an absolute instant.
    At(Instant),
}

enum Progress {
    Connected,
    Pending,
    TimedOut,
    Failed(Error),
}

impl super::EventSocket {
    /// Start a non-blocking connect. The first attempt runs synchronously
    /// and its failures are returned to the caller; while the OS reports the
    /// connection as in progress, the attempt is re-run every 100 ms until
    /// it succeeds, fails, or the deadline passes. A passed deadline
    /// force-closes the connection with a timeout context.
    pub fn connect(&self, addr: SocketAddr, deadline: Deadline) -> Result<()> {
        let deadline = {
            let b = self.inner().borrow();
            if b.closed {
                return Err(Error::Closed { op: "connect" });
            }
            match deadline {
                Deadline::At(at) => Some(at),
                Deadline::After(t) => Some(Instant::now() + t),
                Deadline::Default => b
                    .connect_timeout
                    .filter(|t| !t.is_zero())
                    .map(|t| Instant::now() + t),
                Deadline::None => None,
            }
        };
        match connect_step(self.inner(), addr, deadline) {
            Progress::Failed(err) => {
                self.inner().borrow_mut().error_context = None;
                Err(err)
            }
            Progress::Pending => {
                schedule_retry(self.inner(), addr, deadline);
                Ok(())
            }
            Progress::Connected | Progress::TimedOut => Ok(()),
        }
    }
}

fn connect_step(inner: &Rc<RefCell<Inner>>, addr: SocketAddr, deadline: Option<Instant>) -> Progress {
    let result = {
        let b = inner.borrow();
        if b.closed || b.closing {
            return Progress::Failed(Error::Closed { op: "connect" });
        }
        let Some(sock) = b.socket.as_ref() else {
            return Progress::Failed(Error::Closed { op: "connect" });
        };
        sock.connect(&SockAddr::from(addr))
    };

    match result {
        Ok(()) => {
            finish_connect(inner);
            Progress::Connected
        }
        Err(e) if e.raw_os_error() == Some(libc::EISCONN) => {
            finish_connect(inner);
            Progress::Connected
        }
        Err(e) if in_progress(&e) => {
            if deadline.is_some_and(|at| Instant::now() > at) {
                guard::set_context(inner, format!("timeout connecting to {addr}"));
                close_inner(inner);
                Progress::TimedOut
            } else {
                Progress::Pending
            }
        }
        Err(e) => {
            if let Some(evt) = inner.borrow_mut().connect_evt.take() {
                evt.cancel();
            }
            guard::set_context(inner, e.to_string());
            Progress::Failed(Error::Connect { addr, source: e })
        }
    }
}

/// The standard non-blocking "connection pending" signals. `EWOULDBLOCK`
/// aliases `EAGAIN` on every platform this builds for.
fn in_progress(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EAGAIN)
    )
}

fn finish_connect(inner: &Rc<RefCell<Inner>>) {
    if let Some(evt) = inner.borrow_mut().connect_evt.take() {
        evt.cancel();
    }
    attach_connected(inner);
    let has_queued = !inner.borrow().write_queue.is_empty();
    if has_queued {
        // Chunks queued before the connection completed start draining as
        // soon as the descriptor is writable.
        write::ensure_write_subscription(inner);
    }
}

/// Periodic retry carrying the same deadline and address forward. Failures
/// here have no caller stack to unwind into, so they go through the guard.
fn schedule_retry(inner: &Rc<RefCell<Inner>>, addr: SocketAddr, deadline: Option<Instant>) {
    let reactor = Rc::clone(&inner.borrow().reactor);
    let weak = Rc::downgrade(inner);
    let handle = reactor.schedule_after(
        CONNECT_POLL_INTERVAL,
        Box::new(move || {
            let Some(inner) = weak.upgrade() else {
                return Rearm::Disarm;
            };
            if inner.borrow().closed {
                return Rearm::Disarm;
            }
            match connect_step(&inner, addr, deadline) {
                Progress::Pending => Rearm::Keep,
                Progress::Connected | Progress::TimedOut => Rearm::Disarm,
                Progress::Failed(err) => {
                    guard::guarded(&inner, || Err(err));
                    Rearm::Disarm
                }
            }
        }),
    );
    let mut b = inner.borrow_mut();
    if let Some(old) = b.connect_evt.take() {
        old.cancel();
    }
    b.connect_evt = Some(handle);
    tracing::debug!(peer = %addr, "connect in progress, polling");
}
