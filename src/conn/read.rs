//! Readable continuation: accumulate, overflow-guard, deferred delivery.

use std::cell::RefCell;
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::slice;
use std::time::Duration;

use crate::error::Result;
use crate::reactor::Rearm;

use super::{EventSocket, Inner, close_inner, flag_activity, guard};

pub(crate) fn subscribe_read(inner: &Rc<RefCell<Inner>>) {
    let (fd, reactor) = {
        let b = inner.borrow();
        if b.read_evt.is_some() {
            return;
        }
        let Some(sock) = b.socket.as_ref() else {
            return;
        };
        (sock.as_raw_fd(), Rc::clone(&b.reactor))
    };
    // The read subscription holds the connection's keep-alive reference:
    // an accepted peer nobody retains must still deliver its reads and its
    // close notification. `close()` cancels the handle, which makes the
    // reactor drop this closure and release the reference.
    let strong = Rc::clone(inner);
    let handle = reactor.subscribe_readable(fd, Box::new(move || on_readable(&strong)));
    inner.borrow_mut().read_evt = Some(handle);
}

fn on_readable(inner: &Rc<RefCell<Inner>>) -> Rearm {
    let mut rearm = Rearm::Disarm;
    guard::guarded(inner, || {
        rearm = read_step(inner)?;
        Ok(())
    });
    rearm
}

fn read_step(inner: &Rc<RefCell<Inner>>) -> Result<Rearm> {
    guard::set_context(inner, "error reading from socket");
    let received = {
        let b = inner.borrow();
        if b.closed || b.closing {
            return Ok(Rearm::Disarm);
        }
        let Some(sock) = b.socket.as_ref() else {
            return Ok(Rearm::Disarm);
        };
        // One recv sized to the live kernel buffer, not a hard-coded
        // constant.
        let capacity = sock.recv_buffer_size()?.max(1);
        let mut scratch = vec![MaybeUninit::<u8>::uninit(); capacity];
        match sock.recv(&mut scratch) {
            Ok(0) => None,
            Ok(n) => {
                let filled = unsafe { slice::from_raw_parts(scratch.as_ptr().cast::<u8>(), n) };
                Some(filled.to_vec())
            }
            // The reactor only fires on readiness; a spurious wakeup is not
            // an error.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(Rearm::Keep),
            Err(e) => return Err(e.into()),
        }
    };

    let Some(data) = received else {
        // Peer closed the stream.
        close_inner(inner);
        return Ok(Rearm::Disarm);
    };

    flag_activity(inner);
    let overflowed = {
        let mut b = inner.borrow_mut();
        tracing::trace!(bytes = data.len(), peer = %b.peer_label, "read from socket");
        b.read_buf.extend(&data).is_err()
    };
    if overflowed {
        // The buffer is already discarded, so the close sequence cannot
        // flush the overflowing bytes to the application.
        tracing::debug!(peer = %inner.borrow().peer_label, "read buffer overflowed");
        close_inner(inner);
        return Ok(Rearm::Disarm);
    }

    schedule_read_notify(inner);
    Ok(Rearm::Keep)
}

/// Schedule the zero-delay deferred delivery, unless one is already
/// outstanding or nobody is listening. Deferring to the next reactor turn
/// gives the reactor priority over application processing and coalesces
/// recv bursts into one notification.
pub(crate) fn schedule_read_notify(inner: &Rc<RefCell<Inner>>) {
    let reactor = {
        let b = inner.borrow();
        if b.closed || b.on_read.is_none() || b.pending_notify_evt.is_some() {
            return;
        }
        Rc::clone(&b.reactor)
    };
    let weak = Rc::downgrade(inner);
    let handle = reactor.schedule_after(
        Duration::ZERO,
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                deferred_notify(&inner);
            }
            Rearm::Disarm
        }),
    );
    inner.borrow_mut().pending_notify_evt = Some(handle);
}

fn deferred_notify(inner: &Rc<RefCell<Inner>>) {
    let cb = {
        let mut b = inner.borrow_mut();
        // Clear the slot first so the callback can trigger another cycle.
        b.pending_notify_evt = None;
        if b.closed {
            return;
        }
        b.error_context = Some("error processing socket input buffer".to_string());
        b.on_read.clone()
    };
    // The slot can have been cleared between scheduling and delivery.
    if let Some(cb) = cb {
        let sock = EventSocket::from_inner(Rc::clone(inner));
        guard::guarded(inner, || cb(&sock));
    } else {
        inner.borrow_mut().error_context = None;
    }
}
