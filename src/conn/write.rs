//! Write path: queue, opportunistic drain, backpressure signaling.

use std::cell::RefCell;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::reactor::Rearm;

use super::{EventSocket, Inner, flag_activity, guard};

impl EventSocket {
    /// Queue a chunk for transmission. Chunks accumulate even before a
    /// connection is established; nothing goes out until the descriptor is
    /// connected and writable.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        {
            let mut b = self.inner().borrow_mut();
            if b.closed {
                return Err(Error::Closed { op: "write" });
            }
            b.write_queue.push(data);
            tracing::trace!(
                queued = b.write_queue.byte_len(),
                peer = %b.peer_label,
                "buffered output"
            );
        }
        ensure_write_subscription(self.inner());
        // Count the write as activity so the watchdog cannot fire between
        // queueing and the drain.
        flag_activity(self.inner());
        Ok(())
    }
}

/// Make sure a writable subscription exists and is armed. Idempotent: a
/// pending subscription is left alone, a disarmed one is re-armed, and one
/// is created for a connected descriptor that has none yet. An unconnected
/// descriptor gets its subscription when the connect sequencer finishes.
pub(crate) fn ensure_write_subscription(inner: &Rc<RefCell<Inner>>) {
    let (fd, reactor) = {
        let b = inner.borrow();
        if b.closed || b.closing {
            return;
        }
        if let Some(evt) = &b.write_evt {
            if !evt.is_pending() {
                evt.rearm();
            }
            return;
        }
        let Some(sock) = b.socket.as_ref() else {
            return;
        };
        if sock.peer_addr().is_err() {
            return;
        }
        (sock.as_raw_fd(), Rc::clone(&b.reactor))
    };
    let weak = Rc::downgrade(inner);
    let handle = reactor.subscribe_writable(
        fd,
        Box::new(move || match weak.upgrade() {
            Some(inner) => on_writable(&inner),
            None => Rearm::Disarm,
        }),
    );
    inner.borrow_mut().write_evt = Some(handle);
}

fn on_writable(inner: &Rc<RefCell<Inner>>) -> Rearm {
    let mut rearm = Rearm::Disarm;
    guard::guarded(inner, || {
        rearm = write_step(inner)?;
        Ok(())
    });
    rearm
}

fn write_step(inner: &Rc<RefCell<Inner>>) -> Result<Rearm> {
    guard::set_context(inner, "error writing socket output buffer");
    let drained = {
        let mut b = inner.borrow_mut();
        if b.closed || b.closing {
            return Ok(Rearm::Disarm);
        }
        if b.write_queue.is_empty() {
            // Stay registered but inert until the next write() re-arms us.
            return Ok(Rearm::Disarm);
        }
        let Inner { socket, write_queue, .. } = &mut *b;
        let Some(sock) = socket.as_ref() else {
            return Ok(Rearm::Disarm);
        };
        let sent = write_queue.drain(|chunk| sock.send(chunk))?;
        tracing::trace!(bytes = sent, peer = %b.peer_label, "flushed output buffer");
        b.write_queue.is_empty()
    };

    flag_activity(inner);

    if drained {
        let cb = inner.borrow().on_write_drained.clone();
        if let Some(cb) = cb {
            let sock = EventSocket::from_inner(Rc::clone(inner));
            cb(&sock)?;
        }
        Ok(Rearm::Disarm)
    } else {
        Ok(Rearm::Keep)
    }
}
