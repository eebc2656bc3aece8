//! Accept spawner: each accepted peer becomes a new connection inheriting
//! the listener's callback configuration.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;

use socket2::{SockAddr, Socket};

use crate::buffer::{ReadBuffer, WriteQueue};
use crate::error::{Error, Result};
use crate::reactor::Rearm;

use super::{EventSocket, Inner, addr_label, attach_connected, guard};

impl EventSocket {
    /// Bind the socket and subscribe accept readiness. Call
    /// [`listen`](EventSocket::listen) afterwards to open the backlog.
    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        {
            let mut b = self.inner().borrow_mut();
            if b.closed {
                return Err(Error::Closed { op: "bind" });
            }
            let sock = b.socket.as_ref().ok_or(Error::Closed { op: "bind" })?;
            sock.bind(&SockAddr::from(addr))?;
            if let Ok(local) = sock.local_addr() {
                b.peer_label = addr_label(&local);
            }
            tracing::debug!(addr = %addr, "bound socket");
        }
        subscribe_accept(self.inner());
        Ok(())
    }
}

fn subscribe_accept(inner: &Rc<RefCell<Inner>>) {
    let (fd, reactor) = {
        let b = inner.borrow();
        if b.accept_evt.is_some() {
            return;
        }
        let Some(sock) = b.socket.as_ref() else {
            return;
        };
        (sock.as_raw_fd(), Rc::clone(&b.reactor))
    };
    let weak = Rc::downgrade(inner);
    let handle = reactor.subscribe_readable(
        fd,
        Box::new(move || match weak.upgrade() {
            Some(inner) => on_acceptable(&inner),
            None => Rearm::Disarm,
        }),
    );
    inner.borrow_mut().accept_evt = Some(handle);
}

fn on_acceptable(inner: &Rc<RefCell<Inner>>) -> Rearm {
    guard::guarded(inner, || accept_step(inner));
    // Keep listening even when one accept cycle errors.
    Rearm::Keep
}

fn accept_step(inner: &Rc<RefCell<Inner>>) -> Result<()> {
    guard::set_context(inner, "error accepting new socket");
    let accepted = {
        let b = inner.borrow();
        if b.closed || b.closing {
            return Ok(());
        }
        let Some(listener) = b.socket.as_ref() else {
            return Ok(());
        };
        match listener.accept() {
            Ok(pair) => pair,
            // Another continuation already drained the backlog.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    };
    let (sock, addr) = accepted;
    sock.set_nonblocking(true)?;
    tracing::debug!(peer = %addr_label(&addr), "accepted connection");

    let spawned = spawn_accepted(inner, sock);

    // Synchronous delivery: a peer that connects and immediately disconnects
    // can otherwise have its read and close events fire before the caller
    // finished configuring the new connection.
    let cb = inner.borrow().on_accept.clone();
    if let Some(cb) = cb {
        cb(spawned)?;
    }
    Ok(())
}

/// Wrap an accepted descriptor in a new connection, inheriting the
/// listener's `on_read`, `on_error`, `on_close`, and read-buffer ceiling,
/// but not its `on_accept`, `on_write_drained`, buffers, or events.
fn spawn_accepted(listener: &Rc<RefCell<Inner>>, sock: Socket) -> EventSocket {
    let inner = {
        let l = listener.borrow();
        Rc::new(RefCell::new(Inner {
            reactor: Rc::clone(&l.reactor),
            socket: Some(sock),
            peer_label: "unknown".to_string(),
            read_buf: ReadBuffer::new(l.read_buf.max()),
            write_queue: WriteQueue::new(),
            inactivity_timeout: std::time::Duration::ZERO,
            connect_timeout: None,
            read_evt: None,
            write_evt: None,
            accept_evt: None,
            connect_evt: None,
            inactivity_evt: None,
            pending_notify_evt: None,
            on_read: l.on_read.clone(),
            on_accept: None,
            on_close: l.on_close.clone(),
            on_error: l.on_error.clone(),
            on_write_drained: None,
            closed: false,
            closing: false,
            error_context: None,
        }))
    };
    attach_connected(&inner);
    EventSocket::from_inner(inner)
}
