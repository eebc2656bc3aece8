//! The connection aggregate: one socket descriptor, its buffers, its event
//! handles, and the callbacks configured by the application.
//!
//! Everything runs on one logical thread. The public [`EventSocket`] is a
//! cheap clone handle over the shared state; closures handed to the reactor
//! capture only a weak reference, so cancelling the handles in [`close`]
//! deterministically breaks every cycle between a connection and its events.
//!
//! [`close`]: EventSocket::close

mod accept;
mod connect;
mod guard;
mod read;
mod write;

pub use connect::Deadline;

use std::cell::RefCell;
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buffer::{ReadBuffer, RebufferMode, WriteQueue};
use crate::error::{Error, Result};
use crate::reactor::{EventHandle, Reactor, Rearm};

pub type ReadCallback = Rc<dyn Fn(&EventSocket) -> Result<()>>;
pub type AcceptCallback = Rc<dyn Fn(EventSocket) -> Result<()>>;
pub type CloseCallback = Rc<dyn Fn(&EventSocket) -> Result<()>>;
pub type WriteDrainedCallback = Rc<dyn Fn(&EventSocket) -> Result<()>>;
pub type ErrorCallback = Rc<dyn Fn(&EventSocket, &str, &Error)>;

pub(crate) struct Inner {
    pub(crate) reactor: Rc<dyn Reactor>,
    pub(crate) socket: Option<Socket>,
    /// Best-effort endpoint label, retained after close for diagnostics.
    pub(crate) peer_label: String,
    pub(crate) read_buf: ReadBuffer,
    pub(crate) write_queue: WriteQueue,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) read_evt: Option<Box<dyn EventHandle>>,
    pub(crate) write_evt: Option<Box<dyn EventHandle>>,
    pub(crate) accept_evt: Option<Box<dyn EventHandle>>,
    pub(crate) connect_evt: Option<Box<dyn EventHandle>>,
    pub(crate) inactivity_evt: Option<Box<dyn EventHandle>>,
    pub(crate) pending_notify_evt: Option<Box<dyn EventHandle>>,
    pub(crate) on_read: Option<ReadCallback>,
    pub(crate) on_accept: Option<AcceptCallback>,
    pub(crate) on_close: Option<CloseCallback>,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_write_drained: Option<WriteDrainedCallback>,
    pub(crate) closed: bool,
    /// Latched while the close sequence runs so a close triggered from
    /// inside the final flush callback cannot run it a second time.
    pub(crate) closing: bool,
    /// Describes the operation in flight when an error surfaces. Set before
    /// fallible work, cleared after every guarded callback completes.
    pub(crate) error_context: Option<String>,
}

/// A non-blocking socket driven by an injected reactor.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct EventSocket {
    inner: Rc<RefCell<Inner>>,
}

/// Fluent configuration for an [`EventSocket`].
pub struct EventSocketBuilder {
    reactor: Rc<dyn Reactor>,
    domain: Domain,
    socket_type: Type,
    protocol: Option<Protocol>,
    on_read: Option<ReadCallback>,
    on_accept: Option<AcceptCallback>,
    on_close: Option<CloseCallback>,
    on_error: Option<ErrorCallback>,
    on_write_drained: Option<WriteDrainedCallback>,
    max_read_buffer: usize,
    connect_timeout: Option<Duration>,
}

impl EventSocketBuilder {
    pub fn new(reactor: Rc<dyn Reactor>) -> Self {
        Self {
            reactor,
            domain: Domain::IPV4,
            socket_type: Type::STREAM,
            protocol: None,
            on_read: None,
            on_accept: None,
            on_close: None,
            on_error: None,
            on_write_drained: None,
            max_read_buffer: 0,
            connect_timeout: None,
        }
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = domain;
        self
    }

    pub fn socket_type(mut self, socket_type: Type) -> Self {
        self.socket_type = socket_type;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Called after buffered input is ready; the connection coalesces recv
    /// bursts into one deferred notification.
    pub fn on_read(mut self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) -> Self {
        self.on_read = Some(Rc::new(cb));
        self
    }

    /// Called synchronously with each connection spawned by a listener.
    pub fn on_accept(mut self, cb: impl Fn(EventSocket) -> Result<()> + 'static) -> Self {
        self.on_accept = Some(Rc::new(cb));
        self
    }

    pub fn on_close(mut self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) -> Self {
        self.on_close = Some(Rc::new(cb));
        self
    }

    /// Sink for failures surfacing inside reactor continuations. Receives
    /// the connection, a short description of the operation in flight, and
    /// the error itself.
    pub fn on_error(mut self, cb: impl Fn(&EventSocket, &str, &Error) + 'static) -> Self {
        self.on_error = Some(Rc::new(cb));
        self
    }

    /// Called each time the write queue fully drains.
    pub fn on_write_drained(mut self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) -> Self {
        self.on_write_drained = Some(Rc::new(cb));
        self
    }

    /// Ceiling on buffered input; exceeding it force-closes the connection
    /// and discards the buffer. `0` means unbounded.
    pub fn max_read_buffer(mut self, max: usize) -> Self {
        self.max_read_buffer = max;
        self
    }

    /// Default timeout applied by [`EventSocket::connect`] when the caller
    /// passes [`Deadline::Default`].
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Create a fresh non-blocking socket.
    pub fn build(self) -> Result<EventSocket> {
        let socket = Socket::new(self.domain, self.socket_type, self.protocol)?;
        socket.set_nonblocking(true)?;
        Ok(self.finish(socket, false))
    }

    /// Adopt an existing socket. If it is already connected, the peer label
    /// is recorded and the read path is subscribed immediately.
    pub fn wrap(self, socket: impl Into<Socket>) -> Result<EventSocket> {
        let socket = socket.into();
        socket.set_nonblocking(true)?;
        let connected = socket.peer_addr().is_ok();
        Ok(self.finish(socket, connected))
    }

    fn finish(self, socket: Socket, connected: bool) -> EventSocket {
        let inner = Rc::new(RefCell::new(Inner {
            reactor: self.reactor,
            socket: Some(socket),
            peer_label: "unknown".to_string(),
            read_buf: ReadBuffer::new(self.max_read_buffer),
            write_queue: WriteQueue::new(),
            inactivity_timeout: Duration::ZERO,
            connect_timeout: self.connect_timeout,
            read_evt: None,
            write_evt: None,
            accept_evt: None,
            connect_evt: None,
            inactivity_evt: None,
            pending_notify_evt: None,
            on_read: self.on_read,
            on_accept: self.on_accept,
            on_close: self.on_close,
            on_error: self.on_error,
            on_write_drained: self.on_write_drained,
            closed: false,
            closing: false,
            error_context: None,
        }));
        if connected {
            attach_connected(&inner);
        }
        EventSocket { inner }
    }
}

impl EventSocket {
    pub(crate) fn from_inner(inner: Rc<RefCell<Inner>>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<Inner>> {
        &self.inner
    }

    /// Whether the connection reached its terminal state.
    pub fn closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Best-effort "ip:port" of the remote (or local, for listeners)
    /// endpoint. Stays available after close.
    pub fn peer_label(&self) -> String {
        self.inner.borrow().peer_label.clone()
    }

    /// Bytes currently accumulated in the read buffer.
    pub fn buffered(&self) -> usize {
        self.inner.borrow().read_buf.len()
    }

    /// Configured read-buffer ceiling, `0` meaning unbounded.
    pub fn max_read_buffer(&self) -> usize {
        self.inner.borrow().read_buf.max()
    }

    /// Take ownership of everything buffered so far, leaving the read
    /// buffer empty.
    pub fn read(&self) -> Result<Bytes> {
        let mut b = self.inner.borrow_mut();
        if b.closed {
            return Err(Error::Closed { op: "read" });
        }
        Ok(b.read_buf.take())
    }

    /// Push unconsumed bytes back for the next read cycle. Must happen in
    /// the same notification cycle that produced the data; deferring it
    /// risks the buffer being overwritten by the next recv.
    pub fn rebuffer(&self, data: &[u8], mode: RebufferMode) -> Result<()> {
        let mut b = self.inner.borrow_mut();
        if b.closed {
            return Err(Error::Closed { op: "rebuffer" });
        }
        b.read_buf.restore(data, mode);
        Ok(())
    }

    /// Replace the read callback. If data is already buffered and no
    /// delivery is pending, a deferred flush is scheduled immediately.
    ///
    /// All callback setters are inert on a closed connection; close cleared
    /// the slots, and a late registration must not repopulate them.
    pub fn set_on_read(&self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) {
        let buffered = {
            let mut b = self.inner.borrow_mut();
            if b.closed {
                return;
            }
            b.on_read = Some(Rc::new(cb));
            !b.read_buf.is_empty()
        };
        if buffered {
            read::schedule_read_notify(&self.inner);
        }
    }

    pub fn set_on_accept(&self, cb: impl Fn(EventSocket) -> Result<()> + 'static) {
        let mut b = self.inner.borrow_mut();
        if !b.closed {
            b.on_accept = Some(Rc::new(cb));
        }
    }

    pub fn set_on_close(&self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) {
        let mut b = self.inner.borrow_mut();
        if !b.closed {
            b.on_close = Some(Rc::new(cb));
        }
    }

    pub fn set_on_error(&self, cb: impl Fn(&EventSocket, &str, &Error) + 'static) {
        let mut b = self.inner.borrow_mut();
        if !b.closed {
            b.on_error = Some(Rc::new(cb));
        }
    }

    pub fn set_on_write_drained(&self, cb: impl Fn(&EventSocket) -> Result<()> + 'static) {
        let mut b = self.inner.borrow_mut();
        if !b.closed {
            b.on_write_drained = Some(Rc::new(cb));
        }
    }

    /// Arm (or, with a zero duration, disarm) the inactivity watchdog. The
    /// timer is reset by every successful read and every write; when it
    /// fires, the connection is force-closed.
    pub fn set_inactivity_timeout(&self, timeout: Duration) -> Result<()> {
        {
            let mut b = self.inner.borrow_mut();
            if b.closed {
                return Err(Error::Closed { op: "set_inactivity_timeout" });
            }
            if let Some(evt) = b.inactivity_evt.take() {
                evt.cancel();
            }
            b.inactivity_timeout = timeout;
        }
        if !timeout.is_zero() {
            arm_watchdog(&self.inner);
        }
        Ok(())
    }

    /// Close the connection: cancel every event, close the descriptor,
    /// deliver one final read notification if data is still buffered, then
    /// invoke `on_close` and release all callbacks and buffers. Calling it
    /// a second time is a no-op.
    pub fn close(&self) {
        close_inner(&self.inner);
    }

    // Explicit pass-throughs to the descriptor; nothing is forwarded
    // dynamically.

    pub fn listen(&self, backlog: i32) -> Result<()> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "listen")?;
        sock.listen(backlog)?;
        Ok(())
    }

    pub fn shutdown(&self, how: Shutdown) -> Result<()> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "shutdown")?;
        sock.shutdown(how)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "local_addr")?;
        as_inet(sock.local_addr()?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "peer_addr")?;
        as_inet(sock.peer_addr()?)
    }

    pub fn recv_buffer_size(&self) -> Result<usize> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "recv_buffer_size")?;
        Ok(sock.recv_buffer_size()?)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "set_recv_buffer_size")?;
        sock.set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "set_nodelay")?;
        sock.set_tcp_nodelay(nodelay)?;
        Ok(())
    }

    pub fn raw_fd(&self) -> Result<RawFd> {
        let b = self.inner.borrow();
        let sock = live_socket(&b, "raw_fd")?;
        Ok(sock.as_raw_fd())
    }
}

impl fmt::Debug for EventSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.inner.borrow();
        f.debug_struct("EventSocket")
            .field("peer", &b.peer_label)
            .field("closed", &b.closed)
            .finish()
    }
}

fn live_socket<'a>(b: &'a std::cell::Ref<'_, Inner>, op: &'static str) -> Result<&'a Socket> {
    b.socket.as_ref().ok_or(Error::Closed { op })
}

fn as_inet(addr: SockAddr) -> Result<SocketAddr> {
    addr.as_socket()
        .ok_or_else(|| Error::Io(std::io::ErrorKind::AddrNotAvailable.into()))
}

pub(crate) fn addr_label(addr: &SockAddr) -> String {
    match addr.as_socket() {
        Some(inet) => inet.to_string(),
        None => "unknown".to_string(),
    }
}

/// Record the peer label and subscribe the read path of a socket that is
/// already connected (adopted, accepted, or freshly completed connect).
pub(crate) fn attach_connected(inner: &Rc<RefCell<Inner>>) {
    {
        let mut b = inner.borrow_mut();
        if let Some(addr) = b.socket.as_ref().and_then(|s| s.peer_addr().ok()) {
            b.peer_label = addr_label(&addr);
        }
    }
    read::subscribe_read(inner);
}

/// Cancel and re-arm the watchdog after any successful read or write.
pub(crate) fn flag_activity(inner: &Rc<RefCell<Inner>>) {
    let rearm = {
        let mut b = inner.borrow_mut();
        match b.inactivity_evt.take() {
            Some(evt) => {
                evt.cancel();
                true
            }
            None => false,
        }
    };
    if rearm {
        arm_watchdog(inner);
    }
}

fn arm_watchdog(inner: &Rc<RefCell<Inner>>) {
    let (reactor, timeout) = {
        let b = inner.borrow();
        if b.closed || b.inactivity_timeout.is_zero() {
            return;
        }
        (Rc::clone(&b.reactor), b.inactivity_timeout)
    };
    let weak = Rc::downgrade(inner);
    let handle = reactor.schedule_after(
        timeout,
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if !inner.borrow().closed {
                    guard::guarded(&inner, || {
                        guard::set_context(&inner, "error closing inactive socket");
                        close_inner(&inner);
                        Ok(())
                    });
                }
            }
            Rearm::Disarm
        }),
    );
    inner.borrow_mut().inactivity_evt = Some(handle);
}

pub(crate) fn close_inner(inner: &Rc<RefCell<Inner>>) {
    {
        let mut b = inner.borrow_mut();
        if b.closed || b.closing {
            return;
        }
        b.closing = true;
        let b = &mut *b;
        for slot in [
            &mut b.read_evt,
            &mut b.accept_evt,
            &mut b.inactivity_evt,
            &mut b.write_evt,
            &mut b.connect_evt,
        ] {
            if let Some(evt) = slot.take() {
                evt.cancel();
            }
        }
        // Dropping the socket closes the descriptor.
        b.socket = None;
        tracing::debug!(peer = %b.peer_label, "closing connection");
    }

    // Flush input that accumulated between the last notification and this
    // close; a consumer may have re-buffered a partial message and then
    // disconnected, and those bytes must not vanish silently. The callback
    // slot is cleared first so the flush runs exactly once.
    let flush_cb = {
        let mut b = inner.borrow_mut();
        if !b.read_buf.is_empty() && b.on_read.is_some() {
            b.error_context = Some("error processing remaining socket input buffer".to_string());
            b.on_read.take()
        } else {
            None
        }
    };
    if let Some(cb) = flush_cb {
        let sock = EventSocket::from_inner(Rc::clone(inner));
        guard::guarded(inner, || cb(&sock));
    }

    // Only now is the connection observably closed.
    let close_cb = {
        let mut b = inner.borrow_mut();
        b.closed = true;
        b.on_close.take()
    };
    if let Some(cb) = close_cb {
        let sock = EventSocket::from_inner(Rc::clone(inner));
        guard::guarded(inner, || cb(&sock));
    }

    let mut b = inner.borrow_mut();
    if let Some(evt) = b.pending_notify_evt.take() {
        evt.cancel();
    }
    b.on_read = None;
    b.on_accept = None;
    b.on_close = None;
    b.on_error = None;
    b.on_write_drained = None;
    b.read_buf.clear();
    b.write_queue.clear();
    b.closing = false;
}
