#![allow(dead_code)]

use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use eventsock::testing::TestReactor;
use eventsock::{EventSocket, Reactor};

pub fn reactor() -> (TestReactor, Rc<dyn Reactor>) {
    let reactor = TestReactor::new();
    let shared: Rc<dyn Reactor> = Rc::new(reactor.clone());
    (reactor, shared)
}

/// A connected loopback pair: the accepted end (to be wrapped in an
/// `EventSocket`) and the peer driven with blocking std calls.
pub fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let peer = TcpStream::connect(addr).expect("connect peer");
    let (accepted, _) = listener.accept().expect("accept");
    (accepted, peer)
}

/// Fire readable until the connection has buffered at least `want` bytes or
/// closed; loopback delivery is fast but not instantaneous.
pub fn pump_reads(reactor: &TestReactor, sock: &EventSocket, want: usize) {
    let fd = match sock.raw_fd() {
        Ok(fd) => fd,
        Err(_) => return,
    };
    for _ in 0..200 {
        reactor.fire_readable(fd);
        if sock.closed() || sock.buffered() >= want {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("peer data never arrived");
}
