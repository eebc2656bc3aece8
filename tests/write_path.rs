mod common;

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;
use std::time::Duration;

use eventsock::{Error, EventSocketBuilder};

#[test]
fn write_creates_the_writable_subscription_and_queues_the_chunk() {
    let (reactor, shared) = common::reactor();
    let (accepted, _peer) = common::loopback_pair();

    let sock = EventSocketBuilder::new(shared).wrap(accepted).expect("wrap");
    let fd = sock.raw_fd().expect("fd");

    assert!(!reactor.writable_armed(fd));
    sock.write(&b"hello"[..]).expect("write");
    assert!(reactor.writable_armed(fd));
}

#[test]
fn drained_queue_disarms_until_the_next_write() {
    let (reactor, shared) = common::reactor();
    let (accepted, mut peer) = common::loopback_pair();

    let drained = Rc::new(RefCell::new(0));
    let drained2 = Rc::clone(&drained);
    let sock = EventSocketBuilder::new(shared)
        .on_write_drained(move |_| {
            *drained2.borrow_mut() += 1;
            Ok(())
        })
        .wrap(accepted)
        .expect("wrap");
    let fd = sock.raw_fd().expect("fd");

    sock.write(&b"hello"[..]).expect("write");
    reactor.fire_writable(fd);
    assert_eq!(*drained.borrow(), 1);
    assert!(!reactor.writable_armed(fd));

    let mut buf = [0u8; 5];
    peer.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
    peer.read_exact(&mut buf).expect("peer read");
    assert_eq!(&buf, b"hello");

    // The subscription stays registered but inert; the next write re-arms
    // it instead of creating a second one.
    sock.write(&b"again"[..]).expect("write");
    assert!(reactor.writable_armed(fd));
    reactor.fire_writable(fd);
    peer.read_exact(&mut buf).expect("peer read");
    assert_eq!(&buf, b"again");
    assert_eq!(*drained.borrow(), 2);
}

#[test]
fn chunks_arrive_in_queue_order() {
    let (reactor, shared) = common::reactor();
    let (accepted, mut peer) = common::loopback_pair();

    let sock = EventSocketBuilder::new(shared).wrap(accepted).expect("wrap");
    let fd = sock.raw_fd().expect("fd");

    sock.write(&b"one"[..]).expect("write");
    sock.write(&b"two"[..]).expect("write");
    sock.write(&b"three"[..]).expect("write");
    for _ in 0..100 {
        reactor.fire_writable(fd);
        if !reactor.writable_armed(fd) {
            break;
        }
    }

    let mut buf = [0u8; 11];
    peer.set_read_timeout(Some(Duration::from_secs(5))).expect("timeout");
    peer.read_exact(&mut buf).expect("peer read");
    assert_eq!(&buf, b"onetwothree");
}

#[test]
fn write_on_a_closed_connection_is_a_usage_error() {
    let (_reactor, shared) = common::reactor();
    let (accepted, _peer) = common::loopback_pair();

    let sock = EventSocketBuilder::new(shared).wrap(accepted).expect("wrap");
    sock.close();
    assert!(matches!(
        sock.write(&b"late"[..]),
        Err(Error::Closed { op: "write" })
    ));
}

#[test]
fn drained_subscription_does_not_refire() {
    let (reactor, shared) = common::reactor();
    let (accepted, _peer) = common::loopback_pair();

    let drained = Rc::new(RefCell::new(0));
    let drained2 = Rc::clone(&drained);
    let sock = EventSocketBuilder::new(shared)
        .on_write_drained(move |_| {
            *drained2.borrow_mut() += 1;
            Ok(())
        })
        .wrap(accepted)
        .expect("wrap");
    let fd = sock.raw_fd().expect("fd");

    sock.write(&b"x"[..]).expect("write");
    reactor.fire_writable(fd);
    assert_eq!(*drained.borrow(), 1);

    // A wakeup with nothing queued must not report a drain.
    let handle_fired = reactor.fire_writable(fd);
    assert_eq!(handle_fired, 0);
    assert_eq!(*drained.borrow(), 1);
}
