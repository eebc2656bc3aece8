mod common;

use std::cell::RefCell;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use eventsock::{EventSocket, EventSocketBuilder};

fn wait_for_accept(
    reactor: &eventsock::testing::TestReactor,
    listener: &EventSocket,
    accepted: &Rc<RefCell<Option<EventSocket>>>,
) {
    let fd = listener.raw_fd().expect("listener fd");
    for _ in 0..200 {
        reactor.fire_readable(fd);
        if accepted.borrow().is_some() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("no connection was accepted");
}

#[test]
fn accepted_peers_spawn_configured_connections() {
    let (reactor, shared) = common::reactor();

    let accepted = Rc::new(RefCell::new(None));
    let accepted2 = Rc::clone(&accepted);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = Rc::clone(&seen);
    let listener = EventSocketBuilder::new(shared)
        .max_read_buffer(1024)
        .on_read(move |conn| {
            seen2.borrow_mut().extend_from_slice(&conn.read()?);
            Ok(())
        })
        .on_accept(move |conn| {
            *accepted2.borrow_mut() = Some(conn);
            Ok(())
        })
        .build()
        .expect("build");

    let bind_addr: SocketAddr = "127.0.0.1:0".parse().expect("addr");
    listener.bind(bind_addr).expect("bind");
    listener.listen(16).expect("listen");
    let addr = listener.local_addr().expect("local addr");

    let mut peer = TcpStream::connect(addr).expect("peer connect");
    wait_for_accept(&reactor, &listener, &accepted);

    let spawned = accepted.borrow().clone().expect("spawned connection");
    // The spawned connection inherits the listener's read configuration and
    // ceiling, and is wired into the reactor before any bytes arrive.
    assert_eq!(spawned.max_read_buffer(), 1024);
    assert!(reactor.readable_armed(spawned.raw_fd().expect("fd")));
    assert_eq!(spawned.peer_addr().expect("peer"), peer.local_addr().expect("local"));

    peer.write_all(b"ping").expect("peer write");
    common::pump_reads(&reactor, &spawned, 4);
    reactor.run_pending_timers();
    assert_eq!(seen.borrow().as_slice(), b"ping");

    // The listener itself keeps listening.
    assert!(reactor.readable_armed(listener.raw_fd().expect("fd")));
}

#[test]
fn unretained_spawned_connections_survive_until_they_close() {
    let (reactor, shared) = common::reactor();

    let spawned_fd = Rc::new(RefCell::new(None));
    let spawned_fd2 = Rc::clone(&spawned_fd);
    let delivered = Rc::new(RefCell::new(Vec::new()));
    let delivered2 = Rc::clone(&delivered);
    let closes = Rc::new(RefCell::new(0));
    let closes2 = Rc::clone(&closes);
    let listener = EventSocketBuilder::new(shared)
        .on_read(move |conn| {
            delivered2.borrow_mut().extend_from_slice(&conn.read()?);
            Ok(())
        })
        .on_close(move |_| {
            *closes2.borrow_mut() += 1;
            Ok(())
        })
        .on_accept(move |conn| {
            // Deliberately let the handle go; the subscriptions alone must
            // keep the connection serviced.
            *spawned_fd2.borrow_mut() = Some(conn.raw_fd()?);
            Ok(())
        })
        .build()
        .expect("build");

    listener
        .bind("127.0.0.1:0".parse().expect("addr"))
        .expect("bind");
    listener.listen(16).expect("listen");
    let addr = listener.local_addr().expect("local addr");
    let listener_fd = listener.raw_fd().expect("fd");

    let mut peer = TcpStream::connect(addr).expect("peer connect");
    for _ in 0..200 {
        reactor.fire_readable(listener_fd);
        if spawned_fd.borrow().is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let fd = (*spawned_fd.borrow()).expect("accepted fd");
    assert!(reactor.readable_armed(fd), "spawned connection stayed wired");

    peer.write_all(b"ping").expect("peer write");
    for _ in 0..200 {
        reactor.fire_readable(fd);
        reactor.run_pending_timers();
        if delivered.borrow().len() >= 4 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(delivered.borrow().as_slice(), b"ping");

    drop(peer);
    for _ in 0..200 {
        reactor.fire_readable(fd);
        if *closes.borrow() > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*closes.borrow(), 1);
    assert!(!reactor.readable_armed(fd));
}

#[test]
fn on_accept_runs_synchronously_inside_the_accept_cycle() {
    let (reactor, shared) = common::reactor();

    let accepted = Rc::new(RefCell::new(None));
    let accepted2 = Rc::clone(&accepted);
    let listener = EventSocketBuilder::new(shared)
        .on_accept(move |conn| {
            // Configure the connection before any of its own events can
            // possibly run; a peer that connected and instantly dropped
            // must still see this state.
            conn.set_on_close(|_| Ok(()));
            *accepted2.borrow_mut() = Some(conn);
            Ok(())
        })
        .build()
        .expect("build");

    listener
        .bind("127.0.0.1:0".parse().expect("addr"))
        .expect("bind");
    listener.listen(16).expect("listen");
    let addr = listener.local_addr().expect("local addr");

    // Connect and disconnect immediately.
    drop(TcpStream::connect(addr).expect("peer connect"));

    wait_for_accept(&reactor, &listener, &accepted);
    let spawned = accepted.borrow().clone().expect("spawned connection");
    // Only after on_accept returned may the spawned connection observe the
    // disconnect.
    assert!(!spawned.closed() || spawned.peer_label() != "unknown");
}

#[test]
fn accept_errors_keep_the_listener_subscribed() {
    let (reactor, shared) = common::reactor();

    let errors = Rc::new(RefCell::new(0));
    let errors2 = Rc::clone(&errors);
    let listener = EventSocketBuilder::new(shared)
        .on_accept(|_| Err(eventsock::Error::app("not today")))
        .on_error(move |_, _, _| *errors2.borrow_mut() += 1)
        .build()
        .expect("build");

    listener
        .bind("127.0.0.1:0".parse().expect("addr"))
        .expect("bind");
    listener.listen(16).expect("listen");
    let addr = listener.local_addr().expect("local addr");
    let fd = listener.raw_fd().expect("fd");

    let _peer = TcpStream::connect(addr).expect("peer connect");
    for _ in 0..200 {
        reactor.fire_readable(fd);
        if *errors.borrow() > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*errors.borrow(), 1);
    assert!(reactor.readable_armed(fd), "listener still accepts");
}
