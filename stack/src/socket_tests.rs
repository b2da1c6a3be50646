use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::error::NetError;
use crate::socket::{
    MAX_SOCKETS, Proto, ShutdownFlags, SocketId, SocketState, StreamState,
};
use crate::stack::{SOCKET_GC_DELAY_MS, ShutdownMode, SocketStack, StateChange};
use crate::addr::Family;
use crate::testkit::{test_stack, v4, v4_any};

fn open_datagram(stack: &mut SocketStack) -> Option<SocketId> {
    stack.open(Family::V4, Proto::Datagram, None).ok()
}

fn open_stream(stack: &mut SocketStack) -> Option<SocketId> {
    stack.open(Family::V4, Proto::Stream, None).ok()
}

pub fn test_open_defaults() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let Some(sock) = stack.socket(id) else {
        return fail!("socket missing");
    };
    assert_eq_test!(sock.state, SocketState::Unbound);
    assert_test!(!sock.is_bound(), "fresh socket is unregistered");
    assert_test!(sock.q_in.is_empty() && sock.q_out.is_empty(), "queues empty");
    assert_eq_test!(sock.shutdown, ShutdownFlags::empty());
    pass!()
}

pub fn test_open_table_full() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    for _ in 0..MAX_SOCKETS {
        if open_datagram(&mut stack).is_none() {
            return fail!("table filled early");
        }
    }
    assert_eq_test!(
        stack.open(Family::V4, Proto::Datagram, None),
        Err(NetError::OutOfMemory),
        "65th open fails"
    );
    assert_eq_test!(stack.last_error(), Some(NetError::OutOfMemory));
    pass!()
}

pub fn test_bind_registers() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 5000;
    if let Err(e) = stack.bind(id, v4(10, 0, 0, 1), &mut port) {
        return fail!("bind failed: {:?}", e);
    }
    let Some(sock) = stack.socket(id) else {
        return fail!("socket missing");
    };
    assert_eq_test!(sock.state, SocketState::Bound);
    assert_test!(sock.is_bound(), "bound flag synchronized");
    assert_test!(stack.registry().contains(sock), "registry membership");
    assert_eq_test!(
        stack
            .registry()
            .lookup(Proto::Datagram, 5000)
            .map(|e| e.member_count()),
        Some(1),
        "entry created on first bind"
    );
    pass!()
}

pub fn test_bind_ephemeral_port() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 0;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    assert_test!(port >= 1024, "ephemeral port from the high range");
    assert_eq_test!(stack.socket(id).map(|s| s.local_port), Some(port));
    pass!()
}

pub fn test_bind_unknown_address_rejected() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 5000;
    assert_eq_test!(
        stack.bind(id, v4(192, 168, 9, 9), &mut port),
        Err(NetError::InvalidArgument),
        "no device owns that address"
    );
    assert_eq_test!(stack.last_error(), Some(NetError::InvalidArgument));
    pass!()
}

pub fn test_bind_address_in_use() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let (Some(a), Some(b)) = (open_datagram(&mut stack), open_datagram(&mut stack)) else {
        return fail!("open failed");
    };
    let mut port = 6000;
    if stack.bind(a, v4_any(), &mut port).is_err() {
        return fail!("first bind failed");
    }
    let mut port = 6000;
    assert_eq_test!(
        stack.bind(b, v4(10, 0, 0, 1), &mut port),
        Err(NetError::AddressInUse),
        "wildcard member collides with concrete bind"
    );
    pass!()
}

pub fn test_connect_datagram() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    if let Err(e) = stack.connect(id, v4(10, 0, 0, 9), 53) {
        return fail!("connect failed: {:?}", e);
    }
    let Some(sock) = stack.socket(id) else {
        return fail!("socket missing");
    };
    assert_eq_test!(sock.state, SocketState::Connected);
    assert_eq_test!(sock.remote_addr, v4(10, 0, 0, 9));
    assert_eq_test!(sock.remote_port, 53);
    assert_eq_test!(sock.local_addr, v4(10, 0, 0, 1), "source address resolved");
    assert_test!(sock.local_port >= 1024, "ephemeral local port drawn");
    assert_test!(sock.is_bound(), "connect registers the socket");
    pass!()
}

pub fn test_connect_stream_starts_handshake() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    if stack.connect(id, v4(10, 0, 0, 9), 80).is_err() {
        return fail!("connect failed");
    }
    let Some(sock) = stack.socket(id) else {
        return fail!("socket missing");
    };
    assert_eq_test!(sock.state, SocketState::Connecting);
    assert_eq_test!(sock.stream_state, StreamState::SynSent);
    pass!()
}

pub fn test_connect_stream_no_route() -> TestResult {
    let (mut stack, net, _eng) = test_stack();
    net.lock().route_ok = false;
    let Some(id) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    assert_eq_test!(
        stack.connect(id, v4(10, 0, 0, 9), 80),
        Err(NetError::HostUnreachable)
    );
    pass!()
}

pub fn test_listen_and_accept() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(listener) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 80;
    if stack.bind(listener, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    if stack.listen(listener, 4).is_err() {
        return fail!("listen failed");
    }
    let Some(sock) = stack.socket(listener) else {
        return fail!("socket missing");
    };
    assert_eq_test!(sock.state, SocketState::Listening);
    assert_eq_test!(sock.stream_state, StreamState::Listen);

    // No pending connection yet.
    assert_eq_test!(stack.accept(listener).err(), Some(NetError::WouldBlock));

    // Materialize an established child the way the demultiplexer would.
    let Ok(child) = stack.clone_socket(listener) else {
        return fail!("clone failed");
    };
    if let Some(sock) = stack.socket_mut(child) {
        sock.remote_addr = v4(10, 0, 0, 9);
        sock.remote_port = 5555;
        sock.stream_state = StreamState::Established;
        sock.state = SocketState::Connected;
        sock.parent = Some(listener);
    }
    if stack.alter_state(child, StateChange::Bind).is_err() {
        return fail!("child bind failed");
    }
    if let Some(sock) = stack.socket_mut(listener) {
        sock.pending_connections = 1;
    }

    let Ok((accepted, ra, rp)) = stack.accept(listener) else {
        return fail!("accept failed");
    };
    assert_eq_test!(accepted, child);
    assert_eq_test!(ra, v4(10, 0, 0, 9));
    assert_eq_test!(rp, 5555);
    assert_eq_test!(stack.socket(child).and_then(|s| s.parent), None);
    assert_eq_test!(
        stack.socket(listener).map(|s| s.pending_connections),
        Some(0)
    );
    pass!()
}

pub fn test_listen_on_datagram_rejected() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 5000;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    assert_eq_test!(stack.listen(id, 4), Err(NetError::InvalidArgument));
    pass!()
}

pub fn test_clone_socket_copies_identity() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 80;
    if stack.bind(id, v4(10, 0, 0, 1), &mut port).is_err() {
        return fail!("bind failed");
    }
    let Ok(copy) = stack.clone_socket(id) else {
        return fail!("clone failed");
    };
    let Some(sock) = stack.socket(copy) else {
        return fail!("clone missing");
    };
    assert_eq_test!(sock.local_addr, v4(10, 0, 0, 1));
    assert_eq_test!(sock.local_port, 80);
    assert_eq_test!(sock.state, SocketState::Bound, "state copied");
    assert_test!(!sock.is_bound(), "clone is not registered");
    assert_test!(sock.q_in.is_empty() && sock.q_out.is_empty(), "fresh queues");
    pass!()
}

pub fn test_close_unregisters_then_releases() -> TestResult {
    let (mut stack, _net, eng) = test_stack();
    let Some(id) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 4000;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    stack.set_clock(1_000);
    if stack.close(id).is_err() {
        return fail!("close failed");
    }

    // Unregistered synchronously: the port is free again...
    assert_test!(
        stack.registry().lookup(Proto::Stream, 4000).is_none(),
        "port entry gone at close"
    );
    assert_eq_test!(stack.socket(id).map(|s| s.state), Some(SocketState::Closed));
    assert_eq_test!(stack.reclaim_pending(), 1);
    assert_test!(
        eng.lock().closing_notified.contains(&id),
        "close handshake notified"
    );

    // ...but the memory survives until the grace delay elapses.
    stack.poll_reclaim(1_000 + SOCKET_GC_DELAY_MS - 1);
    assert_test!(stack.socket(id).is_some(), "still retained inside grace");

    stack.poll_reclaim(1_000 + SOCKET_GC_DELAY_MS);
    assert_test!(stack.socket(id).is_none(), "released after grace");
    assert_test!(eng.lock().cleanups.contains(&id), "engine queues cleaned");
    pass!()
}

pub fn test_shutdown_never_registered_releases_now() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    assert_test!(stack.shutdown(id, ShutdownMode::Both).is_ok(), "shutdown ok");
    assert_test!(stack.socket(id).is_none(), "released immediately");
    assert_eq_test!(stack.reclaim_pending(), 0);
    pass!()
}

pub fn test_shutdown_directions() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = open_datagram(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 5001;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }

    if stack.shutdown(id, ShutdownMode::Read).is_err() {
        return fail!("shutdown read failed");
    }
    assert_test!(
        stack
            .socket(id)
            .is_some_and(|s| s.shutdown.contains(ShutdownFlags::REMOTE)),
        "read shutdown sets the remote flag"
    );
    assert_test!(
        stack.socket(id).is_some_and(|s| s.is_bound()),
        "read shutdown alone keeps the binding"
    );

    if stack.shutdown(id, ShutdownMode::Both).is_err() {
        return fail!("shutdown both failed");
    }
    assert_test!(
        stack.socket(id).is_some_and(|s| !s.is_bound()),
        "full shutdown unbinds a datagram socket"
    );
    assert_eq_test!(stack.socket(id).map(|s| s.state), Some(SocketState::Closed));
    pass!()
}

pub fn test_spawned_child_counts_against_parent() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(listener) = open_stream(&mut stack) else {
        return fail!("open failed");
    };
    let mut port = 81;
    if stack.bind(listener, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    if stack.listen(listener, 2).is_err() {
        return fail!("listen failed");
    }
    let Ok(child) = stack.clone_socket(listener) else {
        return fail!("clone failed");
    };
    if let Some(sock) = stack.socket_mut(child) {
        sock.remote_addr = v4(10, 0, 0, 9);
        sock.remote_port = 1234;
        sock.parent = Some(listener);
    }
    if stack.alter_state(child, StateChange::Bind).is_err() {
        return fail!("child bind failed");
    }
    if let Some(sock) = stack.socket_mut(listener) {
        sock.pending_connections = 1;
    }

    // Closing an unaccepted child gives its slot back to the listener.
    if stack.close(child).is_err() {
        return fail!("child close failed");
    }
    assert_eq_test!(
        stack.socket(listener).map(|s| s.pending_connections),
        Some(0),
        "pending counter released on child close"
    );
    pass!()
}

define_test_suite!(
    socket_lifecycle,
    [
        test_open_defaults,
        test_open_table_full,
        test_bind_registers,
        test_bind_ephemeral_port,
        test_bind_unknown_address_rejected,
        test_bind_address_in_use,
        test_connect_datagram,
        test_connect_stream_starts_handshake,
        test_connect_stream_no_route,
        test_listen_and_accept,
        test_listen_on_datagram_rejected,
        test_clone_socket_copies_identity,
        test_close_unregisters_then_releases,
        test_shutdown_never_registered_releases_now,
        test_shutdown_directions,
        test_spawned_child_counts_against_parent,
    ]
);
