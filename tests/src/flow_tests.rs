use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use rill_stack::engine::ChildSpawn;
use rill_stack::testkit::{rx_datagram_frame, rx_stream_frame, test_stack, v4, v4_any, wake_recorder};
use rill_stack::{
    Family, NetError, Proto, SOCKET_GC_DELAY_MS, SockEvent, SocketState, StreamState,
};

pub fn test_datagram_round_trip() -> TestResult {
    let (mut stack, net, _eng) = test_stack();
    let (cb, wakes) = wake_recorder();
    let Ok(id) = stack.open(Family::V4, Proto::Datagram, Some(cb)) else {
        return fail!("open failed");
    };
    let mut port = 5000;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }

    // Outbound: segment, queue, and let the scheduler hand the frame down.
    assert_eq_test!(stack.send_to(id, b"ping", v4(10, 0, 0, 9), 6000), Ok(4));
    let remaining = stack.run_output_cycle(8, 0);
    assert_eq_test!(remaining, 7, "one frame unit spent");
    {
        let ctl = net.lock();
        let Some((proto, frame)) = ctl.pushed.last() else {
            return fail!("nothing reached the network layer");
        };
        assert_eq_test!(*proto, Proto::Datagram);
        assert_eq_test!(frame.src_port(), Some(5000));
        assert_eq_test!(frame.dst_port(), Some(6000));
        assert_eq_test!(frame.payload(), b"ping");
        assert_test!(frame.remote().is_some(), "destination snapshot attached");
    }

    // Inbound: the reply lands in the queue and wakes the application.
    let reply = rx_datagram_frame(v4(10, 0, 0, 9), 6000, v4(10, 0, 0, 1), 5000, b"pong");
    assert_eq_test!(stack.process_inbound(Proto::Datagram, reply), Ok(()));
    assert_eq_test!(wakes.lock().last().copied(), Some((SockEvent::RD, id)));

    let mut buf = [0u8; 16];
    let Ok((n, Some(origin))) = stack.recv_from(id, &mut buf) else {
        return fail!("recv failed");
    };
    assert_eq_test!(&buf[..n], b"pong");
    assert_eq_test!(origin.ip, v4(10, 0, 0, 9));
    assert_eq_test!(origin.port, 6000);

    // Nothing left: the call would block and the context mirrors the error.
    assert_eq_test!(stack.recv(id, &mut buf), Err(NetError::WouldBlock));
    assert_eq_test!(stack.last_error(), Some(NetError::WouldBlock));
    pass!()
}

pub fn test_stream_accept_and_flush() -> TestResult {
    let (mut stack, net, eng) = test_stack();
    let Ok(listener) = stack.open(Family::V4, Proto::Stream, None) else {
        return fail!("open failed");
    };
    let mut port = 80;
    if stack.bind(listener, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    if stack.listen(listener, 4).is_err() {
        return fail!("listen failed");
    }

    // A handshake completion reported by the engine materializes a child.
    eng.lock().input_spawn = Some(ChildSpawn {
        remote_addr: v4(10, 0, 0, 9),
        remote_port: 5555,
        stream_state: StreamState::Established,
    });
    let syn = rx_stream_frame(v4(10, 0, 0, 9), 5555, v4(10, 0, 0, 1), 80, b"");
    assert_test!(stack.process_inbound(Proto::Stream, syn).is_ok(), "deliver");

    let Ok((child, ra, rp)) = stack.accept(listener) else {
        return fail!("accept failed");
    };
    assert_eq_test!(ra, v4(10, 0, 0, 9));
    assert_eq_test!(rp, 5555);
    assert_eq_test!(
        stack.socket(child).map(|s| s.state),
        Some(SocketState::Connected)
    );

    // Write on the accepted socket, then let the stream phase flush it.
    assert_eq_test!(stack.write(child, b"hello there"), Ok(11));
    eng.lock().output_cost = 1;
    let _ = stack.run_output_cycle(8, 0);
    {
        let ctl = net.lock();
        let Some((proto, frame)) = ctl.pushed.last() else {
            return fail!("nothing flushed");
        };
        assert_eq_test!(*proto, Proto::Stream);
        assert_eq_test!(frame.payload(), b"hello there");
    }
    pass!()
}

pub fn test_close_retains_through_grace() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Ok(id) = stack.open(Family::V4, Proto::Datagram, None) else {
        return fail!("open failed");
    };
    let mut port = 7000;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    stack.set_clock(10_000);
    if stack.close(id).is_err() {
        return fail!("close failed");
    }

    // The port frees synchronously; the memory survives the grace window.
    assert_test!(
        stack.registry().lookup(Proto::Datagram, 7000).is_none(),
        "port entry gone immediately after close"
    );
    assert_eq_test!(stack.socket(id).map(|s| s.state), Some(SocketState::Closed));

    stack.poll_reclaim(10_000 + SOCKET_GC_DELAY_MS - 1);
    assert_test!(stack.socket(id).is_some(), "retained inside the grace window");
    stack.poll_reclaim(10_000 + SOCKET_GC_DELAY_MS);
    assert_test!(stack.socket(id).is_none(), "released after the grace window");

    // A fresh socket can take the port right away.
    let Ok(next) = stack.open(Family::V4, Proto::Datagram, None) else {
        return fail!("open failed");
    };
    let mut port = 7000;
    assert_test!(stack.bind(next, v4_any(), &mut port).is_ok(), "port rebound");
    pass!()
}

define_test_suite!(
    socket_flows,
    [
        test_datagram_round_trip,
        test_stream_accept_and_flush,
        test_close_retains_through_grace,
    ]
);
