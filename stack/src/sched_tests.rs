extern crate alloc;

use rill_lib::testing::TestResult;
use rill_lib::{assert_eq_test, assert_test, define_test_suite, fail, pass};

use crate::addr::Family;
use crate::socket::{Proto, SockEvent, SocketId, StreamState};
use crate::stack::{
    SOCKET_BOUND_TIMEOUT_MS, SOCKET_IDLE_TIMEOUT_MS, SocketStack,
};
use crate::testkit::{test_stack, v4, v4_any, wake_recorder};

fn bound_datagram(stack: &mut SocketStack, port: u16) -> Option<SocketId> {
    let id = stack.open(Family::V4, Proto::Datagram, None).ok()?;
    let mut port = port;
    stack.bind(id, v4_any(), &mut port).ok()?;
    Some(id)
}

fn bound_stream(stack: &mut SocketStack, port: u16) -> Option<SocketId> {
    let id = stack.open(Family::V4, Proto::Stream, None).ok()?;
    let mut port = port;
    stack.bind(id, v4_any(), &mut port).ok()?;
    Some(id)
}

fn queue_datagrams(stack: &mut SocketStack, id: SocketId, count: usize) -> bool {
    for _ in 0..count {
        if stack.send_to(id, b"payload", v4(10, 0, 0, 9), 7777).is_err() {
            return false;
        }
    }
    true
}

pub fn test_datagram_rotation_with_cursor() -> TestResult {
    let (mut stack, net, _eng) = test_stack();
    let (Some(a), Some(b), Some(c)) = (
        bound_datagram(&mut stack, 1000),
        bound_datagram(&mut stack, 2000),
        bound_datagram(&mut stack, 3000),
    ) else {
        return fail!("setup failed");
    };
    if !queue_datagrams(&mut stack, a, 2)
        || !queue_datagrams(&mut stack, b, 2)
        || !queue_datagrams(&mut stack, c, 2)
    {
        return fail!("queueing failed");
    }

    // Budget for four frames: ports 1000 and 2000 drain, 3000 must wait.
    let remaining = stack.run_output_cycle(5, 0);
    assert_eq_test!(remaining, 1, "budget spent down to the floor");
    assert_eq_test!(net.lock().pushed.len(), 4);
    assert_eq_test!(stack.socket(a).map(|s| s.q_out.len()), Some(0));
    assert_eq_test!(stack.socket(b).map(|s| s.q_out.len()), Some(0));
    assert_eq_test!(stack.socket(c).map(|s| s.q_out.len()), Some(2));
    assert_eq_test!(stack.datagram_cursor, Some(3000), "cursor parked on the loser");

    // The next cycle resumes at port 3000 instead of restarting at 1000.
    let remaining = stack.run_output_cycle(5, 1);
    assert_test!(remaining >= 3, "only two frames left to push");
    assert_eq_test!(stack.socket(c).map(|s| s.q_out.len()), Some(0));
    assert_eq_test!(net.lock().pushed.len(), 6);
    pass!()
}

pub fn test_datagram_full_rotation_stops() -> TestResult {
    let (mut stack, net, _eng) = test_stack();
    let (Some(a), Some(b)) = (
        bound_datagram(&mut stack, 1100),
        bound_datagram(&mut stack, 1200),
    ) else {
        return fail!("setup failed");
    };
    if !queue_datagrams(&mut stack, a, 1) || !queue_datagrams(&mut stack, b, 1) {
        return fail!("queueing failed");
    }

    let remaining = stack.run_output_cycle(100, 0);
    assert_eq_test!(remaining, 98, "one unit per frame");
    assert_eq_test!(net.lock().pushed.len(), 2);
    pass!()
}

pub fn test_budget_floor_does_nothing() -> TestResult {
    let (mut stack, net, _eng) = test_stack();
    let Some(a) = bound_datagram(&mut stack, 1300) else {
        return fail!("setup failed");
    };
    if !queue_datagrams(&mut stack, a, 1) {
        return fail!("queueing failed");
    }
    let remaining = stack.run_output_cycle(1, 0);
    assert_eq_test!(remaining, 1, "budget at the floor is untouched");
    assert_eq_test!(net.lock().pushed.len(), 0);
    pass!()
}

pub fn test_stream_phase_visits_in_rotation() -> TestResult {
    let (mut stack, _net, eng) = test_stack();
    eng.lock().output_cost = 1;
    let (Some(a), Some(b), Some(c)) = (
        bound_stream(&mut stack, 10),
        bound_stream(&mut stack, 20),
        bound_stream(&mut stack, 30),
    ) else {
        return fail!("setup failed");
    };

    let remaining = stack.run_output_cycle(10, 0);
    assert_eq_test!(remaining, 7, "one unit per socket");
    let visited: alloc::vec::Vec<SocketId> =
        eng.lock().outputs.iter().map(|(id, _)| *id).collect();
    assert_eq_test!(visited, alloc::vec![a, b, c], "port-index order");
    pass!()
}

pub fn test_stream_budget_exhaustion_keeps_cursor() -> TestResult {
    let (mut stack, _net, eng) = test_stack();
    eng.lock().output_cost = 1;
    let (Some(_a), Some(b), Some(_c)) = (
        bound_stream(&mut stack, 10),
        bound_stream(&mut stack, 20),
        bound_stream(&mut stack, 30),
    ) else {
        return fail!("setup failed");
    };

    let remaining = stack.run_output_cycle(2, 0);
    assert_eq_test!(remaining, 1);
    assert_eq_test!(
        stack.stream_cursor,
        Some(20),
        "cursor advanced past the serviced entry only"
    );

    // Next cycle continues with port 20 rather than restarting.
    let _ = stack.run_output_cycle(2, 1);
    assert_eq_test!(
        eng.lock().outputs.iter().map(|(id, _)| *id).nth(1),
        Some(b),
        "second serviced socket is the one the cursor pointed at"
    );
    pass!()
}

pub fn test_stream_phase_flushes_pending_wakeups() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let (cb, wakes) = wake_recorder();
    let Ok(id) = stack.open(Family::V4, Proto::Stream, Some(cb)) else {
        return fail!("open failed");
    };
    let mut port = 40;
    if stack.bind(id, v4_any(), &mut port).is_err() {
        return fail!("bind failed");
    }
    if let Some(sock) = stack.socket_mut(id) {
        sock.ev_pending = SockEvent::CONN;
    }

    let _ = stack.run_output_cycle(10, 0);
    assert_eq_test!(wakes.lock().last().copied(), Some((SockEvent::CONN, id)));
    assert_eq_test!(
        stack.socket(id).map(|s| s.ev_pending),
        Some(SockEvent::empty()),
        "pending events cleared after the flush"
    );
    pass!()
}

pub fn test_liveness_kills_stuck_connecting_socket() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = bound_stream(&mut stack, 50) else {
        return fail!("setup failed");
    };
    if let Some(sock) = stack.socket_mut(id) {
        sock.stream_state = StreamState::SynReceived;
        sock.timestamp_ms = 0;
    }

    let _ = stack.run_output_cycle(10, SOCKET_BOUND_TIMEOUT_MS);
    assert_test!(
        stack.registry().lookup(Proto::Stream, 50).is_none(),
        "stuck socket unregistered"
    );
    assert_eq_test!(stack.reclaim_pending(), 1, "queued for deferred release");
    assert_eq_test!(
        stack.stream_cursor,
        None,
        "rotation restarts after mid-iteration removal"
    );
    pass!()
}

pub fn test_liveness_kills_idle_socket() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let Some(id) = bound_stream(&mut stack, 60) else {
        return fail!("setup failed");
    };
    if let Some(sock) = stack.socket_mut(id) {
        sock.stream_state = StreamState::SynSent;
        sock.timestamp_ms = 0;
    }

    let _ = stack.run_output_cycle(10, SOCKET_IDLE_TIMEOUT_MS);
    assert_test!(
        stack.registry().lookup(Proto::Stream, 60).is_none(),
        "idle non-established socket force-closed"
    );
    pass!()
}

pub fn test_liveness_spares_established_and_listen() -> TestResult {
    let (mut stack, _net, _eng) = test_stack();
    let (Some(est), Some(lst)) = (bound_stream(&mut stack, 70), bound_stream(&mut stack, 71))
    else {
        return fail!("setup failed");
    };
    if let Some(sock) = stack.socket_mut(est) {
        sock.stream_state = StreamState::Established;
        sock.timestamp_ms = 0;
    }
    if let Some(sock) = stack.socket_mut(lst) {
        sock.stream_state = StreamState::Listen;
        sock.timestamp_ms = 0;
    }

    let _ = stack.run_output_cycle(10, SOCKET_IDLE_TIMEOUT_MS * 10);
    assert_test!(
        stack.registry().lookup(Proto::Stream, 70).is_some(),
        "established socket survives idleness"
    );
    assert_test!(
        stack.registry().lookup(Proto::Stream, 71).is_some(),
        "listening socket survives idleness"
    );
    pass!()
}

define_test_suite!(
    output_scheduler,
    [
        test_datagram_rotation_with_cursor,
        test_datagram_full_rotation_stops,
        test_budget_floor_does_nothing,
        test_stream_phase_visits_in_rotation,
        test_stream_budget_exhaustion_keeps_cursor,
        test_stream_phase_flushes_pending_wakeups,
        test_liveness_kills_stuck_connecting_socket,
        test_liveness_kills_idle_socket,
        test_liveness_spares_established_and_listen,
    ]
);
