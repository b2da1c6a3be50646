//! Inbound frame delivery.
//!
//! `process_inbound` is the entry point the network layer calls for every
//! transport frame addressed to this host: it gates on the transport header
//! and checksum, routes through [`deliver`](SocketStack::deliver), and turns
//! routing failures into unreachable notifications. `deliver` owns the
//! protocol-specific matching rules; `notify_transport_error` maps inbound
//! network-layer error reports onto the affected socket.

extern crate alloc;

use alloc::vec::Vec;

use rill_lib::{netlog_debug, netlog_trace};

use crate::error::NetError;
use crate::frame::Frame;
use crate::socket::{Proto, SockEvent, SocketId, SocketState, StreamState};
use crate::stack::{SocketStack, StateChange};

impl SocketStack {
    /// Accept one inbound transport frame from the network layer.
    ///
    /// The frame is always consumed. Undeliverable non-broadcast frames
    /// trigger an unreachable notification upstream and report
    /// [`NetError::NoSuchEntry`].
    pub fn process_inbound(&mut self, proto: Proto, frame: Frame) -> Result<(), NetError> {
        if frame.transport_offset().is_none() {
            drop(frame);
            return Err(self.record(NetError::Fault));
        }

        #[cfg(feature = "crc")]
        if !checksum_ok(proto, &frame) {
            netlog_debug!("demux: checksum validation failed, frame dropped");
            drop(frame);
            return Ok(());
        }

        let Some(dst_port) = frame.dst_port() else {
            drop(frame);
            return Err(self.record(NetError::Fault));
        };

        match self.deliver(proto, frame, dst_port) {
            Ok(()) => Ok(()),
            Err((frame, err)) => {
                if frame.is_broadcast_dst() {
                    drop(frame);
                    return Ok(());
                }
                netlog_debug!("demux: no socket for {:?} port {}", proto, dst_port);
                self.net.notify_unreachable(&frame);
                drop(frame);
                Err(self.record(err))
            }
        }
    }

    /// Match `frame` to the sockets of its (protocol, port) entry.
    ///
    /// On routing failure the frame is handed back so the caller can notify
    /// upstream before discarding.
    pub fn deliver(
        &mut self,
        proto: Proto,
        frame: Frame,
        local_port: u16,
    ) -> Result<(), (Frame, NetError)> {
        let Some(entry) = self.registry.lookup(proto, local_port) else {
            return Err((frame, NetError::NoSuchEntry));
        };
        let members: Vec<SocketId> = entry.members().collect();

        match proto {
            Proto::Stream => self.deliver_stream(frame, &members),
            Proto::Datagram => self.deliver_datagram(frame, &members),
        }
    }

    /// Connection-oriented match: the first exact four-tuple match wins and
    /// stops the scan. A listening socket (no remote port) whose local
    /// address is wildcard or matches the destination is kept as fallback —
    /// without stopping the scan, so a later listening match replaces an
    /// earlier one. The scan-order dependency is deliberate and preserved.
    fn deliver_stream(
        &mut self,
        frame: Frame,
        members: &[SocketId],
    ) -> Result<(), (Frame, NetError)> {
        let src = frame.src();
        let dst = frame.dst();
        let src_port = frame.src_port().unwrap_or(0);

        let mut found: Option<SocketId> = None;
        for id in members.iter().copied() {
            let Some(sock) = self.sockets.get(id) else {
                continue;
            };
            let local_ok = sock.local_addr.is_unspecified() || sock.local_addr == dst;
            if sock.remote_port == src_port && sock.remote_addr == src && local_ok {
                found = Some(id);
                break;
            }
            if sock.is_listening_endpoint() && local_ok {
                found = Some(id);
            }
        }

        let Some(found) = found else {
            return Err((frame, NetError::NoSuchEntry));
        };

        let outcome = {
            let Self {
                sockets,
                stream_engine,
                now_ms,
                ..
            } = self;
            let Some(sock) = sockets.get_mut(found) else {
                return Err((frame, NetError::NoSuchEntry));
            };
            sock.mark_activity(*now_ms);
            match stream_engine.input(sock, frame) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // The engine consumed (and dropped) the frame; delivery
                    // itself succeeded.
                    netlog_debug!("demux: stream input error {:?}", err);
                    return Ok(());
                }
            }
        };

        if let Some(stream_state) = outcome.stream_state
            && let Some(sock) = self.sockets.get_mut(found)
        {
            sock.stream_state = stream_state;
            if stream_state == StreamState::Established && sock.state == SocketState::Connecting {
                sock.state = SocketState::Connected;
            }
        }
        if let Some(spawn) = outcome.spawn {
            self.spawn_child(found, spawn);
        }
        if let Some(sock) = self.sockets.get_mut(found) {
            sock.ev_pending.insert(outcome.events);
            sock.fire_pending_wakeup();
        }
        Ok(())
    }

    /// Materialize an engine-requested child connection on `listener`,
    /// honoring its backlog limit.
    fn spawn_child(&mut self, listener: SocketId, spawn: crate::engine::ChildSpawn) {
        let within_backlog = self
            .sockets
            .get(listener)
            .is_some_and(|l| l.pending_connections < l.backlog);
        if !within_backlog {
            netlog_debug!("demux: backlog full on {:?}, connection dropped", listener);
            return;
        }
        let Ok(child) = self.clone_socket(listener) else {
            return;
        };
        if let Some(sock) = self.sockets.get_mut(child) {
            sock.remote_addr = spawn.remote_addr;
            sock.remote_port = spawn.remote_port;
            sock.stream_state = spawn.stream_state;
            sock.state = SocketState::Connected;
            sock.parent = Some(listener);
        }
        if self.alter_state(child, StateChange::Bind).is_err() {
            self.release_socket(child);
            return;
        }
        if let Some(l) = self.sockets.get_mut(listener) {
            l.pending_connections += 1;
        }
        netlog_trace!("demux: spawned child {:?} of {:?}", child, listener);
    }

    /// Connectionless fan-out: every matching member receives a private copy;
    /// the original is discarded exactly once after the loop. A full input
    /// queue drops that one copy without notification; success is reported
    /// whenever the entry had at least one member.
    fn deliver_datagram(
        &mut self,
        frame: Frame,
        members: &[SocketId],
    ) -> Result<(), (Frame, NetError)> {
        if members.is_empty() {
            return Err((frame, NetError::NoSuchEntry));
        }

        let src = frame.src();
        let dst = frame.dst();
        let fanout = frame.is_broadcast_dst() || dst.is_multicast();

        for id in members.iter().copied() {
            let deliver_here = {
                let Some(sock) = self.sockets.get(id) else {
                    continue;
                };
                if fanout {
                    if dst.is_multicast() && !sock.mcast_filter(&dst, &src) {
                        false
                    } else {
                        sock.local_addr.is_unspecified()
                            || self.net.device_for_address(&sock.local_addr) == frame.dev()
                    }
                } else {
                    sock.local_addr.is_unspecified() || sock.local_addr == dst
                }
            };
            if !deliver_here {
                continue;
            }

            let copy = frame.duplicate();
            if let Some(sock) = self.sockets.get_mut(id) {
                match sock.q_in.push(copy) {
                    Ok(()) => {
                        sock.mark_activity(self.now_ms);
                        sock.notify(SockEvent::RD);
                    }
                    Err(copy) => {
                        netlog_trace!("demux: input queue full on {:?}, copy dropped", id);
                        drop(copy);
                    }
                }
            }
        }

        drop(frame);
        Ok(())
    }

    /// Map an inbound network-layer error report (e.g. an ICMP unreachable
    /// carrying the offending frame's transport header) onto the matching
    /// socket: record the error, mark the remote side shut, and wake the
    /// application with an error event.
    pub fn notify_transport_error(
        &mut self,
        frame: Frame,
        proto: Proto,
        icmp_code: u8,
    ) -> Result<(), NetError> {
        use rill_abi::net::{
            ICMP_UNREACH_HOST, ICMP_UNREACH_NET, ICMP_UNREACH_NET_PROHIB,
            ICMP_UNREACH_NET_UNKNOWN, ICMP_UNREACH_PORT, ICMP_UNREACH_PROTOCOL,
        };

        // The embedded frame is one we sent: its source port is our local
        // port, its destination the remote endpoint that bounced.
        let Some(local_port) = frame.src_port() else {
            drop(frame);
            return Err(self.record(NetError::Fault));
        };
        let remote_port = frame.dst_port().unwrap_or(0);

        let Some(entry) = self.registry.lookup(proto, local_port) else {
            drop(frame);
            return Err(self.record(NetError::NoSuchEntry));
        };
        let members: Vec<SocketId> = entry.members().collect();

        let err = match icmp_code {
            ICMP_UNREACH_NET | ICMP_UNREACH_NET_UNKNOWN | ICMP_UNREACH_NET_PROHIB => {
                NetError::NetUnreachable
            }
            ICMP_UNREACH_HOST => NetError::HostUnreachable,
            ICMP_UNREACH_PROTOCOL => NetError::ProtocolNotSupported,
            ICMP_UNREACH_PORT => NetError::ConnectionRefused,
            _ => NetError::OperationNotSupported,
        };

        for id in members {
            let matches = self
                .sockets
                .get(id)
                .is_some_and(|s| s.remote_port == remote_port);
            if !matches {
                continue;
            }
            self.last_error = Some(err);
            if let Some(sock) = self.sockets.get_mut(id) {
                sock.shutdown.insert(crate::socket::ShutdownFlags::REMOTE);
                sock.notify(SockEvent::ERR);
            }
            break;
        }

        drop(frame);
        Ok(())
    }
}

/// Transport checksum gate. Datagram frames with a zero stored checksum skip
/// validation, per RFC 768.
#[cfg(feature = "crc")]
fn checksum_ok(proto: Proto, frame: &Frame) -> bool {
    match proto {
        Proto::Stream => crate::frame::verify_stream_checksum(frame),
        Proto::Datagram => crate::frame::verify_datagram_checksum(frame),
    }
}
