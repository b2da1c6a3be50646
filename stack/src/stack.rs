//! The socket stack context.
//!
//! `SocketStack` packages the socket table, the port registry, the rotation
//! cursors, the last-error slot and the deferred-reclamation list into one
//! explicitly passed object — there is no hidden global state. The embedder
//! constructs it with its network layer and the two transport engines, then
//! drives it from a single cooperative execution context.
//!
//! # Concurrency
//!
//! Every operation runs to completion without preemption; calls never block,
//! they return [`NetError::WouldBlock`] and rely on wake notifications. For
//! drivers invoking the stack from more than one context, wrap it in
//! [`SharedStack`](crate::shared::SharedStack).

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;

use rill_lib::netlog_debug;

use crate::addr::{Family, IpAddr, SockAddr};
use crate::engine::{
    NetworkLayer, SocketOption, SocketOptionName, TransportEngine, socket_mtu,
};
use crate::error::NetError;
use crate::frame::{FragInfo, RemoteEndpoint};
use crate::socket::{
    Proto, ShutdownFlags, Socket, SocketId, SocketState, SocketTable, StreamState, WakeFn,
};
use crate::registry::PortRegistry;

/// Grace delay between unregistration and memory release (ms). Long enough
/// for any in-flight scheduler rotation to drain its reference.
pub const SOCKET_GC_DELAY_MS: u64 = 3000;

/// A stream socket stuck in the connecting sub-state longer than this is
/// considered dead (ms).
pub const SOCKET_BOUND_TIMEOUT_MS: u64 = 30_000;

/// A stream socket outside Listen/Established idle longer than this is
/// force-closed (ms).
pub const SOCKET_IDLE_TIMEOUT_MS: u64 = 90_000;

/// Bottom of the ephemeral port range.
pub const EPHEMERAL_PORT_BASE: u16 = 1024;

/// Shutdown direction selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownMode {
    Read,
    Write,
    Both,
}

impl ShutdownMode {
    /// Parse from the ABI `SHUT_*` constants.
    pub const fn from_raw(raw: u8) -> Result<Self, NetError> {
        match raw {
            rill_abi::net::SHUT_RD => Ok(Self::Read),
            rill_abi::net::SHUT_WR => Ok(Self::Write),
            rill_abi::net::SHUT_RDWR => Ok(Self::Both),
            _ => Err(NetError::InvalidArgument),
        }
    }
}

/// The one state-transition funnel. Bound is only ever set by `Bind` and only
/// ever cleared by `Unbind`, which keeps registry membership and lifecycle
/// state consistent by construction.
#[derive(Debug)]
pub(crate) enum StateChange {
    /// Register with the port registry and mark bound.
    Bind,
    /// Unregister, mark closed, and queue deferred reclamation.
    Unbind,
    /// Apply state/flag updates to a registered socket.
    Set {
        state: Option<SocketState>,
        shutdown_add: ShutdownFlags,
        stream: Option<StreamState>,
    },
}

pub(crate) struct PendingReclaim {
    pub id: SocketId,
    pub deadline_ms: u64,
}

// =============================================================================
// SocketStack
// =============================================================================

pub struct SocketStack {
    pub(crate) sockets: SocketTable,
    pub(crate) registry: PortRegistry,
    pub(crate) net: Box<dyn NetworkLayer + Send>,
    pub(crate) stream_engine: Box<dyn TransportEngine + Send>,
    pub(crate) datagram_engine: Box<dyn TransportEngine + Send>,
    /// Rotation cursors: the port the next output cycle resumes from.
    pub(crate) datagram_cursor: Option<u16>,
    pub(crate) stream_cursor: Option<u16>,
    pub(crate) reclaim: Vec<PendingReclaim>,
    pub(crate) last_error: Option<NetError>,
    pub(crate) now_ms: u64,
    rng: u32,
}

impl SocketStack {
    pub fn new(
        net: Box<dyn NetworkLayer + Send>,
        stream_engine: Box<dyn TransportEngine + Send>,
        datagram_engine: Box<dyn TransportEngine + Send>,
    ) -> Self {
        Self::with_seed(net, stream_engine, datagram_engine, 0x2545_F491)
    }

    /// Construct with a fixed ephemeral-port PRNG seed (deterministic tests).
    pub fn with_seed(
        net: Box<dyn NetworkLayer + Send>,
        stream_engine: Box<dyn TransportEngine + Send>,
        datagram_engine: Box<dyn TransportEngine + Send>,
        seed: u32,
    ) -> Self {
        Self {
            sockets: SocketTable::new(),
            registry: PortRegistry::new(),
            net,
            stream_engine,
            datagram_engine,
            datagram_cursor: None,
            stream_cursor: None,
            reclaim: Vec::new(),
            last_error: None,
            now_ms: 0,
            rng: if seed == 0 { 0x2545_F491 } else { seed },
        }
    }

    // -- Error mirror ---------------------------------------------------------

    pub(crate) fn record(&mut self, err: NetError) -> NetError {
        self.last_error = Some(err);
        err
    }

    /// The last error any operation on this context reported.
    pub fn last_error(&self) -> Option<NetError> {
        self.last_error
    }

    pub fn clear_last_error(&mut self) {
        self.last_error = None;
    }

    // -- Clock ----------------------------------------------------------------

    /// Advance the context clock. The clock never moves backwards.
    pub fn set_clock(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    // -- Accessors ------------------------------------------------------------

    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(id)
    }

    pub fn socket_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.sockets.get_mut(id)
    }

    pub fn registry(&self) -> &PortRegistry {
        &self.registry
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.count_active()
    }

    /// Sockets awaiting their deferred release.
    pub fn reclaim_pending(&self) -> usize {
        self.reclaim.len()
    }

    pub(crate) fn engine_mut(&mut self, proto: Proto) -> &mut dyn TransportEngine {
        match proto {
            Proto::Stream => self.stream_engine.as_mut(),
            Proto::Datagram => self.datagram_engine.as_mut(),
        }
    }

    fn next_rand(&mut self) -> u32 {
        // xorshift32; seeded at construction.
        let mut x = self.rng;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.rng = x;
        x
    }

    // =========================================================================
    // Lifecycle operations
    // =========================================================================

    /// Create an endpoint for `family`/`proto` with an optional wake callback.
    pub fn open(
        &mut self,
        family: Family,
        proto: Proto,
        wakeup: Option<WakeFn>,
    ) -> Result<SocketId, NetError> {
        let mut sock = Socket::new(proto, family);
        sock.set_wakeup(wakeup);
        sock.mark_activity(self.now_ms);
        self.engine_mut(proto).init_socket(&mut sock);
        match self.sockets.insert(sock) {
            Some(id) => Ok(id),
            None => Err(self.record(NetError::OutOfMemory)),
        }
    }

    /// Duplicate `template`'s identity into a fresh, unregistered socket with
    /// empty queues and no wake callback. Stream engines use this to
    /// materialize accepted connections.
    pub fn clone_socket(&mut self, template: SocketId) -> Result<SocketId, NetError> {
        let Some(t) = self.sockets.get(template) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let (proto, family) = (t.proto, t.family);
        let (la, lp, ra, rp) = (t.local_addr, t.local_port, t.remote_addr, t.remote_port);
        let (state, stream_state, shutdown) = (t.state, t.stream_state, t.shutdown);

        let mut sock = Socket::new(proto, family);
        self.engine_mut(proto).init_socket(&mut sock);
        sock.local_addr = la;
        sock.local_port = lp;
        sock.remote_addr = ra;
        sock.remote_port = rp;
        sock.state = state;
        sock.stream_state = stream_state;
        sock.shutdown = shutdown;
        sock.mark_activity(self.now_ms);
        match self.sockets.insert(sock) {
            Some(id) => Ok(id),
            None => Err(self.record(NetError::OutOfMemory)),
        }
    }

    /// The state-transition funnel. See [`StateChange`].
    pub(crate) fn alter_state(&mut self, id: SocketId, change: StateChange) -> Result<(), NetError> {
        match change {
            StateChange::Bind => {
                let Self {
                    sockets, registry, ..
                } = self;
                let sock = sockets.get_mut(id).ok_or(NetError::InvalidArgument)?;
                registry.register(sock)?;
                if sock.state == SocketState::Unbound {
                    sock.state = SocketState::Bound;
                }
                Ok(())
            }
            StateChange::Unbind => {
                let parent = {
                    let Self {
                        sockets, registry, ..
                    } = self;
                    let sock = sockets.get_mut(id).ok_or(NetError::InvalidArgument)?;
                    registry.unregister(sock)?;
                    sock.state = SocketState::Closed;
                    sock.mcast.clear();
                    sock.parent.take()
                };
                if let Some(pid) = parent
                    && let Some(listener) = self.sockets.get_mut(pid)
                {
                    listener.pending_connections = listener.pending_connections.saturating_sub(1);
                }
                self.schedule_reclaim(id);
                Ok(())
            }
            StateChange::Set {
                state,
                shutdown_add,
                stream,
            } => {
                let Self {
                    sockets, registry, ..
                } = self;
                let sock = sockets.get_mut(id).ok_or(NetError::InvalidArgument)?;
                if !registry.contains(sock) {
                    return Err(NetError::NoSuchEntry);
                }
                if let Some(state) = state {
                    sock.state = state;
                }
                sock.shutdown.insert(shutdown_add);
                if let Some(stream) = stream {
                    sock.stream_state = stream;
                }
                Ok(())
            }
        }
    }

    /// Bind to `addr` and `*port`. A zero port draws from the ephemeral range
    /// and reports the chosen port back through `port`.
    pub fn bind(&mut self, id: SocketId, addr: IpAddr, port: &mut u16) -> Result<(), NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let proto = sock.proto;
        if sock.is_bound() {
            return Err(self.record(NetError::InvalidArgument));
        }
        if addr.family() != sock.family {
            return Err(self.record(NetError::AddressNotAvailable));
        }
        if !addr.is_unspecified() && self.net.device_for_address(&addr).is_none() {
            return Err(self.record(NetError::InvalidArgument));
        }

        if *port == 0 {
            let drawn = self.high_port(proto);
            if drawn == 0 {
                return Err(self.record(NetError::InvalidArgument));
            }
            *port = drawn;
        } else if !self
            .registry
            .port_is_free(proto, *port, Some(&addr), &self.sockets)
        {
            return Err(self.record(NetError::AddressInUse));
        }

        if let Some(sock) = self.sockets.get_mut(id) {
            sock.local_addr = addr;
            sock.local_port = *port;
        }
        match self.alter_state(id, StateChange::Bind) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.record(e)),
        }
    }

    /// Fix the remote endpoint; stream sockets additionally start the
    /// connection handshake.
    pub fn connect(
        &mut self,
        id: SocketId,
        remote_addr: IpAddr,
        remote_port: u16,
    ) -> Result<(), NetError> {
        if remote_port == 0 || remote_addr.is_unspecified() {
            return Err(self.record(NetError::InvalidArgument));
        }
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let proto = sock.proto;
        if remote_addr.family() != sock.family {
            return Err(self.record(NetError::InvalidArgument));
        }

        let Some(src) = self.net.source_address_for(&remote_addr) else {
            return Err(self.record(NetError::HostUnreachable));
        };

        let needs_port = {
            let Some(sock) = self.sockets.get_mut(id) else {
                return Err(self.record(NetError::InvalidArgument));
            };
            sock.remote_addr = remote_addr;
            sock.remote_port = remote_port;
            sock.local_addr = src;
            sock.local_port == 0
        };
        if needs_port {
            let drawn = self.high_port(proto);
            if drawn == 0 {
                return Err(self.record(NetError::InvalidArgument));
            }
            if let Some(sock) = self.sockets.get_mut(id) {
                sock.local_port = drawn;
            }
        }

        let bound = self.sockets.get(id).is_some_and(Socket::is_bound);
        if !bound && let Err(e) = self.alter_state(id, StateChange::Bind) {
            return Err(self.record(e));
        }

        match proto {
            Proto::Datagram => {
                let change = StateChange::Set {
                    state: Some(SocketState::Connected),
                    shutdown_add: ShutdownFlags::empty(),
                    stream: None,
                };
                match self.alter_state(id, change) {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.record(e)),
                }
            }
            Proto::Stream => {
                let initiated = {
                    let Self {
                        sockets,
                        stream_engine,
                        ..
                    } = self;
                    let Some(sock) = sockets.get_mut(id) else {
                        return Err(NetError::InvalidArgument);
                    };
                    stream_engine.initiate_connection(sock)
                };
                match initiated {
                    Ok(()) => {
                        let change = StateChange::Set {
                            state: Some(SocketState::Connecting),
                            shutdown_add: ShutdownFlags::empty(),
                            stream: Some(StreamState::SynSent),
                        };
                        match self.alter_state(id, change) {
                            Ok(()) => Ok(()),
                            Err(e) => Err(self.record(e)),
                        }
                    }
                    Err(_) => Err(self.record(NetError::HostUnreachable)),
                }
            }
        }
    }

    /// Put a bound stream socket into the listening state.
    pub fn listen(&mut self, id: SocketId, backlog: u16) -> Result<(), NetError> {
        if backlog == 0 {
            return Err(self.record(NetError::InvalidArgument));
        }
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if sock.proto != Proto::Stream {
            return Err(self.record(NetError::InvalidArgument));
        }
        if !sock.is_bound() || !self.registry.contains(sock) {
            return Err(self.record(NetError::InvalidArgument));
        }

        let change = StateChange::Set {
            state: Some(SocketState::Listening),
            shutdown_add: ShutdownFlags::empty(),
            stream: Some(StreamState::Listen),
        };
        match self.alter_state(id, change) {
            Ok(()) => {
                if let Some(sock) = self.sockets.get_mut(id) {
                    sock.backlog = backlog;
                }
                Ok(())
            }
            Err(e) => Err(self.record(e)),
        }
    }

    /// Take one established child connection off a listening socket.
    pub fn accept(&mut self, id: SocketId) -> Result<(SocketId, IpAddr, u16), NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if sock.proto != Proto::Stream || !sock.is_bound() {
            return Err(self.record(NetError::InvalidArgument));
        }
        if sock.stream_state != StreamState::Listen {
            return Err(self.record(NetError::InvalidArgument));
        }
        let local_port = sock.local_port;

        let Some(entry) = self.registry.lookup(Proto::Stream, local_port) else {
            return Err(self.record(NetError::WouldBlock));
        };
        let members: Vec<SocketId> = entry.members().collect();
        for child_id in members {
            let accepted = self.sockets.get(child_id).is_some_and(|child| {
                child.parent == Some(id) && child.stream_state == StreamState::Established
            });
            if !accepted {
                continue;
            }
            let Some(child) = self.sockets.get_mut(child_id) else {
                continue;
            };
            child.parent = None;
            let (ra, rp) = (child.remote_addr, child.remote_port);
            if let Some(listener) = self.sockets.get_mut(id) {
                listener.pending_connections = listener.pending_connections.saturating_sub(1);
            }
            return Ok((child_id, ra, rp));
        }
        Err(self.record(NetError::WouldBlock))
    }

    // =========================================================================
    // Data transfer
    // =========================================================================

    /// Byte-stream style read: source endpoint is discarded.
    pub fn read(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if !self.registry.contains(sock) {
            return Err(self.record(NetError::InvalidArgument));
        }
        if !sock.is_bound() {
            return Err(self.record(NetError::Io));
        }
        self.recv_inner(id, buf).map(|(n, _)| n)
    }

    /// Byte-stream style write to the connected remote endpoint.
    pub fn write(&mut self, id: SocketId, buf: &[u8]) -> Result<usize, NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if !self.registry.contains(sock) {
            return Err(self.record(NetError::InvalidArgument));
        }
        if !sock.is_bound() {
            return Err(self.record(NetError::Io));
        }
        if sock.state != SocketState::Connected {
            return Err(self.record(NetError::NotConnected));
        }
        if sock.shutdown.contains(ShutdownFlags::LOCAL) {
            return Err(self.record(NetError::AlreadyShuttingDown));
        }
        let (ra, rp) = (sock.remote_addr, sock.remote_port);
        self.send_to(id, buf, ra, rp)
    }

    /// Send to the connected remote endpoint.
    pub fn send(&mut self, id: SocketId, buf: &[u8]) -> Result<usize, NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if !self.registry.contains(sock) {
            return Err(self.record(NetError::InvalidArgument));
        }
        if sock.state != SocketState::Connected {
            return Err(self.record(NetError::NotConnected));
        }
        let (ra, rp) = (sock.remote_addr, sock.remote_port);
        self.send_to(id, buf, ra, rp)
    }

    pub fn recv(&mut self, id: SocketId, buf: &mut [u8]) -> Result<usize, NetError> {
        self.recv_from(id, buf).map(|(n, _)| n)
    }

    /// Receive, reporting the source endpoint for connectionless sockets.
    pub fn recv_from(
        &mut self,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SockAddr>), NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if !self.registry.contains(sock) {
            return Err(self.record(NetError::InvalidArgument));
        }
        if !sock.is_bound() {
            return Err(self.record(NetError::AddressNotAvailable));
        }
        self.recv_inner(id, buf)
    }

    fn recv_inner(
        &mut self,
        id: SocketId,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SockAddr>), NetError> {
        let (proto, shut_remote) = {
            let Some(sock) = self.sockets.get(id) else {
                return Err(self.record(NetError::InvalidArgument));
            };
            (sock.proto, sock.shutdown.contains(ShutdownFlags::REMOTE))
        };
        let received = {
            let Self {
                sockets,
                stream_engine,
                datagram_engine,
                ..
            } = self;
            let Some(sock) = sockets.get_mut(id) else {
                return Err(NetError::InvalidArgument);
            };
            let engine = match proto {
                Proto::Stream => stream_engine.as_mut(),
                Proto::Datagram => datagram_engine.as_mut(),
            };
            if proto == Proto::Stream && shut_remote && engine.queue_in_is_empty(sock) {
                Err(NetError::AlreadyShuttingDown)
            } else {
                engine.recv(sock, buf)
            }
        };
        match received {
            Ok(out) => {
                if let Some(sock) = self.sockets.get_mut(id) {
                    sock.mark_activity(self.now_ms);
                }
                Ok(out)
            }
            Err(e) => Err(self.record(e)),
        }
    }

    /// Segment `buf` into MTU-sized frames and hand each to the transport
    /// engine. Partial writes stand: on an engine refusal the byte count so
    /// far is returned and the caller retries the remainder.
    pub fn send_to(
        &mut self,
        id: SocketId,
        buf: &[u8],
        dst: IpAddr,
        dst_port: u16,
    ) -> Result<usize, NetError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let (proto, family, connected, remote_addr, remote_port, bound) = {
            let Some(sock) = self.sockets.get(id) else {
                return Err(self.record(NetError::InvalidArgument));
            };
            (
                sock.proto,
                sock.family,
                sock.state == SocketState::Connected,
                sock.remote_addr,
                sock.remote_port,
                sock.is_bound(),
            )
        };
        if dst.is_unspecified() || dst_port == 0 {
            return Err(self.record(NetError::AddressNotAvailable));
        }
        if dst.family() != family {
            return Err(self.record(NetError::AddressNotAvailable));
        }
        if connected && dst_port != remote_port {
            return Err(self.record(NetError::InvalidArgument));
        }

        let mut pending_remote = None;
        if connected {
            if remote_addr != dst {
                return Err(self.record(NetError::AddressNotAvailable));
            }
        } else {
            let Some(src) = self.net.source_address_for(&dst) else {
                return Err(self.record(NetError::HostUnreachable));
            };
            if !src.is_unspecified()
                && let Some(sock) = self.sockets.get_mut(id)
            {
                sock.local_addr = src;
            }
            // The socket's remote endpoint may change on a consecutive call;
            // snapshot the destination per-frame.
            if proto == Proto::Datagram {
                pending_remote = Some(RemoteEndpoint {
                    addr: dst,
                    port: dst_port,
                });
            }
        }

        if !bound {
            let drawn = self.high_port(proto);
            if drawn == 0 {
                return Err(self.record(NetError::InvalidArgument));
            }
            if let Some(sock) = self.sockets.get_mut(id) {
                sock.local_port = drawn;
            }
        }
        if !connected && let Some(sock) = self.sockets.get_mut(id) {
            sock.remote_port = dst_port;
        }

        let Some(header_offset) = self.engine_overhead(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let local_addr = self
            .sockets
            .get(id)
            .map(|s| s.local_addr)
            .unwrap_or(IpAddr::any(family));
        let mtu = socket_mtu(family);
        let fragmented = proto == Proto::Datagram && buf.len() + header_offset > mtu;

        let mut total = 0usize;
        while total < buf.len() {
            let mut transport_len = (buf.len() - total + header_offset).min(mtu);
            let first = total == 0;
            if !first {
                // Continuation frames carry no fresh transport header.
                transport_len -= header_offset;
            }

            let Some(mut frame) = self.net.alloc_frame(family, transport_len as u16) else {
                return Err(self.record(NetError::OutOfMemory));
            };
            frame.set_owner(id);
            frame.set_addrs(local_addr, dst);
            frame.advance_payload(header_offset);
            if let Some(remote) = pending_remote {
                frame.set_remote(remote);
            }
            if fragmented {
                if first {
                    frame.set_transport_total((buf.len() + header_offset) as u16);
                    frame.set_frag(FragInfo::Fragment {
                        offset: 0,
                        more: true,
                    });
                } else {
                    frame.restore_payload_to_transport();
                    let offset = ((total + header_offset) / 8) as u16;
                    let more = total + frame.payload_len() < buf.len();
                    frame.set_frag(FragInfo::Fragment { offset, more });
                }
            }

            let n = frame.payload_len();
            if n == 0 {
                // Nothing left once the header is accounted for.
                drop(frame);
                return Ok(total);
            }
            frame.payload_mut().copy_from_slice(&buf[total..total + n]);

            let pushed = {
                let Self {
                    sockets,
                    stream_engine,
                    datagram_engine,
                    now_ms,
                    ..
                } = self;
                let Some(sock) = sockets.get_mut(id) else {
                    return Err(NetError::InvalidArgument);
                };
                sock.mark_activity(*now_ms);
                let engine = match proto {
                    Proto::Stream => stream_engine.as_mut(),
                    Proto::Datagram => datagram_engine.as_mut(),
                };
                engine.push(sock, frame)
            };
            match pushed {
                Ok(()) => total += n,
                Err(_) => {
                    self.last_error = Some(NetError::WouldBlock);
                    break;
                }
            }
        }
        Ok(total)
    }

    fn engine_overhead(&self, id: SocketId) -> Option<usize> {
        let sock = self.sockets.get(id)?;
        Some(match sock.proto {
            Proto::Stream => self.stream_engine.overhead(sock),
            Proto::Datagram => self.datagram_engine.overhead(sock),
        })
    }

    /// Draw a free port from the ephemeral range. Returns 0 when no candidate
    /// can be found.
    pub fn high_port(&mut self, proto: Proto) -> u16 {
        let span = (u16::MAX - EPHEMERAL_PORT_BASE) as u32;
        for _ in 0..u32::from(u16::MAX) {
            let candidate = EPHEMERAL_PORT_BASE + (self.next_rand() % span) as u16;
            if self
                .registry
                .port_is_free(proto, candidate, None, &self.sockets)
            {
                return candidate;
            }
        }
        0
    }

    // =========================================================================
    // Options
    // =========================================================================

    pub fn set_option(&mut self, id: SocketId, opt: &SocketOption) -> Result<(), NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let proto = sock.proto;
        match opt {
            SocketOption::AddMembership(m) => {
                if proto != Proto::Datagram {
                    return Err(self.record(NetError::OperationNotSupported));
                }
                if !m.group.is_multicast() {
                    return Err(self.record(NetError::InvalidArgument));
                }
                if let Some(sock) = self.sockets.get_mut(id) {
                    if let Some(existing) =
                        sock.mcast.iter_mut().find(|e| e.group == m.group)
                    {
                        existing.source = m.source;
                    } else {
                        sock.mcast.push(*m);
                    }
                }
                Ok(())
            }
            SocketOption::DropMembership(group) => {
                if proto != Proto::Datagram {
                    return Err(self.record(NetError::OperationNotSupported));
                }
                let Some(sock) = self.sockets.get_mut(id) else {
                    return Err(self.record(NetError::InvalidArgument));
                };
                let before = sock.mcast.len();
                sock.mcast.retain(|m| m.group != *group);
                if sock.mcast.len() == before {
                    return Err(self.record(NetError::AddressNotAvailable));
                }
                Ok(())
            }
            SocketOption::RecvQueueLimit(limit) => {
                if let Some(sock) = self.sockets.get_mut(id) {
                    sock.q_in.set_max_bytes(*limit);
                }
                Ok(())
            }
            other => {
                let forwarded = {
                    let Self {
                        sockets,
                        stream_engine,
                        datagram_engine,
                        ..
                    } = self;
                    let Some(sock) = sockets.get_mut(id) else {
                        return Err(NetError::InvalidArgument);
                    };
                    let engine = match proto {
                        Proto::Stream => stream_engine.as_mut(),
                        Proto::Datagram => datagram_engine.as_mut(),
                    };
                    engine.set_option(sock, other)
                };
                match forwarded {
                    Ok(()) => Ok(()),
                    Err(e) => Err(self.record(e)),
                }
            }
        }
    }

    pub fn get_option(
        &mut self,
        id: SocketId,
        name: SocketOptionName,
    ) -> Result<SocketOption, NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        if name == SocketOptionName::RecvQueueLimit {
            return Ok(SocketOption::RecvQueueLimit(sock.q_in.max_bytes()));
        }
        let fetched = match sock.proto {
            Proto::Stream => self.stream_engine.get_option(sock, name),
            Proto::Datagram => self.datagram_engine.get_option(sock, name),
        };
        match fetched {
            Ok(opt) => Ok(opt),
            Err(e) => Err(self.record(e)),
        }
    }

    // =========================================================================
    // Shutdown, close and deferred reclamation
    // =========================================================================

    pub fn shutdown(&mut self, id: SocketId, mode: ShutdownMode) -> Result<(), NetError> {
        let Some(sock) = self.sockets.get(id) else {
            return Err(self.record(NetError::InvalidArgument));
        };
        let proto = sock.proto;
        if !self.registry.contains(sock) {
            // Close after a failed bind/connect: nothing to unregister, the
            // memory can go now.
            self.release_socket(id);
            return Ok(());
        }

        let result = match (proto, mode) {
            (Proto::Datagram, ShutdownMode::Read) => self.alter_state(
                id,
                StateChange::Set {
                    state: None,
                    shutdown_add: ShutdownFlags::REMOTE,
                    stream: None,
                },
            ),
            (Proto::Datagram, ShutdownMode::Write) => self.alter_state(
                id,
                StateChange::Set {
                    state: None,
                    shutdown_add: ShutdownFlags::LOCAL,
                    stream: None,
                },
            ),
            (Proto::Datagram, ShutdownMode::Both) => self.alter_state(id, StateChange::Unbind),
            (Proto::Stream, ShutdownMode::Read) => self.alter_state(
                id,
                StateChange::Set {
                    state: None,
                    shutdown_add: ShutdownFlags::REMOTE,
                    stream: None,
                },
            ),
            (Proto::Stream, ShutdownMode::Write) => self.alter_state(
                id,
                StateChange::Set {
                    state: None,
                    shutdown_add: ShutdownFlags::LOCAL,
                    stream: None,
                },
            ),
            (Proto::Stream, ShutdownMode::Both) => {
                let staged = self.alter_state(
                    id,
                    StateChange::Set {
                        state: Some(SocketState::ShuttingDown),
                        shutdown_add: ShutdownFlags::LOCAL | ShutdownFlags::REMOTE,
                        stream: None,
                    },
                );
                match staged {
                    Ok(()) => {
                        {
                            let Self {
                                sockets,
                                stream_engine,
                                ..
                            } = self;
                            if let Some(sock) = sockets.get_mut(id) {
                                stream_engine.notify_peer_closing(sock);
                            }
                        }
                        self.alter_state(id, StateChange::Unbind)
                    }
                    Err(e) => Err(e),
                }
            }
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.record(e)),
        }
    }

    /// Close both directions and queue the deferred release.
    pub fn close(&mut self, id: SocketId) -> Result<(), NetError> {
        self.shutdown(id, ShutdownMode::Both)
    }

    pub(crate) fn schedule_reclaim(&mut self, id: SocketId) {
        if self.reclaim.iter().any(|r| r.id == id) {
            return;
        }
        let deadline_ms = self.now_ms + SOCKET_GC_DELAY_MS;
        netlog_debug!("socket {:?}: release scheduled at {}ms", id, deadline_ms);
        self.reclaim.push(PendingReclaim { id, deadline_ms });
    }

    /// Release every closed socket whose grace delay has elapsed. Driven by
    /// the external timer collaborator.
    pub fn poll_reclaim(&mut self, now_ms: u64) {
        self.set_clock(now_ms);
        let mut i = 0;
        while i < self.reclaim.len() {
            if self.reclaim[i].deadline_ms <= now_ms {
                let id = self.reclaim.swap_remove(i).id;
                self.release_socket(id);
            } else {
                i += 1;
            }
        }
    }

    /// Drain both queues, let the engine drop its retained segments, and free
    /// the slot.
    pub(crate) fn release_socket(&mut self, id: SocketId) {
        let Some(mut sock) = self.sockets.release(id) else {
            return;
        };
        sock.q_in.clear();
        sock.q_out.clear();
        self.engine_mut(sock.proto).cleanup(&mut sock);
        netlog_debug!("socket {:?}: released", id);
    }
}
