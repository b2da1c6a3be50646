//! Socket entity, state machinery and the socket table.
//!
//! The lifecycle state is split three ways instead of the classic packed
//! bitfield: an outer [`SocketState`] enum for the coarse lifecycle, a small
//! [`ShutdownFlags`] set for the two independent shutdown directions, and a
//! [`StreamState`] sub-state that only stream sockets advance through. All
//! three are only ever mutated through the stack's single state-transition
//! funnel, which keeps registry membership and the lifecycle state in step.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::addr::{Family, IpAddr};
use crate::queue::FrameQueue;
use crate::registry::SocketKey;

/// Maximum number of live sockets per stack context.
pub const MAX_SOCKETS: usize = 64;

/// Default queue budget per direction, in bytes.
pub const DEFAULT_SOCKETQ: usize = 16 * 1024;

// =============================================================================
// Identifiers and protocol tag
// =============================================================================

/// Socket handle — an index into the owning stack's socket table.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SocketId(pub u32);

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({})", self.0)
    }
}

/// Transport protocol tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Proto {
    Datagram,
    Stream,
}

impl Proto {
    /// IP protocol number for the wire.
    pub const fn ip_proto(self) -> u8 {
        match self {
            Self::Datagram => rill_abi::net::IPPROTO_UDP,
            Self::Stream => rill_abi::net::IPPROTO_TCP,
        }
    }
}

// =============================================================================
// Lifecycle state
// =============================================================================

/// Coarse socket lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketState {
    Unbound,
    Bound,
    Listening,
    Connecting,
    Connected,
    ShuttingDown,
    Closed,
}

bitflags! {
    /// Independently shut-down directions.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ShutdownFlags: u8 {
        /// Local write side closed.
        const LOCAL = 1 << 0;
        /// Remote read side closed.
        const REMOTE = 1 << 1;
    }
}

/// Stream-transport sub-state (handshake and teardown machine). Datagram
/// sockets stay at `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    TimeWait,
    LastAck,
}

bitflags! {
    /// Readiness/error events delivered through the wake callback.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct SockEvent: u16 {
        /// Input available.
        const RD = 0x01;
        /// Output possible.
        const WR = 0x02;
        /// Connection established or pending accept.
        const CONN = 0x04;
        /// Orderly close observed.
        const CLOSE = 0x08;
        /// Final close of the stream.
        const FIN = 0x10;
        /// Error condition; the context's last error holds the cause.
        const ERR = 0x80;
    }
}

impl Default for SockEvent {
    fn default() -> Self {
        Self::empty()
    }
}

/// Wake-notification callback. Receives the triggering events and the socket
/// handle; it must not reenter the stack.
pub type WakeFn = Box<dyn FnMut(SockEvent, SocketId) + Send>;

/// Multicast group membership with an optional source filter.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MulticastMembership {
    pub group: IpAddr,
    /// When set, only datagrams from this source pass the filter.
    pub source: Option<IpAddr>,
}

// =============================================================================
// Socket
// =============================================================================

/// An endpoint descriptor.
pub struct Socket {
    pub(crate) id: SocketId,
    pub proto: Proto,
    pub family: Family,
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub state: SocketState,
    pub shutdown: ShutdownFlags,
    pub stream_state: StreamState,
    pub q_in: FrameQueue,
    pub q_out: FrameQueue,
    pub backlog: u16,
    pub pending_connections: u16,
    /// Listener this socket was spawned from, until it is accepted.
    pub parent: Option<SocketId>,
    pub(crate) wakeup: Option<WakeFn>,
    /// Events accumulated for the next wake notification.
    pub ev_pending: SockEvent,
    /// Last-activity timestamp (ms), fed by the stack clock.
    pub timestamp_ms: u64,
    pub(crate) mcast: Vec<MulticastMembership>,
    /// Member-set key recorded at registration; `Some` iff the socket is in
    /// the port registry.
    pub(crate) bound_key: Option<SocketKey>,
}

impl Socket {
    pub fn new(proto: Proto, family: Family) -> Self {
        Self {
            id: SocketId(u32::MAX),
            proto,
            family,
            local_addr: IpAddr::any(family),
            local_port: 0,
            remote_addr: IpAddr::any(family),
            remote_port: 0,
            state: SocketState::Unbound,
            shutdown: ShutdownFlags::empty(),
            stream_state: StreamState::Closed,
            q_in: FrameQueue::new(DEFAULT_SOCKETQ),
            q_out: FrameQueue::new(DEFAULT_SOCKETQ),
            backlog: 0,
            pending_connections: 0,
            parent: None,
            wakeup: None,
            ev_pending: SockEvent::empty(),
            timestamp_ms: 0,
            mcast: Vec::new(),
            bound_key: None,
        }
    }

    #[inline]
    pub fn id(&self) -> SocketId {
        self.id
    }

    #[inline]
    pub fn is_stream(&self) -> bool {
        self.proto == Proto::Stream
    }

    #[inline]
    pub fn is_datagram(&self) -> bool {
        self.proto == Proto::Datagram
    }

    /// `true` iff the socket currently has a port-registry entry. This is the
    /// single source of truth for "bound" — it cannot drift from registry
    /// membership because only register/unregister touch `bound_key`.
    #[inline]
    pub fn is_bound(&self) -> bool {
        self.bound_key.is_some()
    }

    /// A passive socket for its protocol: bound but with no remote port.
    #[inline]
    pub fn is_listening_endpoint(&self) -> bool {
        self.remote_port == 0
    }

    pub fn set_wakeup(&mut self, wakeup: Option<WakeFn>) {
        self.wakeup = wakeup;
    }

    pub(crate) fn mark_activity(&mut self, now_ms: u64) {
        self.timestamp_ms = now_ms;
    }

    /// Invoke the wake callback immediately with `events`, bypassing the
    /// pending set. Used by the datagram fan-out and the error path.
    pub(crate) fn notify(&mut self, events: SockEvent) {
        let id = self.id;
        if let Some(cb) = self.wakeup.as_mut() {
            cb(events, id);
        }
    }

    /// Flush accumulated pending events through the wake callback.
    ///
    /// Pending events on a not-yet-accepted child are preserved across the
    /// call so the accepting application still observes them.
    pub(crate) fn fire_pending_wakeup(&mut self) {
        if self.ev_pending.is_empty() {
            return;
        }
        let events = self.ev_pending;
        let id = self.id;
        let retain = self.parent.is_some();
        if let Some(cb) = self.wakeup.as_mut() {
            cb(events, id);
            if !retain {
                self.ev_pending = SockEvent::empty();
            }
        }
    }

    /// Multicast membership/source filter for inbound fan-out: passes when
    /// the socket joined `group` and the membership's source filter (if any)
    /// admits `source`.
    pub(crate) fn mcast_filter(&self, group: &IpAddr, source: &IpAddr) -> bool {
        self.mcast
            .iter()
            .any(|m| m.group == *group && m.source.is_none_or(|s| s == *source))
    }

    pub fn multicast_memberships(&self) -> &[MulticastMembership] {
        &self.mcast
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket {{ id={:?}, proto={:?}, {}:{} -> {}:{}, state={:?}, stream={:?} }}",
            self.id,
            self.proto,
            self.local_addr,
            self.local_port,
            self.remote_addr,
            self.remote_port,
            self.state,
            self.stream_state,
        )
    }
}

// =============================================================================
// Socket table
// =============================================================================

/// Slab of live sockets, indexed by [`SocketId`]. Slots are reused after
/// release; the deferred-reclamation grace period keeps stale handles from
/// observing a recycled slot mid-cycle.
pub struct SocketTable {
    slots: Vec<Option<Socket>>,
}

impl SocketTable {
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Insert a socket, assigning its id. `None` when the table is full.
    pub fn insert(&mut self, mut sock: Socket) -> Option<SocketId> {
        if let Some(idx) = self.slots.iter().position(|s| s.is_none()) {
            let id = SocketId(idx as u32);
            sock.id = id;
            self.slots[idx] = Some(sock);
            return Some(id);
        }
        if self.slots.len() >= MAX_SOCKETS {
            return None;
        }
        let id = SocketId(self.slots.len() as u32);
        sock.id = id;
        self.slots.push(Some(sock));
        Some(id)
    }

    pub fn get(&self, id: SocketId) -> Option<&Socket> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: SocketId) -> Option<&mut Socket> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// Release a slot, dropping the socket and everything it owns.
    pub fn release(&mut self, id: SocketId) -> Option<Socket> {
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn count_active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Socket> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}
