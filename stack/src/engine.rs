//! Boundary contracts between the socket core and its collaborators.
//!
//! The core never speaks wire protocols itself: the network layer owns
//! addressing, routing and frame transmission; the transport engines own
//! sequencing, retransmission and checksum generation. Everything the core
//! needs from either side is captured here, so both can be swapped for test
//! doubles or alternative implementations.

use crate::addr::{DevIndex, Family, IpAddr, SockAddr};
use crate::error::NetError;
use crate::frame::Frame;
use crate::socket::{SockEvent, Socket, StreamState};

/// Effective per-frame payload budget for v4 frames (1500-byte link MTU minus
/// the 20-byte network header).
pub const SOCKET4_MTU: usize = 1480;
/// Effective per-frame payload budget for v6 frames (40-byte network header).
pub const SOCKET6_MTU: usize = 1460;

/// Link payload budget for `family`.
pub const fn socket_mtu(family: Family) -> usize {
    match family {
        Family::V4 => SOCKET4_MTU,
        Family::V6 => SOCKET6_MTU,
    }
}

// =============================================================================
// Network layer
// =============================================================================

/// Everything the socket core requires from the network layer below it.
pub trait NetworkLayer {
    /// Allocate a transport-segment frame of `len` bytes for `family`.
    /// `None` when the frame pool is exhausted.
    fn alloc_frame(&mut self, family: Family, len: u16) -> Option<Frame>;

    /// Take ownership of `frame` and transmit it. The callee consumes the
    /// frame on failure as well — the error only informs accounting.
    fn push(&mut self, proto: crate::socket::Proto, frame: Frame) -> Result<(), NetError>;

    /// Pick a source address for reaching `dst`, if a route exists.
    fn source_address_for(&mut self, dst: &IpAddr) -> Option<IpAddr>;

    /// The device owning `addr`, if any. Used for bind validation and for
    /// matching broadcast arrivals to device-bound sockets.
    fn device_for_address(&self, addr: &IpAddr) -> Option<DevIndex>;

    /// Report an undeliverable inbound frame upstream (e.g. emit a
    /// port-unreachable). The frame stays with the caller.
    fn notify_unreachable(&mut self, frame: &Frame);
}

// =============================================================================
// Transport engines
// =============================================================================

/// Request from an engine to materialize an accepted connection.
///
/// Returned from [`TransportEngine::input`] instead of having the engine
/// reach back into the socket table; the core clones the listener, stamps the
/// remote endpoint and registers the child, enforcing the backlog limit.
#[derive(Clone, Copy, Debug)]
pub struct ChildSpawn {
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub stream_state: StreamState,
}

/// Result of feeding one inbound frame to an engine.
#[derive(Debug, Default)]
pub struct InputOutcome {
    /// Events to accumulate on the socket before the wake flush.
    pub events: SockEvent,
    /// New stream sub-state, if the segment advanced the machine.
    pub stream_state: Option<StreamState>,
    /// Connection to materialize on the listener, if any.
    pub spawn: Option<ChildSpawn>,
}

/// Per-socket options understood by the core or forwarded to the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOption {
    /// Join a multicast group, optionally filtered to one source.
    AddMembership(crate::socket::MulticastMembership),
    /// Leave a multicast group.
    DropMembership(IpAddr),
    /// Disable the stream engine's output coalescing.
    Nodelay(bool),
    /// Receive-queue budget in bytes.
    RecvQueueLimit(usize),
}

/// Option selector for [`TransportEngine::get_option`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketOptionName {
    Nodelay,
    RecvQueueLimit,
}

/// One byte-stream or datagram engine, as seen from the socket core.
pub trait TransportEngine {
    /// Apply protocol defaults to a freshly opened socket.
    fn init_socket(&mut self, sock: &mut Socket);

    /// Consume one inbound frame addressed to `sock`.
    fn input(&mut self, sock: &mut Socket, frame: Frame) -> Result<InputOutcome, NetError>;

    /// Take ownership of one outbound frame produced by the segmentation
    /// loop: stamp transport fields and queue it for the output cycle. The
    /// frame is consumed on failure as well.
    fn push(&mut self, sock: &mut Socket, frame: Frame) -> Result<(), NetError>;

    /// Flush queued output for `sock`, spending at most `budget` frame units.
    /// Returns the unspent budget.
    fn output(&mut self, sock: &mut Socket, net: &mut dyn NetworkLayer, budget: u32) -> u32;

    /// Per-frame transport header overhead for `sock`.
    fn overhead(&self, sock: &Socket) -> usize;

    /// Copy received payload into `buf`; the source endpoint is reported for
    /// connectionless sockets.
    fn recv(&mut self, sock: &mut Socket, buf: &mut [u8])
    -> Result<(usize, Option<SockAddr>), NetError>;

    /// `true` when no received data is pending for `sock`.
    fn queue_in_is_empty(&self, sock: &Socket) -> bool;

    /// Begin the connection handshake (stream protocols).
    fn initiate_connection(&mut self, sock: &mut Socket) -> Result<(), NetError>;

    /// Both directions are shutting down; start the close handshake.
    fn notify_peer_closing(&mut self, sock: &mut Socket);

    /// Drop protocol-internal retained segments before the socket's memory
    /// is released.
    fn cleanup(&mut self, sock: &mut Socket);

    fn set_option(&mut self, sock: &mut Socket, opt: &SocketOption) -> Result<(), NetError> {
        let _ = (sock, opt);
        Err(NetError::OperationNotSupported)
    }

    fn get_option(&self, sock: &Socket, name: SocketOptionName) -> Result<SocketOption, NetError> {
        let _ = (sock, name);
        Err(NetError::OperationNotSupported)
    }
}
