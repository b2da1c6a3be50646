//! Single-owner network frame and transport checksum helpers.
//!
//! `Frame` is the one currency exchanged between the socket core, the
//! transport engines and the network layer. It carries the raw transport
//! segment plus the metadata each stage needs: payload window, fragmentation
//! state, originating device, owning socket, and the pending remote endpoint
//! of a not-yet-connected datagram send.
//!
//! # Ownership
//!
//! `Frame` is **move-only** — it deliberately does not implement `Clone`.
//! Every hand-off point either consumes the frame (forwards or drops it) or
//! hands it back explicitly; fan-out paths create independent copies via
//! [`duplicate`](Frame::duplicate).
//!
//! # Layout
//!
//! ```text
//! |<- transport header ->|<-- payload (head..tail) -->|
//! transport_offset    head                         tail
//! ```
//!
//! * TX path: the network layer allocates a transport-sized frame; the socket
//!   core advances the payload window past the header region, which the
//!   owning engine later fills in.
//! * RX path: the network layer parses its own headers and hands the core a
//!   frame whose transport offset marks the start of the transport header.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use rill_abi::net::{IPPROTO_TCP, IPPROTO_UDP};

use crate::addr::{DevIndex, Family, IpAddr, Ipv4Addr};
use crate::socket::SocketId;

/// Destination snapshot attached to frames of a not-yet-connected datagram
/// send, so the destination survives until the frame reaches the network
/// layer even if the socket's own remote endpoint is overwritten by a later
/// call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RemoteEndpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// Fragmentation metadata stamped by the outbound segmentation loop and
/// consumed by the network layer. Offsets are in 8-byte units, as the wire
/// format demands.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FragInfo {
    /// Not part of a fragment chain.
    #[default]
    None,
    /// Part of a fragment chain; `more` is clear only on the final fragment.
    Fragment { offset: u16, more: bool },
}

impl FragInfo {
    /// `true` when further fragments follow this frame.
    #[inline]
    pub const fn more_fragments(&self) -> bool {
        matches!(self, Self::Fragment { more: true, .. })
    }
}

// =============================================================================
// Frame
// =============================================================================

/// A single-owner transport frame. See [module documentation](self).
pub struct Frame {
    buf: Vec<u8>,
    /// Start of the payload window within `buf`.
    head: u16,
    /// End of the payload window (exclusive).
    tail: u16,
    /// Offset of the transport header, if the frame carries one.
    transport: Option<u16>,
    /// Total transport length of a fragmented datagram, stamped on the first
    /// fragment only; 0 otherwise.
    transport_total: u16,
    /// Network-layer source address (RX) or unspecified (TX).
    src: IpAddr,
    /// Network-layer destination address (RX) or unspecified (TX).
    dst: IpAddr,
    /// Set by the network layer when the destination was a link or subnet
    /// broadcast it already resolved.
    broadcast: bool,
    frag: FragInfo,
    /// Arrival device (RX only).
    dev: Option<DevIndex>,
    /// Owning socket (TX only).
    sock: Option<SocketId>,
    remote: Option<RemoteEndpoint>,
}

impl Frame {
    /// Allocate a zeroed transport-segment frame of `len` bytes.
    ///
    /// The payload window initially spans the whole segment and the transport
    /// header is at offset 0, matching what the segmentation loop expects.
    pub fn with_len(len: u16) -> Self {
        Self {
            buf: vec![0u8; len as usize],
            head: 0,
            tail: len,
            transport: Some(0),
            transport_total: 0,
            src: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast: false,
            frag: FragInfo::None,
            dev: None,
            sock: None,
            remote: None,
        }
    }

    /// Build an inbound frame from raw wire bytes.
    ///
    /// `transport_offset` marks the start of the transport header within
    /// `data`; `None` produces a headerless frame the demultiplexer will
    /// reject with a fault.
    pub fn from_wire(data: &[u8], transport_offset: Option<u16>) -> Self {
        let mut f = Self::with_len(data.len() as u16);
        f.buf.copy_from_slice(data);
        f.transport = transport_offset;
        f
    }

    /// Create an independent copy for fan-out delivery.
    ///
    /// The copy shares nothing with the original; both must be consumed
    /// independently.
    pub fn duplicate(&self) -> Self {
        Self {
            buf: self.buf.clone(),
            head: self.head,
            tail: self.tail,
            transport: self.transport,
            transport_total: self.transport_total,
            src: self.src,
            dst: self.dst,
            broadcast: self.broadcast,
            frag: self.frag,
            dev: self.dev,
            sock: self.sock,
            remote: self.remote,
        }
    }
}

// -- Payload window -----------------------------------------------------------

impl Frame {
    /// Number of bytes in the payload window.
    #[inline]
    pub fn payload_len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    /// The payload window `buf[head..tail]`.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.head as usize..self.tail as usize]
    }

    /// Mutable payload window.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let (h, t) = (self.head as usize, self.tail as usize);
        &mut self.buf[h..t]
    }

    /// Shrink the payload window from the front by `n` bytes (saturating at
    /// an empty window), exposing the transport header region to the engine.
    #[inline]
    pub fn advance_payload(&mut self, n: usize) {
        self.head = (self.head + n as u16).min(self.tail);
    }

    /// Reset the payload window to start at the transport header.
    ///
    /// Continuation fragments carry no fresh transport header, so their
    /// header region is reused as payload space.
    #[inline]
    pub fn restore_payload_to_transport(&mut self) {
        self.head = self.transport.unwrap_or(0);
    }

    /// Total length of the backing buffer.
    #[inline]
    pub fn buf_len(&self) -> usize {
        self.buf.len()
    }
}

// -- Transport header ---------------------------------------------------------

impl Frame {
    /// Offset of the transport header, if the frame carries one.
    #[inline]
    pub fn transport_offset(&self) -> Option<u16> {
        self.transport
    }

    /// The transport segment `buf[transport..tail]` (header plus payload).
    ///
    /// Empty when the frame carries no transport header.
    pub fn transport_segment(&self) -> &[u8] {
        match self.transport {
            Some(off) => &self.buf[off as usize..self.tail as usize],
            None => &[],
        }
    }

    /// Mutable transport segment.
    pub fn transport_segment_mut(&mut self) -> &mut [u8] {
        match self.transport {
            Some(off) => {
                let (o, t) = (off as usize, self.tail as usize);
                &mut self.buf[o..t]
            }
            None => &mut [],
        }
    }

    /// Source port parsed from the transport header (both transport header
    /// formats lead with source then destination port).
    pub fn src_port(&self) -> Option<u16> {
        let seg = self.transport_segment();
        if seg.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([seg[0], seg[1]]))
    }

    /// Destination port parsed from the transport header.
    pub fn dst_port(&self) -> Option<u16> {
        let seg = self.transport_segment();
        if seg.len() < 4 {
            return None;
        }
        Some(u16::from_be_bytes([seg[2], seg[3]]))
    }

    /// Stamp the leading port pair of the transport header.
    pub fn set_ports(&mut self, src_port: u16, dst_port: u16) {
        let seg = self.transport_segment_mut();
        if seg.len() >= 4 {
            seg[0..2].copy_from_slice(&src_port.to_be_bytes());
            seg[2..4].copy_from_slice(&dst_port.to_be_bytes());
        }
    }

    /// Total transport length of a fragmented datagram (first fragment only).
    #[inline]
    pub fn transport_total(&self) -> u16 {
        self.transport_total
    }

    #[inline]
    pub fn set_transport_total(&mut self, total: u16) {
        self.transport_total = total;
    }
}

// -- Metadata -----------------------------------------------------------------

impl Frame {
    #[inline]
    pub fn src(&self) -> IpAddr {
        self.src
    }

    #[inline]
    pub fn dst(&self) -> IpAddr {
        self.dst
    }

    #[inline]
    pub fn set_addrs(&mut self, src: IpAddr, dst: IpAddr) {
        self.src = src;
        self.dst = dst;
    }

    /// `true` when the destination is any form of broadcast — the limited
    /// broadcast address or a subnet broadcast flagged by the network layer.
    #[inline]
    pub fn is_broadcast_dst(&self) -> bool {
        self.broadcast || self.dst.is_broadcast()
    }

    #[inline]
    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.broadcast = broadcast;
    }

    #[inline]
    pub fn frag(&self) -> FragInfo {
        self.frag
    }

    #[inline]
    pub fn set_frag(&mut self, frag: FragInfo) {
        self.frag = frag;
    }

    #[inline]
    pub fn dev(&self) -> Option<DevIndex> {
        self.dev
    }

    #[inline]
    pub fn set_dev(&mut self, dev: DevIndex) {
        self.dev = Some(dev);
    }

    #[inline]
    pub fn owner(&self) -> Option<SocketId> {
        self.sock
    }

    #[inline]
    pub fn set_owner(&mut self, id: SocketId) {
        self.sock = Some(id);
    }

    #[inline]
    pub fn remote(&self) -> Option<&RemoteEndpoint> {
        self.remote.as_ref()
    }

    #[inline]
    pub fn set_remote(&mut self, remote: RemoteEndpoint) {
        self.remote = Some(remote);
    }

    /// Family of the destination address.
    #[inline]
    pub fn family(&self) -> Family {
        self.dst.family()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {{ len={}, head={}, tail={}, transport={:?}, frag={:?}, src={}, dst={} }}",
            self.buf.len(),
            self.head,
            self.tail,
            self.transport,
            self.frag,
            self.src,
            self.dst,
        )
    }
}

// =============================================================================
// Checksum helpers
// =============================================================================

/// Accumulate the one's-complement sum over a byte slice. The caller folds
/// the result via [`fold_checksum`] after accumulating all data.
fn ones_complement_sum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut i = 0usize;
    while i + 1 < data.len() {
        let word = u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        sum = sum.wrapping_add(word);
        i += 2;
    }
    // Odd trailing byte — pad with zero on the right.
    if i < data.len() {
        sum = sum.wrapping_add((data[i] as u32) << 8);
    }
    sum
}

/// Fold a 32-bit running sum into a 16-bit one's-complement checksum.
fn fold_checksum(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Accumulate the IPv4 pseudo-header into `sum`.
fn add_pseudo_header(sum: &mut u32, src: &Ipv4Addr, dst: &Ipv4Addr, protocol: u8, l4_len: usize) {
    *sum = sum.wrapping_add(u16::from_be_bytes([src.0[0], src.0[1]]) as u32);
    *sum = sum.wrapping_add(u16::from_be_bytes([src.0[2], src.0[3]]) as u32);
    *sum = sum.wrapping_add(u16::from_be_bytes([dst.0[0], dst.0[1]]) as u32);
    *sum = sum.wrapping_add(u16::from_be_bytes([dst.0[2], dst.0[3]]) as u32);
    *sum = sum.wrapping_add(protocol as u32);
    *sum = sum.wrapping_add(l4_len as u32);
}

fn pseudo_pair(frame: &Frame) -> Option<(Ipv4Addr, Ipv4Addr)> {
    match (frame.src(), frame.dst()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => Some((s, d)),
        _ => None,
    }
}

/// Verify a stream (TCP) segment checksum over the IPv4 pseudo-header and the
/// full transport segment. Non-v4 frames pass unconditionally.
pub fn verify_stream_checksum(frame: &Frame) -> bool {
    let Some((src, dst)) = pseudo_pair(frame) else {
        return true;
    };
    let segment = frame.transport_segment();
    if segment.len() < 20 {
        return false;
    }
    let mut sum = 0u32;
    add_pseudo_header(&mut sum, &src, &dst, IPPROTO_TCP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(segment));
    fold_checksum(sum) == 0
}

/// Verify a datagram (UDP) checksum. A stored checksum of zero means "not
/// computed" and passes, per RFC 768. Non-v4 frames pass unconditionally.
pub fn verify_datagram_checksum(frame: &Frame) -> bool {
    let Some((src, dst)) = pseudo_pair(frame) else {
        return true;
    };
    let segment = frame.transport_segment();
    if segment.len() < 8 {
        return false;
    }
    let stored = u16::from_be_bytes([segment[6], segment[7]]);
    if stored == 0 {
        return true;
    }
    let mut sum = 0u32;
    add_pseudo_header(&mut sum, &src, &dst, IPPROTO_UDP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(segment));
    fold_checksum(sum) == 0
}

/// Compute a stream (TCP) checksum for stamping, treating the checksum field
/// (segment bytes 16–17) as zero.
pub fn compute_stream_checksum(frame: &Frame) -> u16 {
    let Some((src, dst)) = pseudo_pair(frame) else {
        return 0;
    };
    let segment = frame.transport_segment();
    if segment.len() < 20 {
        return 0;
    }
    let mut sum = 0u32;
    add_pseudo_header(&mut sum, &src, &dst, IPPROTO_TCP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(&segment[..16]));
    if segment.len() > 18 {
        sum = sum.wrapping_add(ones_complement_sum(&segment[18..]));
    }
    fold_checksum(sum)
}

/// Compute a datagram (UDP) checksum for stamping, treating the checksum
/// field (segment bytes 6–7) as zero. A computed value of zero is transmitted
/// as `0xFFFF`, per RFC 768.
pub fn compute_datagram_checksum(frame: &Frame) -> u16 {
    let Some((src, dst)) = pseudo_pair(frame) else {
        return 0;
    };
    let segment = frame.transport_segment();
    if segment.len() < 8 {
        return 0;
    }
    let mut sum = 0u32;
    add_pseudo_header(&mut sum, &src, &dst, IPPROTO_UDP, segment.len());
    sum = sum.wrapping_add(ones_complement_sum(&segment[..6]));
    if segment.len() > 8 {
        sum = sum.wrapping_add(ones_complement_sum(&segment[8..]));
    }
    let csum = fold_checksum(sum);
    if csum == 0 { 0xFFFF } else { csum }
}
