//! Shared test doubles and frame builders for the suite modules.
//!
//! The mocks expose their knobs and observations through `Arc<spin::Mutex>`
//! control blocks so tests keep a handle after the double is boxed into the
//! stack context.

extern crate alloc;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::addr::{DevIndex, Family, IpAddr, Ipv4Addr, SockAddr};
use crate::datagram::{DATAGRAM_HEADER_LEN, DatagramTransport};
use crate::engine::{ChildSpawn, InputOutcome, NetworkLayer, TransportEngine};
use crate::error::NetError;
use crate::frame::{Frame, compute_stream_checksum};
use crate::socket::{Proto, SockEvent, Socket, SocketId, StreamState, WakeFn};
use crate::stack::SocketStack;

pub fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr([a, b, c, d]))
}

pub fn v4_any() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

// =============================================================================
// Network layer double
// =============================================================================

pub struct NetCtl {
    /// Frames handed to the network layer, in push order.
    pub pushed: Vec<(Proto, Frame)>,
    pub alloc_count: usize,
    pub unreachable_count: usize,
    /// Fail allocations once this many have succeeded.
    pub fail_allocs_after: Option<usize>,
    /// Whether a route (and thus a source address) exists.
    pub route_ok: bool,
    pub source_v4: IpAddr,
    /// Address-to-device ownership map for bind validation and broadcast
    /// matching.
    pub devices: Vec<(IpAddr, DevIndex)>,
}

impl Default for NetCtl {
    fn default() -> Self {
        Self {
            pushed: Vec::new(),
            alloc_count: 0,
            unreachable_count: 0,
            fail_allocs_after: None,
            route_ok: true,
            source_v4: v4(10, 0, 0, 1),
            devices: alloc::vec![(v4(10, 0, 0, 1), DevIndex(0))],
        }
    }
}

pub struct MockNet {
    pub ctl: Arc<Mutex<NetCtl>>,
}

impl NetworkLayer for MockNet {
    fn alloc_frame(&mut self, family: Family, len: u16) -> Option<Frame> {
        let mut ctl = self.ctl.lock();
        if let Some(limit) = ctl.fail_allocs_after
            && ctl.alloc_count >= limit
        {
            return None;
        }
        ctl.alloc_count += 1;
        let mut frame = Frame::with_len(len);
        frame.set_addrs(IpAddr::any(family), IpAddr::any(family));
        Some(frame)
    }

    fn push(&mut self, proto: Proto, frame: Frame) -> Result<(), NetError> {
        self.ctl.lock().pushed.push((proto, frame));
        Ok(())
    }

    fn source_address_for(&mut self, dst: &IpAddr) -> Option<IpAddr> {
        let ctl = self.ctl.lock();
        if !ctl.route_ok {
            return None;
        }
        match dst.family() {
            Family::V4 => Some(ctl.source_v4),
            Family::V6 => Some(IpAddr::any(Family::V6)),
        }
    }

    fn device_for_address(&self, addr: &IpAddr) -> Option<DevIndex> {
        self.ctl
            .lock()
            .devices
            .iter()
            .find(|(a, _)| a == addr)
            .map(|(_, dev)| *dev)
    }

    fn notify_unreachable(&mut self, _frame: &Frame) {
        self.ctl.lock().unreachable_count += 1;
    }
}

// =============================================================================
// Stream engine double
// =============================================================================

pub struct StreamCtl {
    /// (socket, transport segment length) per input frame.
    pub inputs: Vec<(SocketId, usize)>,
    /// (socket, budget on entry) per output step.
    pub outputs: Vec<(SocketId, u32)>,
    pub closing_notified: Vec<SocketId>,
    pub cleanups: Vec<SocketId>,
    /// Refuse pushes when false.
    pub push_accept: bool,
    pub overhead: usize,
    /// Budget units consumed per output step.
    pub output_cost: u32,
    pub connect_ok: bool,
    /// Events reported from the next inputs.
    pub input_events: SockEvent,
    /// Stream sub-state reported from the next inputs.
    pub input_stream_state: Option<StreamState>,
    /// Child-spawn request consumed by the next input.
    pub input_spawn: Option<ChildSpawn>,
}

impl Default for StreamCtl {
    fn default() -> Self {
        Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            closing_notified: Vec::new(),
            cleanups: Vec::new(),
            push_accept: true,
            overhead: 20,
            output_cost: 0,
            connect_ok: true,
            input_events: SockEvent::RD,
            input_stream_state: None,
            input_spawn: None,
        }
    }
}

pub struct MockStreamEngine {
    pub ctl: Arc<Mutex<StreamCtl>>,
}

impl TransportEngine for MockStreamEngine {
    fn init_socket(&mut self, _sock: &mut Socket) {}

    fn input(&mut self, sock: &mut Socket, frame: Frame) -> Result<InputOutcome, NetError> {
        let mut ctl = self.ctl.lock();
        ctl.inputs.push((sock.id(), frame.transport_segment().len()));
        drop(frame);
        Ok(InputOutcome {
            events: ctl.input_events,
            stream_state: ctl.input_stream_state,
            spawn: ctl.input_spawn.take(),
        })
    }

    fn push(&mut self, sock: &mut Socket, frame: Frame) -> Result<(), NetError> {
        let accept = self.ctl.lock().push_accept;
        if !accept {
            drop(frame);
            return Err(NetError::WouldBlock);
        }
        match sock.q_out.push(frame) {
            Ok(()) => Ok(()),
            Err(frame) => {
                drop(frame);
                Err(NetError::WouldBlock)
            }
        }
    }

    fn output(&mut self, sock: &mut Socket, net: &mut dyn NetworkLayer, budget: u32) -> u32 {
        let spend = {
            let mut ctl = self.ctl.lock();
            ctl.outputs.push((sock.id(), budget));
            ctl.output_cost.min(budget)
        };
        for _ in 0..spend {
            if let Some(frame) = sock.q_out.pop() {
                let _ = net.push(Proto::Stream, frame);
            }
        }
        budget - spend
    }

    fn overhead(&self, _sock: &Socket) -> usize {
        self.ctl.lock().overhead
    }

    fn recv(
        &mut self,
        sock: &mut Socket,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SockAddr>), NetError> {
        let Some(frame) = sock.q_in.pop() else {
            return Err(NetError::WouldBlock);
        };
        let payload = frame.payload();
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, None))
    }

    fn queue_in_is_empty(&self, sock: &Socket) -> bool {
        sock.q_in.is_empty()
    }

    fn initiate_connection(&mut self, _sock: &mut Socket) -> Result<(), NetError> {
        if self.ctl.lock().connect_ok {
            Ok(())
        } else {
            Err(NetError::HostUnreachable)
        }
    }

    fn notify_peer_closing(&mut self, sock: &mut Socket) {
        self.ctl.lock().closing_notified.push(sock.id());
    }

    fn cleanup(&mut self, sock: &mut Socket) {
        self.ctl.lock().cleanups.push(sock.id());
    }
}

// =============================================================================
// Stack assembly and frame builders
// =============================================================================

/// A stack wired to fresh mocks, plus the control handles.
pub fn test_stack() -> (SocketStack, Arc<Mutex<NetCtl>>, Arc<Mutex<StreamCtl>>) {
    let net_ctl = Arc::new(Mutex::new(NetCtl::default()));
    let stream_ctl = Arc::new(Mutex::new(StreamCtl::default()));
    let stack = SocketStack::with_seed(
        Box::new(MockNet {
            ctl: net_ctl.clone(),
        }),
        Box::new(MockStreamEngine {
            ctl: stream_ctl.clone(),
        }),
        Box::new(DatagramTransport::new()),
        0x00C0_FFEE,
    );
    (stack, net_ctl, stream_ctl)
}

/// Inbound datagram frame: 8-byte header (checksum left zero, so the
/// validation gate passes it untouched) plus payload.
pub fn rx_datagram_frame(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
) -> Frame {
    let mut bytes = alloc::vec![0u8; DATAGRAM_HEADER_LEN + payload.len()];
    bytes[0..2].copy_from_slice(&src_port.to_be_bytes());
    bytes[2..4].copy_from_slice(&dst_port.to_be_bytes());
    bytes[4..6].copy_from_slice(&((DATAGRAM_HEADER_LEN + payload.len()) as u16).to_be_bytes());
    bytes[DATAGRAM_HEADER_LEN..].copy_from_slice(payload);
    let mut frame = Frame::from_wire(&bytes, Some(0));
    frame.set_addrs(src, dst);
    frame
}

/// Inbound stream frame: minimal 20-byte header with a valid checksum.
pub fn rx_stream_frame(
    src: IpAddr,
    src_port: u16,
    dst: IpAddr,
    dst_port: u16,
    payload: &[u8],
) -> Frame {
    let mut bytes = alloc::vec![0u8; 20 + payload.len()];
    bytes[0..2].copy_from_slice(&src_port.to_be_bytes());
    bytes[2..4].copy_from_slice(&dst_port.to_be_bytes());
    bytes[12] = 0x50; // data offset: 5 words
    bytes[20..].copy_from_slice(payload);
    let mut frame = Frame::from_wire(&bytes, Some(0));
    frame.set_addrs(src, dst);
    let csum = compute_stream_checksum(&frame);
    frame.transport_segment_mut()[16..18].copy_from_slice(&csum.to_be_bytes());
    frame
}

/// Wake callback that records every notification.
pub fn wake_recorder() -> (WakeFn, Arc<Mutex<Vec<(SockEvent, SocketId)>>>) {
    let log: Arc<Mutex<Vec<(SockEvent, SocketId)>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = log.clone();
    let cb: WakeFn = Box::new(move |ev, id| {
        handle.lock().push((ev, id));
    });
    (cb, log)
}
