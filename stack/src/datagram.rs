//! Built-in connectionless transport engine.
//!
//! The datagram engine is thin by design: the demultiplexer fans inbound
//! copies straight into each socket's input queue, and the output scheduler
//! drains output queues straight into the network layer. What remains here is
//! header stamping on the way out and payload extraction on the way in.

use rill_lib::netlog_trace;

use crate::addr::SockAddr;
use crate::engine::{InputOutcome, NetworkLayer, TransportEngine};
use crate::error::NetError;
use crate::frame::{FragInfo, Frame};
use crate::socket::{SockEvent, Socket};

/// Datagram transport header length in bytes.
pub const DATAGRAM_HEADER_LEN: usize = 8;

/// The stock datagram engine.
#[derive(Default)]
pub struct DatagramTransport;

impl DatagramTransport {
    pub const fn new() -> Self {
        Self
    }

    /// Stamp the transport header of a first-or-only frame: port pair, total
    /// length, checksum left to the network layer.
    fn stamp_header(sock: &Socket, frame: &mut Frame) {
        let src_port = sock.local_port;
        let dst_port = frame
            .remote()
            .map(|r| r.port)
            .unwrap_or(sock.remote_port);
        let len_field = if frame.transport_total() > 0 {
            frame.transport_total()
        } else {
            frame.transport_segment().len() as u16
        };
        frame.set_ports(src_port, dst_port);
        let seg = frame.transport_segment_mut();
        if seg.len() >= DATAGRAM_HEADER_LEN {
            seg[4..6].copy_from_slice(&len_field.to_be_bytes());
            seg[6..8].copy_from_slice(&0u16.to_be_bytes());
        }
    }
}

impl TransportEngine for DatagramTransport {
    fn init_socket(&mut self, sock: &mut Socket) {
        netlog_trace!("datagram: init socket {:?}", sock.id());
    }

    fn input(&mut self, sock: &mut Socket, frame: Frame) -> Result<InputOutcome, NetError> {
        // Direct input path for embedders that bypass the demultiplexer.
        match sock.q_in.push(frame) {
            Ok(()) => Ok(InputOutcome {
                events: SockEvent::RD,
                ..InputOutcome::default()
            }),
            Err(frame) => {
                drop(frame);
                Err(NetError::WouldBlock)
            }
        }
    }

    fn push(&mut self, sock: &mut Socket, mut frame: Frame) -> Result<(), NetError> {
        // Continuation fragments reuse their header region as payload; only
        // the chain head (or an unfragmented datagram) carries a header.
        let stamp = match frame.frag() {
            FragInfo::None => true,
            FragInfo::Fragment { offset, .. } => offset == 0,
        };
        if stamp {
            Self::stamp_header(sock, &mut frame);
        }
        match sock.q_out.push(frame) {
            Ok(()) => Ok(()),
            Err(frame) => {
                drop(frame);
                Err(NetError::WouldBlock)
            }
        }
    }

    fn output(&mut self, _sock: &mut Socket, _net: &mut dyn NetworkLayer, budget: u32) -> u32 {
        // The scheduler drains datagram queues itself.
        budget
    }

    fn overhead(&self, _sock: &Socket) -> usize {
        DATAGRAM_HEADER_LEN
    }

    fn recv(
        &mut self,
        sock: &mut Socket,
        buf: &mut [u8],
    ) -> Result<(usize, Option<SockAddr>), NetError> {
        let Some(frame) = sock.q_in.pop() else {
            return Err(NetError::WouldBlock);
        };
        let src_port = frame.src_port().unwrap_or(0);
        let origin = SockAddr::new(frame.src(), src_port);
        let segment = frame.transport_segment();
        let payload = if segment.len() >= DATAGRAM_HEADER_LEN {
            &segment[DATAGRAM_HEADER_LEN..]
        } else {
            frame.payload()
        };
        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok((n, Some(origin)))
    }

    fn queue_in_is_empty(&self, sock: &Socket) -> bool {
        sock.q_in.is_empty()
    }

    fn initiate_connection(&mut self, _sock: &mut Socket) -> Result<(), NetError> {
        // Connecting a datagram socket only fixes the default remote endpoint.
        Ok(())
    }

    fn notify_peer_closing(&mut self, _sock: &mut Socket) {}

    fn cleanup(&mut self, _sock: &mut Socket) {}
}
