//! Budget-bounded round-robin output scheduler.
//!
//! The stack driver calls [`run_output_cycle`](SocketStack::run_output_cycle)
//! periodically with a work budget in frame units. Rotation across port
//! entries is index order with a persistent per-protocol cursor, so repeated
//! calls resume where the previous cycle stopped instead of favoring low
//! ports — fair in the amortized sense, not strictly round-robin per call.
//!
//! A frame is only dequeued when budget remains to push it; nothing is ever
//! dropped on the floor between queue and network layer.

extern crate alloc;

use alloc::vec::Vec;

use rill_lib::netlog_debug;

use crate::socket::{Proto, SocketId, StreamState};
use crate::stack::{
    SOCKET_BOUND_TIMEOUT_MS, SOCKET_IDLE_TIMEOUT_MS, SocketStack, StateChange,
};

/// Budget floor below which a phase stops visiting entries.
const LOOP_FLOOR: u32 = 1;

impl SocketStack {
    /// Flush queued output across both protocols, spending at most `budget`
    /// frame units. Returns the unspent budget so the caller can account for
    /// the cycle's total work.
    pub fn run_output_cycle(&mut self, budget: u32, now_ms: u64) -> u32 {
        self.set_clock(now_ms);
        let budget = self.datagram_phase(budget);
        self.stream_phase(budget)
    }

    // -- Datagram phase -------------------------------------------------------

    fn datagram_phase(&mut self, mut budget: u32) -> u32 {
        let Some(start) = self.resume_port(Proto::Datagram) else {
            return budget;
        };
        self.datagram_cursor = Some(start);
        let mut cur = start;

        while budget > LOOP_FLOOR {
            budget = self.drain_datagram_entry(cur, budget);
            let Some(next) = self.registry.next_port_wrapping(Proto::Datagram, cur) else {
                self.datagram_cursor = None;
                break;
            };
            cur = next;
            self.datagram_cursor = Some(cur);
            if cur == start {
                break;
            }
        }
        budget
    }

    /// Drain every member socket's output queue into the network layer,
    /// one budget unit per frame.
    fn drain_datagram_entry(&mut self, port: u16, mut budget: u32) -> u32 {
        let Some(entry) = self.registry.lookup(Proto::Datagram, port) else {
            return budget;
        };
        let members: Vec<SocketId> = entry.members().collect();

        let Self { sockets, net, .. } = self;
        for id in members {
            let Some(sock) = sockets.get_mut(id) else {
                continue;
            };
            while budget > 0 {
                let Some(frame) = sock.q_out.pop() else {
                    break;
                };
                if let Err(err) = net.push(Proto::Datagram, frame) {
                    netlog_debug!("sched: datagram push failed: {:?}", err);
                }
                budget -= 1;
            }
            if budget == 0 {
                break;
            }
        }
        budget
    }

    // -- Stream phase ---------------------------------------------------------

    fn stream_phase(&mut self, mut budget: u32) -> u32 {
        let Some(start) = self.resume_port(Proto::Stream) else {
            return budget;
        };
        self.stream_cursor = Some(start);
        let mut cur = start;

        'rotation: while budget > LOOP_FLOOR {
            let members: Vec<SocketId> = match self.registry.lookup(Proto::Stream, cur) {
                Some(entry) => entry.members().collect(),
                None => Vec::new(),
            };

            let mut exhausted = false;
            for id in members {
                budget = {
                    let Self {
                        sockets,
                        stream_engine,
                        net,
                        ..
                    } = self;
                    match sockets.get_mut(id) {
                        Some(sock) => stream_engine.output(sock, net.as_mut(), budget),
                        None => budget,
                    }
                };
                if let Some(sock) = self.sockets.get_mut(id) {
                    sock.fire_pending_wakeup();
                }
                if budget == 0 {
                    exhausted = true;
                    break;
                }
                if !self.socket_is_live(id) {
                    netlog_debug!("sched: {:?} failed liveness check, force-closing", id);
                    let _ = self.alter_state(id, StateChange::Unbind);
                    // The member set just mutated mid-rotation; restart from
                    // the first entry next cycle.
                    self.stream_cursor = None;
                    break 'rotation;
                }
            }
            if exhausted {
                // Cursor stays on the current entry so the next cycle picks
                // up exactly here.
                break;
            }

            let Some(next) = self.registry.next_port_wrapping(Proto::Stream, cur) else {
                self.stream_cursor = None;
                break;
            };
            cur = next;
            self.stream_cursor = Some(cur);
            if cur == start {
                break;
            }
        }
        budget
    }

    /// Liveness check: a socket stuck connecting past the bound timeout is
    /// dead; any socket outside Listen/Established idle past the general
    /// timeout is dead.
    fn socket_is_live(&self, id: SocketId) -> bool {
        let Some(sock) = self.sockets.get(id) else {
            return true;
        };
        if sock.proto != Proto::Stream {
            return true;
        }
        let idle = self.now_ms.saturating_sub(sock.timestamp_ms);
        if sock.stream_state == StreamState::SynReceived && idle >= SOCKET_BOUND_TIMEOUT_MS {
            return false;
        }
        if idle >= SOCKET_IDLE_TIMEOUT_MS
            && !matches!(
                sock.stream_state,
                StreamState::Listen | StreamState::Established
            )
        {
            return false;
        }
        true
    }

    /// Where a phase resumes: the cursor's port if it still exists, else the
    /// next one after it, else the first entry in index order.
    fn resume_port(&self, proto: Proto) -> Option<u16> {
        let cursor = match proto {
            Proto::Datagram => self.datagram_cursor,
            Proto::Stream => self.stream_cursor,
        };
        match cursor {
            Some(port) => self
                .registry
                .port_at_or_after(proto, port)
                .or_else(|| self.registry.first_port(proto)),
            None => self.registry.first_port(proto),
        }
    }
}
