//! rill — the socket multiplexing core of an embedded TCP/IP stack.
//!
//! One shared per-protocol port space multiplexed across many concurrent
//! endpoints: an ordered port registry, protocol-aware inbound
//! demultiplexing, MTU-sized outbound segmentation, a budget-bounded
//! round-robin output scheduler and deferred socket reclamation. Byte-stream
//! semantics, network protocols and device drivers live behind the
//! [`engine`] boundary traits.
//!
//! # Architecture
//!
//! The whole core is one explicitly passed context object,
//! [`SocketStack`](stack::SocketStack): application calls mutate sockets and
//! the registry directly; the network layer feeds inbound frames through
//! [`process_inbound`](stack::SocketStack::process_inbound); the stack driver
//! pumps [`run_output_cycle`](stack::SocketStack::run_output_cycle) and
//! [`poll_reclaim`](stack::SocketStack::poll_reclaim).
//!
//! # Concurrency
//!
//! Single-threaded cooperative; no call blocks. Multi-context drivers wrap
//! the context in [`shared::SharedStack`], the only lock in the system.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod datagram;
pub mod demux;
pub mod engine;
pub mod error;
pub mod frame;
pub mod queue;
pub mod registry;
pub mod sched;
pub mod shared;
pub mod socket;
pub mod stack;

pub mod testkit;

#[cfg(test)]
mod sched_tests;
#[cfg(test)]
mod socket_tests;

pub use addr::{DevIndex, Family, IpAddr, Ipv4Addr, Ipv6Addr, SockAddr};
pub use engine::{
    ChildSpawn, InputOutcome, NetworkLayer, SOCKET4_MTU, SOCKET6_MTU, SocketOption,
    SocketOptionName, TransportEngine,
};
pub use error::NetError;
pub use frame::{FragInfo, Frame, RemoteEndpoint};
pub use shared::SharedStack;
pub use socket::{
    MAX_SOCKETS, MulticastMembership, Proto, ShutdownFlags, SockEvent, Socket, SocketId,
    SocketState, StreamState, WakeFn,
};
pub use stack::{
    SOCKET_BOUND_TIMEOUT_MS, SOCKET_GC_DELAY_MS, SOCKET_IDLE_TIMEOUT_MS, ShutdownMode,
    SocketStack,
};
