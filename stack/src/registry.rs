//! Ordered port registry — one index per transport protocol.
//!
//! Each in-use (protocol, port) pair owns a [`PortEntry`] holding an ordered
//! member set of sockets. Entries are created lazily on the first
//! registration and destroyed the instant their member set empties; a port
//! number is never reserved beyond active ownership.
//!
//! Member ordering is the plain derived ordering of [`SocketKey`] (family,
//! then local address, then remote address, then remote port). The
//! wildcard-collides-with-everything rule applies **only** inside
//! [`port_is_free`](PortRegistry::port_is_free) — folding it into the
//! container ordering would make wildcard and specific bindings collide for
//! iteration as well, which is not what delivery wants.

extern crate alloc;

use alloc::collections::BTreeMap;
use core::ops::Bound::{Excluded, Unbounded};

use rill_lib::netlog_debug;

use crate::addr::{Family, IpAddr};
use crate::error::NetError;
use crate::socket::{Proto, Socket, SocketId, SocketTable};

// =============================================================================
// SocketKey
// =============================================================================

/// Composite member-set key, snapshotted at registration time.
///
/// Lookup paths compare against live socket fields; the snapshot only fixes
/// the iteration order and locates the member for removal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SocketKey {
    pub family: Family,
    pub local: IpAddr,
    pub remote: IpAddr,
    pub remote_port: u16,
}

impl SocketKey {
    pub fn from_socket(sock: &Socket) -> Self {
        Self {
            family: sock.family,
            local: sock.local_addr,
            remote: sock.remote_addr,
            remote_port: sock.remote_port,
        }
    }
}

// =============================================================================
// PortEntry
// =============================================================================

/// Registry node holding every socket bound to one (protocol, port) pair.
pub struct PortEntry {
    pub port: u16,
    pub proto: Proto,
    members: BTreeMap<SocketKey, SocketId>,
}

impl PortEntry {
    fn new(proto: Proto, port: u16) -> Self {
        Self {
            port,
            proto,
            members: BTreeMap::new(),
        }
    }

    /// Member sockets in key order.
    pub fn members(&self) -> impl Iterator<Item = SocketId> + '_ {
        self.members.values().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

// =============================================================================
// PortRegistry
// =============================================================================

/// The two per-protocol ordered indexes.
pub struct PortRegistry {
    datagram: BTreeMap<u16, PortEntry>,
    stream: BTreeMap<u16, PortEntry>,
}

impl PortRegistry {
    pub const fn new() -> Self {
        Self {
            datagram: BTreeMap::new(),
            stream: BTreeMap::new(),
        }
    }

    fn index(&self, proto: Proto) -> &BTreeMap<u16, PortEntry> {
        match proto {
            Proto::Datagram => &self.datagram,
            Proto::Stream => &self.stream,
        }
    }

    fn index_mut(&mut self, proto: Proto) -> &mut BTreeMap<u16, PortEntry> {
        match proto {
            Proto::Datagram => &mut self.datagram,
            Proto::Stream => &mut self.stream,
        }
    }

    /// O(log n) entry lookup.
    pub fn lookup(&self, proto: Proto, port: u16) -> Option<&PortEntry> {
        self.index(proto).get(&port)
    }

    /// Insert `sock` into the entry for its (protocol, local port), creating
    /// the entry on first use, and record the membership key on the socket.
    ///
    /// Inserting a socket whose effective key is already present is a caller
    /// bug; the registry only guards it with a debug assertion.
    pub fn register(&mut self, sock: &mut Socket) -> Result<(), NetError> {
        let key = SocketKey::from_socket(sock);
        let entry = self
            .index_mut(sock.proto)
            .entry(sock.local_port)
            .or_insert_with(|| {
                netlog_debug!("registry: new {:?} entry for port {}", sock.proto, sock.local_port);
                PortEntry::new(sock.proto, sock.local_port)
            });
        let prev = entry.members.insert(key, sock.id);
        debug_assert!(prev.is_none(), "duplicate socket key in port entry");
        sock.bound_key = Some(key);
        Ok(())
    }

    /// Remove `sock` from its entry, destroying the entry if it empties.
    ///
    /// Fails with [`NetError::NoSuchEntry`] when the socket's port has no
    /// entry or the socket was never registered (double-unregister).
    pub fn unregister(&mut self, sock: &mut Socket) -> Result<(), NetError> {
        let Some(key) = sock.bound_key else {
            return Err(NetError::NoSuchEntry);
        };
        let index = self.index_mut(sock.proto);
        let Some(entry) = index.get_mut(&sock.local_port) else {
            return Err(NetError::NoSuchEntry);
        };
        entry.members.remove(&key);
        if entry.is_empty() {
            index.remove(&sock.local_port);
            netlog_debug!(
                "registry: dropped empty {:?} entry for port {}",
                sock.proto,
                sock.local_port
            );
        }
        sock.bound_key = None;
        Ok(())
    }

    /// `true` iff `sock` is a current member of its port entry.
    pub fn contains(&self, sock: &Socket) -> bool {
        let Some(key) = sock.bound_key else {
            return false;
        };
        self.index(sock.proto)
            .get(&sock.local_port)
            .and_then(|entry| entry.members.get(&key))
            .is_some_and(|id| *id == sock.id)
    }

    /// Decide whether `port` can be bound with `candidate` as local address.
    ///
    /// A `None` or wildcard candidate collides with any existing entry; a
    /// concrete candidate collides with members that are wildcard-bound or
    /// bound to the same concrete address. The asymmetric rule keeps delivery
    /// unambiguous later.
    pub fn port_is_free(
        &self,
        proto: Proto,
        port: u16,
        candidate: Option<&IpAddr>,
        table: &SocketTable,
    ) -> bool {
        let Some(entry) = self.lookup(proto, port) else {
            return true;
        };
        let Some(candidate) = candidate else {
            return false;
        };
        if candidate.is_unspecified() {
            return false;
        }
        for (key, id) in entry.members.iter() {
            // Prefer the live socket's address; fall back to the snapshot.
            let member_local = table.get(*id).map(|s| s.local_addr).unwrap_or(key.local);
            if member_local.family() != candidate.family() {
                continue;
            }
            if member_local.is_unspecified() || member_local == *candidate {
                return false;
            }
        }
        true
    }

    /// Diagnostic lookup: linear scan of one stream entry for an exact
    /// local/remote port pair. Not on the delivery hot path.
    pub fn find_by_local_remote(
        &self,
        local_port: u16,
        remote_port: u16,
        table: &SocketTable,
    ) -> Option<SocketId> {
        let entry = self.lookup(Proto::Stream, local_port)?;
        entry
            .members()
            .find(|id| table.get(*id).is_some_and(|s| s.remote_port == remote_port))
    }

    /// First port with an entry, in index order.
    pub fn first_port(&self, proto: Proto) -> Option<u16> {
        self.index(proto).keys().next().copied()
    }

    /// First port with an entry at or after `port`.
    pub fn port_at_or_after(&self, proto: Proto, port: u16) -> Option<u16> {
        self.index(proto).range(port..).next().map(|(p, _)| *p)
    }

    /// Next port after `port` in index order, wrapping to the first.
    pub fn next_port_wrapping(&self, proto: Proto, port: u16) -> Option<u16> {
        let index = self.index(proto);
        index
            .range((Excluded(port), Unbounded))
            .next()
            .map(|(p, _)| *p)
            .or_else(|| self.first_port(proto))
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
