//! Socket-core error taxonomy.
//!
//! Internal code uses `NetError` exclusively. Conversion to POSIX errno
//! happens at the embedder boundary via [`NetError::to_errno`]. Every failing
//! `SocketStack` operation additionally mirrors its error into the context's
//! last-error slot before returning.

use core::fmt;

use rill_abi::net::{
    ERRNO_EADDRINUSE, ERRNO_EADDRNOTAVAIL, ERRNO_EAGAIN, ERRNO_ECONNREFUSED, ERRNO_EFAULT,
    ERRNO_EHOSTUNREACH, ERRNO_EINVAL, ERRNO_EIO, ERRNO_ENETUNREACH, ERRNO_ENOMEM, ERRNO_ENOTCONN,
    ERRNO_ENXIO, ERRNO_EOPNOTSUPP, ERRNO_EPROTONOSUPPORT, ERRNO_ESHUTDOWN,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    /// Invalid argument (EINVAL).
    InvalidArgument,
    /// Allocation failed — socket table or frame pool exhausted (ENOMEM).
    OutOfMemory,
    /// Operation would block / resource temporarily unavailable (EAGAIN).
    WouldBlock,
    /// Socket is not connected (ENOTCONN).
    NotConnected,
    /// Socket direction already shut down (ESHUTDOWN).
    AlreadyShuttingDown,
    /// Requested address not available (EADDRNOTAVAIL).
    AddressNotAvailable,
    /// Address already in use (EADDRINUSE).
    AddressInUse,
    /// Host unreachable (EHOSTUNREACH).
    HostUnreachable,
    /// Network unreachable (ENETUNREACH).
    NetUnreachable,
    /// Protocol or family not supported (EPROTONOSUPPORT).
    ProtocolNotSupported,
    /// Operation on a socket with no registry entry (ENXIO).
    NoSuchEntry,
    /// Malformed frame — missing or truncated transport header (EFAULT).
    Fault,
    /// Operation not supported on this socket (EOPNOTSUPP).
    OperationNotSupported,
    /// Connection refused by the remote host (ECONNREFUSED).
    ConnectionRefused,
    /// I/O on an unbound socket (EIO).
    Io,
}

impl NetError {
    /// Convert to a positive POSIX errno value for the embedder boundary.
    pub const fn to_errno(self) -> i32 {
        match self {
            Self::InvalidArgument => ERRNO_EINVAL,
            Self::OutOfMemory => ERRNO_ENOMEM,
            Self::WouldBlock => ERRNO_EAGAIN,
            Self::NotConnected => ERRNO_ENOTCONN,
            Self::AlreadyShuttingDown => ERRNO_ESHUTDOWN,
            Self::AddressNotAvailable => ERRNO_EADDRNOTAVAIL,
            Self::AddressInUse => ERRNO_EADDRINUSE,
            Self::HostUnreachable => ERRNO_EHOSTUNREACH,
            Self::NetUnreachable => ERRNO_ENETUNREACH,
            Self::ProtocolNotSupported => ERRNO_EPROTONOSUPPORT,
            Self::NoSuchEntry => ERRNO_ENXIO,
            Self::Fault => ERRNO_EFAULT,
            Self::OperationNotSupported => ERRNO_EOPNOTSUPP,
            Self::ConnectionRefused => ERRNO_ECONNREFUSED,
            Self::Io => ERRNO_EIO,
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotConnected => write!(f, "socket not connected"),
            Self::AlreadyShuttingDown => write!(f, "socket already shutting down"),
            Self::AddressNotAvailable => write!(f, "address not available"),
            Self::AddressInUse => write!(f, "address already in use"),
            Self::HostUnreachable => write!(f, "host unreachable"),
            Self::NetUnreachable => write!(f, "network unreachable"),
            Self::ProtocolNotSupported => write!(f, "protocol not supported"),
            Self::NoSuchEntry => write!(f, "no such registry entry"),
            Self::Fault => write!(f, "malformed frame"),
            Self::OperationNotSupported => write!(f, "operation not supported"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Io => write!(f, "i/o error"),
        }
    }
}
