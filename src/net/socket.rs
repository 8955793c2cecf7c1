//! Thin socket helpers over `socket2`.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

/// Non-blocking, close-on-exec TCP socket for `addr`'s family.
pub(crate) fn create_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
    Socket::new(
        Domain::for_address(*addr),
        Type::STREAM.nonblocking().cloexec(),
        Some(Protocol::TCP),
    )
}

/// True when the socket ended up connected to itself, which happens when the
/// kernel picks the destination port as the ephemeral source port.
pub(crate) fn is_self_connect(socket: &Socket) -> bool {
    match (socket.local_addr(), socket.peer_addr()) {
        (Ok(local), Ok(peer)) => local.as_socket().is_some() && local.as_socket() == peer.as_socket(),
        _ => false,
    }
}

/// Loopback socket connected to its own address through a simultaneous open.
#[cfg(test)]
pub(crate) fn connect_to_self() -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    let loopback: SocketAddr = ([127, 0, 0, 1], 0).into();
    socket.bind(&loopback.into())?;
    let local = socket.local_addr()?;
    socket.connect(&local)?;
    Ok(socket)
}

/// What to do after a non-blocking `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectOutcome {
    /// Connected or in progress: wait for writability.
    Proceed,
    /// Transient failure: back off and try again.
    Retry,
    /// Bad arguments, permissions or address family: cannot recover.
    Fatal,
}

pub(crate) fn classify_connect_error(errno: i32) -> ConnectOutcome {
    match errno {
        0 | libc::EINPROGRESS | libc::EINTR | libc::EISCONN => ConnectOutcome::Proceed,
        libc::EAGAIN
        | libc::EADDRINUSE
        | libc::EADDRNOTAVAIL
        | libc::ECONNREFUSED
        | libc::ENETUNREACH
        | libc::EHOSTUNREACH
        | libc::ETIMEDOUT => ConnectOutcome::Retry,
        _ => ConnectOutcome::Fatal,
    }
}
