//! Non-blocking socket construction.
//!
//! Every socket leaves here non-blocking. TCP sockets additionally get
//! `TCP_NODELAY` and a transmit-acknowledgement deadline via
//! `TCP_USER_TIMEOUT`, so a dead peer cannot hold acknowledged-but-unsent
//! data hostage for longer than the reconnect cadence.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Transmit-acknowledgement deadline, matching the reconnect timeout.
pub(crate) const GENERAL_TIMEOUT_SECS: u64 = 10;

/// Non-blocking TCP socket for the given peer address family.
pub(crate) fn tcp(addr: &SocketAddr) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    #[cfg(target_os = "linux")]
    socket.set_tcp_user_timeout(Some(Duration::from_secs(GENERAL_TIMEOUT_SECS)))?;
    Ok(socket)
}

/// Non-blocking AF_UNIX stream socket.
pub(crate) fn unix() -> io::Result<Socket> {
    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Start a non-blocking connect.
///
/// `Ok(true)` means connected right away, `Ok(false)` means in progress
/// (`EINPROGRESS`, or `EAGAIN` for unix sockets short on resources).
pub(crate) fn connect_start(socket: &Socket, addr: &SockAddr) -> io::Result<bool> {
    match socket.connect(addr) {
        Ok(()) => Ok(true),
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock =>
        {
            Ok(false)
        }
        Err(e) => Err(e),
    }
}
