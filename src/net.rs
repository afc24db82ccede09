use std::net::{TcpListener, UdpSocket};
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;

use crate::error::Result;

/// Non-blocking TCP listener bound to `ip:port`, handed over as a raw-fd owner
/// for the state table.
pub fn tcp_listen(ip: &str, port: u16) -> Result<OwnedFd> {
    let listener = TcpListener::bind((ip, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener.into())
}

/// Non-blocking UDP socket bound to `ip:port`.
pub fn udp_listen(ip: &str, port: u16) -> Result<OwnedFd> {
    let socket = UdpSocket::bind((ip, port))?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Non-blocking Unix listener for the scripting side channel. A stale socket
/// file from a previous run is removed first.
pub fn unix_listen(path: &Path) -> Result<OwnedFd> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener.into())
}

/// Read from a descriptor tracked by the state table.
///
/// SAFETY: callers only pass descriptors that are alive in the table (or the
/// process-global fds 0/1); the borrow does not outlive the call.
pub fn read_raw(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
    nix::unistd::read(unsafe { BorrowedFd::borrow_raw(fd) }, buf)
}

/// Write to a descriptor tracked by the state table. Same aliveness contract
/// as [`read_raw`].
pub fn write_raw(fd: RawFd, buf: &[u8]) -> nix::Result<usize> {
    nix::unistd::write(unsafe { BorrowedFd::borrow_raw(fd) }, buf)
}
