//! The multiplexing event loop.
//!
//! One thread, one `poll` set. Every descriptor lives in the fd-indexed state
//! table; the readiness set is rebuilt from it each iteration. All tunneled
//! sessions funnel through the single PTY master, so back-pressure and
//! ordering reduce to buffer discipline on that one descriptor.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Buf;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{accept4, recv, recvfrom, sendto, MsgFlags, SockFlag, SockaddrIn};
use slog_scope::debug;

use crate::codec::{Codec, Decoded, Endpoint};
use crate::config::Listeners;
use crate::dispatch;
use crate::error::{AppError, Result};
use crate::net::{read_raw, write_raw};
use crate::pty;
use crate::signals;
use crate::socks;
use crate::state::{FdTable, Role};
use crate::tty;

/// Seconds a tunnel may wait for the remote connect confirmation.
const CONNECT_TIME: i64 = 30;
/// Seconds a finished session gets to drain before being retired.
const CLOSING_TIME: i64 = 5;
/// Upper bound per write-ready event so one session cannot starve the loop.
const CHUNK_SIZE: usize = 8192;
/// Read block for stdin, script and tunneled sockets.
const HALF_BLOCK: usize = 2048;

const DEFAULT_WRITE_KEY: &str = "pscl-write-v1";
const DEFAULT_READ_KEY: &str = "pscl-read-v1";

fn key_from_env(var: &str, fallback: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| fallback.to_string())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct Proxy {
    table: FdTable,
    codec: Codec,
    tcp_nodes: HashMap<String, RawFd>,
    udp_nodes: HashMap<String, RawFd>,
    pty_fd: RawFd,
    script_accept: Option<RawFd>,
    script_fd: Option<RawFd>,
}

/// Fork the shell, take the terminal raw and run the multiplexer until the
/// shell dies or the TTY goes away. The terminal is restored on every path
/// out of here.
pub fn run(listeners: Listeners) -> Result<()> {
    let shell = std::env::var("SHELL").map_err(|_| AppError::NoShell)?;
    let ws = tty::get_winsize(0)?;
    let shell_pty = pty::spawn_shell(&shell, &ws)?;
    let mut child = shell_pty.child;

    let pty_fd = shell_pty.master.as_raw_fd();
    fcntl(&shell_pty.master, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

    let write_key = key_from_env("PSC_WRITE_KEY", DEFAULT_WRITE_KEY);
    let read_key = key_from_env("PSC_READ_KEY", DEFAULT_READ_KEY);
    let codec = Codec::new(pty_fd, pty_fd, &write_key, &read_key, Endpoint::Local);

    let now = unix_now();
    let mut table = FdTable::new();
    table.adopt_std(0, Role::Stdin, PollFlags::POLLIN, now);
    table.adopt_std(1, Role::Stdout, PollFlags::empty(), now);
    table.install(shell_pty.master, Role::Pty, PollFlags::POLLIN, now);

    for (handle, rnode) in listeners.tcp {
        let fd = table.install(handle, Role::TcpAccept, PollFlags::POLLIN, now);
        if let Some(entry) = table.entry_mut(fd) {
            entry.rnode = rnode;
        }
    }
    for (handle, rnode) in listeners.udp {
        let fd = table.install(handle, Role::UdpServer, PollFlags::POLLIN, now);
        if let Some(entry) = table.entry_mut(fd) {
            entry.rnode = rnode;
        }
    }
    if let Some(handle) = listeners.socks4 {
        table.install(handle, Role::Socks4Accept, PollFlags::POLLIN, now);
    }
    if let Some(handle) = listeners.socks5 {
        table.install(handle, Role::Socks5Accept, PollFlags::POLLIN, now);
    }
    let script_accept = listeners
        .script
        .map(|handle| table.install(handle, Role::ScriptAccept, PollFlags::POLLIN, now));

    let mut proxy = Proxy {
        table,
        codec,
        tcp_nodes: HashMap::new(),
        udp_nodes: HashMap::new(),
        pty_fd,
        script_accept,
        script_fd: None,
    };

    let raw_guard = tty::RawModeGuard::enter()?;
    let result = match proxy.event_loop() {
        // The PTY collapses when the shell dies; if SIGCHLD already fired
        // this is the orderly exit, not a failure.
        Err(AppError::TtyHangup) if signals::child_exited() => Ok(()),
        other => other,
    };
    drop(raw_guard);

    let _ = child.try_wait();
    result
}

impl Proxy {
    fn event_loop(&mut self) -> Result<()> {
        loop {
            if signals::child_exited() {
                return Ok(());
            }
            if signals::take_crypto_info() {
                let msg: &[u8] = if self.codec.is_crypted() {
                    b"\r\npscl: encryption enabled\r\n"
                } else {
                    b"\r\npscl: encryption disabled\r\n"
                };
                // Queued like any other screen output so a flow-controlled
                // stdout cannot stall the loop.
                if let Some(entry) = self.table.entry_mut(1) {
                    entry.obuf.extend_from_slice(msg);
                    entry.interest |= PollFlags::POLLOUT;
                }
            }
            // The winsize flag stays pending until the stream is encrypted;
            // geometry is only meaningful to an active remote peer.
            if signals::winsize_changed() && self.codec.is_crypted() {
                let frame = self.codec.wsize_cmd();
                self.pty_push(frame);
                signals::clear_winsize_changed();
            }

            let fds: Vec<RawFd> = self.table.active_fds().collect();
            let mut pfds: Vec<PollFd> = fds
                .iter()
                .map(|&fd| {
                    let interest = self
                        .table
                        .entry(fd)
                        .map_or(PollFlags::empty(), |e| e.interest);
                    // SAFETY: every fd here is live in the table and stays
                    // open for the duration of the poll call.
                    PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, interest)
                })
                .collect();

            match poll(&mut pfds, PollTimeout::from(1000u16)) {
                Ok(_) => {}
                Err(nix::Error::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            let revents: Vec<(RawFd, PollFlags)> = fds
                .iter()
                .zip(pfds.iter())
                .map(|(&fd, p)| (fd, p.revents().unwrap_or(PollFlags::empty())))
                .collect();
            drop(pfds);

            let now = unix_now();

            for (fd, re) in revents {
                let role = self.table.role(fd);
                if role == Role::Invalid {
                    continue;
                }

                let idle = now - self.table.entry(fd).map_or(now, |e| e.time);
                if (role == Role::Closing && idle > CLOSING_TIME)
                    || (role == Role::Connect && idle > CONNECT_TIME)
                {
                    if role == Role::Connect {
                        self.fail_tunnel(fd);
                    }
                    self.table.close(fd);
                    continue;
                }

                if re.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                    match role {
                        Role::Stdin | Role::Pty => return Err(AppError::TtyHangup),
                        Role::Connect | Role::Connected => self.fail_tunnel(fd),
                        Role::ScriptIo => self.end_script(),
                        _ => {}
                    }
                    self.table.close(fd);
                    continue;
                }

                if re.contains(PollFlags::POLLIN) {
                    self.handle_read(fd, role, now)?;
                } else if re.contains(PollFlags::POLLOUT) {
                    self.handle_write(fd, role, now)?;
                }
            }
        }
    }

    /// Queue a frame on the PTY master and arm it for writing.
    fn pty_push(&mut self, frame: Vec<u8>) {
        if frame.is_empty() {
            return;
        }
        if let Some(entry) = self.table.entry_mut(self.pty_fd) {
            entry.obuf.extend_from_slice(&frame);
            entry.interest |= PollFlags::POLLOUT;
        }
    }

    /// Tell the remote end a tunnel is gone and drop its peer key. The
    /// caller closes the descriptor.
    fn fail_tunnel(&mut self, fd: RawFd) {
        let Some(entry) = self.table.entry(fd) else {
            return;
        };
        let node = entry.rnode.clone();
        self.tcp_nodes.remove(&node);
        let frame = self.codec.possibly_b64encrypt("C:T:F:", node.as_bytes());
        self.pty_push(frame);
        debug!("tunnel_torn_down"; "node" => node);
    }

    /// Keyboard and script accept come back when the scripting client goes.
    fn end_script(&mut self) {
        self.script_fd = None;
        self.table.arm(0, PollFlags::POLLIN);
        if let Some(fd) = self.script_accept {
            self.table.arm(fd, PollFlags::POLLIN);
        }
    }

    fn handle_read(&mut self, fd: RawFd, role: Role, now: i64) -> Result<()> {
        match role {
            Role::Stdin => {
                let mut buf = [0u8; HALF_BLOCK];
                match read_raw(0, &mut buf) {
                    Err(nix::Error::EINTR) => {}
                    Ok(n) if n > 0 => {
                        let frame = self.codec.possibly_b64encrypt("D:0:", &buf[..n]);
                        self.pty_push(frame);
                    }
                    _ => return Err(AppError::TtyHangup),
                }
            }
            Role::Pty => self.drain_codec(now)?,
            Role::TcpAccept => self.accept_tunnel(fd, now),
            Role::Socks4Accept => self.accept_socks(fd, Role::Socks4Auth, now),
            Role::Socks5Accept => self.accept_socks(fd, Role::Socks5Auth1, now),
            Role::ScriptAccept => self.accept_script(fd, now),
            Role::Connected => self.tunnel_read(fd, now),
            Role::Socks4Auth => self.socks4_request(fd, now),
            Role::Socks5Auth1 => self.socks5_greeting(fd, now),
            Role::Socks5Auth2 => self.socks5_request(fd, now),
            Role::UdpServer => self.udp_read(fd, now),
            Role::ScriptIo => self.script_read(fd, now),
            _ => {}
        }
        Ok(())
    }

    /// Pull everything the codec has ready out of the PTY stream: terminal
    /// bytes go to the screen (and the script mirror), commands to the
    /// dispatcher, mode flips re-arm the window-size update.
    fn drain_codec(&mut self, now: i64) -> Result<()> {
        let mut no_syscall = false;
        loop {
            let (event, more) = self.codec.read(no_syscall)?;
            no_syscall = true;
            match event {
                Decoded::StartTls => signals::set_winsize_changed(),
                Decoded::Command(cmd) => dispatch::handle_command(
                    &cmd,
                    &mut self.table,
                    &mut self.tcp_nodes,
                    &mut self.udp_nodes,
                    now,
                ),
                Decoded::Plain(data) if !data.is_empty() => {
                    if let Some(entry) = self.table.entry_mut(1) {
                        entry.obuf.extend_from_slice(&data);
                        entry.interest |= PollFlags::POLLOUT;
                        entry.time = now;
                    }
                    if let Some(sfd) = self.script_fd {
                        if let Some(entry) = self.table.entry_mut(sfd) {
                            entry.obuf.extend_from_slice(&data);
                            entry.interest |= PollFlags::POLLOUT;
                            entry.time = now;
                        }
                    }
                }
                _ => {}
            }
            if !more {
                break;
            }
        }
        Ok(())
    }

    fn accept_fd(lfd: RawFd) -> Option<OwnedFd> {
        let afd = accept4(lfd, SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC).ok()?;
        // SAFETY: accept4 returned a fresh descriptor that nothing else owns.
        Some(unsafe { OwnedFd::from_raw_fd(afd) })
    }

    fn accept_tunnel(&mut self, lfd: RawFd, now: i64) {
        let Some(handle) = Self::accept_fd(lfd) else {
            return;
        };
        let base = self
            .table
            .entry(lfd)
            .map(|e| e.rnode.clone())
            .unwrap_or_default();
        // The accepted fd number is the session id: unique while it lives.
        let fd = self.table.install(handle, Role::Connect, PollFlags::empty(), now);
        let node = format!("{}{}/", base, fd);
        if let Some(entry) = self.table.entry_mut(fd) {
            entry.rnode = node.clone();
        }
        self.tcp_nodes.insert(node.clone(), fd);
        let frame = self.codec.possibly_b64encrypt("C:T:N:", node.as_bytes());
        self.pty_push(frame);
        debug!("tunnel_accepted"; "node" => node);
    }

    fn accept_socks(&mut self, lfd: RawFd, auth_role: Role, now: i64) {
        let Some(handle) = Self::accept_fd(lfd) else {
            return;
        };
        self.table.install(handle, auth_role, PollFlags::POLLIN, now);
    }

    fn accept_script(&mut self, lfd: RawFd, now: i64) {
        let Some(handle) = Self::accept_fd(lfd) else {
            return;
        };
        let fd = self.table.install(handle, Role::ScriptIo, PollFlags::POLLIN, now);
        self.script_fd = Some(fd);
        // One scripting client at a time; the keyboard pauses while it drives.
        self.table.disarm(lfd, PollFlags::POLLIN);
        self.table.disarm(0, PollFlags::POLLIN);
    }

    fn tunnel_read(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(n) if n > 0 => {
                let node = self
                    .table
                    .entry(fd)
                    .map(|e| e.rnode.clone())
                    .unwrap_or_default();
                let mut payload = Vec::with_capacity(node.len() + n);
                payload.extend_from_slice(node.as_bytes());
                payload.extend_from_slice(&buf[..n]);
                let frame = self.codec.possibly_b64encrypt("C:T:S:", &payload);
                self.pty_push(frame);
                if let Some(entry) = self.table.entry_mut(fd) {
                    entry.time = now;
                }
            }
            Err(nix::Error::EINTR) => {}
            _ => {
                self.fail_tunnel(fd);
                self.table.close(fd);
            }
        }
    }

    fn socks4_request(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        let n = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(n) if n > 0 => n,
            Err(nix::Error::EINTR) => return,
            _ => {
                self.table.close(fd);
                return;
            }
        };
        let Some(dest) = socks::parse_socks4(&buf[..n]) else {
            self.table.close(fd);
            return;
        };

        let reply = socks::socks4_reply(&buf[..n]);
        let node = dest.rnode(fd);
        if let Some(entry) = self.table.entry_mut(fd) {
            entry.obuf.extend_from_slice(&reply);
            entry.rnode = node.clone();
            entry.role = Role::Connect;
            entry.time = now;
            // Only the staged reply may move until the remote end connects.
            entry.interest = PollFlags::POLLOUT;
        }
        self.tcp_nodes.insert(node.clone(), fd);
        let frame = self.codec.possibly_b64encrypt("C:T:N:", node.as_bytes());
        self.pty_push(frame);
    }

    fn socks5_greeting(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        let n = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(n) if n > 0 => n,
            Err(nix::Error::EINTR) => return,
            _ => {
                self.table.close(fd);
                return;
            }
        };
        if buf[..n][0] != socks::SOCKS5_VERSION {
            self.table.close(fd);
            return;
        }
        if let Some(entry) = self.table.entry_mut(fd) {
            // No authentication; the socket is loopback-only.
            entry.obuf.extend_from_slice(&[socks::SOCKS5_VERSION, 0]);
            entry.role = Role::Socks5Auth2;
            entry.interest |= PollFlags::POLLOUT;
            entry.time = now;
        }
    }

    fn socks5_request(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        let n = match recv(fd, &mut buf, MsgFlags::empty()) {
            Ok(n) if n > 0 => n,
            Err(nix::Error::EINTR) => return,
            _ => {
                self.table.close(fd);
                return;
            }
        };
        let Some(dest) = socks::parse_socks5(&buf[..n]) else {
            let _ = write_raw(
                fd,
                &[socks::SOCKS5_VERSION, socks::SOCKS5_REP_ATYP_UNSUPPORTED],
            );
            self.table.close(fd);
            return;
        };

        let node = dest.rnode(fd);
        let reply = socks::socks5_reply(&buf[..n]);
        if let Some(entry) = self.table.entry_mut(fd) {
            entry.obuf.extend_from_slice(&reply);
            entry.rnode = node.clone();
            entry.role = Role::Connect;
            entry.time = now;
            entry.interest = PollFlags::POLLOUT;
        }
        self.tcp_nodes.insert(node.clone(), fd);
        let frame = self.codec.possibly_b64encrypt("C:T:N:", node.as_bytes());
        self.pty_push(frame);
    }

    fn udp_read(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        let (n, src) = match recvfrom::<SockaddrIn>(fd, &mut buf) {
            Ok((n, Some(src))) if n > 0 => (n, src),
            _ => return,
        };
        // The datagram's source port, kept in network byte order, is the
        // session id; replies are addressed straight back to it.
        let id = src.port().to_be();
        let base = self
            .table
            .entry(fd)
            .map(|e| e.rnode.clone())
            .unwrap_or_default();
        let key = format!("{}{}/", base, id);

        let mut payload = Vec::with_capacity(key.len() + n);
        payload.extend_from_slice(key.as_bytes());
        payload.extend_from_slice(&buf[..n]);
        let frame = self.codec.possibly_b64encrypt("C:U:S:", &payload);
        self.pty_push(frame);

        self.udp_nodes.insert(key, fd);
        if let Some(entry) = self.table.entry_mut(fd) {
            entry.time = now;
        }
    }

    fn script_read(&mut self, fd: RawFd, now: i64) {
        let mut buf = [0u8; HALF_BLOCK];
        match read_raw(fd, &mut buf) {
            Err(nix::Error::EINTR) => {}
            Ok(n) if n > 0 => {
                let frame = self.codec.possibly_b64encrypt("D:0:", &buf[..n]);
                self.pty_push(frame);
                if let Some(entry) = self.table.entry_mut(fd) {
                    entry.time = now;
                }
            }
            _ => {
                self.end_script();
                self.table.close(fd);
            }
        }
    }

    fn handle_write(&mut self, fd: RawFd, role: Role, now: i64) -> Result<()> {
        match role {
            Role::Stdout => self.flush_stdout(now)?,
            Role::Pty => self.flush_pty(now)?,
            Role::Connect | Role::Socks5Auth2 | Role::Connected | Role::Closing => {
                self.flush_tunnel(fd, role, now)
            }
            Role::UdpServer => self.flush_udp(fd, now),
            Role::ScriptIo => self.flush_script(fd, now),
            _ => {}
        }

        if let Some(entry) = self.table.entry_mut(fd) {
            if !entry.has_output() {
                entry.interest &= !PollFlags::POLLOUT;
            }
        }
        Ok(())
    }

    fn flush_stdout(&mut self, now: i64) -> Result<()> {
        let Some(entry) = self.table.entry_mut(1) else {
            return Ok(());
        };
        let n = CHUNK_SIZE.min(entry.obuf.len());
        if n == 0 {
            return Ok(());
        }
        match write_raw(1, &entry.obuf[..n]) {
            Ok(written) if written > 0 => {
                entry.obuf.advance(written);
                entry.time = now;
                Ok(())
            }
            Err(nix::Error::EINTR) => Ok(()),
            _ => Err(AppError::TtyHangup),
        }
    }

    fn flush_pty(&mut self, now: i64) -> Result<()> {
        let pty_fd = self.codec.w_fileno();
        let Some(entry) = self.table.entry_mut(pty_fd) else {
            return Ok(());
        };
        if entry.obuf.is_empty() {
            return Ok(());
        }
        match write_raw(pty_fd, &entry.obuf[..]) {
            Ok(written) if written > 0 => {
                entry.obuf.advance(written);
                entry.time = now;
                Ok(())
            }
            Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => Ok(()),
            _ => Err(AppError::TtyHangup),
        }
    }

    fn flush_tunnel(&mut self, fd: RawFd, role: Role, now: i64) {
        let result = {
            let Some(entry) = self.table.entry_mut(fd) else {
                return;
            };
            let n = CHUNK_SIZE.min(entry.obuf.len());
            if n == 0 {
                return;
            }
            write_raw(fd, &entry.obuf[..n])
        };
        match result {
            Ok(written) if written > 0 => {
                let drained = self
                    .table
                    .entry_mut(fd)
                    .map(|entry| {
                        entry.obuf.advance(written);
                        entry.time = now;
                        entry.obuf.is_empty()
                    })
                    .unwrap_or(true);
                // A finished session that has flushed everything is done.
                if role == Role::Closing && drained {
                    self.table.close(fd);
                }
            }
            Err(nix::Error::EINTR) => {}
            _ => {
                if role != Role::Closing {
                    self.fail_tunnel(fd);
                }
                self.table.close(fd);
            }
        }
    }

    fn flush_udp(&mut self, fd: RawFd, now: i64) {
        let (dgram, port) = {
            let Some(entry) = self.table.entry(fd) else {
                return;
            };
            match (entry.odgrams.front(), entry.ulports.front()) {
                (Some(d), Some(&p)) => (d.clone(), p),
                _ => return,
            }
        };
        let addr = SockaddrIn::new(127, 0, 0, 1, u16::from_be(port));
        match sendto(fd, &dgram, &addr, MsgFlags::empty()) {
            Ok(_) => {
                if let Some(entry) = self.table.entry_mut(fd) {
                    entry.odgrams.pop_front();
                    entry.ulports.pop_front();
                    entry.time = now;
                }
            }
            // Transient; the datagram stays queued for the next readiness.
            Err(_) => {}
        }
    }

    fn flush_script(&mut self, fd: RawFd, now: i64) {
        let result = {
            let Some(entry) = self.table.entry_mut(fd) else {
                return;
            };
            let n = CHUNK_SIZE.min(entry.obuf.len());
            if n == 0 {
                return;
            }
            write_raw(fd, &entry.obuf[..n])
        };
        match result {
            Ok(written) if written > 0 => {
                if let Some(entry) = self.table.entry_mut(fd) {
                    entry.obuf.advance(written);
                    entry.time = now;
                }
            }
            Err(nix::Error::EINTR) => {}
            _ => {
                self.end_script();
                self.table.close(fd);
            }
        }
    }
}
