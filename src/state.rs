//! The fd-indexed state table driving the event loop.
//!
//! Every live descriptor owns one slot, indexed by its raw fd number, so the
//! loop gets O(1) access without hashing on the hot path. The table grows on
//! demand up to whatever the process rlimit allows and keeps a high watermark
//! by scanning from the top.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use bytes::BytesMut;
use nix::poll::PollFlags;

/// What a descriptor currently is to the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Invalid,
    Stdin,
    Stdout,
    Pty,
    /// Plain `-T` TCP listener.
    TcpAccept,
    /// `-U` UDP socket; carries all sessions for its port.
    UdpServer,
    Socks4Accept,
    Socks5Accept,
    ScriptAccept,
    /// Accepted SOCKS4 client, waiting for its request.
    Socks4Auth,
    /// Accepted SOCKS5 client, waiting for method selection.
    Socks5Auth1,
    /// SOCKS5 client, method reply staged, waiting for the connect request.
    Socks5Auth2,
    /// Local end accepted; remote has not yet confirmed its outbound connect.
    Connect,
    /// Remote confirmed; data flows both ways.
    Connected,
    /// Remote finished; draining what is left, then retiring.
    Closing,
    /// The single active scripting connection.
    ScriptIo,
}

/// Per-descriptor record. `handle` owns descriptors the table must close;
/// stdin/stdout are process-global and tracked without ownership.
#[derive(Debug)]
pub struct FdEntry {
    pub role: Role,
    /// Peer key `"ip/port/id/"` for tunneled sessions, destination prefix
    /// `"ip/port/"` for listeners.
    pub rnode: String,
    /// Pending stream output.
    pub obuf: BytesMut,
    /// Pending outbound UDP payloads, lock-step with `ulports`.
    pub odgrams: VecDeque<Vec<u8>>,
    /// Destination ports (network byte order) for each queued datagram.
    pub ulports: VecDeque<u16>,
    /// Last activity, seconds since the epoch.
    pub time: i64,
    /// Readiness interest rebuilt into the poll set each iteration.
    pub interest: PollFlags,
    handle: Option<OwnedFd>,
}

impl Default for FdEntry {
    fn default() -> Self {
        FdEntry {
            role: Role::Invalid,
            rnode: String::new(),
            obuf: BytesMut::new(),
            odgrams: VecDeque::new(),
            ulports: VecDeque::new(),
            time: 0,
            interest: PollFlags::empty(),
            handle: None,
        }
    }
}

impl FdEntry {
    pub fn has_output(&self) -> bool {
        !self.obuf.is_empty() || !self.odgrams.is_empty()
    }
}

pub struct FdTable {
    slots: Vec<FdEntry>,
}

impl FdTable {
    pub fn new() -> Self {
        FdTable { slots: Vec::new() }
    }

    fn ensure(&mut self, fd: RawFd) {
        let need = fd as usize + 1;
        if self.slots.len() < need {
            self.slots.resize_with(need, FdEntry::default);
        }
    }

    /// Track a descriptor the table owns; its slot index is the fd number and
    /// the fd is closed exactly once, when the slot is cleared.
    pub fn install(
        &mut self,
        handle: OwnedFd,
        role: Role,
        interest: PollFlags,
        now: i64,
    ) -> RawFd {
        let fd = handle.as_raw_fd();
        self.ensure(fd);
        let entry = &mut self.slots[fd as usize];
        *entry = FdEntry::default();
        entry.role = role;
        entry.interest = interest;
        entry.time = now;
        entry.handle = Some(handle);
        fd
    }

    /// Track stdin/stdout, which the table polls but never closes.
    pub fn adopt_std(&mut self, fd: RawFd, role: Role, interest: PollFlags, now: i64) {
        self.ensure(fd);
        let entry = &mut self.slots[fd as usize];
        *entry = FdEntry::default();
        entry.role = role;
        entry.interest = interest;
        entry.time = now;
    }

    pub fn entry(&self, fd: RawFd) -> Option<&FdEntry> {
        self.slots.get(fd as usize)
    }

    pub fn entry_mut(&mut self, fd: RawFd) -> Option<&mut FdEntry> {
        self.slots.get_mut(fd as usize)
    }

    pub fn role(&self, fd: RawFd) -> Role {
        self.entry(fd).map_or(Role::Invalid, |e| e.role)
    }

    /// Clear a slot, dropping (and thereby closing) the owned descriptor.
    pub fn close(&mut self, fd: RawFd) {
        if let Some(entry) = self.slots.get_mut(fd as usize) {
            *entry = FdEntry::default();
        }
    }

    /// Highest fd with a live slot. The poll set covers `0..=max_fd()`.
    pub fn max_fd(&self) -> RawFd {
        for i in (0..self.slots.len()).rev() {
            if self.slots[i].role != Role::Invalid {
                return i as RawFd;
            }
        }
        0
    }

    pub fn arm(&mut self, fd: RawFd, flags: PollFlags) {
        if let Some(entry) = self.slots.get_mut(fd as usize) {
            entry.interest |= flags;
        }
    }

    pub fn disarm(&mut self, fd: RawFd, flags: PollFlags) {
        if let Some(entry) = self.slots.get_mut(fd as usize) {
            entry.interest &= !flags;
        }
    }

    /// Live descriptors in ascending fd order.
    pub fn active_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role != Role::Invalid)
            .map(|(i, _)| i as RawFd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_fd() -> OwnedFd {
        let (r, w) = nix::unistd::pipe().unwrap();
        drop(w);
        r
    }

    #[test]
    fn test_install_indexes_by_fd_number() {
        let mut table = FdTable::new();
        let handle = dummy_fd();
        let raw = handle.as_raw_fd();
        let fd = table.install(handle, Role::Connect, PollFlags::empty(), 1);
        assert_eq!(fd, raw);
        assert_eq!(table.role(fd), Role::Connect);
        assert_eq!(table.max_fd(), fd);
    }

    #[test]
    fn test_close_clears_slot_and_watermark() {
        let mut table = FdTable::new();
        table.adopt_std(0, Role::Stdin, PollFlags::POLLIN, 1);
        let fd = table.install(dummy_fd(), Role::Connected, PollFlags::POLLIN, 1);
        assert_eq!(table.max_fd(), fd);
        table.close(fd);
        assert_eq!(table.role(fd), Role::Invalid);
        assert_eq!(table.max_fd(), 0);
    }

    #[test]
    fn test_arm_disarm_interest() {
        let mut table = FdTable::new();
        let fd = table.install(dummy_fd(), Role::Connected, PollFlags::POLLIN, 1);
        table.arm(fd, PollFlags::POLLOUT);
        assert_eq!(
            table.entry(fd).unwrap().interest,
            PollFlags::POLLIN | PollFlags::POLLOUT
        );
        table.disarm(fd, PollFlags::POLLOUT);
        assert_eq!(table.entry(fd).unwrap().interest, PollFlags::POLLIN);
    }

    #[test]
    fn test_dgram_queues_stay_lock_step() {
        let mut table = FdTable::new();
        let fd = table.install(dummy_fd(), Role::UdpServer, PollFlags::POLLIN, 1);
        let entry = table.entry_mut(fd).unwrap();
        entry.odgrams.push_back(b"abc".to_vec());
        entry.ulports.push_back(40000u16.to_be());
        assert_eq!(entry.odgrams.len(), entry.ulports.len());
        assert!(entry.has_output());
    }
}
