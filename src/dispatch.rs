//! Dispatcher for in-band commands arriving from the remote end.
//!
//! Commands reference sessions by their textual peer key; anything
//! unrecognized or malformed is dropped so one bad record can never disturb
//! the other sessions sharing the stream.

use std::collections::HashMap;
use std::os::fd::RawFd;

use nix::poll::PollFlags;
use slog_scope::debug;

use crate::state::{FdTable, Role};

/// Split `"ip/port/id/<data>"` into the peer key (trailing slash included)
/// and the remaining payload.
fn split_node(rest: &[u8]) -> Option<(&str, &[u8])> {
    let mut slashes = 0;
    for (i, &b) in rest.iter().enumerate() {
        if b == b'/' {
            slashes += 1;
            if slashes == 3 {
                let key = std::str::from_utf8(&rest[..=i]).ok()?;
                return Some((key, &rest[i + 1..]));
            }
        }
    }
    None
}

/// Act on one decoded command.
pub fn handle_command(
    cmd: &[u8],
    table: &mut FdTable,
    tcp_nodes: &mut HashMap<String, RawFd>,
    udp_nodes: &mut HashMap<String, RawFd>,
    now: i64,
) {
    if let Some(rest) = cmd.strip_prefix(b"C:T:C:".as_slice()) {
        // Remote side opened the outbound connection; start accepting data.
        let Ok(node) = std::str::from_utf8(rest) else {
            return;
        };
        let Some(&fd) = tcp_nodes.get(node) else {
            return;
        };
        if let Some(entry) = table.entry_mut(fd) {
            if entry.role == Role::Connect {
                entry.role = Role::Connected;
                entry.interest |= PollFlags::POLLIN;
                entry.time = now;
                debug!("tunnel_connected"; "node" => node);
            }
        }
    } else if let Some(rest) = cmd.strip_prefix(b"C:T:F:".as_slice()) {
        // Remote side finished or failed; drain what is queued, then retire.
        let Ok(node) = std::str::from_utf8(rest) else {
            return;
        };
        let Some(fd) = tcp_nodes.remove(node) else {
            return;
        };
        if let Some(entry) = table.entry_mut(fd) {
            entry.role = Role::Closing;
            entry.interest &= !PollFlags::POLLIN;
            entry.time = now;
            debug!("tunnel_finished"; "node" => node);
        }
    } else if let Some(rest) = cmd.strip_prefix(b"C:T:S:".as_slice()) {
        let Some((node, data)) = split_node(rest) else {
            return;
        };
        let Some(&fd) = tcp_nodes.get(node) else {
            return;
        };
        if let Some(entry) = table.entry_mut(fd) {
            if matches!(entry.role, Role::Connect | Role::Connected) {
                entry.obuf.extend_from_slice(data);
                entry.interest |= PollFlags::POLLOUT;
                entry.time = now;
            }
        }
    } else if let Some(rest) = cmd.strip_prefix(b"C:U:S:".as_slice()) {
        let Some((node, data)) = split_node(rest) else {
            return;
        };
        // The key's last field is the reply port, kept in network byte order.
        let Some(port) = node
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
        else {
            return;
        };
        let Some(&fd) = udp_nodes.get(node) else {
            return;
        };
        if let Some(entry) = table.entry_mut(fd) {
            if entry.role == Role::UdpServer {
                entry.odgrams.push_back(data.to_vec());
                entry.ulports.push_back(port);
                entry.interest |= PollFlags::POLLOUT;
                entry.time = now;
            }
        }
    }
    // Unknown tags fall through silently (forward compatible).
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;

    fn dummy_fd() -> OwnedFd {
        let (r, w) = nix::unistd::pipe().unwrap();
        drop(w);
        r
    }

    struct Fixture {
        table: FdTable,
        tcp: HashMap<String, RawFd>,
        udp: HashMap<String, RawFd>,
    }

    fn fixture_with_connect(node: &str) -> (Fixture, RawFd) {
        let mut table = FdTable::new();
        let fd = table.install(dummy_fd(), Role::Connect, PollFlags::empty(), 1);
        table.entry_mut(fd).unwrap().rnode = node.to_string();
        let mut tcp = HashMap::new();
        tcp.insert(node.to_string(), fd);
        (
            Fixture {
                table,
                tcp,
                udp: HashMap::new(),
            },
            fd,
        )
    }

    #[test]
    fn test_connect_confirmation_arms_read() {
        let (mut fx, fd) = fixture_with_connect("10.0.0.1/22/5/");
        handle_command(
            b"C:T:C:10.0.0.1/22/5/",
            &mut fx.table,
            &mut fx.tcp,
            &mut fx.udp,
            7,
        );
        let entry = fx.table.entry(fd).unwrap();
        assert_eq!(entry.role, Role::Connected);
        assert!(entry.interest.contains(PollFlags::POLLIN));
        assert_eq!(entry.time, 7);
        assert_eq!(fx.tcp["10.0.0.1/22/5/"], fd);
    }

    #[test]
    fn test_finish_moves_to_closing_and_clears_key() {
        let (mut fx, fd) = fixture_with_connect("10.0.0.1/22/5/");
        fx.table.entry_mut(fd).unwrap().role = Role::Connected;
        handle_command(
            b"C:T:F:10.0.0.1/22/5/",
            &mut fx.table,
            &mut fx.tcp,
            &mut fx.udp,
            9,
        );
        assert_eq!(fx.table.role(fd), Role::Closing);
        assert!(!fx.tcp.contains_key("10.0.0.1/22/5/"));
        assert!(!fx.table.entry(fd).unwrap().interest.contains(PollFlags::POLLIN));
    }

    #[test]
    fn test_stream_data_buffers_and_arms_write() {
        let (mut fx, fd) = fixture_with_connect("10.0.0.1/22/5/");
        fx.table.entry_mut(fd).unwrap().role = Role::Connected;
        let mut cmd = b"C:T:S:10.0.0.1/22/5/".to_vec();
        cmd.extend_from_slice(&[1, 2, b'\n', 3]);
        handle_command(&cmd, &mut fx.table, &mut fx.tcp, &mut fx.udp, 3);
        let entry = fx.table.entry(fd).unwrap();
        assert_eq!(&entry.obuf[..], &[1, 2, b'\n', 3]);
        assert!(entry.interest.contains(PollFlags::POLLOUT));
    }

    #[test]
    fn test_udp_reply_queues_lock_step() {
        let mut table = FdTable::new();
        let fd = table.install(dummy_fd(), Role::UdpServer, PollFlags::POLLIN, 1);
        let mut udp = HashMap::new();
        let port_id = 40000u16.to_be();
        let key = format!("10.0.0.2/53/{}/", port_id);
        udp.insert(key.clone(), fd);
        let mut tcp = HashMap::new();

        let mut cmd = format!("C:U:S:{}", key).into_bytes();
        cmd.extend_from_slice(b"dns reply");
        handle_command(&cmd, &mut table, &mut tcp, &mut udp, 4);

        let entry = table.entry(fd).unwrap();
        assert_eq!(entry.odgrams.len(), 1);
        assert_eq!(entry.ulports.len(), 1);
        assert_eq!(entry.odgrams[0], b"dns reply".to_vec());
        assert_eq!(entry.ulports[0], port_id);
        assert!(entry.interest.contains(PollFlags::POLLOUT));
    }

    #[test]
    fn test_unknown_and_malformed_commands_ignored() {
        let (mut fx, fd) = fixture_with_connect("10.0.0.1/22/5/");
        handle_command(b"C:X:?:what", &mut fx.table, &mut fx.tcp, &mut fx.udp, 1);
        handle_command(b"C:T:S:no-key-here", &mut fx.table, &mut fx.tcp, &mut fx.udp, 1);
        handle_command(
            b"C:T:C:1.2.3.4/9/9/",
            &mut fx.table,
            &mut fx.tcp,
            &mut fx.udp,
            1,
        );
        assert_eq!(fx.table.role(fd), Role::Connect);
        assert!(fx.table.entry(fd).unwrap().obuf.is_empty());
    }

    #[test]
    fn test_split_node() {
        let (key, data) = split_node(b"::1/80/9/payload").unwrap();
        assert_eq!(key, "::1/80/9/");
        assert_eq!(data, b"payload");
        assert!(split_node(b"only/two/").is_none());
    }
}
