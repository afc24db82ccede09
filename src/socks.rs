//! SOCKS4 and SOCKS5 request validation.
//!
//! Only the CONNECT path is served: the destination is not dialed locally but
//! forwarded to the remote end of the PTY session, so the handshake replies
//! are staged optimistically and data is held back until the remote confirms.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS4_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;
pub const SOCKS4_GRANTED: u8 = 0x5a;
pub const SOCKS5_REP_ATYP_UNSUPPORTED: u8 = 0x08;

/// Destination extracted from a SOCKS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksDest {
    pub addr: IpAddr,
    pub port: u16,
}

impl SocksDest {
    /// Peer key for this destination as owned by descriptor `fd`.
    pub fn rnode(&self, fd: i32) -> String {
        format!("{}/{}/{}/", self.addr, self.port, fd)
    }
}

/// Validate a SOCKS4 CONNECT request. Expects at least the 8 fixed bytes;
/// the trailing user id is ignored.
pub fn parse_socks4(buf: &[u8]) -> Option<SocksDest> {
    if buf.len() < 8 || buf[0] != SOCKS4_VERSION {
        return None;
    }
    let port = u16::from_be_bytes([buf[2], buf[3]]);
    let addr = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    Some(SocksDest {
        addr: IpAddr::V4(addr),
        port,
    })
}

/// SOCKS4 reply: the first 8 request bytes with version zeroed and the
/// command byte set to "granted".
pub fn socks4_reply(req: &[u8]) -> [u8; 8] {
    let mut reply = [0u8; 8];
    reply[..8].copy_from_slice(&req[..8]);
    reply[0] = 0;
    reply[1] = SOCKS4_GRANTED;
    reply
}

/// Validate a SOCKS5 CONNECT request (`VER CMD RSV ATYP ADDR PORT`). Only
/// IPv4 and IPv6 address types are accepted; anything else is answered with
/// "address type not supported" by the caller.
pub fn parse_socks5(buf: &[u8]) -> Option<SocksDest> {
    if buf.len() < 10 || buf[0] != SOCKS5_VERSION || buf[1] != CMD_CONNECT {
        return None;
    }
    match buf[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = buf[4..8].try_into().ok()?;
            let port = u16::from_be_bytes([buf[8], buf[9]]);
            Some(SocksDest {
                addr: IpAddr::V4(Ipv4Addr::from(octets)),
                port,
            })
        }
        ATYP_IPV6 => {
            if buf.len() < 22 {
                return None;
            }
            let octets: [u8; 16] = buf[4..20].try_into().ok()?;
            let port = u16::from_be_bytes([buf[20], buf[21]]);
            Some(SocksDest {
                addr: IpAddr::V6(Ipv6Addr::from(octets)),
                port,
            })
        }
        _ => None,
    }
}

/// SOCKS5 success reply: the request echoed back with the command byte
/// cleared, so the client sees the destination it asked for.
pub fn socks5_reply(req: &[u8]) -> Vec<u8> {
    let mut reply = req.to_vec();
    reply[1] = 0;
    reply
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks4_connect() {
        // 10.0.0.1:22, empty user id
        let req = [4u8, 1, 0, 22, 10, 0, 0, 1, 0];
        let dest = parse_socks4(&req).unwrap();
        assert_eq!(dest.addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(dest.port, 22);
        assert_eq!(dest.rnode(7), "10.0.0.1/22/7/");

        let reply = socks4_reply(&req);
        assert_eq!(reply[0], 0);
        assert_eq!(reply[1], SOCKS4_GRANTED);
        assert_eq!(&reply[2..8], &req[2..8]);
    }

    #[test]
    fn test_socks4_wrong_version() {
        let req = [5u8, 1, 0, 22, 10, 0, 0, 1];
        assert!(parse_socks4(&req).is_none());
    }

    #[test]
    fn test_socks4_short_request() {
        assert!(parse_socks4(&[4u8, 1, 0]).is_none());
    }

    #[test]
    fn test_socks5_ipv4_connect() {
        let req = [5u8, 1, 0, 1, 127, 0, 0, 1, 0x1f, 0x90];
        let dest = parse_socks5(&req).unwrap();
        assert_eq!(dest.addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(dest.port, 8080);
    }

    #[test]
    fn test_socks5_ipv6_connect() {
        let mut req = vec![5u8, 1, 0, 4];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&80u16.to_be_bytes());
        let dest = parse_socks5(&req).unwrap();
        assert_eq!(dest.addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(dest.port, 80);
        assert_eq!(dest.rnode(9), "::1/80/9/");
    }

    #[test]
    fn test_socks5_rejects_bind_and_domain() {
        // cmd=2 (BIND)
        let req = [5u8, 2, 0, 1, 127, 0, 0, 1, 0, 80];
        assert!(parse_socks5(&req).is_none());
        // atype=3 (domain)
        let req = [5u8, 1, 0, 3, 4, b'h', b'o', b's', b't', 0, 80];
        assert!(parse_socks5(&req).is_none());
    }

    #[test]
    fn test_socks5_truncated_ipv6() {
        let req = [5u8, 1, 0, 4, 0, 0, 0, 0, 0, 80];
        assert!(parse_socks5(&req).is_none());
    }

    #[test]
    fn test_socks5_reply_echoes_request() {
        let req = [5u8, 1, 0, 1, 127, 0, 0, 1, 0, 80];
        let reply = socks5_reply(&req);
        assert_eq!(reply[1], 0);
        assert_eq!(reply.len(), req.len());
        assert_eq!(&reply[2..], &req[2..]);
    }
}
