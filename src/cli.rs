use std::path::PathBuf;

use clap::{ArgAction, Parser};

#[derive(Parser)]
#[command(
    name = "pscl",
    about = "TCP/UDP forwarding and SOCKS proxying across an existing PTY session",
    version
)]
pub struct Cli {
    /// Listen for SOCKS4 clients on this local port
    #[arg(short = '4', value_name = "PORT", action = ArgAction::Append)]
    pub socks4: Vec<u16>,

    /// Listen for SOCKS5 clients on this local port
    #[arg(short = '5', value_name = "PORT", action = ArgAction::Append)]
    pub socks5: Vec<u16>,

    /// Forward a local TCP port to ip:rport at the remote end
    #[arg(short = 'T', value_name = "LPORT:[IP]:RPORT", action = ArgAction::Append)]
    pub tcp: Vec<String>,

    /// Forward a local UDP port to ip:rport at the remote end
    #[arg(short = 'U', value_name = "LPORT:[IP]:RPORT", action = ArgAction::Append)]
    pub udp: Vec<String>,

    /// Unix socket whose input is injected into the session as if typed
    #[arg(short = 'S', value_name = "PATH", action = ArgAction::Append)]
    pub script: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    /// Append diagnostics to this file instead of stderr
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,
}

/// One `-T`/`-U` forward: local listen port plus the remote destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub lport: u16,
    pub ip: String,
    pub rport: u16,
}

impl Forward {
    /// Destination prefix as it travels inside in-band records: `"ip/rport/"`.
    pub fn rnode(&self) -> String {
        format!("{}/{}/", self.ip, self.rport)
    }
}

/// Parse `lport:[ip]:rport`. The brackets are literal, which keeps IPv6
/// destinations unambiguous (`5000:[::1]:22`).
pub fn parse_forward(spec: &str) -> Option<Forward> {
    let (lport, rest) = spec.split_once(":[")?;
    let (ip, rport) = rest.rsplit_once("]:")?;
    if ip.is_empty() {
        return None;
    }
    let lport = lport.parse().ok()?;
    let rport = rport.parse().ok()?;
    Some(Forward {
        lport,
        ip: ip.to_string(),
        rport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forward_ipv4() {
        let f = parse_forward("5000:[10.0.0.1]:22").unwrap();
        assert_eq!(f.lport, 5000);
        assert_eq!(f.ip, "10.0.0.1");
        assert_eq!(f.rport, 22);
        assert_eq!(f.rnode(), "10.0.0.1/22/");
    }

    #[test]
    fn test_parse_forward_ipv6() {
        let f = parse_forward("5353:[::1]:53").unwrap();
        assert_eq!(f.ip, "::1");
        assert_eq!(f.rnode(), "::1/53/");
    }

    #[test]
    fn test_parse_forward_hostname() {
        let f = parse_forward("8080:[internal.example]:80").unwrap();
        assert_eq!(f.ip, "internal.example");
    }

    #[test]
    fn test_parse_forward_rejects_malformed() {
        assert!(parse_forward("5000:10.0.0.1:22").is_none());
        assert!(parse_forward("5000:[]:22").is_none());
        assert!(parse_forward("x:[::1]:22").is_none());
        assert!(parse_forward("5000:[::1]:y").is_none());
        assert!(parse_forward("70000:[::1]:22").is_none());
        assert!(parse_forward("").is_none());
    }
}
