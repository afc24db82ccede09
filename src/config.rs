use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use slog_scope::warn;

use crate::cli::{parse_forward, Cli};
use crate::net;

/// Run configuration, assembled once from the CLI and read-only afterwards.
/// Listen maps are ordered by local port; the value is the `"ip/rport/"`
/// destination prefix embedded in in-band records.
#[derive(Debug, Default)]
pub struct Config {
    pub tcp_listens: BTreeMap<u16, String>,
    pub udp_listens: BTreeMap<u16, String>,
    pub socks4_port: Option<u16>,
    pub socks5_port: Option<u16>,
    pub script_path: Option<PathBuf>,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Self {
        let mut cfg = Config::default();

        for spec in &cli.tcp {
            match parse_forward(spec) {
                Some(f) => {
                    println!(
                        "pscl: set up local TCP port {} to proxy to {}:{} @ remote.",
                        f.lport, f.ip, f.rport
                    );
                    cfg.tcp_listens.insert(f.lport, f.rnode());
                }
                None => warn!("forward_spec_ignored"; "spec" => spec.as_str()),
            }
        }
        for spec in &cli.udp {
            match parse_forward(spec) {
                Some(f) => {
                    println!(
                        "pscl: set up local UDP port {} to proxy to {}:{} @ remote.",
                        f.lport, f.ip, f.rport
                    );
                    cfg.udp_listens.insert(f.lport, f.rnode());
                }
                None => warn!("forward_spec_ignored"; "spec" => spec.as_str()),
            }
        }

        // -4/-5/-S accept a single value; repeats are ignored.
        cfg.socks4_port = cli.socks4.first().copied();
        cfg.socks5_port = cli.socks5.first().copied();
        cfg.script_path = cli.script.first().cloned();
        cfg
    }
}

/// The bound, non-blocking listening sockets the proxy loop starts from.
pub struct Listeners {
    pub tcp: Vec<(OwnedFd, String)>,
    pub udp: Vec<(OwnedFd, String)>,
    pub socks4: Option<OwnedFd>,
    pub socks5: Option<OwnedFd>,
    pub script: Option<OwnedFd>,
}

/// Bind everything the config asks for. A port that cannot be bound is
/// reported and skipped; the session still starts with the remaining ones.
pub fn bind_listeners(cfg: &Config) -> Listeners {
    let mut set = Listeners {
        tcp: Vec::new(),
        udp: Vec::new(),
        socks4: None,
        socks5: None,
        script: None,
    };

    for (lport, rnode) in &cfg.tcp_listens {
        match net::tcp_listen("127.0.0.1", *lport) {
            Ok(fd) => set.tcp.push((fd, rnode.clone())),
            Err(e) => warn!("tcp_listen_failed"; "port" => *lport, "error" => e.to_string()),
        }
    }
    for (lport, rnode) in &cfg.udp_listens {
        match net::udp_listen("127.0.0.1", *lport) {
            Ok(fd) => set.udp.push((fd, rnode.clone())),
            Err(e) => warn!("udp_listen_failed"; "port" => *lport, "error" => e.to_string()),
        }
    }

    if let Some(port) = cfg.socks4_port {
        match net::tcp_listen("127.0.0.1", port) {
            Ok(fd) => {
                println!("pscl: set up SOCKS4 port on {}", port);
                set.socks4 = Some(fd);
            }
            Err(e) => warn!("socks4_listen_failed"; "port" => port, "error" => e.to_string()),
        }
    }
    if let Some(port) = cfg.socks5_port {
        match net::tcp_listen("127.0.0.1", port) {
            Ok(fd) => {
                println!("pscl: set up SOCKS5 port on {}", port);
                set.socks5 = Some(fd);
            }
            Err(e) => warn!("socks5_listen_failed"; "port" => port, "error" => e.to_string()),
        }
    }
    if let Some(path) = &cfg.script_path {
        match net::unix_listen(path) {
            Ok(fd) => {
                println!("pscl: set up script socket on {}", path.display());
                set.script = Some(fd);
            }
            Err(e) => warn!(
                "script_listen_failed";
                "path" => path.display().to_string(),
                "error" => e.to_string()
            ),
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_config_from_cli_accumulates_forwards() {
        let cli = Cli::parse_from([
            "pscl",
            "-T",
            "5000:[10.0.0.1]:22",
            "-T",
            "5001:[10.0.0.2]:80",
            "-U",
            "5353:[10.0.0.2]:53",
        ]);
        let cfg = Config::from_cli(&cli);
        assert_eq!(cfg.tcp_listens.len(), 2);
        assert_eq!(cfg.tcp_listens[&5000], "10.0.0.1/22/");
        assert_eq!(cfg.tcp_listens[&5001], "10.0.0.2/80/");
        assert_eq!(cfg.udp_listens[&5353], "10.0.0.2/53/");
    }

    #[test]
    fn test_config_first_socks_port_wins() {
        let cli = Cli::parse_from(["pscl", "-5", "1080", "-5", "1081", "-4", "1090"]);
        let cfg = Config::from_cli(&cli);
        assert_eq!(cfg.socks5_port, Some(1080));
        assert_eq!(cfg.socks4_port, Some(1090));
    }
}
