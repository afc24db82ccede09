//! In-band codec for the PTY stream.
//!
//! Until the remote peer announces itself the stream is transparent: typed
//! bytes go out unmodified and everything read renders to the screen. The
//! announcement marker switches both directions to framed mode, where each
//! record is `tag || base64(AES-256-CTR(payload)) || "\n"`. Base64 armor
//! survives whatever line discipline mangling the outer shell channel applies;
//! the CTR keystream runs across records, one stream per direction, so both
//! ends stay in sync as long as the channel stays a FIFO.
//!
//! Noise between records (prompt echo, terminal chatter) never reaches the
//! cipher state: only lines with a known tag are decrypted, everything else
//! is dropped.

use std::os::fd::RawFd;

use aes::cipher::{KeyIvInit, StreamCipher};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use bytes::BytesMut;
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::net::read_raw;
use crate::tty;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Emitted by the remote peer when it starts; switches framing on.
pub const SESSION_BEGIN_MARK: &[u8] = b"\x1b]psc;starttls\x07";
/// Emitted (as a framed-mode line) when the remote peer exits.
pub const SESSION_END_MARK: &[u8] = b"\x1b]psc;bye\x07";

/// Record tags understood on the wire. `D:0:` is terminal data; the `C:`
/// family carries tunnel control and payloads; `C:WS:` is window geometry.
const TAGS: [&str; 7] = ["D:0:", "C:T:N:", "C:T:C:", "C:T:F:", "C:T:S:", "C:U:S:", "C:WS:"];

const READ_CHUNK: usize = 4096;

/// Which end of the session this codec sits on. Determines which key
/// encrypts and which decrypts, so two codecs built from the same key pair
/// with opposite endpoints can talk to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Local,
    #[allow(dead_code)]
    Remote,
}

/// One decode step's result.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// Terminal bytes to render.
    Plain(Vec<u8>),
    /// A full in-band command, tag included, for the dispatcher.
    Command(Vec<u8>),
    /// Framing mode flipped; the caller re-sends window geometry.
    StartTls,
    /// Nothing complete available.
    Empty,
}

pub struct Codec {
    r_fd: RawFd,
    w_fd: RawFd,
    crypted: bool,
    enc: Option<Aes256Ctr>,
    dec: Option<Aes256Ctr>,
    enc_key: [u8; 32],
    enc_iv: [u8; 16],
    dec_key: [u8; 32],
    dec_iv: [u8; 16],
    ibuf: BytesMut,
}

fn derive_key(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

fn derive_iv(key: &[u8; 32]) -> [u8; 16] {
    let digest: [u8; 32] = Sha256::digest([&key[..], b"iv"].concat()).into();
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    iv
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the longest `haystack` suffix that is a proper prefix of
/// `needle` (a marker that may still complete on the next read).
fn suffix_overlap(haystack: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().min(haystack.len() + 1);
    for k in (1..max).rev() {
        if haystack.ends_with(&needle[..k]) {
            return k;
        }
    }
    0
}

impl Codec {
    /// `write_key` encrypts local-to-remote traffic, `read_key` the reverse;
    /// a `Remote` endpoint swaps the two.
    pub fn new(r_fd: RawFd, w_fd: RawFd, write_key: &str, read_key: &str, end: Endpoint) -> Self {
        let wk = derive_key(write_key);
        let rk = derive_key(read_key);
        let (enc_key, dec_key) = match end {
            Endpoint::Local => (wk, rk),
            Endpoint::Remote => (rk, wk),
        };
        Codec {
            r_fd,
            w_fd,
            crypted: false,
            enc: None,
            dec: None,
            enc_iv: derive_iv(&enc_key),
            dec_iv: derive_iv(&dec_key),
            enc_key,
            dec_key,
            ibuf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    pub fn is_crypted(&self) -> bool {
        self.crypted
    }

    pub fn w_fileno(&self) -> RawFd {
        self.w_fd
    }

    /// Switch to framed mode with fresh keystreams. Normally driven by the
    /// in-band marker; the remote end of a session calls it directly when it
    /// announces itself.
    pub fn starttls(&mut self) {
        self.crypted = true;
        self.enc = Some(Aes256Ctr::new(&self.enc_key.into(), &self.enc_iv.into()));
        self.dec = Some(Aes256Ctr::new(&self.dec_key.into(), &self.dec_iv.into()));
    }

    fn endtls(&mut self) {
        self.crypted = false;
        self.enc = None;
        self.dec = None;
    }

    /// Produce the wire form of one record. Transparent mode passes terminal
    /// data through unframed and swallows commands (there is nobody on the
    /// other side to act on them yet).
    pub fn possibly_b64encrypt(&mut self, tag: &str, payload: &[u8]) -> Vec<u8> {
        let Some(enc) = self.enc.as_mut() else {
            if tag == "D:0:" {
                return payload.to_vec();
            }
            return Vec::new();
        };
        let mut ct = payload.to_vec();
        enc.apply_keystream(&mut ct);

        let b64 = B64.encode(&ct);
        let mut out = Vec::with_capacity(tag.len() + b64.len() + 1);
        out.extend_from_slice(tag.as_bytes());
        out.extend_from_slice(b64.as_bytes());
        out.push(b'\n');
        out
    }

    /// Current terminal geometry as a framed record (empty while transparent).
    pub fn wsize_cmd(&mut self) -> Vec<u8> {
        let Ok(ws) = tty::get_winsize(0) else {
            return Vec::new();
        };
        let payload = format!(
            "{}:{}:{}:{}",
            ws.ws_row, ws.ws_col, ws.ws_xpixel, ws.ws_ypixel
        );
        self.possibly_b64encrypt("C:WS:", payload.as_bytes())
    }

    /// Drain one decode step. With `no_syscall` the internal buffer is parsed
    /// without touching the descriptor (used on successive drains within one
    /// readiness event). The second return value is true when another call
    /// may yield more right away.
    pub fn read(&mut self, no_syscall: bool) -> Result<(Decoded, bool)> {
        if !no_syscall {
            let mut buf = [0u8; READ_CHUNK];
            match read_raw(self.r_fd, &mut buf) {
                Ok(0) => return Err(AppError::TtyHangup),
                Ok(n) => self.ibuf.extend_from_slice(&buf[..n]),
                Err(nix::Error::EAGAIN) | Err(nix::Error::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.next_event())
    }

    fn next_event(&mut self) -> (Decoded, bool) {
        if !self.crypted {
            return self.next_plain();
        }
        self.next_framed()
    }

    fn next_plain(&mut self) -> (Decoded, bool) {
        if let Some(pos) = find(&self.ibuf, SESSION_BEGIN_MARK) {
            if pos > 0 {
                let out = self.ibuf.split_to(pos).to_vec();
                return (Decoded::Plain(out), true);
            }
            let _ = self.ibuf.split_to(SESSION_BEGIN_MARK.len());
            self.starttls();
            return (Decoded::StartTls, !self.ibuf.is_empty());
        }

        // Emit what cannot be part of a half-received marker yet.
        let keep = suffix_overlap(&self.ibuf, SESSION_BEGIN_MARK);
        let emit = self.ibuf.len() - keep;
        if emit > 0 {
            let out = self.ibuf.split_to(emit).to_vec();
            return (Decoded::Plain(out), false);
        }
        (Decoded::Empty, false)
    }

    fn next_framed(&mut self) -> (Decoded, bool) {
        while let Some(pos) = find(&self.ibuf, b"\n") {
            let mut line = self.ibuf.split_to(pos + 1);
            line.truncate(pos);
            while line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            if line.is_empty() {
                continue;
            }
            if line[..] == *SESSION_END_MARK {
                self.endtls();
                return (Decoded::StartTls, !self.ibuf.is_empty());
            }
            if let Some(decoded) = self.decode_line(&line) {
                let more = !self.ibuf.is_empty();
                return (decoded, more);
            }
            // Channel noise between records; never touches cipher state.
        }
        (Decoded::Empty, false)
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<Decoded> {
        let tag = TAGS
            .iter()
            .find(|t| line.starts_with(t.as_bytes()))
            .copied()?;
        let mut payload = B64.decode(&line[tag.len()..]).ok()?;
        self.dec.as_mut()?.apply_keystream(&mut payload);

        if tag == "D:0:" {
            return Some(Decoded::Plain(payload));
        }
        let mut cmd = Vec::with_capacity(tag.len() + payload.len());
        cmd.extend_from_slice(tag.as_bytes());
        cmd.extend_from_slice(&payload);
        Some(Decoded::Command(cmd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::os::fd::{AsRawFd, OwnedFd};

    fn nonblocking_pipe() -> (OwnedFd, File) {
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            &r,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();
        (r, File::from(w))
    }

    fn local_codec(r_fd: RawFd) -> Codec {
        Codec::new(r_fd, r_fd, "wkey", "rkey", Endpoint::Local)
    }

    /// The peer's encoder: same keys, opposite endpoint, framing enabled.
    fn remote_encoder() -> Codec {
        let mut c = Codec::new(-1, -1, "wkey", "rkey", Endpoint::Remote);
        c.starttls();
        c
    }

    #[test]
    fn test_transparent_passthrough() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());

        w.write_all(b"login: ").unwrap();
        let (ev, more) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::Plain(b"login: ".to_vec()));
        assert!(!more);
        assert!(!codec.is_crypted());
    }

    #[test]
    fn test_transparent_encode_is_raw() {
        let (r, _w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());
        assert_eq!(codec.possibly_b64encrypt("D:0:", b"ls\n"), b"ls\n".to_vec());
        // Commands have no receiver yet.
        assert!(codec.possibly_b64encrypt("C:T:N:", b"1.2.3.4/80/5/").is_empty());
        assert!(codec.wsize_cmd().is_empty());
    }

    #[test]
    fn test_starttls_marker_enables_framing() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());

        w.write_all(b"motd")
            .and_then(|_| w.write_all(SESSION_BEGIN_MARK))
            .unwrap();

        let (ev, more) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::Plain(b"motd".to_vec()));
        assert!(more);
        let (ev, _) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        assert!(codec.is_crypted());
    }

    #[test]
    fn test_marker_split_across_reads() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());

        let (head, tail) = SESSION_BEGIN_MARK.split_at(5);
        w.write_all(head).unwrap();
        let (ev, _) = codec.read(false).unwrap();
        // A marker prefix is held back, not rendered.
        assert_eq!(ev, Decoded::Empty);

        w.write_all(tail).unwrap();
        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
    }

    #[test]
    fn test_framed_command_roundtrip() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());
        let mut peer = remote_encoder();

        w.write_all(SESSION_BEGIN_MARK).unwrap();
        let frame = peer.possibly_b64encrypt("C:T:C:", b"10.0.0.1/22/7/");
        w.write_all(&frame).unwrap();

        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        let (ev, _) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::Command(b"C:T:C:10.0.0.1/22/7/".to_vec()));
    }

    #[test]
    fn test_framed_data_and_binary_payload() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());
        let mut peer = remote_encoder();

        w.write_all(SESSION_BEGIN_MARK).unwrap();
        let payload = [b'x', 0, b'\n', 0xff, b'y'];
        let mut body = b"1.2.3.4/80/5/".to_vec();
        body.extend_from_slice(&payload);
        w.write_all(&peer.possibly_b64encrypt("D:0:", b"shell output"))
            .unwrap();
        w.write_all(&peer.possibly_b64encrypt("C:T:S:", &body))
            .unwrap();

        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        let (ev, more) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::Plain(b"shell output".to_vec()));
        assert!(more);
        let (ev, _) = codec.read(true).unwrap();
        let mut expected = b"C:T:S:".to_vec();
        expected.extend_from_slice(&body);
        assert_eq!(ev, Decoded::Command(expected));
    }

    #[test]
    fn test_noise_between_records_is_dropped() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());
        let mut peer = remote_encoder();

        w.write_all(SESSION_BEGIN_MARK).unwrap();
        w.write_all(b"stray prompt echo\r\n").unwrap();
        w.write_all(&peer.possibly_b64encrypt("D:0:", b"ok")).unwrap();

        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        let (ev, _) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::Plain(b"ok".to_vec()));
    }

    #[test]
    fn test_end_mark_returns_to_transparent() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());

        w.write_all(SESSION_BEGIN_MARK).unwrap();
        w.write_all(SESSION_END_MARK).unwrap();
        w.write_all(b"\n$ ").unwrap();

        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        let (ev, _) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        assert!(!codec.is_crypted());
        let (ev, _) = codec.read(true).unwrap();
        assert_eq!(ev, Decoded::Plain(b"$ ".to_vec()));
    }

    #[test]
    fn test_keystream_survives_multiple_records() {
        let (r, mut w) = nonblocking_pipe();
        let mut codec = local_codec(r.as_raw_fd());
        let mut peer = remote_encoder();

        w.write_all(SESSION_BEGIN_MARK).unwrap();
        for i in 0..5u8 {
            let msg = format!("chunk {}", i);
            w.write_all(&peer.possibly_b64encrypt("D:0:", msg.as_bytes()))
                .unwrap();
        }
        let (ev, _) = codec.read(false).unwrap();
        assert_eq!(ev, Decoded::StartTls);
        for i in 0..5u8 {
            let (ev, _) = codec.read(true).unwrap();
            assert_eq!(ev, Decoded::Plain(format!("chunk {}", i).into_bytes()));
        }
    }
}
