use std::os::fd::RawFd;

use nix::pty::Winsize;
use nix::sys::termios::{
    self, LocalFlags, SetArg, SpecialCharacterIndices, Termios,
};

use crate::error::Result;

/// Current terminal geometry of `fd`.
pub fn get_winsize(fd: RawFd) -> Result<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ fills in a winsize struct and nothing else.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc == -1 {
        return Err(nix::Error::last().into());
    }
    Ok(ws)
}

/// Puts the controlling terminal into raw mode for the session and restores
/// the saved attributes when dropped, so every exit path (child death, fatal
/// error) leaves the user's terminal usable.
pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    pub fn enter() -> Result<Self> {
        let stdin = std::io::stdin();
        let saved = termios::tcgetattr(&stdin)?;

        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
        raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        // Keep ^C/^Z flowing to the remote shell rather than to us.
        raw.local_flags.remove(LocalFlags::ISIG);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        Ok(RawModeGuard { saved })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &self.saved);
    }
}
