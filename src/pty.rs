//! PTY pair allocation and shell child spawning.
//!
//! The parent keeps the master side; the child becomes a session leader with
//! the slave as its controlling terminal and execs `$SHELL`.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::pty::{openpty, OpenptyResult, Winsize};

use crate::error::Result;

pub struct ShellPty {
    pub master: OwnedFd,
    pub child: Child,
}

/// Allocate a PTY pair sized like the user's terminal and start `shell` on
/// the slave side. The slave end is closed in the parent before returning.
pub fn spawn_shell(shell: &str, ws: &Winsize) -> Result<ShellPty> {
    let OpenptyResult { master, slave } = openpty(ws, None)?;
    let slave_fd = slave.as_raw_fd();

    // openpty sets CLOEXEC on neither end, so the child must sweep every
    // descriptor above stderr or the PTY master (and anything else the
    // parent holds) leaks into the shell.
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit fills in the rlimit struct and nothing else.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    // rlim_cur can be effectively unbounded in containers; 64k covers any
    // descriptor this process could hold.
    let max_fd = rl.rlim_cur.min(65536) as libc::c_int;

    let mut cmd = Command::new(shell);
    // The child's stdio is wired up by pre_exec (dup2 to the PTY slave).
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe syscalls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            for fd in 3..max_fd {
                libc::close(fd);
            }
            Ok(())
        });
    }

    let child = cmd.spawn()?;
    drop(slave);

    Ok(ShellPty { master, child })
}
