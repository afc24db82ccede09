//! Signal plumbing. Handlers only flip atomic flags; the event loop consumes
//! them at the top of each iteration.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::error::Result;

static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static WINSIZE_CHANGED: AtomicBool = AtomicBool::new(false);
static CRYPTO_INFO: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigchld(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigwinch(_: libc::c_int) {
    WINSIZE_CHANGED.store(true, Ordering::SeqCst);
}

extern "C" fn on_sigusr1(_: libc::c_int) {
    CRYPTO_INFO.store(true, Ordering::SeqCst);
}

/// Install the session's handlers: SIGCHLD/SIGWINCH/SIGUSR1 set flags,
/// SIGINT/SIGQUIT/SIGPIPE are ignored so the corresponding control bytes pass
/// through to the remote shell.
pub fn install() -> Result<()> {
    let flag = |handler| SigAction::new(handler, SaFlags::SA_RESTART, SigSet::empty());

    // SAFETY: the handlers above only store to atomics.
    unsafe {
        sigaction(Signal::SIGCHLD, &flag(SigHandler::Handler(on_sigchld)))?;
        sigaction(Signal::SIGWINCH, &flag(SigHandler::Handler(on_sigwinch)))?;
        sigaction(Signal::SIGUSR1, &flag(SigHandler::Handler(on_sigusr1)))?;

        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        sigaction(Signal::SIGINT, &ignore)?;
        sigaction(Signal::SIGQUIT, &ignore)?;
        sigaction(Signal::SIGPIPE, &ignore)?;
    }
    Ok(())
}

pub fn child_exited() -> bool {
    CHILD_EXITED.load(Ordering::SeqCst)
}

/// A window-size change is pending. The flag stays set until
/// [`clear_winsize_changed`], because the update can only be sent once the
/// stream is encrypted.
pub fn winsize_changed() -> bool {
    WINSIZE_CHANGED.load(Ordering::SeqCst)
}

pub fn set_winsize_changed() {
    WINSIZE_CHANGED.store(true, Ordering::SeqCst);
}

pub fn clear_winsize_changed() {
    WINSIZE_CHANGED.store(false, Ordering::SeqCst);
}

/// Consume a pending SIGUSR1 status request.
pub fn take_crypto_info() -> bool {
    CRYPTO_INFO.swap(false, Ordering::SeqCst)
}
