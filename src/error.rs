use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("syscall failed: {0}")]
    Sys(#[from] nix::Error),

    #[error("no $SHELL set in environment")]
    NoShell,

    #[error("TTY hangup")]
    TtyHangup,
}

pub type Result<T> = std::result::Result<T, AppError>;
