use sidewinderd_common::MacroError;
use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors raised while driving a keyboard or managing devices
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),

    #[error(transparent)]
    Macro(#[from] MacroError),

    #[error("configuration error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("{device} has no {node} node")]
    MissingNode { device: String, node: &'static str },

    #[error("virtual input device error: {0}")]
    Injector(String),

    #[error("hot-plug watch unavailable: {0}")]
    Hotplug(String),

    #[error("profile {0} out of range")]
    InvalidProfile(u8),
}

impl DriverError {
    /// The device behind the descriptor went away
    pub fn is_disconnect(&self) -> bool {
        match self {
            DriverError::Io(e) => matches!(e.raw_os_error(), Some(libc::ENODEV) | Some(libc::EIO)),
            DriverError::Sys(errno) => matches!(errno, nix::errno::Errno::ENODEV | nix::errno::Errno::EIO),
            _ => false,
        }
    }
}
