//! Common error types

use thiserror::Error;

/// Errors shared by the workspace crates
#[derive(Debug, Error)]
pub enum Error {
    /// The device subsystem sent a notification that contradicts tracked state
    /// (removal of an unknown descriptor, duplicate addition).
    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    /// A transfer result was requested before the transfer completed.
    #[error("Transfer result not ready")]
    NotReady,

    /// A transfer result was requested after it had already been taken.
    #[error("Transfer result already consumed")]
    AlreadyConsumed,

    /// Failure reported by the USB library.
    #[error("USB error: {0}")]
    Usb(String),

    /// The main loop could not set up or poll its descriptors.
    #[error("Event loop error: {0}")]
    EventLoop(String),

    /// Invalid settings or a logging setup failure.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O on the loop's own descriptors, such as the wake pipe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias over [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InternalConsistency("fd 7 is not tracked".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Internal consistency"));
        assert!(msg.contains("fd 7"));

        assert_eq!(Error::NotReady.to_string(), "Transfer result not ready");
        assert_eq!(
            Error::AlreadyConsumed.to_string(),
            "Transfer result already consumed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("pipe closed"));
    }
}
