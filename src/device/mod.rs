pub mod discovery;
pub mod listener;
pub mod manager;
pub mod models;

pub use discovery::{HostPlatform, ScanOutcome};
pub use listener::{AccountInfoListener, SigningListener};
pub use manager::{SignerHandle, SignerManager};
pub use models::{ConnectionStatus, PendingOperation, StatusCell};

#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("Device not connected")]
    NotConnected,

    #[error("Another operation is already in flight")]
    Busy,

    #[error("Access to the device was denied")]
    PermissionDenied,

    #[error("Failed to open device: {0}")]
    OpenFailure(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    Serialport(#[from] serialport::Error),

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Payload of {len} bytes does not fit in a single frame")]
    PayloadTooLarge { len: usize },

    #[error("Operation cancelled by disconnect")]
    Cancelled,

    #[error("Signer manager has stopped")]
    ManagerStopped,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SignerError {
    /// Errors after which the byte stream can no longer be trusted.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SignerError::Io(_) | SignerError::Serialport(_) | SignerError::Timeout { .. }
        )
    }
}

impl From<crate::serial::SerialError> for SignerError {
    fn from(err: crate::serial::SerialError) -> Self {
        use crate::serial::SerialError;
        match err {
            SerialError::IoError(e) => SignerError::Io(e),
            SerialError::SerialportError(e) => SignerError::Serialport(e),
            SerialError::WriteTimeout(_) => {
                SignerError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, err.to_string()))
            }
            SerialError::Closed => SignerError::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                err.to_string(),
            )),
            SerialError::PortNotFound(_) | SerialError::ConnectionFailed(_) => {
                SignerError::OpenFailure(err.to_string())
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SignerError>;
