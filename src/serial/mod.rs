pub mod interface;
pub mod protocol;

pub use interface::{Channel, InboundEvent, InboundSink, LineSettings, SerialChannel, SerialHost};
pub use protocol::{ApduCommand, ApduHeader};

use serde::{Deserialize, Serialize};

/// Identity of a serial-capable USB device as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("Channel closed")]
    Closed,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
