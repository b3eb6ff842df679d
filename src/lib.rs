pub mod serial;
pub mod device;
pub mod config;

pub use config::SignerConfig;
pub use device::{
    AccountInfoListener, ConnectionStatus, HostPlatform, PendingOperation, Result, SignerError,
    SignerHandle, SignerManager, SigningListener,
};
pub use serial::{SerialDeviceInfo, SerialHost};
