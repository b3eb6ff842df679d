pub mod settings;

pub use settings::{SignerConfig, DEFAULT_BAUD_RATE, DEFAULT_VENDOR_ID};
