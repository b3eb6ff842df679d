//! Locating the signing device on the host.
//!
//! A scan enumerates every serial-capable USB device the host exposes, keeps
//! the ones reporting the configured vendor id and tries only the first of
//! them. If the host has not yet authorized access to it, authorization is
//! requested once and the scan resolves when the host answers.

use async_trait::async_trait;

use super::Result;
use crate::serial::{Channel, InboundSink, LineSettings, SerialDeviceInfo};

/// Host services needed to find and open a device
#[async_trait]
pub trait HostPlatform: Send + Sync + 'static {
    /// List serial-capable USB devices currently attached.
    async fn enumerate(&self) -> Result<Vec<SerialDeviceInfo>>;

    /// Whether access to `device` was already granted.
    fn has_permission(&self, device: &SerialDeviceInfo) -> bool;

    /// Ask the host for access to `device`; resolves once with the answer.
    async fn request_permission(&self, device: &SerialDeviceInfo) -> bool;

    /// Open a channel to `device`, delivering inbound bytes to `sink`.
    async fn open(
        &self,
        device: &SerialDeviceInfo,
        settings: &LineSettings,
        sink: InboundSink,
    ) -> Result<Box<dyn Channel>>;
}

/// How a scan ended
#[derive(Debug)]
pub enum ScanOutcome {
    /// Nothing attached reports the expected vendor id
    NoCandidate,
    /// The host refused access to the first candidate
    PermissionDenied(SerialDeviceInfo),
    /// The first candidate may be opened
    Authorized(SerialDeviceInfo),
    /// Enumeration itself failed
    Failed(super::SignerError),
}

/// Keep only devices reporting `vendor_id`, preserving enumeration order.
pub fn matching_devices(devices: Vec<SerialDeviceInfo>, vendor_id: u16) -> Vec<SerialDeviceInfo> {
    devices.into_iter().filter(|d| d.vid == vendor_id).collect()
}

/// Run one scan against `host`.
pub async fn scan(host: &dyn HostPlatform, vendor_id: u16) -> ScanOutcome {
    let devices = match host.enumerate().await {
        Ok(devices) => devices,
        Err(e) => {
            log::warn!("Device enumeration failed: {}", e);
            return ScanOutcome::Failed(e);
        }
    };
    log::debug!("Enumerated {} serial device(s)", devices.len());

    let mut candidates = matching_devices(devices, vendor_id);
    if candidates.is_empty() {
        log::info!("No device with vendor id {:04x} attached", vendor_id);
        return ScanOutcome::NoCandidate;
    }
    if candidates.len() > 1 {
        log::warn!(
            "{} devices match vendor id {:04x}; using {}",
            candidates.len(),
            vendor_id,
            candidates[0].port_name
        );
    }
    let device = candidates.swap_remove(0);

    if host.has_permission(&device) {
        return ScanOutcome::Authorized(device);
    }

    log::info!("Requesting access to {}", device.port_name);
    if host.request_permission(&device).await {
        ScanOutcome::Authorized(device)
    } else {
        log::warn!("Access to {} was denied", device.port_name);
        ScanOutcome::PermissionDenied(device)
    }
}
