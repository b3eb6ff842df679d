use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};

/// Session state of the signing device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Searching,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }

    /// Whether a scan request should be ignored in this state
    pub fn is_busy(&self) -> bool {
        matches!(self, ConnectionStatus::Searching | ConnectionStatus::Connected)
    }
}

/// The operation currently allowed to claim the next inbound frame or timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingOperation {
    #[default]
    None,
    GetAccount { index: u32 },
    SignTransaction,
}

impl PendingOperation {
    pub fn is_none(&self) -> bool {
        matches!(self, PendingOperation::None)
    }

    /// Human readable name used in timeout errors and logs
    pub fn label(&self) -> &'static str {
        match self {
            PendingOperation::None => "idle",
            PendingOperation::GetAccount { .. } => "account info request",
            PendingOperation::SignTransaction => "signing",
        }
    }
}

/// Current connection status plus change notification.
///
/// The latest value is always readable through [`StatusCell::current`] or a
/// `watch` receiver; every individual transition is also broadcast so
/// subscribers can observe short-lived states such as `Searching`. A
/// subscriber stops receiving by dropping its receiver.
#[derive(Debug)]
pub struct StatusCell {
    current: watch::Sender<ConnectionStatus>,
    transitions: broadcast::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub fn new(capacity: usize) -> Self {
        let (current, _) = watch::channel(ConnectionStatus::Disconnected);
        let (transitions, _) = broadcast::channel(capacity.max(1));
        Self { current, transitions }
    }

    pub fn current(&self) -> ConnectionStatus {
        *self.current.borrow()
    }

    /// Store `status`, notifying subscribers only if it differs from the
    /// current value. Returns whether a change happened.
    pub fn set(&self, status: ConnectionStatus) -> bool {
        let changed = self.current.send_if_modified(|value| {
            if *value == status {
                false
            } else {
                *value = status;
                true
            }
        });
        if changed {
            log::debug!("Connection status -> {:?}", status);
            // No subscribers is fine
            let _ = self.transitions.send(status);
        }
        changed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.transitions.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.current.subscribe()
    }
}
