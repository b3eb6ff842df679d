//! Completion callbacks for dispatched commands.
//!
//! A listener is consumed when it fires, so each dispatched command resolves
//! its listener at most once. If the session is torn down while the command
//! is outstanding the listener is dropped without being called.

use tokio::sync::oneshot;

use super::{PendingOperation, SignerError};

/// Receives the outcome of an account lookup
pub trait AccountInfoListener: Send + 'static {
    fn on_account_info(self: Box<Self>, index: u32, account_id: String);
    fn on_account_info_error(self: Box<Self>, index: u32, error: SignerError);
}

/// Receives the outcome of a signing request
pub trait SigningListener: Send + 'static {
    fn on_signature(self: Box<Self>, signature: Vec<u8>);
    fn on_signature_error(self: Box<Self>, error: SignerError);
}

impl AccountInfoListener for oneshot::Sender<Result<(u32, String), SignerError>> {
    fn on_account_info(self: Box<Self>, index: u32, account_id: String) {
        let _ = self.send(Ok((index, account_id)));
    }

    fn on_account_info_error(self: Box<Self>, _index: u32, error: SignerError) {
        let _ = self.send(Err(error));
    }
}

impl SigningListener for oneshot::Sender<Result<Vec<u8>, SignerError>> {
    fn on_signature(self: Box<Self>, signature: Vec<u8>) {
        let _ = self.send(Ok(signature));
    }

    fn on_signature_error(self: Box<Self>, error: SignerError) {
        let _ = self.send(Err(error));
    }
}

/// Listener slot for the one outstanding command
pub(crate) enum PendingListener {
    Account {
        index: u32,
        listener: Box<dyn AccountInfoListener>,
    },
    Signing(Box<dyn SigningListener>),
}

impl PendingListener {
    pub(crate) fn operation(&self) -> PendingOperation {
        match self {
            PendingListener::Account { index, .. } => PendingOperation::GetAccount { index: *index },
            PendingListener::Signing(_) => PendingOperation::SignTransaction,
        }
    }

    pub(crate) fn fail(self, error: SignerError) {
        match self {
            PendingListener::Account { index, listener } => listener.on_account_info_error(index, error),
            PendingListener::Signing(listener) => listener.on_signature_error(error),
        }
    }
}
