//! Scripted host platform shared by the integration tests.
#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hwsign_lib::serial::{Channel, InboundEvent, InboundSink, LineSettings, SerialError};
use hwsign_lib::{ConnectionStatus, HostPlatform, PendingOperation, SerialDeviceInfo, SignerConfig, SignerError, SignerHandle, SignerManager};

pub const VENDOR_ID: u16 = 0x2C97;

#[derive(Default)]
struct MockState {
    devices: Vec<SerialDeviceInfo>,
    has_permission: bool,
    grant_permission: bool,
    permission_requests: usize,
    open_fails: bool,
    opened: usize,
    closed: usize,
    fail_writes: bool,
    writes: Vec<Vec<u8>>,
    sink: Option<InboundSink>,
    settings: Option<LineSettings>,
}

/// In-memory host whose devices, permissions and channel behaviour are set by the test
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock().unwrap();
            state.has_permission = true;
            state.grant_permission = true;
        }
        host
    }

    pub fn with_device(self, port: &str, vid: u16) -> Self {
        self.state.lock().unwrap().devices.push(device(port, vid));
        self
    }

    pub fn without_permission(self, grant: bool) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.has_permission = false;
            state.grant_permission = grant;
        }
        self
    }

    pub fn failing_open(self) -> Self {
        self.state.lock().unwrap().open_fails = true;
        self
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn permission_requests(&self) -> usize {
        self.state.lock().unwrap().permission_requests
    }

    pub fn settings(&self) -> Option<LineSettings> {
        self.state.lock().unwrap().settings
    }

    /// Sink of the most recently opened channel
    pub fn sink(&self) -> InboundSink {
        self.state.lock().unwrap().sink.clone().expect("no channel opened")
    }

    pub fn push_data(&self, data: &[u8]) {
        assert!(self.sink().deliver(InboundEvent::Data(data.to_vec())));
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        assert!(self.sink().deliver(InboundEvent::Error(io::Error::new(kind, "device went away"))));
    }
}

pub fn device(port: &str, vid: u16) -> SerialDeviceInfo {
    SerialDeviceInfo {
        port_name: port.to_string(),
        vid,
        pid: 0x0001,
        serial_number: Some("0001".to_string()),
        manufacturer: Some("Ledger".to_string()),
        product: Some("Nano S".to_string()),
    }
}

#[async_trait]
impl HostPlatform for MockHost {
    async fn enumerate(&self) -> hwsign_lib::Result<Vec<SerialDeviceInfo>> {
        Ok(self.state.lock().unwrap().devices.clone())
    }

    fn has_permission(&self, _device: &SerialDeviceInfo) -> bool {
        self.state.lock().unwrap().has_permission
    }

    async fn request_permission(&self, _device: &SerialDeviceInfo) -> bool {
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.permission_requests += 1;
        state.grant_permission
    }

    async fn open(
        &self,
        device: &SerialDeviceInfo,
        settings: &LineSettings,
        sink: InboundSink,
    ) -> hwsign_lib::Result<Box<dyn Channel>> {
        let mut state = self.state.lock().unwrap();
        if state.open_fails {
            return Err(SignerError::OpenFailure(format!("{} is busy", device.port_name)));
        }
        state.opened += 1;
        state.sink = Some(sink);
        state.settings = Some(*settings);
        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
            closed: false,
        }))
    }
}

struct MockChannel {
    state: Arc<Mutex<MockState>>,
    closed: bool,
}

#[async_trait]
impl Channel for MockChannel {
    async fn write(&mut self, frame: &[u8], _timeout: Duration) -> hwsign_lib::serial::Result<()> {
        let mut state = self.state.lock().unwrap();
        if self.closed {
            return Err(SerialError::Closed);
        }
        if state.fail_writes {
            return Err(SerialError::IoError(io::Error::new(io::ErrorKind::BrokenPipe, "write failed")));
        }
        state.writes.push(frame.to_vec());
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().unwrap().closed += 1;
        }
    }
}

pub fn test_config() -> SignerConfig {
    SignerConfig {
        vendor_id: VENDOR_ID,
        scan_delay_ms: 0,
        ..SignerConfig::default()
    }
}

pub async fn wait_for_status(signer: &SignerHandle, wanted: ConnectionStatus) {
    let mut rx = signer.watch_status();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == wanted))
        .await
        .expect("timed out waiting for status")
        .expect("manager stopped");
}

/// Spawn a manager over `host` and bring it to `Connected`.
pub async fn connected(host: &MockHost) -> SignerHandle {
    let signer = SignerManager::spawn(test_config(), host.clone());
    signer.find_and_connect_to_device().await.unwrap();
    wait_for_status(&signer, ConnectionStatus::Connected).await;
    signer
}

/// Wait until the manager reports `wanted` as its outstanding operation.
pub async fn wait_for_operation(signer: &SignerHandle, wanted: PendingOperation) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while signer.pending_operation() != wanted {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("operation never reached the expected state");
}

/// Wait until the manager has an operation outstanding.
pub async fn wait_for_pending(signer: &SignerHandle) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while signer.pending_operation().is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("command was never dispatched");
}
