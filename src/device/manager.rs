use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::discovery::{self, HostPlatform, ScanOutcome};
use super::listener::{AccountInfoListener, PendingListener, SigningListener};
use super::{ConnectionStatus, PendingOperation, Result, SignerError, StatusCell};
use crate::config::SignerConfig;
use crate::serial::interface::SessionEvent;
use crate::serial::protocol::{self, ApduCommand};
use crate::serial::{Channel, InboundEvent, InboundSink, LineSettings, SerialDeviceInfo};

/// Requests from handles to the manager task
enum Request {
    FindAndConnect,
    GetAccount {
        index: u32,
        listener: Box<dyn AccountInfoListener>,
    },
    Sign {
        payload: Vec<u8>,
        listener: Box<dyn SigningListener>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct ScanResult {
    scan: u64,
    outcome: ScanOutcome,
}

/// The single outstanding command and when it gives up
struct InFlight {
    listener: PendingListener,
    deadline: Instant,
}

/// Owner of the signing device session.
///
/// All session state lives in one task. Handle requests, inbound device
/// events, scan results and the response deadline are consumed by that task
/// one at a time, so resolving an operation and clearing its state cannot
/// interleave with a competing frame or timeout.
pub struct SignerManager {
    config: SignerConfig,
    settings: LineSettings,
    host: Arc<dyn HostPlatform>,
    status: Arc<StatusCell>,
    device: Arc<RwLock<Option<SerialDeviceInfo>>>,
    channel: Option<Box<dyn Channel>>,
    pending: Option<InFlight>,
    pending_tx: watch::Sender<PendingOperation>,
    /// Incremented for every opened channel; inbound events from older
    /// sessions are dropped
    session: u64,
    /// Incremented for every scan and on teardown; stale scan results are dropped
    scan: u64,
    scan_task: Option<JoinHandle<()>>,
    inbound_tx: mpsc::UnboundedSender<SessionEvent>,
    scan_tx: mpsc::UnboundedSender<ScanResult>,
}

impl SignerManager {
    /// Start the manager task and return a handle to it.
    pub fn spawn<H: HostPlatform>(config: SignerConfig, host: H) -> SignerHandle {
        let (request_tx, request_rx) = mpsc::channel(config.event_capacity.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let status = Arc::new(StatusCell::new(config.event_capacity));
        let device = Arc::new(RwLock::new(None));
        let (pending_tx, pending_rx) = watch::channel(PendingOperation::None);

        let manager = SignerManager {
            settings: LineSettings::from_config(&config),
            config,
            host: Arc::new(host),
            status: Arc::clone(&status),
            device: Arc::clone(&device),
            channel: None,
            pending: None,
            pending_tx,
            session: 0,
            scan: 0,
            scan_task: None,
            inbound_tx,
            scan_tx,
        };
        tokio::spawn(manager.run(request_rx, inbound_rx, scan_rx));

        SignerHandle {
            request_tx,
            status,
            device,
            pending: pending_rx,
        }
    }

    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<Request>,
        mut inbound_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut scan_rx: mpsc::UnboundedReceiver<ScanResult>,
    ) {
        log::debug!("Signer manager started");
        let mut stop_reply = None;
        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);
            tokio::select! {
                biased;
                Some(event) = inbound_rx.recv() => self.handle_inbound(event).await,
                Some(result) = scan_rx.recv() => self.handle_scan_result(result).await,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_timeout().await
                }
                request = request_rx.recv() => {
                    let Some(request) = request else {
                        break;
                    };
                    if let ControlFlow::Break(done) = self.handle_request(request).await {
                        stop_reply = Some(done);
                        break;
                    }
                }
            }
            self.publish_pending();
        }

        // Refuse further requests before acknowledging a shutdown
        drop(request_rx);
        self.teardown("manager stopping").await;
        if let Some(done) = stop_reply {
            let _ = done.send(());
        }
        log::debug!("Signer manager stopped");
    }

    /// Breaks with the shutdown acknowledgement once the manager should stop.
    async fn handle_request(&mut self, request: Request) -> ControlFlow<oneshot::Sender<()>> {
        match request {
            Request::FindAndConnect => self.start_scan(),
            Request::GetAccount { index, listener } => match self.check_ready() {
                Ok(()) => {
                    let listener = PendingListener::Account { index, listener };
                    self.dispatch(ApduCommand::GetAccount { index }, listener).await;
                }
                Err(e) => listener.on_account_info_error(index, e),
            },
            Request::Sign { payload, listener } => match self.check_ready() {
                Ok(()) => {
                    let listener = PendingListener::Signing(listener);
                    self.dispatch(ApduCommand::SignTransaction { payload }, listener).await;
                }
                Err(e) => listener.on_signature_error(e),
            },
            Request::Disconnect { done } => {
                self.teardown("disconnect requested").await;
                let _ = done.send(());
            }
            Request::Shutdown { done } => return ControlFlow::Break(done),
        }
        ControlFlow::Continue(())
    }

    fn publish_pending(&self) {
        let operation = self
            .pending
            .as_ref()
            .map(|p| p.listener.operation())
            .unwrap_or_default();
        self.pending_tx.send_if_modified(|current| {
            let changed = *current != operation;
            *current = operation;
            changed
        });
    }

    fn check_ready(&self) -> Result<()> {
        if !self.status.current().is_connected() || self.channel.is_none() {
            return Err(SignerError::NotConnected);
        }
        if let Some(in_flight) = &self.pending {
            log::debug!("Rejecting command while {} is outstanding", in_flight.listener.operation().label());
            return Err(SignerError::Busy);
        }
        Ok(())
    }

    fn start_scan(&mut self) {
        let status = self.status.current();
        if status.is_busy() {
            log::debug!("Scan requested while {:?}; ignoring", status);
            return;
        }

        self.status.set(ConnectionStatus::Searching);
        self.scan += 1;
        let scan = self.scan;
        let host = Arc::clone(&self.host);
        let scan_tx = self.scan_tx.clone();
        let delay = self.config.scan_delay();
        let vendor_id = self.config.vendor_id;

        log::info!("Searching for signing device (vendor id {:04x})", vendor_id);
        self.scan_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let outcome = discovery::scan(host.as_ref(), vendor_id).await;
            let _ = scan_tx.send(ScanResult { scan, outcome });
        }));
    }

    async fn handle_scan_result(&mut self, result: ScanResult) {
        if result.scan != self.scan || self.status.current() != ConnectionStatus::Searching {
            log::debug!("Dropping result of cancelled scan {}", result.scan);
            return;
        }
        self.scan_task = None;

        match result.outcome {
            ScanOutcome::Authorized(device) => self.open_session(device).await,
            ScanOutcome::PermissionDenied(device) => {
                log::warn!("{}: {}", device.port_name, SignerError::PermissionDenied);
                self.status.set(ConnectionStatus::Disconnected);
            }
            ScanOutcome::NoCandidate => {
                self.status.set(ConnectionStatus::Disconnected);
            }
            ScanOutcome::Failed(e) => {
                log::warn!("Scan failed: {}", e);
                self.status.set(ConnectionStatus::Disconnected);
            }
        }
    }

    async fn open_session(&mut self, device: SerialDeviceInfo) {
        self.session += 1;
        let sink = InboundSink::new(self.session, self.inbound_tx.clone());

        match self.host.open(&device, &self.settings, sink).await {
            Ok(channel) => {
                log::info!("Connected to signing device on {} (session {})", device.port_name, self.session);
                self.channel = Some(channel);
                *self.device.write().await = Some(device);
                self.status.set(ConnectionStatus::Connected);
            }
            Err(e) => {
                log::error!("Failed to open {}: {}", device.port_name, e);
                self.status.set(ConnectionStatus::Error);
            }
        }
    }

    /// Write `command` and arm the response deadline.
    async fn dispatch(&mut self, command: ApduCommand, listener: PendingListener) {
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(e) => {
                listener.fail(e);
                return;
            }
        };
        let Some(channel) = self.channel.as_mut() else {
            listener.fail(SignerError::NotConnected);
            return;
        };

        log::debug!("-> {}", hex::encode(&frame));
        let written = channel.write(&frame, self.config.write_timeout()).await;
        match written {
            Ok(()) => {
                self.pending = Some(InFlight {
                    listener,
                    deadline: Instant::now() + self.config.response_timeout(),
                });
            }
            Err(e) => {
                let error = SignerError::from(e);
                log::error!("Write failed: {}", error);
                listener.fail(error);
                self.teardown("write failure").await;
            }
        }
    }

    async fn handle_inbound(&mut self, event: SessionEvent) {
        if event.session != self.session || self.channel.is_none() {
            log::debug!("Dropping event from closed session {}", event.session);
            return;
        }

        match event.event {
            InboundEvent::Data(data) => {
                let Some(in_flight) = self.pending.take() else {
                    log::debug!("Ignoring {} unsolicited byte(s)", data.len());
                    return;
                };
                match in_flight.listener {
                    PendingListener::Account { index, listener } => {
                        match protocol::decode_account_id(&data) {
                            Ok(account_id) => listener.on_account_info(index, account_id),
                            Err(e) => {
                                log::warn!("Account {} response rejected: {}", index, e);
                                listener.on_account_info_error(index, e);
                            }
                        }
                    }
                    PendingListener::Signing(listener) => {
                        listener.on_signature(protocol::decode_signature(&data));
                    }
                }
            }
            InboundEvent::Error(e) => {
                log::error!("Transport error: {}", e);
                if let Some(in_flight) = self.pending.take() {
                    in_flight.listener.fail(SignerError::Io(e));
                }
                self.teardown("transport error").await;
            }
        }
    }

    async fn handle_timeout(&mut self) {
        let Some(in_flight) = self.pending.take() else {
            return;
        };
        let operation = in_flight.listener.operation();
        log::warn!("No response to {} within {:?}", operation.label(), self.config.response_timeout());
        in_flight.listener.fail(SignerError::Timeout {
            operation: operation.label(),
        });
        self.teardown("response timeout").await;
    }

    /// Close the channel, drop any pending listener unresolved, cancel a
    /// running scan and report `Disconnected`.
    async fn teardown(&mut self, reason: &str) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        self.scan += 1;

        if let Some(in_flight) = self.pending.take() {
            log::info!("Discarding outstanding {} ({})", in_flight.listener.operation().label(), reason);
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close();
            log::info!("Disconnected from signing device ({})", reason);
        }
        *self.device.write().await = None;
        self.status.set(ConnectionStatus::Disconnected);
        self.publish_pending();
    }
}

/// Cloneable front end to a running [`SignerManager`].
///
/// Every command returns as soon as it is queued; outcomes arrive through the
/// listener passed in, or through the status channel for connection attempts.
#[derive(Clone)]
pub struct SignerHandle {
    request_tx: mpsc::Sender<Request>,
    status: Arc<StatusCell>,
    device: Arc<RwLock<Option<SerialDeviceInfo>>>,
    pending: watch::Receiver<PendingOperation>,
}

impl SignerHandle {
    /// Start a scan and connect to the first matching device. Ignored while
    /// already searching or connected.
    pub async fn find_and_connect_to_device(&self) -> Result<()> {
        self.request(Request::FindAndConnect).await
    }

    pub async fn request_account_info<L: AccountInfoListener>(&self, index: u32, listener: L) {
        if !self.status.current().is_connected() {
            Box::new(listener).on_account_info_error(index, SignerError::NotConnected);
            return;
        }
        let request = Request::GetAccount {
            index,
            listener: Box::new(listener),
        };
        if let Err(mpsc::error::SendError(request)) = self.request_tx.send(request).await {
            if let Request::GetAccount { index, listener } = request {
                listener.on_account_info_error(index, SignerError::ManagerStopped);
            }
        }
    }

    pub async fn sign_transaction<L: SigningListener>(&self, payload: Vec<u8>, listener: L) {
        if !self.status.current().is_connected() {
            Box::new(listener).on_signature_error(SignerError::NotConnected);
            return;
        }
        let request = Request::Sign {
            payload,
            listener: Box::new(listener),
        };
        if let Err(mpsc::error::SendError(request)) = self.request_tx.send(request).await {
            if let Request::Sign { listener, .. } = request {
                listener.on_signature_error(SignerError::ManagerStopped);
            }
        }
    }

    /// Look up the account identifier at `index` and wait for the answer.
    pub async fn get_account(&self, index: u32) -> Result<String> {
        let (tx, rx) = oneshot::channel::<Result<(u32, String)>>();
        self.request_account_info(index, tx).await;
        let (_, account_id) = rx.await.map_err(|_| SignerError::Cancelled)??;
        Ok(account_id)
    }

    /// Sign `payload` and wait for the signature.
    pub async fn sign(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel::<Result<Vec<u8>>>();
        self.sign_transaction(payload, tx).await;
        rx.await.map_err(|_| SignerError::Cancelled)?
    }

    /// Tear the session down. Outstanding listeners are dropped uncalled.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.request(Request::Disconnect { done }).await?;
        rx.await.map_err(|_| SignerError::ManagerStopped)
    }

    /// Disconnect and stop the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.request(Request::Shutdown { done }).await?;
        rx.await.map_err(|_| SignerError::ManagerStopped)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status.current()
    }

    /// Every status transition from now on. Drop the receiver to unsubscribe.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.watch()
    }

    /// Operation currently awaiting a response, as of the last processed event
    pub fn pending_operation(&self) -> PendingOperation {
        *self.pending.borrow()
    }

    /// Device behind the open session, if any
    pub async fn connected_device(&self) -> Option<SerialDeviceInfo> {
        self.device.read().await.clone()
    }

    async fn request(&self, request: Request) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| SignerError::ManagerStopped)
    }
}
