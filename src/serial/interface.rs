use std::io;
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use super::{Result, SerialDeviceInfo, SerialError};
use crate::config::SignerConfig;
use crate::device::discovery::HostPlatform;
use crate::device::SignerError;

const READ_BUFFER_SIZE: usize = 512;

/// Fixed serial line parameters; only the baud rate is configurable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
}

impl LineSettings {
    pub fn from_config(config: &SignerConfig) -> Self {
        Self {
            baud_rate: config.baud_rate,
            ..Self::default()
        }
    }
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: crate::config::DEFAULT_BAUD_RATE,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
        }
    }
}

/// Something the device sent us, or the reason it stopped sending
#[derive(Debug)]
pub enum InboundEvent {
    Data(Vec<u8>),
    Error(io::Error),
}

/// An inbound event stamped with the session that produced it
#[derive(Debug)]
pub struct SessionEvent {
    pub session: u64,
    pub event: InboundEvent,
}

/// Delivery end handed to a channel when it is opened.
///
/// Every event is tagged with the session number the sink was created for,
/// so the receiver can drop anything a torn-down channel still emits.
#[derive(Debug, Clone)]
pub struct InboundSink {
    session: u64,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl InboundSink {
    pub fn new(session: u64, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { session, tx }
    }

    pub fn session(&self) -> u64 {
        self.session
    }

    /// Returns false once the receiving side is gone.
    pub fn deliver(&self, event: InboundEvent) -> bool {
        self.tx
            .send(SessionEvent {
                session: self.session,
                event,
            })
            .is_ok()
    }
}

/// Write side of an open connection to one device.
///
/// Inbound bytes are not read through this trait; they arrive on the
/// [`InboundSink`] the channel was opened with.
#[async_trait]
pub trait Channel: Send {
    /// Write a whole frame, failing if it does not drain within `timeout`.
    async fn write(&mut self, frame: &[u8], timeout: Duration) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Serial connection backed by tokio-serial with a background reader task
pub struct SerialChannel {
    port_name: String,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
}

impl SerialChannel {
    /// Open `device` with the given line settings and start delivering
    /// inbound bytes to `sink`.
    pub fn open(device: &SerialDeviceInfo, settings: &LineSettings, sink: InboundSink) -> Result<Self> {
        let stream = tokio_serial::new(&device.port_name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", device.port_name, e)))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(read_half, sink, device.port_name.clone()));

        log::info!(
            "Opened {} at {} baud ({:?}, {:?}, {:?})",
            device.port_name,
            settings.baud_rate,
            settings.data_bits,
            settings.stop_bits,
            settings.parity
        );

        Ok(Self {
            port_name: device.port_name.clone(),
            writer: Some(write_half),
            reader: Some(reader),
        })
    }
}

#[async_trait]
impl Channel for SerialChannel {
    async fn write(&mut self, frame: &[u8], timeout: Duration) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(SerialError::Closed)?;

        let write_operation = async {
            writer.write_all(frame).await?;
            writer.flush().await
        };

        tokio::time::timeout(timeout, write_operation)
            .await
            .map_err(|_| SerialError::WriteTimeout(timeout))??;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if self.writer.take().is_some() {
            log::info!("Closed serial port {}", self.port_name);
        }
    }
}

impl Drop for SerialChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(mut port: ReadHalf<SerialStream>, sink: InboundSink, port_name: String) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        match port.read(&mut buf).await {
            Ok(0) => {
                log::warn!("Serial stream {} reached end of file", port_name);
                sink.deliver(InboundEvent::Error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "serial stream closed",
                )));
                break;
            }
            Ok(n) => {
                log::debug!("{} <- {}", port_name, hex::encode(&buf[..n]));
                if !sink.deliver(InboundEvent::Data(buf[..n].to_vec())) {
                    break;
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                log::error!("Read from {} failed: {}", port_name, e);
                sink.deliver(InboundEvent::Error(e));
                break;
            }
        }
    }
    log::debug!("Reader for {} (session {}) stopped", port_name, sink.session());
}

/// Host platform backed by the operating system's serial port enumeration.
///
/// Desktop hosts grant device access through file permissions rather than an
/// interactive prompt, so authorization always resolves granted here and
/// access problems surface when the port is opened.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialHost;

impl SerialHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HostPlatform for SerialHost {
    async fn enumerate(&self) -> crate::device::Result<Vec<SerialDeviceInfo>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| SignerError::Io(io::Error::other(e)))??;

        let devices = ports
            .into_iter()
            .filter_map(|port| match port.port_type {
                SerialPortType::UsbPort(usb_info) => Some(SerialDeviceInfo {
                    port_name: port.port_name,
                    vid: usb_info.vid,
                    pid: usb_info.pid,
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                }),
                _ => None,
            })
            .collect();

        Ok(devices)
    }

    fn has_permission(&self, _device: &SerialDeviceInfo) -> bool {
        true
    }

    async fn request_permission(&self, _device: &SerialDeviceInfo) -> bool {
        true
    }

    async fn open(
        &self,
        device: &SerialDeviceInfo,
        settings: &LineSettings,
        sink: InboundSink,
    ) -> crate::device::Result<Box<dyn Channel>> {
        let channel = SerialChannel::open(device, settings, sink)
            .map_err(|e| SignerError::OpenFailure(e.to_string()))?;
        Ok(Box::new(channel))
    }
}
