use std::sync::Arc;

use serialport::SerialPortType;
use tokio::io::AsyncReadExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::events::{CloseListener, DataListener, ErrorListener, LineSplitter};
use super::{
    FlowControl, Parity, Result, SerialConnectionConfig, SerialError, SerialEvents,
    SerialPortSummary, Subscription,
};

const READ_BUFFER_SIZE: usize = 1024;

/// An open, line-delimited serial connection
#[async_trait::async_trait]
pub trait SerialConnection: Send + Sync {
    /// Listener registry backing the three subscription points
    fn events(&self) -> &Arc<SerialEvents>;

    fn on_data(&self, listener: DataListener) -> Subscription {
        self.events().on_data(listener)
    }

    fn on_error(&self, listener: ErrorListener) -> Subscription {
        self.events().on_error(listener)
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.events().on_close(listener)
    }

    /// Unregister all listeners and release the underlying handle.
    /// Resolves once the handle is fully released.
    async fn close(&mut self) -> Result<()>;
}

/// Opens serial connections; swapped for a simulated source in tests
#[async_trait::async_trait]
pub trait SerialOpener: Send + Sync {
    async fn open(&self, config: &SerialConnectionConfig) -> Result<Box<dyn SerialConnection>>;
}

/// Enumerate serial ports visible to the OS
pub fn list_available_ports() -> Result<Vec<SerialPortSummary>> {
    let ports = serialport::available_ports()?;
    let summaries = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialPortSummary {
                path: port.port_name,
                kind: "usb".to_string(),
                vendor_id: Some(usb_info.vid),
                product_id: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            other => SerialPortSummary {
                path: port.port_name,
                kind: match other {
                    SerialPortType::PciPort => "pci",
                    SerialPortType::BluetoothPort => "bluetooth",
                    _ => "unknown",
                }
                .to_string(),
                vendor_id: None,
                product_id: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();
    Ok(summaries)
}

/// Opener backed by a physical port through `tokio-serial`
#[derive(Debug, Clone, Default)]
pub struct SerialInterface;

impl SerialInterface {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl SerialOpener for SerialInterface {
    async fn open(&self, config: &SerialConnectionConfig) -> Result<Box<dyn SerialConnection>> {
        if config.path.trim().is_empty() {
            return Err(SerialError::PortNotFound("no device selected".to_string()));
        }

        let parity = match config.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            unsupported => return Err(SerialError::UnsupportedParity(unsupported)),
        };

        if config.flow_control != FlowControl::None {
            log::debug!(
                "Flow control {:?} is stored for {} but not applied",
                config.flow_control,
                config.path
            );
        }

        let stream = tokio_serial::new(&config.path, config.baud_rate)
            .data_bits(config.data_bits.into())
            .stop_bits(config.stop_bits.into())
            .parity(parity)
            .open_native_async()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", config.path, e)))?;

        log::info!("Opened serial port {}", config);
        Ok(Box::new(LivePort::spawn(stream, config.path.clone())))
    }
}

/// A physical port with its background line reader
struct LivePort {
    path: String,
    events: Arc<SerialEvents>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

impl LivePort {
    fn spawn(stream: SerialStream, path: String) -> Self {
        let events = SerialEvents::new();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let reader = tokio::spawn(read_loop(stream, events.clone(), shutdown_rx, path.clone()));
        Self {
            path,
            events,
            shutdown_tx: Some(shutdown_tx),
            reader: Some(reader),
        }
    }
}

#[async_trait::async_trait]
impl SerialConnection for LivePort {
    fn events(&self) -> &Arc<SerialEvents> {
        &self.events
    }

    async fn close(&mut self) -> Result<()> {
        self.events.clear();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = reader.await {
                log::warn!("Serial reader for {} ended abnormally: {}", self.path, e);
            }
        }
        log::info!("Closed serial port {}", self.path);
        Ok(())
    }
}

async fn read_loop(
    mut stream: SerialStream,
    events: Arc<SerialEvents>,
    mut shutdown_rx: oneshot::Receiver<()>,
    path: String,
) {
    let mut splitter = LineSplitter::new();
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            read = stream.read(&mut buffer) => {
                match read {
                    Ok(0) => {
                        log::info!("Serial port {} reached end of stream", path);
                        events.emit_close();
                        break;
                    }
                    Ok(n) => {
                        for line in splitter.push(&buffer[..n]) {
                            events.emit_data(&line);
                        }
                    }
                    Err(e) => {
                        log::warn!("Serial read error on {}: {}", path, e);
                        events.emit_error(&SerialError::from(e));
                        events.emit_close();
                        break;
                    }
                }
            }
        }
    }
    // dropping the stream releases the OS handle
}
