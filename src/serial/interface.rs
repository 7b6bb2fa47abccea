use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPortType;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use super::{
    CloseError, ConnectionParams, OpenError, PortIdentity, ReadError, Result, SerialDeviceInfo,
    SerialError, WriteError,
};

/// Bytes requested per read call
pub const READ_CHUNK_SIZE: usize = 1024;

/// One physical serial endpoint.
///
/// `read` with `Some(timeout)` returns an empty vector when nothing arrived
/// in time; with `None` it waits until bytes, end-of-stream or an error.
/// Implementations must keep `read` cancel-safe: dropping the future may
/// not lose bytes that were already pulled from the device.
#[async_trait]
pub trait PortHandle: Send {
    async fn open(&mut self, params: &ConnectionParams) -> std::result::Result<(), OpenError>;

    /// Closing a handle that is not open succeeds
    async fn close(&mut self) -> std::result::Result<(), CloseError>;

    async fn read(&mut self, timeout: Option<Duration>) -> std::result::Result<Vec<u8>, ReadError>;

    async fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError>;

    fn identity(&self) -> PortIdentity;

    fn port_name(&self) -> &str;
}

/// Port enumeration and permission collaborator
#[async_trait]
pub trait PortProvider: Send + Sync {
    async fn list_authorized_ports(&self) -> Result<Vec<SerialDeviceInfo>>;

    /// Ask for access to a port, optionally narrowed by a name hint.
    /// Returns `None` when the user (or platform) grants nothing.
    async fn request_port_access(&self, hint: Option<&str>) -> Result<Option<SerialDeviceInfo>>;

    /// Fresh, unopened handle for the given endpoint
    fn create_handle(&self, port: &SerialDeviceInfo) -> Box<dyn PortHandle>;
}

/// Native ports through the OS serial stack
#[derive(Debug, Default, Clone)]
pub struct SystemPortProvider;

impl SystemPortProvider {
    pub fn new() -> Self {
        Self
    }

    fn to_device_info(port: serialport::SerialPortInfo) -> SerialDeviceInfo {
        match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo::new(port.port_name),
        }
    }
}

#[async_trait]
impl PortProvider for SystemPortProvider {
    async fn list_authorized_ports(&self) -> Result<Vec<SerialDeviceInfo>> {
        let ports = tokio::task::spawn_blocking(serialport::available_ports)
            .await
            .map_err(|e| SerialError::EnumerationFailed(e.to_string()))??;

        Ok(ports.into_iter().map(Self::to_device_info).collect())
    }

    // Native platforms have no permission prompt; every enumerated port is granted
    async fn request_port_access(&self, hint: Option<&str>) -> Result<Option<SerialDeviceInfo>> {
        let ports = self.list_authorized_ports().await?;
        let granted = match hint {
            Some(name) => ports.into_iter().find(|p| p.port_name == name),
            None => ports.into_iter().next(),
        };
        Ok(granted)
    }

    fn create_handle(&self, port: &SerialDeviceInfo) -> Box<dyn PortHandle> {
        Box::new(SystemPort::new(port))
    }
}

/// `tokio-serial` backed handle
pub struct SystemPort {
    port_name: String,
    identity: PortIdentity,
    stream: Option<SerialStream>,
}

impl SystemPort {
    pub fn new(info: &SerialDeviceInfo) -> Self {
        Self {
            port_name: info.port_name.clone(),
            identity: info.identity(),
            stream: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[async_trait]
impl PortHandle for SystemPort {
    async fn open(&mut self, params: &ConnectionParams) -> std::result::Result<(), OpenError> {
        if self.is_open() {
            return Err(OpenError::DeviceBusy(self.port_name.clone()));
        }
        params.validate().map_err(OpenError::InvalidParameters)?;

        let stream = tokio_serial::new(&self.port_name, params.baud_rate)
            .data_bits(params.to_serialport_data_bits())
            .stop_bits(params.to_serialport_stop_bits())
            .parity(params.to_serialport_parity())
            .flow_control(params.to_serialport_flow_control())
            .open_native_async()
            .map_err(|e| OpenError::from_serialport(&self.port_name, e))?;

        log::debug!("Opened {} at {}", self.port_name, params);
        self.stream = Some(stream);
        Ok(())
    }

    async fn close(&mut self) -> std::result::Result<(), CloseError> {
        // Dropping the stream releases the file descriptor even if flush fails
        if let Some(mut stream) = self.stream.take() {
            let flushed = stream.flush().await;
            drop(stream);
            log::debug!("Closed {}", self.port_name);
            flushed?;
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Option<Duration>) -> std::result::Result<Vec<u8>, ReadError> {
        let stream = self.stream.as_mut().ok_or(ReadError::NotOpen)?;
        let mut buf = [0u8; READ_CHUNK_SIZE];

        let read_result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, stream.read(&mut buf)).await {
                Ok(res) => res,
                Err(_) => return Ok(Vec::new()),
            },
            None => stream.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => Err(ReadError::EndOfStream),
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(ReadError::from_io(&self.port_name, e)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> std::result::Result<usize, WriteError> {
        let stream = self.stream.as_mut().ok_or(WriteError::NotOpen)?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(data.len())
    }

    fn identity(&self) -> PortIdentity {
        self.identity.clone()
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }
}
