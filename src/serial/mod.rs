pub mod buffer;
pub mod interface;
pub mod params;
pub mod reader;

pub use buffer::ByteRingBuffer;
pub use interface::{PortHandle, PortProvider, SystemPort, SystemPortProvider};
pub use params::{ConnectionParams, DataBits, FlowControl, Parity, StopBits};

use serde::{Deserialize, Serialize};

/// Enumeration record for one physical serial endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl SerialDeviceInfo {
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            vid: None,
            pid: None,
            serial_number: None,
            manufacturer: None,
            product: None,
        }
    }

    pub fn identity(&self) -> PortIdentity {
        PortIdentity {
            vendor_id: self.vid,
            product_id: self.pid,
            serial_number: self.serial_number.clone(),
        }
    }

    /// Key used to recognise the same endpoint across enumerations.
    /// Descriptive fields (manufacturer, product) are left out on purpose
    /// since some drivers report them lazily.
    pub fn identity_key(&self) -> String {
        format!(
            "{}|{:04x?}|{:04x?}|{}",
            self.port_name,
            self.vid,
            self.pid,
            self.serial_number.as_deref().unwrap_or("")
        )
    }
}

/// USB identity as reported by the port handle
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortIdentity {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Permission denied opening {0}")]
    PermissionDenied(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Open failed: {0}")]
    Other(String),
}

impl OpenError {
    pub fn from_serialport(port_name: &str, err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::NoDevice => OpenError::NotFound(port_name.to_string()),
            ErrorKind::InvalidInput => OpenError::InvalidParameters(err.description),
            ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                OpenError::PermissionDenied(port_name.to_string())
            }
            _ if err.description.to_lowercase().contains("busy") => {
                OpenError::DeviceBusy(port_name.to_string())
            }
            _ => OpenError::Other(format!("{}: {}", port_name, err.description)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("End of stream")]
    EndOfStream,

    #[error("Device removed: {0}")]
    DeviceRemoved(String),

    #[error("Port is not open")]
    NotOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReadError {
    /// Errors after which the endpoint cannot deliver more bytes
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReadError::EndOfStream | ReadError::DeviceRemoved(_) | ReadError::NotOpen
        )
    }

    /// Classify a raw I/O failure; unplugged USB adapters surface as broken pipes
    pub fn from_io(port_name: &str, err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
                ReadError::DeviceRemoved(format!("{}: {}", port_name, err))
            }
            _ => ReadError::Io(err),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("Port is not open")]
    NotOpen,

    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Read loop is not running")]
    LoopGone,
}

#[derive(Debug, thiserror::Error)]
pub enum CloseError {
    #[error("Close failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;
