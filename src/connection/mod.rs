pub mod models;
pub mod registry;

pub use models::*;
pub use registry::{ConnectionRegistry, RegistrySettings};

use crate::serial::{OpenError, SerialError};

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Invalid connection parameters: {0}")]
    InvalidParams(String),

    #[error("Port not found")]
    PortNotFound,

    #[error("Port already connected")]
    AlreadyConnected,

    #[error("Failed to open port: {0}")]
    Open(#[from] OpenError),

    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] SerialError),
}

#[derive(Debug, thiserror::Error)]
pub enum DisconnectError {
    #[error("Read task failed while stopping: {0}")]
    TaskFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Port not connected")]
    NotConnected,

    #[error("Write failed: {0}")]
    Write(#[from] crate::serial::WriteError),
}
