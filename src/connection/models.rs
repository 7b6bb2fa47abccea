use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::serial::reader::StopReason;
use crate::serial::{ConnectionParams, SerialDeviceInfo};

/// Stable identity of a physical port across enumerations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub Uuid);

impl PortId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for PortId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One successful open of a port; a reconnect gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    Errored(String),
}

/// Known serial endpoint as tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub info: SerialDeviceInfo,
    pub connection_state: ConnectionState,
    /// Parameters of the current or most recent connection
    pub params: Option<ConnectionParams>,
    pub last_seen: DateTime<Utc>,
}

impl Port {
    pub fn from_serial_info(info: SerialDeviceInfo) -> Self {
        Self {
            id: PortId::new(),
            info,
            connection_state: ConnectionState::Closed,
            params: None,
            last_seen: Utc::now(),
        }
    }

    pub fn port_name(&self) -> &str {
        &self.info.port_name
    }

    pub fn is_open(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Open)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }

    /// Take fresh enumeration metadata without touching connection state
    pub fn refresh_info(&mut self, info: SerialDeviceInfo) {
        self.info = info;
        self.last_seen = Utc::now();
    }
}

/// Returned by a successful connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHandle {
    pub connection_id: ConnectionId,
    pub port_id: PortId,
    pub port_name: String,
    pub params: ConnectionParams,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connected {
        connection_id: ConnectionId,
        port_id: PortId,
        params: ConnectionParams,
    },
    DataReceived {
        connection_id: ConnectionId,
        port_id: PortId,
        bytes: usize,
        total_bytes: u64,
    },
    ReadError {
        connection_id: ConnectionId,
        port_id: PortId,
        message: String,
        fatal: bool,
    },
    Stopped {
        connection_id: ConnectionId,
        port_id: PortId,
        reason: StopReason,
    },
    Disconnected {
        connection_id: ConnectionId,
        port_id: PortId,
    },
}

/// Result of one port within a bulk operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortOutcome {
    pub port_id: PortId,
    pub port_name: String,
    pub error: Option<String>,
}

impl PortOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate of a connect-all / disconnect-all pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub outcomes: Vec<PortOutcome>,
    pub succeeded: usize,
    pub failed: usize,
}

impl BulkOutcome {
    pub fn push(&mut self, port_id: PortId, port_name: &str, error: Option<String>) {
        if error.is_some() {
            self.failed += 1;
        } else {
            self.succeeded += 1;
        }
        self.outcomes.push(PortOutcome {
            port_id,
            port_name: port_name.to_string(),
            error,
        });
    }
}

/// Per-port throughput reported by a rate tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRate {
    pub port_id: PortId,
    pub port_name: String,
    pub bytes_per_second: f64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateReport {
    pub ports: Vec<PortRate>,
    pub total_bytes_per_second: f64,
}
