//! Surface for the display layer.
//!
//! Every command returns `Result<_, String>` with a message that can be
//! shown to the user as-is; ports are addressed by their id string.

use std::sync::Arc;

use crate::config::MonitorConfig;
use crate::connection::{
    BulkOutcome, ConnectionHandle, ConnectionRegistry, Port, PortId, RateReport,
};
use crate::metrics::StatsSnapshot;
use crate::probe::{BaudProber, ProbeError, ProbeResult};
use crate::serial::{ConnectionParams, PortProvider, SystemPortProvider};

/// Registry plus prober behind one handle
pub struct SerialMonitor {
    registry: ConnectionRegistry,
    prober: BaudProber,
}

impl SerialMonitor {
    pub fn new(provider: Arc<dyn PortProvider>, config: &MonitorConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(provider.clone(), config.registry_settings()),
            prober: BaudProber::new(provider, config.probe_settings()),
        }
    }

    /// Monitor over the OS serial stack
    pub fn system(config: &MonitorConfig) -> Self {
        Self::new(Arc::new(SystemPortProvider::new()), config)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn prober(&self) -> &BaudProber {
        &self.prober
    }

    /// Re-enumerate ports
    pub async fn discover_ports(&self) -> Result<Vec<Port>, String> {
        self.registry
            .refresh_ports()
            .await
            .map_err(|e| format!("Failed to discover ports: {}", e))
    }

    pub async fn request_port_access(&self, hint: Option<&str>) -> Result<Option<Port>, String> {
        self.registry
            .request_port_access(hint)
            .await
            .map_err(|e| format!("Failed to request port access: {}", e))
    }

    pub async fn get_ports(&self) -> Vec<Port> {
        self.registry.list_known_ports().await
    }

    pub async fn connect_port(
        &self,
        port_id: &str,
        params: ConnectionParams,
    ) -> Result<ConnectionHandle, String> {
        let id = parse_port_id(port_id)?;
        self.registry
            .connect(id, params)
            .await
            .map_err(|e| format!("Failed to connect: {}", e))
    }

    pub async fn disconnect_port(&self, port_id: &str) -> Result<(), String> {
        let id = parse_port_id(port_id)?;
        self.registry
            .disconnect(id)
            .await
            .map_err(|e| format!("Failed to disconnect: {}", e))
    }

    pub async fn connect_all(&self, params: ConnectionParams) -> BulkOutcome {
        self.registry.connect_all(params).await
    }

    pub async fn disconnect_all(&self) -> BulkOutcome {
        self.registry.disconnect_all().await
    }

    /// Probe a closed port for its baud rate
    pub async fn auto_detect(&self, port_id: &str) -> Result<ProbeResult, String> {
        let id = parse_port_id(port_id)?;
        self.detect(id)
            .await
            .map_err(|e| format!("Auto-detection failed: {}", e))
    }

    /// Probe, then connect at the detected rate with 8N1 framing
    pub async fn auto_detect_and_connect(&self, port_id: &str) -> Result<ConnectionHandle, String> {
        let id = parse_port_id(port_id)?;
        let result = self
            .detect(id)
            .await
            .map_err(|e| format!("Auto-detection failed: {}", e))?;
        let baud = result
            .baud
            .ok_or_else(|| "Auto-detection failed: no baud rate detected".to_string())?;

        self.registry
            .connect(id, ConnectionParams::probe(baud))
            .await
            .map_err(|e| format!("Failed to connect at {} baud: {}", baud, e))
    }

    pub fn abort_auto_detect(&self) {
        self.prober.abort();
    }

    pub async fn send_bytes(&self, port_id: &str, data: &[u8]) -> Result<usize, String> {
        let id = parse_port_id(port_id)?;
        self.registry
            .send(id, data)
            .await
            .map_err(|e| format!("Failed to send: {}", e))
    }

    pub fn set_paused(&self, paused: bool) {
        self.registry.set_paused(paused);
    }

    pub fn is_paused(&self) -> bool {
        self.registry.is_paused()
    }

    pub async fn get_buffer_snapshot(&self, port_id: &str) -> Result<Vec<u8>, String> {
        let id = parse_port_id(port_id)?;
        self.registry
            .get_buffer_snapshot(id)
            .await
            .ok_or_else(|| "Port not connected".to_string())
    }

    pub async fn get_active_connections(&self) -> Vec<Port> {
        self.registry.get_active_connections().await
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.registry.get_stats()
    }

    pub async fn get_last_probe_result(&self) -> Option<ProbeResult> {
        self.prober.last_result().await
    }

    pub async fn sample_rates(&self) -> RateReport {
        self.registry.sample_rates().await
    }

    async fn detect(&self, port_id: PortId) -> Result<ProbeResult, ProbeError> {
        let port = self
            .registry
            .get_port(port_id)
            .await
            .ok_or(ProbeError::PortNotFound)?;
        if self.registry.is_connected(port_id).await {
            return Err(ProbeError::PortInUse(port.port_name().to_string()));
        }
        self.prober.auto_detect(&port.info).await
    }
}

fn parse_port_id(port_id: &str) -> Result<PortId, String> {
    PortId::parse(port_id).map_err(|e| format!("Invalid port ID: {}", e))
}
