use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{
    BulkOutcome, ConnectError, ConnectionEvent, ConnectionHandle, ConnectionId, ConnectionState,
    DisconnectError, Port, PortId, PortRate, RateReport, SendError,
};
use crate::metrics::{RateEstimator, StatsAggregator, StatsSnapshot};
use crate::serial::buffer::DEFAULT_BUFFER_CAPACITY;
use crate::serial::reader::{
    run_read_loop, LoopCommand, ReadLoopContext, ReadLoopSettings, ReadLoopState, StopReason,
};
use crate::serial::{ByteRingBuffer, ConnectionParams, PortProvider, SerialError, WriteError};

const COMMAND_CAPACITY: usize = 32;

/// Minimum spacing between sequential opens in bulk operations
pub const MIN_INTER_PORT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub buffer_capacity: usize,
    pub inter_port_delay: Duration,
    pub shutdown_timeout: Duration,
    pub event_capacity: usize,
    pub read_loop: ReadLoopSettings,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            inter_port_delay: MIN_INTER_PORT_DELAY,
            shutdown_timeout: Duration::from_secs(2),
            event_capacity: 256,
            read_loop: ReadLoopSettings::default(),
        }
    }
}

/// Live record for one open port; owned by the registry only
struct ConnectionEntry {
    connection_id: ConnectionId,
    params: ConnectionParams,
    buffer: Arc<RwLock<ByteRingBuffer>>,
    rate: Arc<RateEstimator>,
    cmd_tx: mpsc::Sender<LoopCommand>,
    task: JoinHandle<StopReason>,
    state_rx: watch::Receiver<ReadLoopState>,
    opened_at: DateTime<Utc>,
}

type PortTable = Arc<RwLock<Vec<Port>>>;
type ConnectionTable = Arc<RwLock<HashMap<PortId, ConnectionEntry>>>;

/// Tracks known ports and owns every open connection.
///
/// Lock order is always `connections` before `ports`. Connect and
/// disconnect on the same port are serialized by a per-port lock, so a
/// disconnect issued during an in-flight connect waits for it to resolve.
pub struct ConnectionRegistry {
    provider: Arc<dyn PortProvider>,
    settings: RegistrySettings,
    ports: PortTable,
    connections: ConnectionTable,
    port_locks: Mutex<HashMap<PortId, Arc<Mutex<()>>>>,
    pause_tx: watch::Sender<bool>,
    stats: Arc<StatsAggregator>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionRegistry {
    pub fn new(provider: Arc<dyn PortProvider>, settings: RegistrySettings) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(settings.event_capacity.max(1));
        Self {
            provider,
            settings,
            ports: Arc::new(RwLock::new(Vec::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            port_locks: Mutex::new(HashMap::new()),
            pause_tx: watch::Sender::new(false),
            stats: Arc::new(StatsAggregator::new()),
            events_tx,
        }
    }

    pub fn provider(&self) -> Arc<dyn PortProvider> {
        self.provider.clone()
    }

    pub fn stats(&self) -> Arc<StatsAggregator> {
        self.stats.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Re-enumerate and reconcile by identity key.
    /// Ports that vanished are dropped unless they hold an open connection.
    pub async fn refresh_ports(&self) -> Result<Vec<Port>, SerialError> {
        let discovered = self.provider.list_authorized_ports().await?;
        let open: HashSet<PortId> = self.connections.read().await.keys().copied().collect();

        let mut ports_guard = self.ports.write().await;
        let mut previous = std::mem::take(&mut *ports_guard);
        let mut refreshed = Vec::with_capacity(discovered.len());

        for info in discovered {
            let key = info.identity_key();
            let port = match previous.iter().position(|p| p.info.identity_key() == key) {
                Some(pos) => {
                    let mut existing = previous.remove(pos);
                    existing.refresh_info(info);
                    existing
                }
                None => {
                    log::info!("Discovered port {}", info.port_name);
                    Port::from_serial_info(info)
                }
            };
            refreshed.push(port);
        }

        for port in previous {
            if open.contains(&port.id) {
                log::debug!("Port {} missing from enumeration but in use, keeping it", port.port_name());
                refreshed.push(port);
            } else {
                log::info!("Port {} is no longer present", port.port_name());
            }
        }

        *ports_guard = refreshed.clone();
        drop(ports_guard);

        let known: HashSet<PortId> = refreshed.iter().map(|p| p.id).collect();
        // A lock still referenced belongs to an operation in flight
        self.port_locks
            .lock()
            .await
            .retain(|id, lock| known.contains(id) || Arc::strong_count(lock) > 1);

        Ok(refreshed)
    }

    /// Ask the provider for access to a port and add it to the known set
    pub async fn request_port_access(&self, hint: Option<&str>) -> Result<Option<Port>, SerialError> {
        let Some(info) = self.provider.request_port_access(hint).await? else {
            return Ok(None);
        };

        let mut ports = self.ports.write().await;
        let key = info.identity_key();
        if let Some(existing) = ports.iter_mut().find(|p| p.info.identity_key() == key) {
            existing.refresh_info(info);
            return Ok(Some(existing.clone()));
        }

        let port = Port::from_serial_info(info);
        log::info!("Access granted to port {}", port.port_name());
        ports.push(port.clone());
        Ok(Some(port))
    }

    pub async fn list_known_ports(&self) -> Vec<Port> {
        self.ports.read().await.clone()
    }

    pub async fn get_port(&self, port_id: PortId) -> Option<Port> {
        self.ports.read().await.iter().find(|p| p.id == port_id).cloned()
    }

    pub async fn find_port_by_name(&self, port_name: &str) -> Option<Port> {
        self.ports
            .read()
            .await
            .iter()
            .find(|p| p.port_name() == port_name)
            .cloned()
    }

    pub async fn is_connected(&self, port_id: PortId) -> bool {
        self.connections.read().await.contains_key(&port_id)
    }

    /// Open a port and start its read loop
    pub async fn connect(
        &self,
        port_id: PortId,
        params: ConnectionParams,
    ) -> Result<ConnectionHandle, ConnectError> {
        params.validate().map_err(ConnectError::InvalidParams)?;
        if self.get_port(port_id).await.is_none() {
            return Err(ConnectError::PortNotFound);
        }

        let op_lock = self.port_lock(port_id).await;
        let _op_guard = op_lock.lock().await;

        if self.connections.read().await.contains_key(&port_id) {
            return Err(ConnectError::AlreadyConnected);
        }
        let port = self.get_port(port_id).await.ok_or(ConnectError::PortNotFound)?;

        self.set_port_state(port_id, ConnectionState::Opening).await;
        let mut opening = OpeningGuard::new(self.ports.clone(), port_id);
        log::info!("Connecting to {} at {}", port.port_name(), params);

        let mut handle = self.provider.create_handle(&port.info);
        if let Err(e) = handle.open(&params).await {
            log::error!("Failed to open {}: {}", port.port_name(), e);
            self.stats.record_error();
            self.set_port_state(port_id, ConnectionState::Errored(e.to_string())).await;
            opening.disarm();
            return Err(ConnectError::Open(e));
        }

        let connection_id = ConnectionId::new();
        let opened_at = Utc::now();
        let buffer = Arc::new(RwLock::new(ByteRingBuffer::new(self.settings.buffer_capacity)));
        let rate = Arc::new(RateEstimator::new());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ReadLoopState::Running);

        let ctx = ReadLoopContext {
            connection_id,
            port_id,
            port_name: port.port_name().to_string(),
            buffer: buffer.clone(),
            rate: rate.clone(),
            stats: self.stats.clone(),
            pause_rx: self.pause_tx.subscribe(),
            events_tx: self.events_tx.clone(),
            state_tx,
            settings: self.settings.read_loop.clone(),
        };

        {
            // Both tables are locked before spawning: a loop that ends at once
            // cannot reclaim before its entry exists, and nothing below awaits
            let mut connections = self.connections.write().await;
            let mut ports = self.ports.write().await;

            let port_table = self.ports.clone();
            let table = self.connections.clone();
            let stats = self.stats.clone();
            let events_tx = self.events_tx.clone();
            let task = tokio::spawn(async move {
                let reason = run_read_loop(handle, ctx, cmd_rx).await;
                if reason.is_self_stop() {
                    reclaim(&port_table, &table, &stats, &events_tx, port_id, connection_id, &reason).await;
                }
                reason
            });

            connections.insert(
                port_id,
                ConnectionEntry {
                    connection_id,
                    params,
                    buffer,
                    rate,
                    cmd_tx,
                    task,
                    state_rx,
                    opened_at,
                },
            );
            self.stats.connection_opened();

            // A refresh during the open may have dropped the port
            let index = match ports.iter().position(|p| p.id == port_id) {
                Some(index) => index,
                None => {
                    ports.push(port.clone());
                    ports.len() - 1
                }
            };
            ports[index].params = Some(params);
            ports[index].update_connection_state(ConnectionState::Open);
            opening.disarm();
        }

        let _ = self.events_tx.send(ConnectionEvent::Connected {
            connection_id,
            port_id,
            params,
        });
        log::info!("Connected to {} ({})", port.port_name(), connection_id);

        Ok(ConnectionHandle {
            connection_id,
            port_id,
            port_name: port.port_name().to_string(),
            params,
            opened_at,
        })
    }

    /// Stop the read loop, close the handle and drop the buffer.
    /// Disconnecting a port that is not open succeeds without doing anything.
    pub async fn disconnect(&self, port_id: PortId) -> Result<(), DisconnectError> {
        if !self.is_connected(port_id).await && self.get_port(port_id).await.is_none() {
            return Ok(());
        }

        let op_lock = self.port_lock(port_id).await;
        let _op_guard = op_lock.lock().await;

        let entry = self.connections.write().await.remove(&port_id);
        let Some(entry) = entry else {
            return Ok(());
        };
        self.set_port_state(port_id, ConnectionState::Closing).await;

        let ConnectionEntry {
            connection_id,
            cmd_tx,
            mut task,
            ..
        } = entry;

        // A full queue still ends the loop once the sender is dropped
        let _ = cmd_tx.try_send(LoopCommand::Shutdown);
        drop(cmd_tx);

        let result = match tokio::time::timeout(self.settings.shutdown_timeout, &mut task).await {
            Ok(Ok(reason)) => {
                log::debug!("Read loop for {} ended: {}", port_id, reason);
                Ok(())
            }
            Ok(Err(e)) => Err(DisconnectError::TaskFailed(e.to_string())),
            Err(_) => {
                log::warn!(
                    "Read loop for {} did not stop within {:?}, aborting",
                    port_id,
                    self.settings.shutdown_timeout
                );
                task.abort();
                // Wait for the abort so the handle is dropped before we return
                let _ = task.await;
                Ok(())
            }
        };

        self.stats.connection_closed();
        self.set_port_state(port_id, ConnectionState::Closed).await;
        let _ = self.events_tx.send(ConnectionEvent::Disconnected {
            connection_id,
            port_id,
        });
        log::info!("Disconnected port {}", port_id);

        result
    }

    /// Connect every known port that is not already open, one at a time
    pub async fn connect_all(&self, params: ConnectionParams) -> BulkOutcome {
        let candidates: Vec<Port> = {
            let connections = self.connections.read().await;
            self.ports
                .read()
                .await
                .iter()
                .filter(|p| !connections.contains_key(&p.id))
                .cloned()
                .collect()
        };

        let mut outcome = BulkOutcome::default();
        for (index, port) in candidates.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.inter_port_delay).await;
            }
            let error = match self.connect(port.id, params).await {
                Ok(_) => None,
                Err(e) => {
                    log::warn!("connect_all: {} failed: {}", port.port_name(), e);
                    Some(e.to_string())
                }
            };
            outcome.push(port.id, port.port_name(), error);
        }

        log::info!(
            "connect_all: {} connected, {} failed",
            outcome.succeeded,
            outcome.failed
        );
        outcome
    }

    /// Disconnect every open port, one at a time
    pub async fn disconnect_all(&self) -> BulkOutcome {
        let open: Vec<Port> = self.get_active_connections().await;

        let mut outcome = BulkOutcome::default();
        for (index, port) in open.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.settings.inter_port_delay).await;
            }
            let error = self.disconnect(port.id).await.err().map(|e| {
                log::warn!("disconnect_all: {} failed: {}", port.port_name(), e);
                e.to_string()
            });
            outcome.push(port.id, port.port_name(), error);
        }

        log::info!(
            "disconnect_all: {} disconnected, {} failed",
            outcome.succeeded,
            outcome.failed
        );
        outcome
    }

    /// Write bytes to an open port through its read loop
    pub async fn send(&self, port_id: PortId, data: &[u8]) -> Result<usize, SendError> {
        let cmd_tx = self
            .connections
            .read()
            .await
            .get(&port_id)
            .map(|entry| entry.cmd_tx.clone())
            .ok_or(SendError::NotConnected)?;

        let (responder, response) = oneshot::channel();
        cmd_tx
            .send(LoopCommand::Write {
                data: data.to_vec(),
                responder,
            })
            .await
            .map_err(|_| SendError::Write(WriteError::LoopGone))?;

        let written = response
            .await
            .map_err(|_| SendError::Write(WriteError::LoopGone))??;
        Ok(written)
    }

    pub fn set_paused(&self, paused: bool) {
        self.pause_tx.send_replace(paused);
        log::info!("Reading {}", if paused { "paused" } else { "resumed" });
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Copy of the receive buffer in arrival order
    pub async fn get_buffer_snapshot(&self, port_id: PortId) -> Option<Vec<u8>> {
        let buffer = self
            .connections
            .read()
            .await
            .get(&port_id)
            .map(|entry| entry.buffer.clone())?;
        let snapshot = buffer.read().await.snapshot();
        Some(snapshot)
    }

    pub async fn get_active_connections(&self) -> Vec<Port> {
        let connections = self.connections.read().await;
        self.ports
            .read()
            .await
            .iter()
            .filter(|p| connections.contains_key(&p.id))
            .cloned()
            .collect()
    }

    pub async fn get_connection(&self, port_id: PortId) -> Option<ConnectionHandle> {
        let connections = self.connections.read().await;
        let entry = connections.get(&port_id)?;
        let port_name = self
            .ports
            .read()
            .await
            .iter()
            .find(|p| p.id == port_id)
            .map(|p| p.port_name().to_string())
            .unwrap_or_default();

        Some(ConnectionHandle {
            connection_id: entry.connection_id,
            port_id,
            port_name,
            params: entry.params,
            opened_at: entry.opened_at,
        })
    }

    pub async fn loop_state(&self, port_id: PortId) -> Option<ReadLoopState> {
        self.connections
            .read()
            .await
            .get(&port_id)
            .map(|entry| *entry.state_rx.borrow())
    }

    pub fn get_stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the current rate window of every open connection
    pub async fn sample_rates(&self) -> RateReport {
        let connections = self.connections.read().await;
        let ports = self.ports.read().await;

        let mut report = RateReport::default();
        for port in ports.iter() {
            if let Some(entry) = connections.get(&port.id) {
                let bytes_per_second = entry.rate.tick();
                report.total_bytes_per_second += bytes_per_second;
                report.ports.push(PortRate {
                    port_id: port.id,
                    port_name: port.port_name().to_string(),
                    bytes_per_second,
                    total_bytes: entry.rate.total(),
                });
            }
        }
        report
    }

    async fn port_lock(&self, port_id: PortId) -> Arc<Mutex<()>> {
        let mut locks = self.port_locks.lock().await;
        locks
            .entry(port_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn set_port_state(&self, port_id: PortId, state: ConnectionState) {
        let mut ports = self.ports.write().await;
        if let Some(port) = ports.iter_mut().find(|p| p.id == port_id) {
            port.update_connection_state(state);
        }
    }
}

/// Returns a port left in `Opening` to `Closed` when a connect is dropped
/// before it either commits or records its open failure
struct OpeningGuard {
    ports: PortTable,
    port_id: PortId,
    armed: bool,
}

impl OpeningGuard {
    fn new(ports: PortTable, port_id: PortId) -> Self {
        Self {
            ports,
            port_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    fn reset(ports: &mut [Port], port_id: PortId) {
        if let Some(port) = ports.iter_mut().find(|p| p.id == port_id) {
            if port.connection_state == ConnectionState::Opening {
                port.update_connection_state(ConnectionState::Closed);
            }
        }
    }
}

impl Drop for OpeningGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::debug!("Connect to {} was cancelled while opening", self.port_id);

        if let Ok(mut ports) = self.ports.try_write() {
            Self::reset(&mut ports, self.port_id);
            return;
        }
        // Table busy; finish the reset on the runtime instead
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let ports = self.ports.clone();
            let port_id = self.port_id;
            runtime.spawn(async move {
                Self::reset(&mut ports.write().await, port_id);
            });
        }
    }
}

/// Drop a connection whose read loop ended on its own.
/// Matches on the connection id so a newer connection on the same port is left alone.
async fn reclaim(
    ports: &PortTable,
    connections: &ConnectionTable,
    stats: &StatsAggregator,
    events_tx: &broadcast::Sender<ConnectionEvent>,
    port_id: PortId,
    connection_id: ConnectionId,
    reason: &StopReason,
) {
    let mut connections = connections.write().await;
    let is_current = connections
        .get(&port_id)
        .map(|entry| entry.connection_id == connection_id)
        .unwrap_or(false);
    if !is_current {
        return;
    }
    // Our own JoinHandle goes with the entry; dropping it only detaches
    connections.remove(&port_id);
    stats.connection_closed();

    let state = match reason {
        StopReason::EndOfStream | StopReason::Cancelled => ConnectionState::Closed,
        other => ConnectionState::Errored(other.to_string()),
    };
    let mut ports = ports.write().await;
    if let Some(port) = ports.iter_mut().find(|p| p.id == port_id) {
        port.update_connection_state(state);
    }
    drop(ports);
    drop(connections);

    let _ = events_tx.send(ConnectionEvent::Disconnected {
        connection_id,
        port_id,
    });
    log::info!("Reclaimed connection {} on port {} ({})", connection_id, port_id, reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::{PortHandle, SerialDeviceInfo, SystemPort};
    use async_trait::async_trait;

    struct ListProvider(std::sync::Mutex<Vec<SerialDeviceInfo>>);

    #[async_trait]
    impl PortProvider for ListProvider {
        async fn list_authorized_ports(&self) -> Result<Vec<SerialDeviceInfo>, SerialError> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn request_port_access(
            &self,
            _hint: Option<&str>,
        ) -> Result<Option<SerialDeviceInfo>, SerialError> {
            Ok(None)
        }

        fn create_handle(&self, port: &SerialDeviceInfo) -> Box<dyn PortHandle> {
            Box::new(SystemPort::new(port))
        }
    }

    #[tokio::test]
    async fn test_port_locks_follow_known_ports() {
        let provider = Arc::new(ListProvider(std::sync::Mutex::new(vec![SerialDeviceInfo::new(
            "/dev/ttyS9".to_string(),
        )])));
        let registry = ConnectionRegistry::new(provider.clone(), RegistrySettings::default());
        let id = registry.refresh_ports().await.unwrap()[0].id;

        registry.disconnect(PortId::new()).await.unwrap();
        assert_eq!(registry.port_locks.lock().await.len(), 0);

        registry.disconnect(id).await.unwrap();
        assert_eq!(registry.port_locks.lock().await.len(), 1);

        provider.0.lock().unwrap().clear();
        assert!(registry.refresh_ports().await.unwrap().is_empty());
        assert_eq!(registry.port_locks.lock().await.len(), 0);
    }
}
