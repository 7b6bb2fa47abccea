//! Per-connection read task.
//!
//! The loop owns the open `PortHandle`. It races a read against the command
//! channel, so a shutdown request interrupts a pending read right away.
//! A pause request wakes the loop the same way. The handle is closed on
//! every way out of the loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch, RwLock};
use tokio::time::sleep;

use super::{ByteRingBuffer, PortHandle, ReadError, WriteError};
use crate::connection::{ConnectionEvent, ConnectionId, PortId};
use crate::metrics::{RateEstimator, StatsAggregator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadLoopState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    Cancelled,
    EndOfStream,
    DeviceRemoved(String),
    TooManyErrors(String),
}

impl StopReason {
    /// Whether the loop ended by itself rather than on request
    pub fn is_self_stop(&self) -> bool {
        !matches!(self, StopReason::Cancelled)
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Cancelled => write!(f, "cancelled"),
            StopReason::EndOfStream => write!(f, "end of stream"),
            StopReason::DeviceRemoved(msg) => write!(f, "device removed ({})", msg),
            StopReason::TooManyErrors(msg) => write!(f, "too many read errors (last: {})", msg),
        }
    }
}

#[derive(Debug)]
pub enum LoopCommand {
    Write {
        data: Vec<u8>,
        responder: oneshot::Sender<Result<usize, WriteError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ReadLoopSettings {
    pub pause_poll: Duration,
    pub max_consecutive_errors: u32,
    pub error_backoff: Duration,
}

impl Default for ReadLoopSettings {
    fn default() -> Self {
        Self {
            pause_poll: Duration::from_millis(100),
            max_consecutive_errors: 5,
            error_backoff: Duration::from_millis(50),
        }
    }
}

/// Everything the loop shares with the registry and observers
pub struct ReadLoopContext {
    pub connection_id: ConnectionId,
    pub port_id: PortId,
    pub port_name: String,
    pub buffer: Arc<RwLock<ByteRingBuffer>>,
    pub rate: Arc<RateEstimator>,
    pub stats: Arc<StatsAggregator>,
    pub pause_rx: watch::Receiver<bool>,
    pub events_tx: broadcast::Sender<ConnectionEvent>,
    pub state_tx: watch::Sender<ReadLoopState>,
    pub settings: ReadLoopSettings,
}

impl ReadLoopContext {
    fn set_state(&self, state: ReadLoopState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn ingest(&self, bytes: &[u8]) {
        let evicted = {
            let mut buffer = self.buffer.write().await;
            buffer.append(bytes)
        };
        if evicted > 0 {
            log::trace!("{}: evicted {} old bytes", self.port_name, evicted);
        }
        self.rate.record(bytes.len());
        let _ = self.events_tx.send(ConnectionEvent::DataReceived {
            connection_id: self.connection_id,
            port_id: self.port_id,
            bytes: bytes.len(),
            total_bytes: self.rate.total(),
        });
    }
}

/// Run until cancelled, end-of-stream, or a fatal read error
pub async fn run_read_loop(
    mut handle: Box<dyn PortHandle>,
    ctx: ReadLoopContext,
    mut cmd_rx: mpsc::Receiver<LoopCommand>,
) -> StopReason {
    log::info!("Read loop started for {}", ctx.port_name);

    let reason = drive(handle.as_mut(), &ctx, &mut cmd_rx).await;

    if let Err(e) = handle.close().await {
        log::warn!("Closing {} after read loop failed: {}", ctx.port_name, e);
    }
    drop(handle);
    // Pending writers see their responder dropped
    drop(cmd_rx);

    ctx.set_state(ReadLoopState::Stopped);
    let _ = ctx.events_tx.send(ConnectionEvent::Stopped {
        connection_id: ctx.connection_id,
        port_id: ctx.port_id,
        reason: reason.clone(),
    });
    log::info!("Read loop for {} stopped: {}", ctx.port_name, reason);

    reason
}

async fn drive(
    handle: &mut dyn PortHandle,
    ctx: &ReadLoopContext,
    cmd_rx: &mut mpsc::Receiver<LoopCommand>,
) -> StopReason {
    let mut consecutive_errors: u32 = 0;
    let mut pause_rx = ctx.pause_rx.clone();

    loop {
        if *pause_rx.borrow_and_update() {
            ctx.set_state(ReadLoopState::Paused);
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    if let Some(reason) = handle_command(handle, cmd).await {
                        return reason;
                    }
                }
                _ = sleep(ctx.settings.pause_poll) => {}
            }
            continue;
        }
        ctx.set_state(ReadLoopState::Running);

        tokio::select! {
            cmd = cmd_rx.recv() => {
                if let Some(reason) = handle_command(handle, cmd).await {
                    return reason;
                }
            }
            changed = pause_rx.changed() => {
                // Sender lives in the registry
                if changed.is_err() {
                    return StopReason::Cancelled;
                }
            }
            read = handle.read(None) => match read {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => {
                    consecutive_errors = 0;
                    ctx.ingest(&bytes).await;
                }
                Err(ReadError::EndOfStream) => {
                    log::info!("{}: end of stream", ctx.port_name);
                    return StopReason::EndOfStream;
                }
                Err(e) => {
                    let message = e.to_string();
                    let fatal = e.is_terminal();
                    ctx.stats.record_error();
                    let _ = ctx.events_tx.send(ConnectionEvent::ReadError {
                        connection_id: ctx.connection_id,
                        port_id: ctx.port_id,
                        message: message.clone(),
                        fatal,
                    });

                    if fatal {
                        log::error!("{}: {}", ctx.port_name, message);
                        return StopReason::DeviceRemoved(message);
                    }

                    consecutive_errors += 1;
                    log::warn!(
                        "{}: read error {}/{}: {}",
                        ctx.port_name,
                        consecutive_errors,
                        ctx.settings.max_consecutive_errors,
                        message
                    );
                    if consecutive_errors >= ctx.settings.max_consecutive_errors {
                        return StopReason::TooManyErrors(message);
                    }
                    if let Some(reason) = back_off(handle, ctx, cmd_rx).await {
                        return reason;
                    }
                }
            }
        }
    }
}

/// Wait out the retry backoff while still serving commands
async fn back_off(
    handle: &mut dyn PortHandle,
    ctx: &ReadLoopContext,
    cmd_rx: &mut mpsc::Receiver<LoopCommand>,
) -> Option<StopReason> {
    let deadline = sleep(ctx.settings.error_backoff);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                if let Some(reason) = handle_command(handle, cmd).await {
                    return Some(reason);
                }
            }
            _ = &mut deadline => return None,
        }
    }
}

async fn handle_command(handle: &mut dyn PortHandle, cmd: Option<LoopCommand>) -> Option<StopReason> {
    match cmd {
        Some(LoopCommand::Write { data, responder }) => {
            let result = handle.write(&data).await;
            if let Err(ref e) = result {
                log::warn!("{}: write of {} bytes failed: {}", handle.port_name(), data.len(), e);
            }
            let _ = responder.send(result);
            None
        }
        // A dropped sender means the registry forgot this connection
        Some(LoopCommand::Shutdown) | None => Some(StopReason::Cancelled),
    }
}
