use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};

use super::scoring::is_plausible;
use super::{BaudTier, ProbeError, ProbeEvent, ProbeResult, COMMON_BAUD_RATES, UNCOMMON_BAUD_RATES};
use crate::serial::{ConnectionParams, PortProvider, SerialDeviceInfo};

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub read_timeout: Duration,
    pub attempts: u32,
    pub include_uncommon: bool,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            attempts: 3,
            include_uncommon: true,
        }
    }
}

/// Finds the baud rate of a port whose framing is 8N1 without flow control.
///
/// Every candidate is an open / sample / close cycle on a fresh handle, and
/// candidates never overlap: concurrent `auto_detect` calls queue on an
/// internal lock since serial stacks refuse concurrent opens of one device.
pub struct BaudProber {
    provider: Arc<dyn PortProvider>,
    settings: ProbeSettings,
    abort_flag: Arc<AtomicBool>,
    probe_lock: Mutex<()>,
    last_result: RwLock<Option<ProbeResult>>,
    events_tx: broadcast::Sender<ProbeEvent>,
}

impl BaudProber {
    pub fn new(provider: Arc<dyn PortProvider>, settings: ProbeSettings) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(64);
        Self {
            provider,
            settings,
            abort_flag: Arc::new(AtomicBool::new(false)),
            probe_lock: Mutex::new(()),
            last_result: RwLock::new(None),
            events_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ProbeEvent> {
        self.events_tx.subscribe()
    }

    /// Candidate list in trial order
    pub fn candidates(&self) -> Vec<(BaudTier, u32)> {
        let common = COMMON_BAUD_RATES.iter().map(|&b| (BaudTier::Common, b));
        let uncommon = UNCOMMON_BAUD_RATES
            .iter()
            .filter(|_| self.settings.include_uncommon)
            .map(|&b| (BaudTier::Uncommon, b));
        common.chain(uncommon).collect()
    }

    /// Interrupt a running detection before its next candidate
    pub fn abort(&self) {
        self.abort_flag.store(true, Ordering::Release);
    }

    pub async fn last_result(&self) -> Option<ProbeResult> {
        self.last_result.read().await.clone()
    }

    /// Try candidates in order and stop at the first plausible sample.
    /// Open failures on a candidate just move on to the next one.
    pub async fn auto_detect(&self, port: &SerialDeviceInfo) -> Result<ProbeResult, ProbeError> {
        let _probe_guard = self.probe_lock.lock().await;
        self.abort_flag.store(false, Ordering::Release);

        let candidates = self.candidates();
        let port_name = port.port_name.clone();
        log::info!("Auto-detecting baud rate on {} ({} candidates)", port_name, candidates.len());
        let _ = self.events_tx.send(ProbeEvent::Started {
            port_name: port_name.clone(),
            candidates: candidates.len(),
        });

        for (index, (tier, baud)) in candidates.iter().copied().enumerate() {
            if self.abort_flag.load(Ordering::Acquire) {
                log::info!("Auto-detection on {} aborted", port_name);
                let _ = self.events_tx.send(ProbeEvent::Aborted { port_name });
                return Err(ProbeError::Aborted);
            }

            let _ = self.events_tx.send(ProbeEvent::Trying {
                port_name: port_name.clone(),
                baud,
                tier,
            });

            if let Some(sample) = self.try_candidate(port, baud).await {
                log::info!("Detected {} baud on {} ({} byte sample)", baud, port_name, sample.len());
                let result = ProbeResult::matched(baud, sample, index + 1);
                *self.last_result.write().await = Some(result.clone());
                let _ = self.events_tx.send(ProbeEvent::Matched { port_name, baud });
                return Ok(result);
            }
        }

        log::warn!("Auto-detection on {} found no plausible baud rate", port_name);
        *self.last_result.write().await = Some(ProbeResult::none(candidates.len()));
        let _ = self.events_tx.send(ProbeEvent::Exhausted { port_name });
        Err(ProbeError::Exhausted)
    }

    /// One open / sample / close cycle
    async fn try_candidate(&self, port: &SerialDeviceInfo, baud: u32) -> Option<Vec<u8>> {
        let mut handle = self.provider.create_handle(port);

        if let Err(e) = handle.open(&ConnectionParams::probe(baud)).await {
            log::debug!("{} rejected {} baud: {}", port.port_name, baud, e);
            return None;
        }

        let mut found = None;
        for attempt in 1..=self.settings.attempts {
            match handle.read(Some(self.settings.read_timeout)).await {
                Ok(sample) if is_plausible(&sample) => {
                    found = Some(sample);
                    break;
                }
                Ok(sample) => {
                    log::trace!(
                        "{} @ {}: attempt {} implausible ({} bytes)",
                        port.port_name,
                        baud,
                        attempt,
                        sample.len()
                    );
                }
                Err(e) => {
                    log::debug!("{} @ {}: read failed: {}", port.port_name, baud, e);
                    break;
                }
            }
        }

        if let Err(e) = handle.close().await {
            log::warn!("Closing {} after probing {} baud failed: {}", port.port_name, baud, e);
        }
        found
    }
}
