#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use serialwatch_lib::connection::{ConnectionRegistry, RegistrySettings};
use serialwatch_lib::serial::reader::ReadLoopSettings;
use serialwatch_lib::serial::{
    CloseError, ConnectionParams, OpenError, PortHandle, PortIdentity, PortProvider, ReadError,
    SerialDeviceInfo, SerialError, WriteError,
};

/// What a correctly-configured device prints
pub const PAYLOAD: &[u8] = b"temp=21.5 hum=40\r\n";
/// What the same device looks like at the wrong baud rate
pub const GARBAGE: &[u8] = &[0x00, 0xff, 0x80, 0x9c, 0x01, 0xfe, 0x13, 0x7f, 0xe0];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Open { port: String, baud: u32 },
    Close { port: String },
}

/// One scripted read result for ports with a feed
#[derive(Debug)]
pub enum MockRead {
    Data(Vec<u8>),
    Error(io::ErrorKind),
    Eof,
}

#[derive(Debug, Clone, Default)]
pub struct MockPortSpec {
    pub name: String,
    pub correct_baud: Option<u32>,
    pub reject_bauds: Vec<u32>,
    pub fail_open: bool,
    pub open_delay: Option<Duration>,
}

impl MockPortSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn correct_baud(mut self, baud: u32) -> Self {
        self.correct_baud = Some(baud);
        self
    }

    pub fn reject_bauds(mut self, bauds: &[u32]) -> Self {
        self.reject_bauds = bauds.to_vec();
        self
    }

    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Make `open` take this long, like a slow USB adapter
    pub fn open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }
}

type Feed = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRead>>>;

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    open: Mutex<HashSet<String>>,
    written: Mutex<HashMap<String, Vec<u8>>>,
}

/// In-memory stand-in for the OS serial stack.
///
/// Ports without a feed answer timed reads with `PAYLOAD` at their correct
/// baud and `GARBAGE` otherwise, and never answer untimed reads.
#[derive(Default)]
pub struct MockProvider {
    ports: Mutex<Vec<MockPortSpec>>,
    feeds: Mutex<HashMap<String, Feed>>,
    shared: Arc<Shared>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(self, spec: MockPortSpec) -> Self {
        self.add_port(spec);
        self
    }

    pub fn add_port(&self, spec: MockPortSpec) {
        self.ports.lock().unwrap().push(spec);
    }

    pub fn remove_port(&self, name: &str) {
        self.ports.lock().unwrap().retain(|p| p.name != name);
    }

    /// Script the reads of `name`; dropping the sender ends the stream
    pub fn feed(&self, name: &str) -> mpsc::UnboundedSender<MockRead> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(tokio::sync::Mutex::new(rx)));
        tx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn opened_bauds(&self, name: &str) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Open { port, baud } if port == name => Some(baud),
                _ => None,
            })
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Open { .. })).count()
    }

    pub fn close_count(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Close { .. })).count()
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.shared.open.lock().unwrap().contains(name)
    }

    pub fn written(&self, name: &str) -> Vec<u8> {
        self.shared
            .written
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    fn info(spec: &MockPortSpec) -> SerialDeviceInfo {
        let mut info = SerialDeviceInfo::new(spec.name.clone());
        info.vid = Some(0x2341);
        info.pid = Some(0x0043);
        info.serial_number = Some(format!("SN-{}", spec.name));
        info
    }
}

#[async_trait]
impl PortProvider for MockProvider {
    async fn list_authorized_ports(&self) -> Result<Vec<SerialDeviceInfo>, SerialError> {
        Ok(self.ports.lock().unwrap().iter().map(Self::info).collect())
    }

    async fn request_port_access(
        &self,
        hint: Option<&str>,
    ) -> Result<Option<SerialDeviceInfo>, SerialError> {
        let ports = self.ports.lock().unwrap();
        let granted = match hint {
            Some(name) => ports.iter().find(|p| p.name == name),
            None => ports.first(),
        };
        Ok(granted.map(Self::info))
    }

    fn create_handle(&self, port: &SerialDeviceInfo) -> Box<dyn PortHandle> {
        let spec = self
            .ports
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name == port.port_name)
            .cloned()
            .unwrap_or_else(|| MockPortSpec::new(&port.port_name));
        let feed = self.feeds.lock().unwrap().get(&port.port_name).cloned();

        Box::new(MockPort {
            identity: port.identity(),
            spec,
            feed,
            shared: self.shared.clone(),
            baud: None,
        })
    }
}

pub struct MockPort {
    identity: PortIdentity,
    spec: MockPortSpec,
    feed: Option<Feed>,
    shared: Arc<Shared>,
    baud: Option<u32>,
}

impl MockPort {
    async fn next_scripted(feed: &Feed) -> Option<MockRead> {
        feed.lock().await.recv().await
    }
}

#[async_trait]
impl PortHandle for MockPort {
    async fn open(&mut self, params: &ConnectionParams) -> Result<(), OpenError> {
        if let Some(delay) = self.spec.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.spec.fail_open {
            return Err(OpenError::PermissionDenied(self.spec.name.clone()));
        }
        if self.spec.reject_bauds.contains(&params.baud_rate) {
            return Err(OpenError::InvalidParameters(format!(
                "{} baud not supported",
                params.baud_rate
            )));
        }
        if !self.shared.open.lock().unwrap().insert(self.spec.name.clone()) {
            return Err(OpenError::DeviceBusy(self.spec.name.clone()));
        }

        self.baud = Some(params.baud_rate);
        self.shared.calls.lock().unwrap().push(Call::Open {
            port: self.spec.name.clone(),
            baud: params.baud_rate,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        if self.baud.take().is_some() {
            self.shared.open.lock().unwrap().remove(&self.spec.name);
            self.shared.calls.lock().unwrap().push(Call::Close {
                port: self.spec.name.clone(),
            });
        }
        Ok(())
    }

    async fn read(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, ReadError> {
        let baud = self.baud.ok_or(ReadError::NotOpen)?;

        let Some(feed) = self.feed.clone() else {
            let Some(limit) = timeout else {
                std::future::pending::<()>().await;
                return Ok(Vec::new());
            };
            tokio::time::sleep(limit.min(Duration::from_millis(5))).await;
            let sample = if self.spec.correct_baud == Some(baud) {
                PAYLOAD
            } else {
                GARBAGE
            };
            return Ok(sample.to_vec());
        };

        let next = match timeout {
            Some(limit) => match tokio::time::timeout(limit, Self::next_scripted(&feed)).await {
                Ok(next) => next,
                Err(_) => return Ok(Vec::new()),
            },
            None => Self::next_scripted(&feed).await,
        };

        match next {
            Some(MockRead::Data(bytes)) => Ok(bytes),
            Some(MockRead::Error(kind)) => Err(ReadError::from_io(
                &self.spec.name,
                io::Error::new(kind, "mock failure"),
            )),
            Some(MockRead::Eof) | None => Err(ReadError::EndOfStream),
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.baud.is_none() {
            return Err(WriteError::NotOpen);
        }
        self.shared
            .written
            .lock()
            .unwrap()
            .entry(self.spec.name.clone())
            .or_default()
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn identity(&self) -> PortIdentity {
        self.identity.clone()
    }

    fn port_name(&self) -> &str {
        &self.spec.name
    }
}

impl Drop for MockPort {
    // Like an OS handle, a dropped port stops holding the device
    fn drop(&mut self) {
        if self.baud.is_some() {
            self.shared.open.lock().unwrap().remove(&self.spec.name);
        }
    }
}

/// Settings tuned for tests: short pause poll and backoff
pub fn test_settings() -> RegistrySettings {
    RegistrySettings {
        shutdown_timeout: Duration::from_millis(500),
        read_loop: ReadLoopSettings {
            pause_poll: Duration::from_millis(10),
            max_consecutive_errors: 5,
            error_backoff: Duration::from_millis(5),
        },
        ..RegistrySettings::default()
    }
}

pub fn registry(provider: Arc<MockProvider>) -> ConnectionRegistry {
    ConnectionRegistry::new(provider, test_settings())
}

/// Poll `check` every 10ms for up to two seconds
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
