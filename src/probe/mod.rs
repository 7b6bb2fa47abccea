pub mod prober;
pub mod scoring;

pub use prober::{BaudProber, ProbeSettings};
pub use scoring::is_plausible;

use serde::{Deserialize, Serialize};

/// Most likely rates first
pub const COMMON_BAUD_RATES: &[u32] = &[
    115_200, 9_600, 57_600, 38_400, 19_200, 4_800, 2_400, 1_200, 230_400, 460_800, 921_600,
    256_000, 128_000, 76_800, 14_400, 31_250,
];

/// Tried only after every common rate failed
pub const UNCOMMON_BAUD_RATES: &[u32] = &[
    3_000_000, 2_000_000, 1_500_000, 1_000_000, 7_200, 1_800, 600, 300,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudTier {
    Common,
    Uncommon,
}

/// Outcome of one detection run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub baud: Option<u32>,
    pub sample: Option<Vec<u8>>,
    pub candidates_tried: usize,
}

impl ProbeResult {
    pub fn matched(baud: u32, sample: Vec<u8>, candidates_tried: usize) -> Self {
        Self {
            baud: Some(baud),
            sample: Some(sample),
            candidates_tried,
        }
    }

    pub fn none(candidates_tried: usize) -> Self {
        Self {
            baud: None,
            sample: None,
            candidates_tried,
        }
    }

    pub fn is_match(&self) -> bool {
        self.baud.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProbeEvent {
    Started { port_name: String, candidates: usize },
    Trying { port_name: String, baud: u32, tier: BaudTier },
    Matched { port_name: String, baud: u32 },
    Exhausted { port_name: String },
    Aborted { port_name: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("No candidate baud rate produced plausible data")]
    Exhausted,

    #[error("Auto-detection aborted")]
    Aborted,

    #[error("Port not found")]
    PortNotFound,

    #[error("Port {0} is connected; disconnect it before auto-detection")]
    PortInUse(String),
}
