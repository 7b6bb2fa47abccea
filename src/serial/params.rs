//! Line parameters for opening a serial port.
//!
//! The serialport/tokio-serial builders accept a wider range of values
//! than the monitor supports; the enums here narrow them to the framings
//! the monitor can open (7 or 8 data bits, 1 or 2 stop bits).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataBits {
    Seven,
    Eight,
}

impl TryFrom<u8> for DataBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            7 => Ok(DataBits::Seven),
            8 => Ok(DataBits::Eight),
            other => Err(format!("unsupported data bits: {}", other)),
        }
    }
}

impl From<DataBits> for u8 {
    fn from(bits: DataBits) -> u8 {
        match bits {
            DataBits::Seven => 7,
            DataBits::Eight => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop bits: {}", other)),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(bits: StopBits) -> u8 {
        match bits {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
}

/// Fully specified line configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
}

impl ConnectionParams {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Self::default()
        }
    }

    /// Fixed 8N1 framing without flow control, used for baud probing
    pub fn probe(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.baud_rate == 0 {
            return Err("baud rate must be positive".to_string());
        }
        Ok(())
    }

    pub fn to_serialport_data_bits(&self) -> serialport::DataBits {
        match self.data_bits {
            DataBits::Seven => serialport::DataBits::Seven,
            DataBits::Eight => serialport::DataBits::Eight,
        }
    }

    pub fn to_serialport_stop_bits(&self) -> serialport::StopBits {
        match self.stop_bits {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }

    pub fn to_serialport_parity(&self) -> serialport::Parity {
        match self.parity {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }

    pub fn to_serialport_flow_control(&self) -> serialport::FlowControl {
        match self.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
        }
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self::probe(115_200)
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(
            f,
            "{} {}{}{}",
            self.baud_rate,
            u8::from(self.data_bits),
            parity,
            u8::from(self.stop_bits)
        )?;
        if self.flow_control == FlowControl::Hardware {
            write!(f, " RTS/CTS")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_baud_rejected() {
        assert!(ConnectionParams::new(0).validate().is_err());
        assert!(ConnectionParams::new(9600).validate().is_ok());
    }

    #[test]
    fn test_probe_framing_is_8n1() {
        let params = ConnectionParams::probe(57_600);
        assert_eq!(params.data_bits, DataBits::Eight);
        assert_eq!(params.stop_bits, StopBits::One);
        assert_eq!(params.parity, Parity::None);
        assert_eq!(params.flow_control, FlowControl::None);
        assert_eq!(params.to_string(), "57600 8N1");
    }

    #[test]
    fn test_serde_uses_numeric_bits() {
        let json = r#"{"baudRate":9600,"dataBits":7,"stopBits":2,"parity":"even","flowControl":"hardware"}"#;
        let params: ConnectionParams = serde_json::from_str(json).unwrap();
        assert_eq!(params.data_bits, DataBits::Seven);
        assert_eq!(params.stop_bits, StopBits::Two);
        assert_eq!(params.to_string(), "9600 7E2 RTS/CTS");

        let bad = r#"{"baudRate":9600,"dataBits":5,"stopBits":1,"parity":"none","flowControl":"none"}"#;
        assert!(serde_json::from_str::<ConnectionParams>(bad).is_err());
    }

    #[test]
    fn test_serialport_conversions() {
        let params = ConnectionParams {
            baud_rate: 19_200,
            data_bits: DataBits::Seven,
            stop_bits: StopBits::Two,
            parity: Parity::Odd,
            flow_control: FlowControl::Hardware,
        };
        assert!(matches!(params.to_serialport_data_bits(), serialport::DataBits::Seven));
        assert!(matches!(params.to_serialport_stop_bits(), serialport::StopBits::Two));
        assert!(matches!(params.to_serialport_parity(), serialport::Parity::Odd));
        assert!(matches!(
            params.to_serialport_flow_control(),
            serialport::FlowControl::Hardware
        ));
    }
}
