use serde::Serialize;
use serde_json::value::RawValue;

use crate::error::DeviceError;

/// Remote relay command. The wire form is exactly one ASCII byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    /// Anything other than `b"1"` or `b"0"` is not a command.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"1" => Some(Self::On),
            b"0" => Some(Self::Off),
            _ => None,
        }
    }

    pub fn energized(self) -> bool {
        matches!(self, Self::On)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeasurementSample {
    pub current_amps: f32,
    pub power_watts: f32,
    pub relay_state: bool,
}

/// Status body published on [`TOPIC_STATUS`](crate::TOPIC_STATUS):
/// `{"curr":0.000,"pwr":0.0,"relay":0}`.
#[derive(Debug, Serialize)]
pub struct TelemetryPayload {
    curr: Box<RawValue>,
    pwr: Box<RawValue>,
    relay: u8,
}

impl TelemetryPayload {
    pub fn from_sample(sample: &MeasurementSample) -> Result<Self, DeviceError> {
        Ok(Self {
            curr: fixed_point(sample.current_amps, 3)?,
            pwr: fixed_point(sample.power_watts, 1)?,
            relay: u8::from(sample.relay_state),
        })
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, DeviceError> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn fixed_point(value: f32, decimals: usize) -> Result<Box<RawValue>, DeviceError> {
    Ok(RawValue::from_string(format!("{value:.decimals$}"))?)
}
