use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("analog read failed: {0}")]
    AnalogRead(String),
    #[error("digital read failed: {0}")]
    DigitalRead(String),
    #[error("output write failed: {0}")]
    OutputWrite(String),
    #[error("pairing radio shutdown failed: {0}")]
    RadioShutdown(String),
    #[error("configuration erase failed: {0}")]
    ConfigErase(String),
    #[error("telemetry publish failed: {0}")]
    Publish(String),
    #[error("telemetry encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DeviceError {
    /// Hardware faults have no degraded mode; the caller restarts the device.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AnalogRead(_) | Self::DigitalRead(_) | Self::OutputWrite(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_faults_are_fatal() {
        assert!(DeviceError::AnalogRead("adc timeout".into()).is_fatal());
        assert!(DeviceError::DigitalRead("gpio9".into()).is_fatal());
        assert!(DeviceError::OutputWrite("gpio8".into()).is_fatal());
    }

    #[test]
    fn collaborator_failures_are_not_fatal() {
        assert!(!DeviceError::Publish("offline".into()).is_fatal());
        assert!(!DeviceError::RadioShutdown("busy".into()).is_fatal());
        assert!(!DeviceError::ConfigErase("flash".into()).is_fatal());
    }
}
