use log::warn;

use crate::{
    error::DeviceError,
    topics::TOPIC_STATUS,
    types::{MeasurementSample, TelemetryPayload},
};

/// Outbound side of the messaging collaborator. Delivery is requested
/// at-least-once; acknowledgements are not tracked here.
pub trait TelemetrySink {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), DeviceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    SkippedOffline,
    Failed,
}

/// Best-effort publisher: no buffering, no retry. A sample that cannot be
/// sent now is dropped in favour of the next one.
#[derive(Debug, Default)]
pub struct TelemetryPublisher;

impl TelemetryPublisher {
    pub fn new() -> Self {
        Self
    }

    pub fn publish<S: TelemetrySink>(
        &self,
        sample: &MeasurementSample,
        reachable: bool,
        sink: &mut S,
    ) -> PublishOutcome {
        if !reachable {
            return PublishOutcome::SkippedOffline;
        }

        let result = TelemetryPayload::from_sample(sample)
            .and_then(|payload| payload.to_vec())
            .and_then(|body| sink.publish(TOPIC_STATUS, &body));

        match result {
            Ok(()) => PublishOutcome::Sent,
            Err(err) => {
                warn!("status publish failed: {err}");
                PublishOutcome::Failed
            }
        }
    }
}
