pub mod actuator;
pub mod button;
pub mod command;
pub mod config;
pub mod current;
pub mod error;
pub mod pacer;
pub mod pairing;
pub mod supervisor;
pub mod telemetry;
pub mod topics;
pub mod types;

pub use actuator::{ActuatorState, RelayDriver, Switch};
pub use button::{ButtonInput, FactoryReset, LongPressDetector, PressOutcome};
pub use command::{handle_message, CommandOutcome, CommandSubscription};
pub use config::{ButtonConfig, MeasurementConfig, NetworkConfig, PairingConfig, SocketConfig};
pub use current::{AnalogInput, CurrentSensor};
pub use error::DeviceError;
pub use pacer::{Pacer, StdPacer, YieldPolicy};
pub use pairing::{
    ConnectivitySignal, ConnectivityWait, PairingLifecycle, PairingRadio, PairingState,
    RadioGuard, WaitOutcome,
};
pub use telemetry::{PublishOutcome, TelemetryPublisher, TelemetrySink};
pub use topics::*;
pub use types::{MeasurementSample, SwitchCommand, TelemetryPayload};
