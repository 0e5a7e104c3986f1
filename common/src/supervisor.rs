use std::convert::Infallible;

use log::info;

use crate::{
    actuator::ActuatorState,
    button::{poll_button, ButtonInput, FactoryReset, LongPressDetector, PressOutcome},
    config::{ButtonConfig, MeasurementConfig},
    current::{AnalogInput, CurrentSensor},
    error::DeviceError,
    pacer::Pacer,
    pairing::ConnectivitySignal,
    telemetry::{TelemetryPublisher, TelemetrySink},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: &'static str,
    pub priority: u8,
    pub stack_size: usize,
}

/// Highest priority so the reset gesture always gets through.
pub const RESET_TASK: TaskSpec = TaskSpec {
    name: "reset_task",
    priority: 4,
    stack_size: 4 * 1024,
};

pub const CURRENT_TASK: TaskSpec = TaskSpec {
    name: "curr_task",
    priority: 3,
    stack_size: 8 * 1024,
};

pub const PAIRING_TASK: TaskSpec = TaskSpec {
    name: "prov_guard",
    priority: 2,
    stack_size: 4 * 1024,
};

pub const COMMAND_TASK: TaskSpec = TaskSpec {
    name: "mqtt_rx",
    priority: 3,
    stack_size: 8 * 1024,
};

/// Measure, log, publish, sleep. Returns only on a fatal error. `on_cycle` runs at the top of every cycle
/// (watchdog feed on hardware).
pub fn run_measurement_loop<A, P, S>(
    config: MeasurementConfig,
    input: &mut A,
    pacer: &mut P,
    actuator: &ActuatorState,
    connectivity: &ConnectivitySignal,
    sink: &mut S,
    mut on_cycle: impl FnMut(),
) -> Result<Infallible, DeviceError>
where
    A: AnalogInput,
    P: Pacer,
    S: TelemetrySink,
{
    let period = config.cycle_period();
    let mut sensor = CurrentSensor::new(config);
    let publisher = TelemetryPublisher::new();

    loop {
        on_cycle();

        let sample = sensor.measure(input, pacer, actuator)?;
        info!(
            "I: {:.3}A | P: {:.1}W | Relay: {}",
            sample.current_amps,
            sample.power_watts,
            u8::from(sample.relay_state)
        );

        publisher.publish(&sample, connectivity.is_reachable(), sink);
        pacer.sleep(period);
    }
}

/// Polls the reset button until a fatal read error or a completed reset.
/// A completed reset only returns off-target, where restart can come back.
pub fn run_button_loop<B, F, P>(
    config: &ButtonConfig,
    input: &mut B,
    reset: &mut F,
    pacer: &mut P,
) -> Result<(), DeviceError>
where
    B: ButtonInput,
    F: FactoryReset,
    P: Pacer,
{
    let mut detector = LongPressDetector::new(config.long_press_ticks());
    let interval = config.poll_interval();

    loop {
        if poll_button(&mut detector, input, reset)? == PressOutcome::LongPress {
            return Ok(());
        }
        pacer.sleep(interval);
    }
}
