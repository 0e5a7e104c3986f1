use log::{error, warn};

use crate::error::DeviceError;

/// Active-low push button with pull-up.
pub trait ButtonInput {
    fn is_pressed(&mut self) -> Result<bool, DeviceError>;
}

/// Irreversible reset actions, invoked only by the long-press path.
pub trait FactoryReset {
    fn erase_configuration(&mut self) -> Result<(), DeviceError>;

    /// Restarts the device. On hardware this never returns.
    fn restart(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PressOutcome {
    Released,
    Holding(u32),
    LongPress,
}

/// Counts consecutive "pressed" polls. Any other reading starts over.
#[derive(Debug, Clone)]
pub struct LongPressDetector {
    hold_ticks: u32,
    threshold: u32,
    fired: bool,
}

impl LongPressDetector {
    pub fn new(threshold: u32) -> Self {
        Self {
            hold_ticks: 0,
            threshold: threshold.max(1),
            fired: false,
        }
    }

    #[cfg(test)]
    pub fn hold_ticks(&self) -> u32 {
        self.hold_ticks
    }

    /// Feeds one poll. [`PressOutcome::LongPress`] is returned at most once.
    pub fn poll(&mut self, pressed: bool) -> PressOutcome {
        if !pressed {
            self.hold_ticks = 0;
            return PressOutcome::Released;
        }

        self.hold_ticks = self.hold_ticks.saturating_add(1);
        if self.hold_ticks >= self.threshold && !self.fired {
            self.fired = true;
            return PressOutcome::LongPress;
        }
        PressOutcome::Holding(self.hold_ticks)
    }
}

/// Polls the button once and performs the factory reset if the gesture
/// completed. There is no undo; a failed erase is logged and the restart
/// still happens.
pub fn poll_button<B, F>(
    detector: &mut LongPressDetector,
    input: &mut B,
    reset: &mut F,
) -> Result<PressOutcome, DeviceError>
where
    B: ButtonInput,
    F: FactoryReset,
{
    let outcome = detector.poll(input.is_pressed()?);

    if outcome == PressOutcome::LongPress {
        warn!("reset button held; erasing configuration");
        if let Err(err) = reset.erase_configuration() {
            error!("configuration erase failed: {err}");
        }
        reset.restart();
    }

    Ok(outcome)
}
