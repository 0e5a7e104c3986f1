use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};

use log::info;

use crate::{error::DeviceError, types::SwitchCommand};

/// Digital output driving the relay coil.
pub trait RelayDriver {
    fn set_energized(&mut self, energized: bool) -> Result<(), DeviceError>;
}

/// Read-only handle on the relay flag: whether current should flow.
/// Only [`Switch::apply`] changes it.
#[derive(Debug, Clone, Default)]
pub struct ActuatorState {
    energized: Arc<AtomicBool>,
}

impl ActuatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> bool {
        self.energized.load(Ordering::SeqCst)
    }

    fn set(&self, energized: bool) {
        self.energized.store(energized, Ordering::SeqCst);
    }
}

/// Owner of the relay output. Every write to the flag goes through here.
pub struct Switch<R> {
    state: ActuatorState,
    driver: Mutex<R>,
}

impl<R: RelayDriver> Switch<R> {
    /// Drives the output low and starts with the flag cleared.
    pub fn new(mut driver: R) -> Result<Self, DeviceError> {
        driver.set_energized(false)?;
        Ok(Self {
            state: ActuatorState::new(),
            driver: Mutex::new(driver),
        })
    }

    pub fn state(&self) -> ActuatorState {
        self.state.clone()
    }

    /// Applies a remote command. Returns whether the relay changed.
    ///
    /// The flag is published only after the output write succeeded, so a
    /// failed write leaves both at their previous value.
    pub fn apply(&self, command: SwitchCommand) -> Result<bool, DeviceError> {
        let energized = command.energized();
        let mut driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);

        if self.state.get() == energized {
            return Ok(false);
        }

        driver.set_energized(energized)?;
        self.state.set(energized);
        info!("relay {}", if energized { "on" } else { "off" });
        Ok(true)
    }

    /// Runs `f` against the driver while holding the write lock, so the
    /// observed output level is never mid-update.
    #[cfg(test)]
    pub fn with_driver<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner);
        f(&driver)
    }
}
