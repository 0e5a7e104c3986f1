use log::debug;

use crate::{
    actuator::{RelayDriver, Switch},
    error::DeviceError,
    topics::TOPIC_RELAY_COMMAND,
    types::SwitchCommand,
};

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Applied { changed: bool },
    Ignored,
}

/// Routes one inbound message to the relay. Unknown topics and payloads
/// other than the two command tokens are ignored without a state change.
pub fn handle_message<R: RelayDriver>(
    switch: &Switch<R>,
    topic: &str,
    payload: &[u8],
) -> Result<CommandOutcome, DeviceError> {
    if topic != TOPIC_RELAY_COMMAND {
        return Ok(CommandOutcome::Ignored);
    }

    if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
        debug!("dropping oversized command payload ({} bytes)", payload.len());
        return Ok(CommandOutcome::Ignored);
    }

    match SwitchCommand::parse(payload) {
        Some(command) => Ok(CommandOutcome::Applied {
            changed: switch.apply(command)?,
        }),
        None => {
            debug!("ignoring command payload {payload:?}");
            Ok(CommandOutcome::Ignored)
        }
    }
}

/// Pending subscription to the command topic.
///
/// A connect event only marks the subscription; the receive loop issues it
/// after it has released the event, since the MQTT stack holds its client
/// lock until then.
#[derive(Debug, Default)]
pub struct CommandSubscription {
    pending: bool,
}

impl CommandSubscription {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self) {
        self.pending = true;
    }

    /// Returns `true` once per connect, until a failed attempt re-arms it.
    pub fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub fn on_failed(&mut self) {
        self.pending = true;
    }
}
