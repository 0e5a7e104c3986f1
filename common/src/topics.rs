pub const TOPIC_RELAY_COMMAND: &str = "home/c3/led";
pub const TOPIC_STATUS: &str = "home/c3/status";
