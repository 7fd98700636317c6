//! Operator control channel.
//!
//! `command` holds the wire types and dispatch onto the `Controller`; `mqtt`
//! carries them over an MQTT session with availability tracking.

pub mod command;
pub mod mqtt;

pub use command::{handle_command, parse_command, ControlCommand, StatusUpdate};
pub use mqtt::{ControlBridge, ControlTopics, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
