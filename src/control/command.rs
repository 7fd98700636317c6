use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::controller::{is_unknown_source, Controller, SwitchOutcome};

/// Command published on `<topic>/cmnd`.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "Command")]
pub enum ControlCommand {
    ChangeMode {
        #[serde(rename = "TargetMode")]
        target_mode: String,
    },
}

/// Status published on `<topic>/stat`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct StatusUpdate {
    #[serde(rename = "CurrentMode")]
    pub current_mode: String,
}

impl StatusUpdate {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("serialize status update")
    }
}

pub fn parse_command(payload: &[u8]) -> Result<ControlCommand> {
    serde_json::from_slice(payload).context("parse control command")
}

/// Apply one raw command payload to `controller`.
///
/// Returns the status to publish after an accepted switch. Malformed payloads,
/// unknown commands, unknown sources and failed swaps are logged and yield
/// `None`.
pub fn handle_command(controller: &mut Controller, payload: &[u8]) -> Option<StatusUpdate> {
    let command = match parse_command(payload) {
        Ok(command) => command,
        Err(e) => {
            log::warn!(
                "ignoring control message {:?}: {:#}",
                String::from_utf8_lossy(payload),
                e
            );
            return None;
        }
    };

    match command {
        ControlCommand::ChangeMode { target_mode } => {
            log::info!("control: ChangeMode -> {}", target_mode);
            match controller.switch_source(&target_mode) {
                Ok(SwitchOutcome::Switched) | Ok(SwitchOutcome::AlreadyActive) => {
                    Some(StatusUpdate {
                        current_mode: target_mode,
                    })
                }
                Err(e) if is_unknown_source(&e) => {
                    log::warn!("control: rejected ChangeMode: {}", e);
                    None
                }
                Err(e) => {
                    log::error!("control: switch to {} failed: {:#}", target_mode, e);
                    None
                }
            }
        }
    }
}
