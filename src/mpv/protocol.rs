//! MPV JSON IPC protocol types.
//!
//! Reference: https://mpv.io/manual/master/#json-ipc

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::playback::{PlayerCommand, SeekMode};

/// Global request ID counter for unique command identification.
static REQUEST_ID: AtomicI64 = AtomicI64::new(1);

/// Generate a unique request ID for MPV commands.
pub fn next_request_id() -> i64 {
  REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Command sent to MPV via IPC.
#[derive(Debug, Clone, Serialize)]
pub struct MpvCommand {
  pub command: Vec<serde_json::Value>,
  pub request_id: i64,
}

impl MpvCommand {
  /// Create a new command with auto-generated request ID.
  pub fn new(args: Vec<serde_json::Value>) -> Self {
    Self {
      command: args,
      request_id: next_request_id(),
    }
  }

  /// Replace the current file, keeping the playlist untouched.
  pub fn loadfile_replace(path: &str) -> Self {
    Self::new(vec!["loadfile".into(), path.into(), "replace".into()])
  }

  /// Seek to a position in seconds.
  pub fn seek(time: f64, mode: SeekMode) -> Self {
    let mode = match mode {
      SeekMode::Absolute => "absolute",
      SeekMode::Relative => "relative",
    };
    Self::new(vec!["seek".into(), time.into(), mode.into()])
  }

  /// Loop the current file forever, or play it once.
  pub fn set_loop_file(enabled: bool) -> Self {
    let value = if enabled { "inf" } else { "no" };
    Self::new(vec!["set_property".into(), "loop-file".into(), value.into()])
  }

  /// Pause or unpause playback.
  pub fn set_pause(paused: bool) -> Self {
    let value = if paused { "yes" } else { "no" };
    Self::new(vec!["set_property".into(), "pause".into(), value.into()])
  }

  /// Get a property value.
  pub fn get_property(name: &str) -> Self {
    Self::new(vec!["get_property".into(), name.into()])
  }

  /// Stop playback without quitting.
  pub fn stop() -> Self {
    Self::new(vec!["stop".into()])
  }

  /// Quit MPV.
  pub fn quit() -> Self {
    Self::new(vec!["quit".into()])
  }

  /// Serialize as one newline-terminated IPC line.
  pub fn to_line(&self) -> Result<Vec<u8>, serde_json::Error> {
    let mut line = serde_json::to_vec(self)?;
    line.push(b'\n');
    Ok(line)
  }
}

/// Wire commands for one [`PlayerCommand`], in send order.
pub fn wire_commands(cmd: &PlayerCommand) -> Vec<MpvCommand> {
  match cmd {
    PlayerCommand::Seek { time, mode } => vec![MpvCommand::seek(*time, *mode)],
    PlayerCommand::SetLoop(enabled) => vec![MpvCommand::set_loop_file(*enabled)],
    PlayerCommand::Load { path, looping } => vec![
      MpvCommand::set_loop_file(*looping),
      MpvCommand::loadfile_replace(&path.to_string_lossy()),
    ],
    PlayerCommand::Resume => vec![MpvCommand::set_pause(false)],
    PlayerCommand::Stop => vec![MpvCommand::stop()],
    PlayerCommand::Quit => vec![MpvCommand::quit()],
  }
}

/// Response from MPV for a command.
#[derive(Debug, Clone, Deserialize)]
pub struct MpvResponse {
  /// "success" or error message.
  pub error: String,
  /// Response data (command-specific).
  #[serde(default)]
  pub data: Option<serde_json::Value>,
  /// Matching request ID.
  pub request_id: i64,
}

impl MpvResponse {
  /// Check if the command succeeded.
  pub fn is_success(&self) -> bool {
    self.error == "success"
  }

  /// Numeric payload, if any (`time-pos` and friends).
  pub fn as_f64(&self) -> Option<f64> {
    self.data.as_ref().and_then(serde_json::Value::as_f64)
  }

  /// Boolean payload (`eof-reached`, `pause`).
  pub fn as_bool(&self) -> Option<bool> {
    self.data.as_ref().and_then(serde_json::Value::as_bool)
  }
}

/// Unsolicited event sent by MPV (playback-restart, end-file, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct MpvEvent {
  pub event: String,
  /// Reason for end-file events (e.g., "eof", "stop", "quit", "error").
  pub reason: Option<String>,
}

/// Message received from MPV IPC (either response or event).
#[derive(Debug, Clone)]
pub enum MpvMessage {
  Response(MpvResponse),
  Event(MpvEvent),
}

impl MpvMessage {
  /// Parse a JSON line from MPV.
  pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
    if line.contains("request_id") {
      let response: MpvResponse = serde_json::from_str(line)?;
      Ok(MpvMessage::Response(response))
    } else {
      let event: MpvEvent = serde_json::from_str(line)?;
      Ok(MpvMessage::Event(event))
    }
  }
}
