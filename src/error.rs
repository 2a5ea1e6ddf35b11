//! Errors that end the process.

use thiserror::Error;

use crate::config::ConfigError;
use crate::motion::MotionError;
use crate::mpv::ProcessError;

#[derive(Debug, Error)]
pub enum AppError {
  #[error("Configuration error: {0}")]
  Config(#[from] ConfigError),

  #[error("Player could not be started: {0}")]
  Player(#[from] ProcessError),

  #[error("Motion sensor error: {0}")]
  Motion(#[from] MotionError),
}
