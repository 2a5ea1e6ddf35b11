//! Static prop configuration, read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mpv::LaunchSpec;
use crate::playback::{SegmentBounds, TriggerModel};

/// Overrides the config file location.
pub const CONFIG_ENV: &str = "MOTION_PROP_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("Failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    source: serde_json::Error,
  },
  #[error("Invalid configuration: {0}")]
  Invalid(String),
  #[error("Media file not found: {0}")]
  MediaMissing(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionSourceKind {
  /// Hardware edge detector on `sensorPin`.
  Gpio,
  /// SIGUSR1 to this process.
  Signal,
}

/// Where the idle and trigger segments live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PlaybackMode {
  /// One file, segments addressed by offsets in seconds.
  #[serde(rename_all = "camelCase")]
  Offsets {
    media_path: PathBuf,
    idle_start: f64,
    idle_end: f64,
    trigger_start: f64,
    trigger_end: f64,
  },
  /// Two files swapped on trigger; trigger end is timed.
  #[serde(rename_all = "camelCase")]
  Files {
    idle_path: PathBuf,
    trigger_path: PathBuf,
    trigger_duration_secs: f64,
  },
}

impl Default for PlaybackMode {
  fn default() -> Self {
    PlaybackMode::Offsets {
      media_path: PathBuf::from("trickrtreatdoor.mp4"),
      idle_start: 0.0,
      idle_end: 50.0,
      trigger_start: 53.0,
      trigger_end: 76.0,
    }
  }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
  /// Custom MPV executable path (None = auto-detect).
  #[serde(default)]
  pub player_path: Option<PathBuf>,

  /// Additional MPV command-line arguments.
  #[serde(default)]
  pub player_args: Vec<String>,

  #[serde(default = "default_true")]
  pub fullscreen: bool,

  /// `--vo` for the player (e.g. "x11" on Pi desktops).
  #[serde(default)]
  pub video_output: Option<String>,

  /// `--hwdec` for the player.
  #[serde(default)]
  pub hwdec: Option<String>,

  /// Player control socket.
  #[serde(default = "default_ipc_path")]
  pub ipc_path: PathBuf,

  /// BCM pin number of the motion sensor.
  #[serde(default = "default_sensor_pin")]
  pub sensor_pin: u8,

  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,

  /// Delay before the sensor is armed; PIR outputs settle for a few seconds.
  #[serde(default)]
  pub sensor_warmup_ms: u64,

  #[serde(default = "default_motion_source")]
  pub motion_source: MotionSourceKind,

  #[serde(default)]
  pub mode: PlaybackMode,

  #[serde(default = "default_tick_interval_ms")]
  pub tick_interval_ms: u64,

  #[serde(default = "default_command_timeout_ms")]
  pub command_timeout_ms: u64,

  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms: u64,

  /// How long the player gets to exit before it is killed.
  #[serde(default = "default_shutdown_grace_ms")]
  pub shutdown_grace_ms: u64,

  /// Minimum time between two player starts when it keeps exiting.
  #[serde(default = "default_relaunch_delay_ms")]
  pub relaunch_delay_ms: u64,
}

fn default_true() -> bool {
  true
}

fn default_ipc_path() -> PathBuf {
  PathBuf::from("/tmp/mpv.sock")
}

fn default_sensor_pin() -> u8 {
  17
}

fn default_debounce_ms() -> u64 {
  500
}

fn default_motion_source() -> MotionSourceKind {
  if cfg!(feature = "gpio") {
    MotionSourceKind::Gpio
  } else {
    MotionSourceKind::Signal
  }
}

fn default_tick_interval_ms() -> u64 {
  20
}

fn default_command_timeout_ms() -> u64 {
  250
}

fn default_connect_timeout_ms() -> u64 {
  100
}

fn default_shutdown_grace_ms() -> u64 {
  5000
}

fn default_relaunch_delay_ms() -> u64 {
  2000
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      player_path: None,
      player_args: Vec::new(),
      fullscreen: default_true(),
      video_output: None,
      hwdec: None,
      ipc_path: default_ipc_path(),
      sensor_pin: default_sensor_pin(),
      debounce_ms: default_debounce_ms(),
      sensor_warmup_ms: 0,
      motion_source: default_motion_source(),
      mode: PlaybackMode::default(),
      tick_interval_ms: default_tick_interval_ms(),
      command_timeout_ms: default_command_timeout_ms(),
      connect_timeout_ms: default_connect_timeout_ms(),
      shutdown_grace_ms: default_shutdown_grace_ms(),
      relaunch_delay_ms: default_relaunch_delay_ms(),
    }
  }
}

impl AppConfig {
  /// Default config file location.
  pub fn default_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
      return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("motion-prop").join("config.json"))
  }

  /// Load and validate the config file at the default location.
  /// A missing file yields the defaults.
  pub fn load() -> Result<Self, ConfigError> {
    match Self::default_path() {
      Some(path) => Self::load_from(&path),
      None => {
        log::warn!("No config directory on this platform, using defaults");
        let config = Self::default();
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
      }
    }
  }

  pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
    let config = match std::fs::read_to_string(path) {
      Ok(text) => {
        log::info!("Loading config from {}", path.display());
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
          path: path.to_path_buf(),
          source,
        })?
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        log::info!("No config at {}, using defaults", path.display());
        Self::default()
      }
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        })
      }
    };
    config.validate().map_err(ConfigError::Invalid)?;
    Ok(config)
  }

  /// Validate configuration values.
  pub fn validate(&self) -> Result<(), String> {
    if self.ipc_path.as_os_str().is_empty() {
      return Err("IPC path cannot be empty".to_string());
    }
    if self.tick_interval_ms == 0 || self.tick_interval_ms > 1000 {
      return Err("Tick interval must be between 1 and 1000 ms".to_string());
    }
    if self.command_timeout_ms == 0 || self.connect_timeout_ms == 0 {
      return Err("Channel timeouts must be non-zero".to_string());
    }
    match &self.mode {
      PlaybackMode::Offsets { media_path, .. } => {
        if media_path.as_os_str().is_empty() {
          return Err("Media path cannot be empty".to_string());
        }
      }
      PlaybackMode::Files {
        idle_path,
        trigger_path,
        trigger_duration_secs,
      } => {
        if idle_path.as_os_str().is_empty() || trigger_path.as_os_str().is_empty() {
          return Err("Idle and trigger paths cannot be empty".to_string());
        }
        if !trigger_duration_secs.is_finite() || *trigger_duration_secs <= 0.0 {
          return Err("Trigger duration must be a positive number of seconds".to_string());
        }
      }
    }
    self.trigger_model().map(|_| ())
  }

  /// Every media file the prop plays must exist before the player starts.
  pub fn check_media(&self) -> Result<(), ConfigError> {
    let files: Vec<&Path> = match &self.mode {
      PlaybackMode::Offsets { media_path, .. } => vec![media_path.as_path()],
      PlaybackMode::Files {
        idle_path,
        trigger_path,
        ..
      } => vec![idle_path.as_path(), trigger_path.as_path()],
    };
    match files.into_iter().find(|path| !path.is_file()) {
      Some(missing) => Err(ConfigError::MediaMissing(missing.to_path_buf())),
      None => Ok(()),
    }
  }

  /// Trigger model for the state machine.
  pub fn trigger_model(&self) -> Result<TriggerModel, String> {
    match &self.mode {
      PlaybackMode::Offsets {
        idle_start,
        idle_end,
        trigger_start,
        trigger_end,
        ..
      } => SegmentBounds::new(*idle_start, *idle_end, *trigger_start, *trigger_end)
        .map(TriggerModel::Offsets),
      PlaybackMode::Files {
        idle_path,
        trigger_path,
        trigger_duration_secs,
      } => Duration::try_from_secs_f64(*trigger_duration_secs)
        .map(|trigger_duration| TriggerModel::Files {
          idle: idle_path.clone(),
          trigger: trigger_path.clone(),
          trigger_duration,
        })
        .map_err(|e| format!("Invalid trigger duration: {}", e)),
    }
  }

  /// How the player is launched: the file opened at startup is the one the
  /// idle segment lives in.
  pub fn launch_spec(&self) -> LaunchSpec {
    let media = match &self.mode {
      PlaybackMode::Offsets { media_path, .. } => media_path.clone(),
      PlaybackMode::Files { idle_path, .. } => idle_path.clone(),
    };
    LaunchSpec {
      player_path: self.player_path.clone(),
      ipc_path: self.ipc_path.clone(),
      media,
      fullscreen: self.fullscreen,
      video_output: self.video_output.clone(),
      hwdec: self.hwdec.clone(),
      extra_args: self.player_args.clone(),
    }
  }

  pub fn tick_interval(&self) -> Duration {
    Duration::from_millis(self.tick_interval_ms)
  }

  pub fn command_timeout(&self) -> Duration {
    Duration::from_millis(self.command_timeout_ms)
  }

  pub fn connect_timeout(&self) -> Duration {
    Duration::from_millis(self.connect_timeout_ms)
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn sensor_warmup(&self) -> Duration {
    Duration::from_millis(self.sensor_warmup_ms)
  }

  pub fn shutdown_grace(&self) -> Duration {
    Duration::from_millis(self.shutdown_grace_ms)
  }

  pub fn relaunch_delay(&self) -> Duration {
    Duration::from_millis(self.relaunch_delay_ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.sensor_pin, 17);
    assert_eq!(config.tick_interval(), Duration::from_millis(20));
    match config.trigger_model().unwrap() {
      TriggerModel::Offsets(b) => {
        assert_eq!((b.idle_start, b.idle_end, b.trigger_start, b.trigger_end), (0.0, 50.0, 53.0, 76.0));
      }
      other => panic!("unexpected model {:?}", other),
    }
  }

  #[test]
  fn test_partial_json_fills_defaults() {
    let json = r#"{
      "videoOutput": "x11",
      "debounceMs": 5000,
      "mode": {
        "kind": "files",
        "idlePath": "/home/pi/idle.mp4",
        "triggerPath": "/home/pi/trigger.mp4",
        "triggerDurationSecs": 26.0
      }
    }"#;
    let config: AppConfig = serde_json::from_str(json).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.video_output.as_deref(), Some("x11"));
    assert_eq!(config.debounce(), Duration::from_secs(5));
    assert_eq!(config.ipc_path, PathBuf::from("/tmp/mpv.sock"));
    assert_eq!(config.launch_spec().media, PathBuf::from("/home/pi/idle.mp4"));
    assert!(matches!(
      config.trigger_model().unwrap(),
      TriggerModel::Files { trigger_duration, .. } if trigger_duration == Duration::from_secs(26)
    ));
  }

  #[test]
  fn test_rejects_bad_bounds() {
    let config = AppConfig {
      mode: PlaybackMode::Offsets {
        media_path: PathBuf::from("door.mp4"),
        idle_start: 0.0,
        idle_end: 60.0,
        trigger_start: 53.0,
        trigger_end: 76.0,
      },
      ..AppConfig::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_bad_timing() {
    let mut config = AppConfig::default();
    config.tick_interval_ms = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.tick_interval_ms = 5000;
    assert!(config.validate().is_err());

    let config = AppConfig {
      mode: PlaybackMode::Files {
        idle_path: PathBuf::from("idle.mp4"),
        trigger_path: PathBuf::from("trigger.mp4"),
        trigger_duration_secs: 0.0,
      },
      ..AppConfig::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_missing_file_gives_defaults() {
    let path = std::env::temp_dir().join(format!("motion-prop-{}.json", uuid::Uuid::new_v4()));
    let config = AppConfig::load_from(&path).unwrap();
    assert_eq!(config.tick_interval_ms, 20);
  }

  #[test]
  fn test_malformed_file_is_an_error() {
    let path = std::env::temp_dir().join(format!("motion-prop-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(&path, "{ not json").unwrap();
    let result = AppConfig::load_from(&path);
    let _ = std::fs::remove_file(&path);
    assert!(matches!(result, Err(ConfigError::Parse { .. })));
  }

  #[test]
  fn test_missing_media_is_reported() {
    let dir = std::env::temp_dir();
    let idle = dir.join(format!("motion-prop-idle-{}.mp4", uuid::Uuid::new_v4()));
    let trigger = dir.join(format!("motion-prop-trigger-{}.mp4", uuid::Uuid::new_v4()));
    std::fs::write(&idle, b"").unwrap();

    let config = AppConfig {
      mode: PlaybackMode::Files {
        idle_path: idle.clone(),
        trigger_path: trigger.clone(),
        trigger_duration_secs: 26.0,
      },
      ..AppConfig::default()
    };
    let result = config.check_media();
    assert!(matches!(result, Err(ConfigError::MediaMissing(ref p)) if *p == trigger));

    std::fs::write(&trigger, b"").unwrap();
    let result = config.check_media();
    let _ = std::fs::remove_file(&idle);
    let _ = std::fs::remove_file(&trigger);
    assert!(result.is_ok());

    let config = AppConfig {
      mode: PlaybackMode::Offsets {
        media_path: dir.join(format!("motion-prop-{}.mp4", uuid::Uuid::new_v4())),
        idle_start: 0.0,
        idle_end: 50.0,
        trigger_start: 53.0,
        trigger_end: 76.0,
      },
      ..AppConfig::default()
    };
    assert!(matches!(config.check_media(), Err(ConfigError::MediaMissing(_))));
  }
}
