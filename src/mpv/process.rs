//! MPV process detection and spawning.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
  #[error("MPV executable not found")]
  NotFound,
  #[error("Failed to spawn MPV: {0}")]
  SpawnFailed(#[from] std::io::Error),
}

/// Fixed invocation for the player: what to play first and how.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
  /// Explicit binary; `None` means search.
  pub player_path: Option<PathBuf>,
  pub ipc_path: PathBuf,
  /// File the player opens on launch, looping forever.
  pub media: PathBuf,
  pub fullscreen: bool,
  pub video_output: Option<String>,
  pub hwdec: Option<String>,
  pub extra_args: Vec<String>,
}

impl LaunchSpec {
  /// Arguments passed to the player, in order.
  pub fn args(&self) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    if self.fullscreen {
      args.push("--fs".into());
    }
    args.push("--keep-open=yes".into());
    args.push("--loop-file=inf".into());
    args.push("--no-osc".into());
    args.push("--no-osd-bar".into());
    args.push("--no-audio-display".into());
    args.push("--really-quiet".into());
    if let Some(vo) = &self.video_output {
      args.push(format!("--vo={}", vo).into());
    }
    if let Some(hwdec) = &self.hwdec {
      args.push(format!("--hwdec={}", hwdec).into());
    }
    let mut ipc = OsString::from("--input-ipc-server=");
    ipc.push(&self.ipc_path);
    args.push(ipc);
    args.extend(self.extra_args.iter().map(OsString::from));
    args.push("--".into());
    args.push(self.media.clone().into_os_string());
    args
  }
}

/// Find MPV executable in common locations.
pub fn find_mpv() -> Option<PathBuf> {
  if let Ok(path) = which::which("mpv") {
    return Some(path);
  }

  let common_paths = ["/usr/bin/mpv", "/usr/local/bin/mpv", "/opt/homebrew/bin/mpv"];
  common_paths
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
}

/// Spawn the player as the leader of a new process group, so the whole
/// group (window helpers included) can be signalled at once.
pub fn spawn_player(spec: &LaunchSpec) -> Result<Child, ProcessError> {
  let exe = spec
    .player_path
    .clone()
    .or_else(find_mpv)
    .ok_or(ProcessError::NotFound)?;

  log::info!(
    "Spawning player: {:?} with IPC: {}",
    exe,
    spec.ipc_path.display()
  );
  if !spec.extra_args.is_empty() {
    log::info!("Extra player args: {:?}", spec.extra_args);
  }

  let child = Command::new(&exe)
    .args(spec.args())
    .process_group(0)
    .stdin(Stdio::null())
    .stdout(Stdio::null())
    .stderr(Stdio::null())
    .spawn()
    .map_err(|e| match e.kind() {
      std::io::ErrorKind::NotFound => ProcessError::NotFound,
      _ => ProcessError::SpawnFailed(e),
    })?;

  Ok(child)
}

/// Send `signal` to every process in `child`'s group.
pub fn signal_group(child: &Child, signal: libc::c_int) -> std::io::Result<()> {
  let pgid = child.id() as libc::pid_t;
  // SAFETY: killpg has no memory-safety preconditions; a stale pgid only yields ESRCH.
  let rc = unsafe { libc::killpg(pgid, signal) };
  if rc == 0 {
    Ok(())
  } else {
    Err(std::io::Error::last_os_error())
  }
}

/// Remove a leftover control socket so a fresh player can create its own.
pub fn cleanup_ipc(path: &Path) {
  match std::fs::remove_file(path) {
    Ok(()) => log::debug!("Removed control socket {}", path.display()),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
    Err(e) => log::warn!("Could not remove control socket {}: {}", path.display(), e),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn spec() -> LaunchSpec {
    LaunchSpec {
      player_path: None,
      ipc_path: PathBuf::from("/tmp/mpv.sock"),
      media: PathBuf::from("/srv/prop/door.mp4"),
      fullscreen: true,
      video_output: Some("x11".into()),
      hwdec: None,
      extra_args: vec!["--volume=80".into()],
    }
  }

  #[test]
  fn test_args_order() {
    let args = spec().args();
    assert_eq!(args.first().unwrap(), "--fs");
    assert!(args.contains(&OsString::from("--input-ipc-server=/tmp/mpv.sock")));
    assert!(args.contains(&OsString::from("--vo=x11")));
    assert!(!args.iter().any(|a| a.to_string_lossy().starts_with("--hwdec")));
    let n = args.len();
    assert_eq!(args[n - 3], "--volume=80");
    assert_eq!(args[n - 2], "--");
    assert_eq!(args[n - 1], "/srv/prop/door.mp4");
  }

  #[test]
  fn test_windowed_launch_has_no_fs_flag() {
    let mut spec = spec();
    spec.fullscreen = false;
    assert!(!spec.args().contains(&OsString::from("--fs")));
  }

  #[test]
  fn test_missing_binary_is_not_found() {
    let mut spec = spec();
    spec.player_path = Some(PathBuf::from("/nonexistent/bin/mpv"));
    assert!(matches!(spawn_player(&spec), Err(ProcessError::NotFound)));
  }

  #[test]
  fn test_cleanup_ipc_removes_stale_file() {
    let path = std::env::temp_dir().join(format!("motion-prop-stale-{}", uuid::Uuid::new_v4()));
    std::fs::write(&path, b"").unwrap();
    cleanup_ipc(&path);
    assert!(!path.exists());
    // Second call on a missing file is quiet.
    cleanup_ipc(&path);
  }
}
