//! Player process lifecycle: launch, liveness, relaunch, termination.

use std::future::Future;
use std::process::Child;
use std::time::{Duration, Instant};

use super::process::{cleanup_ipc, signal_group, spawn_player, LaunchSpec, ProcessError};

/// How often `terminate` checks whether the player has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
  /// First launch of this supervisor.
  Launched,
  AlreadyRunning,
  /// A previous player exited and a new one was started.
  Relaunched,
  /// The player is down but was started too recently to start again.
  Deferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
  /// Exited within the grace period.
  Graceful,
  /// Had to be killed.
  Forced,
  NotRunning,
}

/// Owner of the player process.
pub trait Supervisor {
  /// Start the player unless it is already running. An error here means
  /// the player cannot be started at all.
  fn ensure_running(&mut self) -> Result<LaunchOutcome, ProcessError>;

  /// Non-blocking liveness check.
  fn is_alive(&mut self) -> bool;

  /// Ask the player to exit, killing it if it is still around after `timeout`.
  fn terminate(&mut self, timeout: Duration) -> impl Future<Output = TerminateOutcome> + Send;
}

/// [`Supervisor`] for a locally spawned mpv.
///
/// A player that keeps dying is restarted at most once per `relaunch_delay`.
pub struct PlayerSupervisor {
  spec: LaunchSpec,
  relaunch_delay: Duration,
  child: Option<Child>,
  last_spawn: Option<Instant>,
}

impl PlayerSupervisor {
  pub fn new(spec: LaunchSpec, relaunch_delay: Duration) -> Self {
    Self {
      spec,
      relaunch_delay,
      child: None,
      last_spawn: None,
    }
  }
}

impl Supervisor for PlayerSupervisor {
  fn ensure_running(&mut self) -> Result<LaunchOutcome, ProcessError> {
    if self.child.is_some() && self.is_alive() {
      return Ok(LaunchOutcome::AlreadyRunning);
    }

    if self.child.is_some() {
      if let Some(last) = self.last_spawn {
        let since = last.elapsed();
        if since < self.relaunch_delay {
          log::debug!(
            "Player relaunch deferred ({:?} since last start)",
            since
          );
          return Ok(LaunchOutcome::Deferred);
        }
      }
    }

    let relaunch = match self.child.take() {
      Some(old) => {
        discard_child(old);
        true
      }
      None => false,
    };
    cleanup_ipc(&self.spec.ipc_path);

    self.last_spawn = Some(Instant::now());
    let child = spawn_player(&self.spec)?;
    log::info!("Player started (pid: {})", child.id());
    self.child = Some(child);

    Ok(if relaunch {
      LaunchOutcome::Relaunched
    } else {
      LaunchOutcome::Launched
    })
  }

  fn is_alive(&mut self) -> bool {
    let Some(child) = self.child.as_mut() else {
      return false;
    };
    match child.try_wait() {
      Ok(None) => true,
      Ok(Some(status)) => {
        log::debug!("Player (pid: {}) exited with: {}", child.id(), status);
        false
      }
      Err(e) => {
        log::warn!("Could not poll player (pid: {}): {}", child.id(), e);
        false
      }
    }
  }

  async fn terminate(&mut self, timeout: Duration) -> TerminateOutcome {
    let outcome = match self.child.take() {
      None => TerminateOutcome::NotRunning,
      Some(child) => stop_child(child, timeout).await,
    };
    cleanup_ipc(&self.spec.ipc_path);
    outcome
  }
}

/// Make sure a player being replaced is really gone. Normally it has
/// already exited; if its status could not be read, kill its group.
fn discard_child(mut child: Child) {
  match child.try_wait() {
    Ok(Some(_)) => {}
    _ => {
      log::warn!("Killing unresponsive player (pid: {})", child.id());
      let _ = signal_group(&child, libc::SIGKILL);
      let _ = child.kill();
      let _ = child.wait();
    }
  }
}

async fn stop_child(mut child: Child, timeout: Duration) -> TerminateOutcome {
  let pid = child.id();
  if let Ok(Some(status)) = child.try_wait() {
    log::info!("Player (pid: {}) already exited with: {}", pid, status);
    return TerminateOutcome::NotRunning;
  }

  log::info!("Stopping player process group (pid: {})", pid);
  if let Err(e) = signal_group(&child, libc::SIGTERM) {
    log::warn!("SIGTERM to player group failed: {}", e);
  }

  let deadline = tokio::time::Instant::now() + timeout;
  while tokio::time::Instant::now() < deadline {
    match child.try_wait() {
      Ok(Some(status)) => {
        log::info!("Player exited with: {}", status);
        return TerminateOutcome::Graceful;
      }
      Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
      Err(e) => {
        log::warn!("Could not poll player: {}", e);
        break;
      }
    }
  }

  log::warn!("Player did not exit within {:?}, killing", timeout);
  let _ = signal_group(&child, libc::SIGKILL);

  // kill/wait block; keep them off the runtime threads
  let result = tokio::task::spawn_blocking(move || {
    let kill_result = child.kill();
    let wait_result = child.wait();
    (kill_result, wait_result)
  })
  .await;

  match result {
    Ok((_, Ok(status))) => log::info!("Player killed, exited with: {}", status),
    Ok((_, Err(e))) => log::error!("wait() after kill failed: {}", e),
    Err(e) => log::error!("spawn_blocking panicked during process cleanup: {}", e),
  }
  TerminateOutcome::Forced
}
