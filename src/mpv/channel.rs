//! Command channel to the player: lazy connect, bounded waits, and
//! classification of failures into "not there yet" versus "broken".

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::ipc::{IpcError, MpvIpc};
use super::protocol::{wire_commands, MpvCommand, MpvResponse};
use crate::playback::PlayerCommand;

#[derive(Error, Debug)]
pub enum ChannelError {
  /// Endpoint missing, refusing connections, or the connection dropped.
  #[error("Control channel unavailable: {0}")]
  Unavailable(String),
  /// The player answered, but not with something usable.
  #[error("Control channel protocol error: {0}")]
  Protocol(String),
}

impl ChannelError {
  pub fn is_unavailable(&self) -> bool {
    matches!(self, ChannelError::Unavailable(_))
  }
}

impl From<IpcError> for ChannelError {
  fn from(e: IpcError) -> Self {
    match e {
      IpcError::ConnectionFailed(_)
      | IpcError::WriteFailed(_)
      | IpcError::Timeout
      | IpcError::Saturated
      | IpcError::Disconnected => ChannelError::Unavailable(e.to_string()),
      IpcError::Encode(_) => ChannelError::Protocol(e.to_string()),
    }
  }
}

/// Transport for player commands. Nothing is retried inside a channel;
/// the caller's next tick is the retry.
pub trait CommandChannel {
  /// Deliver one command and wait (bounded) for the player to accept it.
  fn send(&mut self, cmd: &PlayerCommand) -> impl Future<Output = Result<(), ChannelError>> + Send;

  /// Current playback position in seconds.
  fn query_position(&mut self) -> impl Future<Output = Result<f64, ChannelError>> + Send;

  /// Whether the player is parked on the last frame of a file.
  fn query_at_end(&mut self) -> impl Future<Output = Result<bool, ChannelError>> + Send;

  /// Forget the current connection; the next call reconnects.
  fn reset(&mut self);
}

/// [`CommandChannel`] over mpv's JSON IPC socket.
pub struct MpvChannel {
  path: PathBuf,
  connect_timeout: Duration,
  command_timeout: Duration,
  conn: Option<MpvIpc>,
}

impl MpvChannel {
  pub fn new(path: PathBuf, connect_timeout: Duration, command_timeout: Duration) -> Self {
    Self {
      path,
      connect_timeout,
      command_timeout,
      conn: None,
    }
  }

  async fn connection(&mut self) -> Result<&MpvIpc, ChannelError> {
    if self.conn.as_ref().is_some_and(MpvIpc::is_closed) {
      log::debug!("Dropping closed IPC connection");
      self.conn = None;
    }

    if self.conn.is_none() {
      let ipc = MpvIpc::connect(&self.path, self.connect_timeout).await?;
      log::info!("Connected to player control socket {}", self.path.display());
      self.conn = Some(ipc);
    }

    self
      .conn
      .as_ref()
      .ok_or_else(|| ChannelError::Unavailable("not connected".into()))
  }

  async fn request(&mut self, cmd: MpvCommand) -> Result<MpvResponse, ChannelError> {
    let timeout = self.command_timeout;
    let result = self.connection().await?.send_command(cmd, timeout).await;
    match result {
      Ok(response) if response.is_success() => Ok(response),
      Ok(response) => Err(ChannelError::Protocol(response.error)),
      Err(e) => {
        if matches!(e, IpcError::Disconnected | IpcError::WriteFailed(_)) {
          self.conn = None;
        }
        Err(e.into())
      }
    }
  }

  /// Close the socket, if open.
  pub fn close(&mut self) {
    if let Some(conn) = self.conn.take() {
      conn.close();
    }
  }
}

impl CommandChannel for MpvChannel {
  async fn send(&mut self, cmd: &PlayerCommand) -> Result<(), ChannelError> {
    for wire in wire_commands(cmd) {
      self.request(wire).await?;
    }
    Ok(())
  }

  async fn query_position(&mut self) -> Result<f64, ChannelError> {
    let response = self.request(MpvCommand::get_property("time-pos")).await?;
    response
      .as_f64()
      .ok_or_else(|| ChannelError::Protocol(format!("time-pos not numeric: {:?}", response.data)))
  }

  async fn query_at_end(&mut self) -> Result<bool, ChannelError> {
    let response = self.request(MpvCommand::get_property("eof-reached")).await?;
    response
      .as_bool()
      .ok_or_else(|| ChannelError::Protocol(format!("eof-reached not boolean: {:?}", response.data)))
  }

  fn reset(&mut self) {
    self.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::mpv::ipc::tests::{spawn_fake_player, spawn_silent_player, temp_socket_path};
  use crate::playback::SeekMode;

  fn channel(path: PathBuf) -> MpvChannel {
    MpvChannel::new(path, Duration::from_millis(200), Duration::from_secs(2))
  }

  #[tokio::test]
  async fn test_missing_endpoint_is_unavailable() {
    let mut channel = channel(temp_socket_path());
    let err = channel.query_position().await.unwrap_err();
    assert!(err.is_unavailable());
    let err = channel
      .send(&PlayerCommand::Seek {
        time: 0.0,
        mode: SeekMode::Absolute,
      })
      .await
      .unwrap_err();
    assert!(err.is_unavailable());
  }

  #[tokio::test]
  async fn test_query_and_send() {
    let path = temp_socket_path();
    let server = spawn_fake_player(&path, Some(49.5));
    let mut channel = channel(path.clone());

    assert_eq!(channel.query_position().await.unwrap(), 49.5);
    assert!(!channel.query_at_end().await.unwrap());
    channel
      .send(&PlayerCommand::Seek {
        time: 0.0,
        mode: SeekMode::Absolute,
      })
      .await
      .unwrap();
    channel.send(&PlayerCommand::Quit).await.unwrap();

    let seen = server.await.unwrap();
    assert_eq!(seen, vec!["get_property", "get_property", "seek", "quit"]);
    channel.close();
    let _ = std::fs::remove_file(&path);
  }

  #[tokio::test]
  async fn test_unknown_position_is_protocol_error() {
    let path = temp_socket_path();
    let _server = spawn_fake_player(&path, None);
    let mut channel = channel(path.clone());

    let err = channel.query_position().await.unwrap_err();
    assert!(!err.is_unavailable());
    let _ = std::fs::remove_file(&path);
  }

  #[test]
  fn test_busy_or_silent_player_is_unavailable() {
    assert!(ChannelError::from(IpcError::Saturated).is_unavailable());
    assert!(ChannelError::from(IpcError::Timeout).is_unavailable());
    assert!(ChannelError::from(IpcError::Disconnected).is_unavailable());
  }

  #[tokio::test]
  async fn test_silent_player_times_out() {
    let path = temp_socket_path();
    let _server = spawn_silent_player(&path);
    let mut channel = MpvChannel::new(
      path.clone(),
      Duration::from_millis(200),
      Duration::from_millis(100),
    );

    let started = std::time::Instant::now();
    let err = channel.query_position().await.unwrap_err();
    assert!(err.is_unavailable());
    assert!(started.elapsed() < Duration::from_secs(1));
    let _ = std::fs::remove_file(&path);
  }
}
