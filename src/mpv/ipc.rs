//! Async IPC connection to MPV over its Unix control socket.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::protocol::{MpvCommand, MpvMessage, MpvResponse};

/// Commands queued for the writer task before sends start failing fast.
const WRITE_QUEUE_CAPACITY: usize = 8;

#[derive(Error, Debug)]
pub enum IpcError {
  #[error("Connection failed: {0}")]
  ConnectionFailed(String),
  #[error("Write failed: {0}")]
  WriteFailed(#[from] std::io::Error),
  #[error("Encoding failed: {0}")]
  Encode(#[from] serde_json::Error),
  #[error("Command timeout")]
  Timeout,
  #[error("Write queue full")]
  Saturated,
  #[error("Disconnected")]
  Disconnected,
}

/// Pending request waiting for response.
type PendingRequest = oneshot::Sender<Result<MpvResponse, IpcError>>;

/// IPC connection state shared between writer and reader.
struct IpcState {
  pending: HashMap<i64, PendingRequest>,
}

/// Writer channel message.
enum WriteMessage {
  Command(Vec<u8>),
  Close,
}

/// MPV IPC connection.
pub struct MpvIpc {
  state: Arc<Mutex<IpcState>>,
  closed: Arc<AtomicBool>,
  write_tx: Sender<WriteMessage>,
  reader_handle: JoinHandle<()>,
  _writer_handle: JoinHandle<()>,
}

impl MpvIpc {
  /// Connect to the MPV IPC socket once, giving up after `timeout`.
  pub async fn connect(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
    use tokio::net::UnixStream;

    let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
      .await
      .map_err(|_| IpcError::ConnectionFailed("connect timed out".into()))?
      .map_err(|e| IpcError::ConnectionFailed(e.to_string()))?;

    let (reader, writer) = tokio::io::split(stream);
    Ok(Self::setup(reader, writer))
  }

  fn setup<R, W>(reader: R, writer: W) -> Self
  where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
  {
    let state = Arc::new(Mutex::new(IpcState {
      pending: HashMap::new(),
    }));
    let closed = Arc::new(AtomicBool::new(false));

    let (write_tx, write_rx) = async_channel::bounded::<WriteMessage>(WRITE_QUEUE_CAPACITY);

    let reader_state = state.clone();
    let reader_closed = closed.clone();
    let reader_handle = tokio::spawn(async move {
      Self::reader_loop(reader, reader_state.clone()).await;
      reader_closed.store(true, Ordering::SeqCst);
      // Fail anything still waiting so callers don't sit out their timeout.
      let drained: Vec<_> = reader_state.lock().pending.drain().collect();
      for (_, tx) in drained {
        let _ = tx.send(Err(IpcError::Disconnected));
      }
    });

    let writer_closed = closed.clone();
    let writer_handle = tokio::spawn(async move {
      Self::writer_loop(writer, write_rx).await;
      writer_closed.store(true, Ordering::SeqCst);
    });

    Self {
      state,
      closed,
      write_tx,
      reader_handle,
      _writer_handle: writer_handle,
    }
  }

  async fn reader_loop<R: tokio::io::AsyncRead + Unpin>(reader: R, state: Arc<Mutex<IpcState>>) {
    log::debug!("MPV IPC reader loop started");
    let mut buf_reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
      line.clear();
      match buf_reader.read_line(&mut line).await {
        Ok(0) => {
          log::info!("MPV IPC connection closed");
          break;
        }
        Ok(_) => {
          let trimmed = line.trim();
          if trimmed.is_empty() {
            continue;
          }

          match MpvMessage::parse(trimmed) {
            Ok(MpvMessage::Response(response)) => {
              let tx = state.lock().pending.remove(&response.request_id);
              match tx {
                Some(tx) => {
                  let _ = tx.send(Ok(response));
                }
                None => log::debug!(
                  "MPV reader: late response for request_id={}",
                  response.request_id
                ),
              }
            }
            Ok(MpvMessage::Event(event)) => {
              log::debug!("MPV event: {} ({:?})", event.event, event.reason);
            }
            Err(e) => {
              log::warn!("Failed to parse MPV message: {} - {}", e, trimmed);
            }
          }
        }
        Err(e) => {
          log::warn!("MPV IPC read error: {}", e);
          break;
        }
      }
    }
  }

  async fn writer_loop<W: tokio::io::AsyncWrite + Unpin>(
    mut writer: W,
    write_rx: Receiver<WriteMessage>,
  ) {
    while let Ok(msg) = write_rx.recv().await {
      match msg {
        WriteMessage::Command(data) => {
          if let Err(e) = writer.write_all(&data).await {
            log::warn!("MPV IPC write error: {}", e);
            break;
          }
          if let Err(e) = writer.flush().await {
            log::warn!("MPV IPC flush error: {}", e);
            break;
          }
        }
        WriteMessage::Close => {
          log::debug!("MPV IPC writer closing");
          let _ = writer.shutdown().await;
          break;
        }
      }
    }
  }

  /// Whether the socket has been closed from either side.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Send a command to MPV and wait at most `timeout` for its reply.
  ///
  /// Never waits for queue space: a full writer queue fails with
  /// [`IpcError::Saturated`] immediately.
  pub async fn send_command(
    &self,
    cmd: MpvCommand,
    timeout: Duration,
  ) -> Result<MpvResponse, IpcError> {
    if self.is_closed() {
      return Err(IpcError::Disconnected);
    }

    let request_id = cmd.request_id;
    let line = cmd.to_line()?;
    let (tx, rx) = oneshot::channel();

    self.state.lock().pending.insert(request_id, tx);

    if let Err(e) = self.write_tx.try_send(WriteMessage::Command(line)) {
      self.state.lock().pending.remove(&request_id);
      return Err(match e {
        TrySendError::Full(_) => IpcError::Saturated,
        TrySendError::Closed(_) => IpcError::Disconnected,
      });
    }

    match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(result)) => result,
      Ok(Err(_)) => Err(IpcError::Disconnected),
      Err(_) => {
        log::debug!("MPV command timeout, request_id={}", request_id);
        self.state.lock().pending.remove(&request_id);
        Err(IpcError::Timeout)
      }
    }
  }

  /// Close the connection.
  pub fn close(&self) {
    let _ = self.write_tx.try_send(WriteMessage::Close);
  }
}

impl Drop for MpvIpc {
  fn drop(&mut self) {
    self.write_tx.close();
    self.reader_handle.abort();
  }
}
