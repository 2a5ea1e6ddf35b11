//! OS signal handling: SIGINT or SIGTERM cancels the shared token.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first SIGINT/SIGTERM. The task also ends when the
/// token is cancelled for any other reason.
pub fn spawn_signal_handler(token: CancellationToken) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut term_signal = match signal(SignalKind::terminate()) {
      Ok(signal) => Some(signal),
      Err(e) => {
        log::error!("Failed to register SIGTERM handler: {}", e);
        None
      }
    };

    tokio::select! {
      _ = token.cancelled() => {}
      _ = tokio::signal::ctrl_c() => {
        log::info!("SIGINT received, shutting down");
        token.cancel();
      }
      () = async {
        if let Some(signal) = term_signal.as_mut() {
          signal.recv().await;
        } else {
          std::future::pending::<()>().await;
        }
      } => {
        log::info!("SIGTERM received, shutting down");
        token.cancel();
      }
    }
  })
}
