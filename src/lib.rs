//! Motion-triggered video prop.
//!
//! A sensor edge switches a long-running mpv from a looping idle segment to
//! a one-shot trigger segment and back, with the player supervised and
//! relaunched if it dies.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod motion;
pub mod mpv;
pub mod playback;
pub mod shutdown;

pub use config::AppConfig;
pub use error::AppError;

use coordinator::{Coordinator, Session};
use motion::{MotionSignal, MotionSource};
use mpv::{CommandChannel, MpvChannel, PlayerSupervisor, Supervisor};
use playback::PlaybackStateMachine;
use tokio_util::sync::CancellationToken;

fn init_logging() {
  let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_millis()
    .try_init();
}

/// Run the prop until SIGINT/SIGTERM or a fatal error.
///
/// Whatever ends the run, the sensor is released, the player is asked to
/// quit (then killed if it lingers) and the control socket is removed.
pub async fn run() -> Result<(), AppError> {
  init_logging();

  let config = AppConfig::load()?;
  config.check_media()?;
  let model = config
    .trigger_model()
    .map_err(config::ConfigError::Invalid)?;
  log::info!("Trigger model: {:?}", model);

  let shutdown = CancellationToken::new();
  let signal_task = shutdown::spawn_signal_handler(shutdown.clone());

  let (signal, receiver) = motion::motion_signal();
  let mut source = motion::source_from_config(&config)?;

  let mut coordinator = Coordinator::new(
    PlayerSupervisor::new(config.launch_spec(), config.relaunch_delay()),
    MpvChannel::new(
      config.ipc_path.clone(),
      config.connect_timeout(),
      config.command_timeout(),
    ),
    config.shutdown_grace(),
  );
  let mut session = Session::new(PlaybackStateMachine::new(model), receiver);

  let result = drive(
    &mut coordinator,
    &mut session,
    source.as_mut(),
    signal,
    &config,
    &shutdown,
  )
  .await;

  log::info!("Cleaning up");
  source.stop();
  coordinator.shutdown().await;
  shutdown.cancel();
  let _ = signal_task.await;
  log::info!("Cleanup complete");

  result
}

async fn drive<S: Supervisor, C: CommandChannel>(
  coordinator: &mut Coordinator<S, C>,
  session: &mut Session,
  source: &mut dyn MotionSource,
  signal: MotionSignal,
  config: &AppConfig,
  shutdown: &CancellationToken,
) -> Result<(), AppError> {
  let outcome = coordinator.start()?;
  log::info!("Player {:?}", outcome);

  // Armed before the warm-up so its handlers are in place; edges from the
  // settling sensor are thrown away afterwards.
  source.start(config.debounce(), signal)?;

  let warmup = config.sensor_warmup();
  if !warmup.is_zero() {
    log::info!("Warming up motion sensor ({:?})", warmup);
    tokio::select! {
      _ = shutdown.cancelled() => return Ok(()),
      _ = tokio::time::sleep(warmup) => {}
    }
    session.discard_motion();
  }
  log::info!("Waiting for motion");

  coordinator
    .run(session, config.tick_interval(), shutdown.clone())
    .await?;
  Ok(())
}
