//! Motion sources and the single-slot signal they feed.
//!
//! A source fires from whatever context its edge detector runs on (a GPIO
//! interrupt thread, a signal task). It never talks to the player; it only
//! raises the motion signal, which the polling loop drains once per tick.
//! The signal holds at most one event: a second notification while one is
//! pending is dropped, so bursts never queue up extra trigger cycles.

use std::time::{Duration, Instant, SystemTime};

use async_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, MotionSourceKind};

#[derive(Error, Debug)]
pub enum MotionError {
  #[error("Failed to register signal handler: {0}")]
  Signal(#[from] std::io::Error),
  #[cfg(feature = "gpio")]
  #[error("GPIO error: {0}")]
  Gpio(#[from] rppal::gpio::Error),
  #[error("Motion source not supported in this build: {0}")]
  Unsupported(&'static str),
}

/// Motion occurred.
#[derive(Debug, Clone, Copy)]
pub struct MotionEvent {
  pub at: SystemTime,
}

/// Writer half, handed to a motion source.
#[derive(Clone)]
pub struct MotionSignal {
  tx: Sender<MotionEvent>,
}

impl MotionSignal {
  /// Raise the signal. Returns `false` when an event was already pending
  /// (this one is coalesced into it). Never blocks.
  pub fn notify(&self) -> bool {
    match self.tx.try_send(MotionEvent { at: SystemTime::now() }) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => false,
      Err(TrySendError::Closed(_)) => false,
    }
  }
}

/// Reader half, owned by the polling loop.
pub struct MotionReceiver {
  rx: Receiver<MotionEvent>,
}

impl MotionReceiver {
  /// Consume the pending event, if any. Never blocks.
  pub fn take(&self) -> Option<MotionEvent> {
    self.rx.try_recv().ok()
  }
}

/// Capacity-1 motion signal.
pub fn motion_signal() -> (MotionSignal, MotionReceiver) {
  let (tx, rx) = async_channel::bounded(1);
  (MotionSignal { tx }, MotionReceiver { rx })
}

pub trait MotionSource: Send {
  /// Arm the detector. Edges closer than `debounce` to the previous accepted
  /// one are suppressed by the detector itself.
  fn start(&mut self, debounce: Duration, signal: MotionSignal) -> Result<(), MotionError>;

  /// Disarm and release the underlying resource.
  fn stop(&mut self);
}

/// Build the configured source.
pub fn source_from_config(config: &AppConfig) -> Result<Box<dyn MotionSource>, MotionError> {
  match config.motion_source {
    MotionSourceKind::Signal => Ok(Box::new(SignalMotionSource::new())),
    #[cfg(feature = "gpio")]
    MotionSourceKind::Gpio => Ok(Box::new(GpioMotionSource::new(config.sensor_pin))),
    #[cfg(not(feature = "gpio"))]
    MotionSourceKind::Gpio => Err(MotionError::Unsupported(
      "gpio (rebuild with --features gpio)",
    )),
  }
}

/// Treats SIGUSR1 as a rising edge (`kill -USR1 <pid>`), for benches
/// without a sensor attached.
pub struct SignalMotionSource {
  task: Option<JoinHandle<()>>,
}

impl SignalMotionSource {
  pub fn new() -> Self {
    Self { task: None }
  }
}

impl Default for SignalMotionSource {
  fn default() -> Self {
    Self::new()
  }
}

impl MotionSource for SignalMotionSource {
  fn start(&mut self, debounce: Duration, signal: MotionSignal) -> Result<(), MotionError> {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    let mut usr1 = unix_signal(SignalKind::user_defined1())?;
    log::info!("Motion source: SIGUSR1 (debounce {:?})", debounce);

    self.task = Some(tokio::spawn(async move {
      let mut debouncer = Debouncer::new(debounce);
      while usr1.recv().await.is_some() {
        if !debouncer.accept(Instant::now()) {
          log::debug!("SIGUSR1 within debounce window, ignored");
          continue;
        }
        if !signal.notify() {
          log::debug!("Motion already pending, coalesced");
        }
      }
    }));
    Ok(())
  }

  fn stop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

/// Rising edge on a Raspberry Pi GPIO pin (PIR sensor output), pulled down.
#[cfg(feature = "gpio")]
pub struct GpioMotionSource {
  pin: u8,
  input: Option<rppal::gpio::InputPin>,
}

#[cfg(feature = "gpio")]
impl GpioMotionSource {
  pub fn new(pin: u8) -> Self {
    Self { pin, input: None }
  }
}

#[cfg(feature = "gpio")]
impl MotionSource for GpioMotionSource {
  fn start(&mut self, debounce: Duration, signal: MotionSignal) -> Result<(), MotionError> {
    use rppal::gpio::{Gpio, Trigger};

    let mut input = Gpio::new()?.get(self.pin)?.into_input_pulldown();
    input.set_async_interrupt(Trigger::RisingEdge, Some(debounce), move |_event| {
      signal.notify();
    })?;
    log::info!("Motion source: GPIO {} rising edge (debounce {:?})", self.pin, debounce);
    self.input = Some(input);
    Ok(())
  }

  fn stop(&mut self) {
    if let Some(mut input) = self.input.take() {
      if let Err(e) = input.clear_async_interrupt() {
        log::warn!("Failed to clear GPIO interrupt: {}", e);
      }
      // Dropping the pin restores its previous mode.
    }
  }
}

/// Minimum spacing between accepted edges.
struct Debouncer {
  interval: Duration,
  last: Option<Instant>,
}

impl Debouncer {
  fn new(interval: Duration) -> Self {
    Self { interval, last: None }
  }

  fn accept(&mut self, now: Instant) -> bool {
    if let Some(last) = self.last {
      if now.saturating_duration_since(last) < self.interval {
        return false;
      }
    }
    self.last = Some(now);
    true
  }
}
