//! Main loop: liveness, position poll, motion, state machine, commands.
//!
//! All mutable prop state lives in one [`Session`] owned by the caller and
//! passed into every tick; the coordinator itself only holds the player
//! process and its control channel.

use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::motion::MotionReceiver;
use crate::mpv::{
  ChannelError, CommandChannel, LaunchOutcome, ProcessError, Supervisor, TerminateOutcome,
};
use crate::playback::{
  MotionOutcome, PlaybackState, PlaybackStateMachine, PlayerCommand, TickInput, Transition,
};

/// Per-process prop state.
pub struct Session {
  machine: PlaybackStateMachine,
  motion: MotionReceiver,
  channel_ready: bool,
}

impl Session {
  pub fn new(machine: PlaybackStateMachine, motion: MotionReceiver) -> Self {
    Self {
      machine,
      motion,
      channel_ready: false,
    }
  }

  pub fn state(&self) -> PlaybackState {
    self.machine.state()
  }

  /// Drop motion raised before the loop started (sensor settling).
  pub fn discard_motion(&mut self) {
    if self.motion.take().is_some() {
      log::debug!("Discarded motion from before the loop started");
    }
  }

  fn channel_ok(&mut self) {
    if !self.channel_ready {
      log::info!("Player control channel ready");
      self.channel_ready = true;
    }
  }

  fn channel_failed(&mut self, error: &ChannelError) {
    if self.channel_ready {
      log::warn!("{}", error);
      self.channel_ready = false;
    } else {
      log::debug!("{}", error);
    }
  }
}

/// What one tick did.
#[derive(Debug)]
pub struct TickReport {
  /// The player had died and a new one was started.
  pub relaunched: bool,
  pub transition: Transition,
  /// All of the transition's commands reached the player.
  pub delivered: bool,
}

pub struct Coordinator<S, C> {
  supervisor: S,
  channel: C,
  shutdown_grace: Duration,
}

impl<S: Supervisor, C: CommandChannel> Coordinator<S, C> {
  pub fn new(supervisor: S, channel: C, shutdown_grace: Duration) -> Self {
    Self {
      supervisor,
      channel,
      shutdown_grace,
    }
  }

  /// First launch. Fails only if the player cannot be started at all.
  pub fn start(&mut self) -> Result<LaunchOutcome, ProcessError> {
    self.supervisor.ensure_running()
  }

  /// Run one cadence step.
  pub async fn tick(
    &mut self,
    session: &mut Session,
    now: Instant,
  ) -> Result<TickReport, ProcessError> {
    let mut relaunched = false;
    let mut player_down = false;
    if !self.supervisor.is_alive() {
      self.channel.reset();
      session.channel_ready = false;
      session.machine.reset();
      match self.supervisor.ensure_running()? {
        LaunchOutcome::Deferred => player_down = true,
        LaunchOutcome::AlreadyRunning => {}
        outcome => {
          log::warn!("Player was not running: {:?}", outcome);
          relaunched = true;
        }
      }
    }

    let position = if player_down {
      None
    } else {
      match self.channel.query_position().await {
        Ok(position) => {
          session.channel_ok();
          Some(position)
        }
        Err(e) => {
          session.channel_failed(&e);
          None
        }
      }
    };

    let at_end = if position.is_some() && session.state() == PlaybackState::Trigger {
      match self.channel.query_at_end().await {
        Ok(at_end) => at_end,
        Err(e) => {
          log::debug!("eof-reached unavailable: {}", e);
          false
        }
      }
    } else {
      false
    };

    let motion = session.motion.take();
    let transition = session.machine.decide(&TickInput {
      pending_motion: motion.is_some(),
      position,
      at_end,
      now,
    });

    match transition.motion {
      MotionOutcome::Accepted => log::info!(
        "Motion detected at {:.2}s ({:?} ago)",
        position.unwrap_or_default(),
        motion
          .and_then(|event| event.at.elapsed().ok())
          .unwrap_or_default()
      ),
      MotionOutcome::IgnoredDuringTrigger => log::info!("Motion ignored, trigger already playing"),
      MotionOutcome::LostPositionUnknown => log::warn!("Motion dropped, player not reachable"),
      MotionOutcome::NoMotion => {}
    }

    let delivered = self.deliver(&transition.commands).await;
    if delivered {
      session.machine.commit(&transition, now);
    } else if transition.motion == MotionOutcome::Accepted {
      log::warn!("Motion dropped, trigger commands not delivered");
    }

    Ok(TickReport {
      relaunched,
      transition,
      delivered,
    })
  }

  async fn deliver(&mut self, commands: &[PlayerCommand]) -> bool {
    for cmd in commands {
      if let Err(e) = self.channel.send(cmd).await {
        log::warn!("Failed to send {:?}: {}", cmd, e);
        return false;
      }
      log::debug!("Sent {:?}", cmd);
    }
    true
  }

  /// Tick every `interval` until `shutdown` is cancelled.
  pub async fn run(
    &mut self,
    session: &mut Session,
    interval: Duration,
    shutdown: CancellationToken,
  ) -> Result<(), ProcessError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    log::info!("Control loop running every {:?}", interval);

    loop {
      tokio::select! {
        _ = shutdown.cancelled() => {
          log::info!("Control loop stopping");
          return Ok(());
        }
        _ = ticker.tick() => {
          self.tick(session, Instant::now()).await?;
        }
      }
    }
  }

  /// Ask the player to quit, then make sure it is gone and release the channel.
  pub async fn shutdown(&mut self) -> TerminateOutcome {
    if self.supervisor.is_alive() {
      match self.channel.send(&PlayerCommand::Quit).await {
        Ok(()) => log::info!("Quit sent to player"),
        Err(e) => log::debug!("Quit not delivered: {}", e),
      }
    }
    self.channel.reset();
    let outcome = self.supervisor.terminate(self.shutdown_grace).await;
    log::info!("Player shutdown: {:?}", outcome);
    outcome
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::motion::{motion_signal, MotionSignal};
  use crate::playback::{SegmentBounds, SeekMode, TriggerModel};

  #[derive(Default)]
  pub(crate) struct FakeChannel {
    pub(crate) position: Option<f64>,
    pub(crate) at_end: bool,
    pub(crate) fail_sends: bool,
    pub(crate) sent: Vec<PlayerCommand>,
    pub(crate) resets: usize,
    pub(crate) queries: usize,
  }

  impl CommandChannel for FakeChannel {
    async fn send(&mut self, cmd: &PlayerCommand) -> Result<(), ChannelError> {
      if self.fail_sends {
        return Err(ChannelError::Unavailable("fake".into()));
      }
      self.sent.push(cmd.clone());
      Ok(())
    }

    async fn query_position(&mut self) -> Result<f64, ChannelError> {
      self.queries += 1;
      self
        .position
        .ok_or_else(|| ChannelError::Unavailable("fake".into()))
    }

    async fn query_at_end(&mut self) -> Result<bool, ChannelError> {
      Ok(self.at_end)
    }

    fn reset(&mut self) {
      self.resets += 1;
    }
  }

  #[derive(Default)]
  pub(crate) struct FakeSupervisor {
    pub(crate) alive: bool,
    pub(crate) launches: Vec<LaunchOutcome>,
    pub(crate) unspawnable: bool,
    pub(crate) deferring: bool,
    pub(crate) terminated: bool,
  }

  impl Supervisor for FakeSupervisor {
    fn ensure_running(&mut self) -> Result<LaunchOutcome, ProcessError> {
      if self.unspawnable {
        return Err(ProcessError::NotFound);
      }
      if self.alive {
        return Ok(LaunchOutcome::AlreadyRunning);
      }
      if self.deferring {
        return Ok(LaunchOutcome::Deferred);
      }
      self.alive = true;
      let outcome = if self.launches.is_empty() {
        LaunchOutcome::Launched
      } else {
        LaunchOutcome::Relaunched
      };
      self.launches.push(outcome);
      Ok(outcome)
    }

    fn is_alive(&mut self) -> bool {
      self.alive
    }

    async fn terminate(&mut self, _timeout: Duration) -> TerminateOutcome {
      self.terminated = true;
      if std::mem::take(&mut self.alive) {
        TerminateOutcome::Graceful
      } else {
        TerminateOutcome::NotRunning
      }
    }
  }

  type TestCoordinator = Coordinator<FakeSupervisor, FakeChannel>;

  fn setup() -> (TestCoordinator, Session, MotionSignal) {
    let bounds = SegmentBounds::new(0.0, 50.0, 53.0, 76.0).unwrap();
    let (signal, receiver) = motion_signal();
    let session = Session::new(PlaybackStateMachine::new(TriggerModel::Offsets(bounds)), receiver);
    let mut coordinator = Coordinator::new(
      FakeSupervisor::default(),
      FakeChannel::default(),
      Duration::from_millis(100),
    );
    assert_eq!(coordinator.start().unwrap(), LaunchOutcome::Launched);
    (coordinator, session, signal)
  }

  async fn tick_at(c: &mut TestCoordinator, s: &mut Session, position: Option<f64>) -> TickReport {
    c.channel.position = position;
    c.tick(s, Instant::now()).await.unwrap()
  }

  fn seek(time: f64) -> PlayerCommand {
    PlayerCommand::Seek {
      time,
      mode: SeekMode::Absolute,
    }
  }

  #[tokio::test]
  async fn test_idle_rearm_at_boundary() {
    let (mut c, mut s, _signal) = setup();
    tick_at(&mut c, &mut s, Some(49.0)).await;
    assert!(c.channel.sent.is_empty());

    tick_at(&mut c, &mut s, Some(50.0)).await;
    assert_eq!(c.channel.sent, vec![seek(0.0)]);
  }

  #[tokio::test]
  async fn test_unavailable_channel_changes_nothing() {
    let (mut c, mut s, signal) = setup();
    signal.notify();
    let report = tick_at(&mut c, &mut s, None).await;
    assert!(report.transition.commands.is_empty());
    assert!(c.channel.sent.is_empty());
    assert_eq!(s.state(), PlaybackState::Idle);

    // The motion was consumed with the failed tick.
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Idle);
  }

  #[tokio::test]
  async fn test_motion_burst_plays_trigger_once() {
    let (mut c, mut s, signal) = setup();

    signal.notify();
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Trigger);
    assert_eq!(c.channel.sent[0], seek(53.0));

    for position in [55.0, 60.0, 70.0] {
      signal.notify();
      signal.notify();
      let report = tick_at(&mut c, &mut s, Some(position)).await;
      assert_eq!(report.transition.motion, MotionOutcome::IgnoredDuringTrigger);
      assert_eq!(s.state(), PlaybackState::Trigger);
    }

    tick_at(&mut c, &mut s, Some(76.0)).await;
    assert_eq!(s.state(), PlaybackState::Idle);

    let sent_before = c.channel.sent.len();
    tick_at(&mut c, &mut s, Some(0.5)).await;
    assert_eq!(s.state(), PlaybackState::Idle);
    assert_eq!(c.channel.sent.len(), sent_before);
  }

  #[tokio::test]
  async fn test_dead_player_is_relaunched_and_state_reset() {
    let (mut c, mut s, signal) = setup();
    signal.notify();
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Trigger);

    c.supervisor.alive = false;
    let report = tick_at(&mut c, &mut s, Some(60.0)).await;
    assert!(report.relaunched);
    assert_eq!(
      c.supervisor.launches,
      vec![LaunchOutcome::Launched, LaunchOutcome::Relaunched]
    );
    assert_eq!(c.channel.resets, 1);
    assert_eq!(s.state(), PlaybackState::Idle);
  }

  #[tokio::test]
  async fn test_undelivered_trigger_is_not_committed() {
    let (mut c, mut s, signal) = setup();
    c.channel.fail_sends = true;
    signal.notify();
    let report = tick_at(&mut c, &mut s, Some(10.0)).await;
    assert!(!report.delivered);
    assert_eq!(s.state(), PlaybackState::Idle);

    c.channel.fail_sends = false;
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Idle);
    assert!(c.channel.sent.is_empty());
  }

  #[tokio::test]
  async fn test_undelivered_return_is_retried_next_tick() {
    let (mut c, mut s, signal) = setup();
    signal.notify();
    tick_at(&mut c, &mut s, Some(10.0)).await;

    c.channel.fail_sends = true;
    tick_at(&mut c, &mut s, Some(76.0)).await;
    assert_eq!(s.state(), PlaybackState::Trigger);

    c.channel.fail_sends = false;
    let report = tick_at(&mut c, &mut s, Some(76.5)).await;
    assert!(report.delivered);
    assert_eq!(s.state(), PlaybackState::Idle);
  }

  #[tokio::test]
  async fn test_deferred_relaunch_skips_the_player() {
    let (mut c, mut s, signal) = setup();
    c.supervisor.alive = false;
    c.supervisor.deferring = true;
    let queries = c.channel.queries;

    signal.notify();
    let report = tick_at(&mut c, &mut s, Some(10.0)).await;
    assert!(!report.relaunched);
    assert_eq!(report.transition.motion, MotionOutcome::LostPositionUnknown);
    assert!(c.channel.sent.is_empty());
    assert_eq!(c.channel.queries, queries);
    assert_eq!(c.supervisor.launches, vec![LaunchOutcome::Launched]);

    c.supervisor.deferring = false;
    let report = tick_at(&mut c, &mut s, Some(10.0)).await;
    assert!(report.relaunched);
  }

  #[tokio::test]
  async fn test_trigger_parked_at_end_returns_to_idle() {
    let (mut c, mut s, signal) = setup();
    signal.notify();
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Trigger);

    c.channel.at_end = true;
    let report = tick_at(&mut c, &mut s, Some(70.0)).await;
    assert!(report.delivered);
    assert_eq!(s.state(), PlaybackState::Idle);
    assert_eq!(c.channel.sent.last(), Some(&PlayerCommand::Resume));
  }

  #[tokio::test]
  async fn test_discarded_motion_does_not_trigger() {
    let (mut c, mut s, signal) = setup();
    signal.notify();
    s.discard_motion();
    tick_at(&mut c, &mut s, Some(10.0)).await;
    assert_eq!(s.state(), PlaybackState::Idle);
    assert!(c.channel.sent.is_empty());
  }

  #[tokio::test]
  async fn test_unspawnable_player_is_fatal() {
    let (mut c, mut s, _signal) = setup();
    c.supervisor.alive = false;
    c.supervisor.unspawnable = true;
    c.channel.position = Some(10.0);
    assert!(c.tick(&mut s, Instant::now()).await.is_err());
  }

  #[tokio::test]
  async fn test_shutdown_quits_and_terminates() {
    let (mut c, _s, _signal) = setup();
    let outcome = c.shutdown().await;
    assert_eq!(outcome, TerminateOutcome::Graceful);
    assert_eq!(c.channel.sent, vec![PlayerCommand::Quit]);
    assert!(c.supervisor.terminated);
    assert_eq!(c.channel.resets, 1);
  }

  #[tokio::test]
  async fn test_run_stops_on_cancel() {
    let (mut c, mut s, _signal) = setup();
    c.channel.position = Some(10.0);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(50)).await;
      canceller.cancel();
    });

    tokio::time::timeout(
      Duration::from_secs(2),
      c.run(&mut s, Duration::from_millis(5), token),
    )
    .await
    .expect("run did not stop")
    .unwrap();
    assert_eq!(s.state(), PlaybackState::Idle);
  }
}
