//! Playback state machine: decides, once per tick, what the player should be
//! told given the observed position and whether motion is pending.
//!
//! Two trigger models share the same transition table. With
//! [`TriggerModel::Offsets`] one file holds both segments and completion is
//! read from the player position. With [`TriggerModel::Files`] the segments
//! are separate files swapped with a replace-load, and completion is the wall
//! clock time since the trigger file was loaded.

use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
  #[default]
  Idle,
  Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekMode {
  Absolute,
  Relative,
}

/// Commands the state machine (and shutdown) may issue to the player.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCommand {
  Seek { time: f64, mode: SeekMode },
  /// Loop the current file (or play it once).
  SetLoop(bool),
  /// Replace the current file.
  Load { path: PathBuf, looping: bool },
  /// Unpause; the player pauses itself when it parks on a file's last frame.
  Resume,
  Stop,
  Quit,
}

impl PlayerCommand {
  fn seek_to(time: f64) -> Self {
    PlayerCommand::Seek {
      time,
      mode: SeekMode::Absolute,
    }
  }
}

/// Segment offsets in seconds within the single media file.
///
/// Invariant: `idle_start < idle_end <= trigger_start < trigger_end`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentBounds {
  pub idle_start: f64,
  pub idle_end: f64,
  pub trigger_start: f64,
  pub trigger_end: f64,
}

impl SegmentBounds {
  pub fn new(
    idle_start: f64,
    idle_end: f64,
    trigger_start: f64,
    trigger_end: f64,
  ) -> Result<Self, String> {
    let bounds = Self {
      idle_start,
      idle_end,
      trigger_start,
      trigger_end,
    };
    bounds.check()?;
    Ok(bounds)
  }

  pub fn check(&self) -> Result<(), String> {
    let all = [
      self.idle_start,
      self.idle_end,
      self.trigger_start,
      self.trigger_end,
    ];
    if all.iter().any(|v| !v.is_finite() || *v < 0.0) {
      return Err("Segment bounds must be finite and non-negative".to_string());
    }
    if !(self.idle_start < self.idle_end
      && self.idle_end <= self.trigger_start
      && self.trigger_start < self.trigger_end)
    {
      return Err(format!(
        "Segment bounds out of order: need idle_start < idle_end <= trigger_start < trigger_end, got {} / {} / {} / {}",
        self.idle_start, self.idle_end, self.trigger_start, self.trigger_end
      ));
    }
    Ok(())
  }

  /// Closed-open idle window `[idle_start, idle_end)`.
  pub fn in_idle(&self, position: f64) -> bool {
    position >= self.idle_start && position < self.idle_end
  }
}

/// How the trigger segment is addressed and how its end is detected.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerModel {
  Offsets(SegmentBounds),
  Files {
    idle: PathBuf,
    trigger: PathBuf,
    trigger_duration: Duration,
  },
}

/// Inputs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
  /// Motion consumed this tick.
  pub pending_motion: bool,
  /// `None` when the player could not be queried.
  pub position: Option<f64>,
  /// The player reached the end of the file and is holding its last frame.
  pub at_end: bool,
  pub now: Instant,
}

/// What happened to motion consumed on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
  NoMotion,
  Accepted,
  /// A trigger cycle is already playing.
  IgnoredDuringTrigger,
  /// The player could not be queried this tick.
  LostPositionUnknown,
}

/// Decision for one tick. Nothing changes until it is committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
  pub from: PlaybackState,
  pub next: PlaybackState,
  pub commands: Vec<PlayerCommand>,
  pub motion: MotionOutcome,
}

impl Transition {
  fn stay(state: PlaybackState, motion: MotionOutcome) -> Self {
    Self {
      from: state,
      next: state,
      commands: Vec::new(),
      motion,
    }
  }

  fn to(
    from: PlaybackState,
    next: PlaybackState,
    commands: Vec<PlayerCommand>,
    motion: MotionOutcome,
  ) -> Self {
    Self {
      from,
      next,
      commands,
      motion,
    }
  }

  pub fn changes_state(&self) -> bool {
    self.from != self.next
  }

  pub fn is_noop(&self) -> bool {
    !self.changes_state() && self.commands.is_empty()
  }
}

pub struct PlaybackStateMachine {
  model: TriggerModel,
  state: PlaybackState,
  trigger_started: Option<Instant>,
}

impl PlaybackStateMachine {
  pub fn new(model: TriggerModel) -> Self {
    Self {
      model,
      state: PlaybackState::Idle,
      trigger_started: None,
    }
  }

  pub fn state(&self) -> PlaybackState {
    self.state
  }

  /// Back to IDLE without issuing anything (fresh player).
  pub fn reset(&mut self) {
    self.state = PlaybackState::Idle;
    self.trigger_started = None;
  }

  /// Compute this tick's transition without applying it.
  pub fn decide(&self, input: &TickInput) -> Transition {
    let Some(position) = input.position else {
      let motion = if input.pending_motion {
        MotionOutcome::LostPositionUnknown
      } else {
        MotionOutcome::NoMotion
      };
      return Transition::stay(self.state, motion);
    };

    match self.state {
      PlaybackState::Idle => self.decide_idle(input.pending_motion, position),
      PlaybackState::Trigger => {
        let motion = if input.pending_motion {
          MotionOutcome::IgnoredDuringTrigger
        } else {
          MotionOutcome::NoMotion
        };
        self.decide_trigger(position, input.at_end, input.now, motion)
      }
    }
  }

  fn decide_idle(&self, pending_motion: bool, position: f64) -> Transition {
    use PlaybackState::{Idle, Trigger};

    if pending_motion {
      let commands = match &self.model {
        TriggerModel::Offsets(bounds) => vec![
          PlayerCommand::seek_to(bounds.trigger_start),
          PlayerCommand::SetLoop(false),
        ],
        TriggerModel::Files { trigger, .. } => vec![PlayerCommand::Load {
          path: trigger.clone(),
          looping: false,
        }],
      };
      return Transition::to(Idle, Trigger, commands, MotionOutcome::Accepted);
    }

    match &self.model {
      TriggerModel::Offsets(bounds) if !bounds.in_idle(position) => Transition::to(
        Idle,
        Idle,
        vec![PlayerCommand::seek_to(bounds.idle_start)],
        MotionOutcome::NoMotion,
      ),
      // The idle file loops on its own.
      _ => Transition::stay(Idle, MotionOutcome::NoMotion),
    }
  }

  fn decide_trigger(
    &self,
    position: f64,
    at_end: bool,
    now: Instant,
    motion: MotionOutcome,
  ) -> Transition {
    use PlaybackState::{Idle, Trigger};

    match &self.model {
      TriggerModel::Offsets(bounds) => {
        if position >= bounds.trigger_end || at_end {
          Transition::to(
            Trigger,
            Idle,
            vec![
              PlayerCommand::seek_to(bounds.idle_start),
              PlayerCommand::SetLoop(true),
              PlayerCommand::Resume,
            ],
            motion,
          )
        } else {
          Transition::stay(Trigger, motion)
        }
      }
      TriggerModel::Files {
        idle,
        trigger_duration,
        ..
      } => {
        let finished = at_end
          || self
            .trigger_started
            .map_or(true, |started| now.saturating_duration_since(started) >= *trigger_duration);
        if finished {
          Transition::to(
            Trigger,
            Idle,
            vec![
              PlayerCommand::Load {
                path: idle.clone(),
                looping: true,
              },
              PlayerCommand::Resume,
            ],
            motion,
          )
        } else {
          Transition::stay(Trigger, motion)
        }
      }
    }
  }

  /// Apply a transition whose commands were all delivered.
  pub fn commit(&mut self, transition: &Transition, now: Instant) {
    if transition.from != self.state {
      log::warn!(
        "Stale transition {:?} -> {:?} ignored (state is {:?})",
        transition.from,
        transition.next,
        self.state
      );
      return;
    }
    if transition.changes_state() {
      log::info!("Playback {:?} -> {:?}", transition.from, transition.next);
    }
    match transition.next {
      PlaybackState::Trigger if self.state == PlaybackState::Idle => {
        self.trigger_started = Some(now);
      }
      PlaybackState::Idle => self.trigger_started = None,
      PlaybackState::Trigger => {}
    }
    self.state = transition.next;
  }

  /// Decide and commit in one go, as if every command were delivered.
  pub fn step(&mut self, input: &TickInput) -> Transition {
    let transition = self.decide(input);
    self.commit(&transition, input.now);
    transition
  }
}
