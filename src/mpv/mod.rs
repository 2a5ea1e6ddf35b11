//! MPV control - spawns and supervises an external MPV player and drives it
//! over JSON IPC.
//!
//! Architecture:
//! - `process.rs` - MPV binary detection, launch arguments and spawning
//! - `supervisor.rs` - Player lifecycle (launch, liveness, relaunch, termination)
//! - `ipc.rs` - Async Unix socket connection with request/response matching
//! - `protocol.rs` - JSON command/response types and serialization
//! - `channel.rs` - Command channel with lazy connect and failure classification

mod channel;
mod ipc;
mod process;
mod protocol;
mod supervisor;

pub use channel::{ChannelError, CommandChannel, MpvChannel};
pub use process::{LaunchSpec, ProcessError};
pub use supervisor::{LaunchOutcome, PlayerSupervisor, Supervisor, TerminateOutcome};
