//! Session module.
//!
//! This module runs accepted `session` channels: request dispatch, terminal
//! allocation, process launching, byte relays and the close-once teardown.

pub mod channel;
pub mod dispatch;
pub mod process;
pub mod pty;
pub mod relay;
pub mod teardown;

pub use channel::{ChannelSession, SessionSettings};
pub use dispatch::{decide, Action, Decision, Phase, Refusal, Reply};
pub use process::{spawn, ChannelStdio, LaunchSpec, Process, SpawnError, StdioBinding};
pub use pty::{ResizeError, Terminal, TerminalError};
pub use teardown::{Teardown, TeardownReason};
