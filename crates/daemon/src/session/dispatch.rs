//! Channel request dispatch.
//!
//! [`decide`] maps the session phase and an incoming request to the action
//! the session should take and whether the request gets a reply. It performs
//! no I/O; [`super::channel::ChannelSession`] carries the decision out.

use bytes::Bytes;
use minisshd_protocol::{kind, ChannelRequest, ProtocolError, PtyRequest, WindowSize};
use thiserror::Error;

/// Where a channel session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No terminal, no process.
    Idle,
    /// A terminal is open, no process yet.
    TerminalReady,
    /// A process was started. `terminal` tells whether a terminal is open.
    Running { terminal: bool },
    /// The channel has been torn down.
    Closed,
}

impl Phase {
    fn has_terminal(self) -> bool {
        matches!(self, Phase::TerminalReady | Phase::Running { terminal: true })
    }
}

/// What the session should do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Allocate a terminal and remember the terminal type.
    OpenTerminal(PtyRequest),
    /// Resize the open terminal. `term` is set when a repeated `pty-req`
    /// also names a terminal type.
    ResizeTerminal {
        size: WindowSize,
        term: Option<String>,
    },
    /// Keep the size, and the terminal type when given, for a terminal
    /// opened later.
    RememberSize {
        size: WindowSize,
        term: Option<String>,
    },
    /// Launch the shell on a terminal.
    StartShell,
    /// Launch `<shell> -c <command>` with piped stdio.
    StartExec { command: Bytes },
    /// Do nothing and answer with failure.
    Refuse(Refusal),
}

/// Why a request was refused. The channel stays open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    #[error("malformed payload: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("a process is already running on this channel")]
    ProcessAlreadyRunning,

    #[error("shell arguments are not supported")]
    ShellArguments,

    #[error("unsupported request: {0}")]
    Unsupported(String),

    #[error("channel is closed")]
    Closed,
}

/// Whether the request is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Answer with the outcome of the action.
    Respond,
    /// Never answer. Used for `window-change`.
    Silent,
}

/// Outcome of [`decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub reply: Reply,
}

/// Decides how to handle a request of type `request_kind` with `payload`.
pub fn decide(phase: Phase, request_kind: &str, payload: &[u8]) -> Decision {
    let reply = if request_kind == kind::WINDOW_CHANGE {
        Reply::Silent
    } else {
        Reply::Respond
    };

    let action = if phase == Phase::Closed {
        Action::Refuse(Refusal::Closed)
    } else {
        match ChannelRequest::decode(request_kind, payload) {
            Ok(request) => act(phase, request),
            Err(e) => Action::Refuse(Refusal::Malformed(e)),
        }
    };

    Decision { action, reply }
}

fn act(phase: Phase, request: ChannelRequest) -> Action {
    let running = matches!(phase, Phase::Running { .. });

    match request {
        ChannelRequest::PtyReq(pty) if phase.has_terminal() => Action::ResizeTerminal {
            size: pty.size,
            term: Some(pty.term),
        },
        // A running exec keeps its pipes; the request is only recorded.
        ChannelRequest::PtyReq(pty) if running => Action::RememberSize {
            size: pty.size,
            term: Some(pty.term),
        },
        ChannelRequest::PtyReq(pty) => Action::OpenTerminal(pty),

        ChannelRequest::WindowChange(size) if phase.has_terminal() => {
            Action::ResizeTerminal { size, term: None }
        }
        ChannelRequest::WindowChange(size) => Action::RememberSize { size, term: None },

        ChannelRequest::Shell { .. } | ChannelRequest::Exec { .. } if running => {
            Action::Refuse(Refusal::ProcessAlreadyRunning)
        }
        ChannelRequest::Shell {
            has_arguments: true,
        } => Action::Refuse(Refusal::ShellArguments),
        ChannelRequest::Shell {
            has_arguments: false,
        } => Action::StartShell,
        ChannelRequest::Exec { command } => Action::StartExec { command },

        ChannelRequest::Other { kind } => Action::Refuse(Refusal::Unsupported(kind)),
    }
}
