//! Channel session: one accepted `session` channel.
//!
//! The session processes its requests strictly in arrival order, owns the
//! terminal and at most one process, and closes the channel exactly once
//! through its [`Teardown`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use minisshd_protocol::{PtyRequest, WindowSize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::dispatch::{self, Action, Phase, Refusal, Reply};
use super::process::{self, ChannelStdio, LaunchSpec, Process, SpawnError, StdioBinding};
use super::pty::{Terminal, TerminalError};
use super::relay::{self, EXIT_GRACE};
use super::teardown::{Teardown, TeardownReason};
use crate::network::{AcceptedChannel, ChannelSink, RawRequest};

/// How long to wait for session tasks once the channel is closed.
const TASK_JOIN_GRACE: Duration = Duration::from_secs(5);

/// Per-channel settings shared by every session on the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Shell used for `shell` and as the interpreter for `exec`.
    pub shell: String,
    /// `TERM` value when the client did not send a `pty-req`.
    pub term: String,
    /// Terminal size when the client did not send one.
    pub default_size: WindowSize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            term: "xterm".to_string(),
            default_size: WindowSize::default(),
        }
    }
}

/// Why an action could not be carried out.
#[derive(Error, Debug)]
enum ActionError {
    #[error(transparent)]
    Refused(#[from] Refusal),

    #[error(transparent)]
    Terminal(#[from] TerminalError),

    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

impl ActionError {
    /// Failures to start a process close the channel after the reply.
    fn closes_channel(&self) -> bool {
        matches!(self, ActionError::Spawn(_))
    }
}

/// State of one accepted session channel.
pub struct ChannelSession {
    id: String,
    settings: Arc<SessionSettings>,
    requests: mpsc::Receiver<RawRequest>,
    input: Option<mpsc::Receiver<Bytes>>,
    sink: Arc<dyn ChannelSink>,
    terminal: Option<Terminal>,
    term: Option<String>,
    pending_size: Option<WindowSize>,
    started: bool,
    teardown: Arc<Teardown>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChannelSession {
    pub fn new(channel: AcceptedChannel, settings: Arc<SessionSettings>) -> Self {
        let id = Uuid::new_v4().to_string();
        let teardown = Teardown::new(id.clone(), Arc::clone(&channel.sink));

        Self {
            id,
            settings,
            requests: channel.requests,
            input: Some(channel.input),
            sink: channel.sink,
            terminal: None,
            term: None,
            pending_size: None,
            started: false,
            teardown,
            tasks: Vec::new(),
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the current lifecycle phase.
    pub fn phase(&self) -> Phase {
        if self.teardown.is_fired() {
            Phase::Closed
        } else if self.started {
            Phase::Running {
                terminal: self.terminal.is_some(),
            }
        } else if self.terminal.is_some() {
            Phase::TerminalReady
        } else {
            Phase::Idle
        }
    }

    /// Serves requests until the channel is closed, then releases the
    /// terminal and waits for the process to be reaped.
    pub async fn run(mut self) {
        tracing::debug!(session_id = %self.id, "Session opened");

        loop {
            let request = tokio::select! {
                biased;
                _ = self.teardown.closed() => break,
                request = self.requests.recv() => request,
            };
            match request {
                Some(request) => self.handle(request).await,
                None => break,
            }
        }

        self.teardown.fire(TeardownReason::ChannelClosed).await;

        // Anything still queued is answered with failure.
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            self.handle(request).await;
        }

        if let Some(terminal) = self.terminal.take() {
            terminal.close();
        }

        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(TASK_JOIN_GRACE, task).await.is_err() {
                tracing::warn!(session_id = %self.id, "Session task did not finish, aborting");
                abort.abort();
            }
        }

        tracing::debug!(session_id = %self.id, "Session finished");
    }

    async fn handle(&mut self, request: RawRequest) {
        let decision = dispatch::decide(self.phase(), &request.kind, &request.payload);

        tracing::debug!(
            session_id = %self.id,
            request = %request.kind,
            action = ?decision.action,
            "Channel request"
        );

        let outcome = self.execute(decision.action);

        if let Err(e) = &outcome {
            match e {
                ActionError::Refused(Refusal::Unsupported(_) | Refusal::Closed) => {
                    tracing::debug!(
                        session_id = %self.id,
                        request = %request.kind,
                        error = %e,
                        "Request refused"
                    );
                }
                ActionError::Refused(_) => {
                    tracing::info!(
                        session_id = %self.id,
                        request = %request.kind,
                        error = %e,
                        "Request refused"
                    );
                }
                _ => {
                    tracing::warn!(
                        session_id = %self.id,
                        request = %request.kind,
                        error = %e,
                        "Request failed"
                    );
                }
            }
        }

        let close = outcome.as_ref().is_err_and(ActionError::closes_channel);

        match decision.reply {
            Reply::Respond => request.reply(outcome.is_ok()),
            Reply::Silent => drop(request),
        }

        if close {
            self.teardown.fire(TeardownReason::SpawnFailed).await;
        }
    }

    fn execute(&mut self, action: Action) -> Result<(), ActionError> {
        match action {
            Action::OpenTerminal(request) => self.open_terminal(request),
            Action::ResizeTerminal { size, term } => {
                if let Some(term) = term {
                    self.term = Some(term);
                }
                self.resize(size);
                Ok(())
            }
            Action::RememberSize { size, term } => {
                if let Some(term) = term {
                    self.term = Some(term);
                }
                self.pending_size = Some(size);
                Ok(())
            }
            Action::StartShell => self.start_shell(),
            Action::StartExec { command } => self.start_exec(command),
            Action::Refuse(refusal) => Err(refusal.into()),
        }
    }

    fn open_terminal(&mut self, request: PtyRequest) -> Result<(), ActionError> {
        let terminal = Terminal::open(request.size)?;
        self.terminal = Some(terminal);
        self.term = Some(request.term);
        Ok(())
    }

    fn resize(&mut self, size: WindowSize) {
        if let Some(terminal) = self.terminal.as_mut() {
            if let Err(e) = terminal.resize(size) {
                tracing::warn!(session_id = %self.id, error = %e, "Resize failed");
            }
        }
    }

    fn start_shell(&mut self) -> Result<(), ActionError> {
        let input = self
            .input
            .take()
            .ok_or(Refusal::ProcessAlreadyRunning)?;

        let terminal = match self.terminal.take() {
            Some(terminal) => terminal,
            None => {
                let size = self.pending_size.unwrap_or(self.settings.default_size);
                Terminal::open(size).map_err(SpawnError::from)?
            }
        };
        let terminal = self.terminal.insert(terminal);

        let relays = relay::spawn_relays(
            terminal,
            input,
            Arc::clone(&self.sink),
            Arc::clone(&self.teardown),
        )
        .map_err(SpawnError::from)?;
        self.tasks.push(relays.output);
        self.tasks.push(relays.input);

        let term = self.term.as_deref().unwrap_or(&self.settings.term);
        let spec = LaunchSpec::shell(&self.settings.shell).env("TERM", term);
        let process = process::spawn(spec, StdioBinding::Terminal(terminal))?;

        tracing::info!(
            session_id = %self.id,
            shell = %self.settings.shell,
            pid = ?process.pid(),
            "Shell started"
        );

        self.started = true;
        self.tasks
            .push(tokio::spawn(watch_process(process, Arc::clone(&self.teardown), true)));
        Ok(())
    }

    fn start_exec(&mut self, command: Bytes) -> Result<(), ActionError> {
        let input = self
            .input
            .take()
            .ok_or(Refusal::ProcessAlreadyRunning)?;

        let spec = LaunchSpec::command(&self.settings.shell, command);
        let stdio = ChannelStdio {
            input,
            sink: Arc::clone(&self.sink),
        };
        let process = process::spawn(spec, StdioBinding::Channel(stdio))?;

        tracing::info!(session_id = %self.id, pid = ?process.pid(), "Command started");

        self.started = true;
        self.tasks
            .push(tokio::spawn(watch_process(process, Arc::clone(&self.teardown), false)));
        Ok(())
    }
}

/// Reaps the process, records its exit code and closes the session.
///
/// On a terminal the output relay may still hold buffered output, so the
/// close waits briefly for it to drain.
async fn watch_process(process: Process, teardown: Arc<Teardown>, terminal: bool) {
    let code = process.wait(teardown.token()).await;
    teardown.record_exit(code);

    if terminal {
        tokio::select! {
            _ = teardown.wait_drained(EXIT_GRACE) => {}
            _ = teardown.closed() => {}
        }
    }

    teardown.fire(TeardownReason::ProcessExited).await;
}

#[cfg(test)]
mod tests {
    use minisshd_protocol::{encode_exec, encode_pty_req, encode_window_change};
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::*;
    use crate::network::testing::{RecordingSink, SinkEvent};
    use crate::network::{ChannelPeer, NewChannel};

    struct Harness {
        peer: ChannelPeer,
        sink: Arc<RecordingSink>,
        session: JoinHandle<()>,
    }

    fn start_session() -> Harness {
        let sink = RecordingSink::new();
        let (channel, peer) = NewChannel::new("session", sink.clone());
        let session = ChannelSession::new(channel.accept(), Arc::new(SessionSettings::default()));
        Harness {
            peer,
            sink,
            session: tokio::spawn(session.run()),
        }
    }

    impl Harness {
        async fn send(&self, kind: &str, payload: Bytes) -> Option<oneshot::Receiver<bool>> {
            let want_reply = kind != "window-change";
            let (request, reply) = RawRequest::new(kind, payload, want_reply);
            self.peer.requests.send(request).await.unwrap();
            reply
        }

        async fn request(&self, kind: &str, payload: Bytes) -> bool {
            let reply = self.send(kind, payload).await.unwrap();
            timeout(Duration::from_secs(5), reply).await.unwrap().unwrap_or(false)
        }

        async fn wait_closed(&self) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
            while self.sink.count(&SinkEvent::Close) == 0 {
                assert!(tokio::time::Instant::now() < deadline, "channel never closed");
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        async fn finish(self) -> Arc<RecordingSink> {
            let Harness { peer, sink, session } = self;
            drop(peer);
            timeout(Duration::from_secs(10), session).await.unwrap().unwrap();
            sink
        }
    }

    fn pty_req(width: u32, height: u32) -> Bytes {
        encode_pty_req(&PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::new(width, height),
            pixel_width: 0,
            pixel_height: 0,
        })
    }

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.term, "xterm");
        assert_eq!(settings.default_size, WindowSize::new(80, 24));
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let sink = RecordingSink::new();
        let (channel, _peer) = NewChannel::new("session", sink);
        let mut session =
            ChannelSession::new(channel.accept(), Arc::new(SessionSettings::default()));
        assert_eq!(session.phase(), Phase::Idle);

        session
            .execute(Action::OpenTerminal(PtyRequest {
                term: "vt100".to_string(),
                size: WindowSize::new(80, 24),
                pixel_width: 0,
                pixel_height: 0,
            }))
            .unwrap();
        assert_eq!(session.phase(), Phase::TerminalReady);

        session
            .execute(Action::ResizeTerminal {
                size: WindowSize::new(120, 40),
                term: None,
            })
            .unwrap();
        assert_eq!(
            session.terminal.as_ref().map(Terminal::size),
            Some(WindowSize::new(120, 40))
        );
        assert_eq!(session.term.as_deref(), Some("vt100"));

        session.teardown.fire(TeardownReason::ChannelClosed).await;
        assert_eq!(session.phase(), Phase::Closed);
    }

    #[tokio::test]
    async fn test_window_change_before_pty_sizes_shell_terminal() {
        let sink = RecordingSink::new();
        let (channel, _peer) = NewChannel::new("session", sink);
        let mut session =
            ChannelSession::new(channel.accept(), Arc::new(SessionSettings::default()));

        session
            .execute(Action::RememberSize {
                size: WindowSize::new(100, 50),
                term: None,
            })
            .unwrap();
        session.execute(Action::StartShell).unwrap();

        assert_eq!(session.phase(), Phase::Running { terminal: true });
        assert_eq!(
            session.terminal.as_ref().map(Terminal::size),
            Some(WindowSize::new(100, 50))
        );

        session.teardown.fire(TeardownReason::ChannelClosed).await;
        for task in session.tasks.drain(..) {
            timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_exec_runs_and_closes() {
        let harness = start_session();
        assert!(harness.request("exec", encode_exec(b"echo hi")).await);
        harness.wait_closed().await;

        let sink = harness.finish().await;
        assert_eq!(sink.output(), "hi\n");
        let events = sink.events();
        assert_eq!(
            &events[events.len() - 3..],
            &[SinkEvent::ExitStatus(0), SinkEvent::Eof, SinkEvent::Close]
        );
    }

    #[tokio::test]
    async fn test_second_exec_refused() {
        let harness = start_session();
        assert!(harness.request("exec", encode_exec(b"sleep 1; echo first")).await);
        assert!(!harness.request("exec", encode_exec(b"echo second")).await);
        assert!(!harness.request("shell", Bytes::new()).await);

        // The first command finishes on its own.
        harness.wait_closed().await;

        let sink = harness.finish().await;
        assert_eq!(sink.output(), "first\n");
        assert_eq!(sink.count(&SinkEvent::ExitStatus(0)), 1);
    }

    #[tokio::test]
    async fn test_pty_req_after_exec_succeeds() {
        let harness = start_session();
        assert!(harness.request("exec", encode_exec(b"sleep 1; echo done")).await);
        assert!(harness.request("pty-req", pty_req(100, 30)).await);

        harness.wait_closed().await;
        let sink = harness.finish().await;
        assert_eq!(sink.output(), "done\n");
    }

    #[tokio::test]
    async fn test_exec_input_applies_backpressure() {
        use crate::network::INPUT_QUEUE_CAPACITY;
        use tokio::sync::mpsc::error::TrySendError;

        let harness = start_session();
        // The command never reads stdin, so the pipe and then the queue fill.
        assert!(harness.request("exec", encode_exec(b"sleep 5")).await);

        let chunk = Bytes::from(vec![b'x'; 1 << 20]);
        let mut accepted = 0;
        let mut full = false;
        for _ in 0..INPUT_QUEUE_CAPACITY + 4 {
            match harness.peer.input.try_send(chunk.clone()) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    full = true;
                    break;
                }
                Err(TrySendError::Closed(_)) => panic!("input closed early"),
            }
            tokio::task::yield_now().await;
        }
        assert!(full, "queue accepted {accepted} chunks without filling");
        assert!(accepted <= INPUT_QUEUE_CAPACITY + 1);

        harness.finish().await;
    }

    #[tokio::test]
    async fn test_window_change_has_no_reply() {
        let harness = start_session();
        assert!(harness.request("pty-req", pty_req(80, 24)).await);

        let reply = harness
            .send("window-change", encode_window_change(WindowSize::new(120, 40), 0, 0))
            .await;
        assert!(reply.is_none());

        // The session keeps serving requests afterwards.
        assert!(harness.request("pty-req", pty_req(90, 30)).await);
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_unsupported_request_keeps_channel() {
        let harness = start_session();
        assert!(!harness.request("env", Bytes::from_static(b"\0\0\0\x01A\0\0\0\x01B")).await);
        assert!(!harness.request("shell", Bytes::from_static(b"\0\0\0\x02-l")).await);
        assert!(!harness.request("exec", Bytes::from_static(b"\0\0\0\x09ls")).await);
        assert_eq!(harness.sink.count(&SinkEvent::Close), 0);

        assert!(harness.request("exec", encode_exec(b"true")).await);
        harness.finish().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_closes_channel() {
        let sink = RecordingSink::new();
        let (channel, peer) = NewChannel::new("session", sink.clone());
        let settings = SessionSettings {
            shell: "/nonexistent/minisshd-shell".to_string(),
            ..SessionSettings::default()
        };
        let session = ChannelSession::new(channel.accept(), Arc::new(settings));
        let handle = tokio::spawn(session.run());

        let (request, reply) = RawRequest::new("exec", encode_exec(b"true"), true);
        peer.requests.send(request).await.unwrap();
        assert!(!reply.unwrap().await.unwrap());

        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }

    #[tokio::test]
    async fn test_client_close_kills_process() {
        let harness = start_session();
        assert!(harness.request("exec", encode_exec(b"sleep 30")).await);

        let started = tokio::time::Instant::now();
        let sink = harness.finish().await;
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }
}
