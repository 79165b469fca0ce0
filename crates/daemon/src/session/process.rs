//! Process launching for channel sessions.
//!
//! Interactive shells run on a terminal subordinate; `exec` commands run
//! with their stdio piped to the channel.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{Child, CommandBuilder};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::{Terminal, TerminalError};
use crate::network::{ChannelSink, EXTENDED_DATA_STDERR};

/// Buffer size for reading piped output.
const READ_BUFFER_SIZE: usize = 4096;

/// How long to wait for piped output to drain after the process exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Errors that can occur while starting a process.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// Starting on the terminal failed.
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    /// Starting with piped stdio failed.
    #[error("failed to spawn {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A piped stdio handle was missing after spawn.
    #[error("child is missing its {0} pipe")]
    MissingPipe(&'static str),
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    /// An interactive shell with no arguments.
    pub fn shell(path: impl Into<String>) -> Self {
        Self {
            program: path.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// `<shell> -c <command>`. The command is passed through byte for byte.
    pub fn command(shell: impl Into<String>, command: impl AsRef<[u8]>) -> Self {
        Self {
            program: shell.into(),
            args: vec![
                OsString::from("-c"),
                OsStr::from_bytes(command.as_ref()).to_os_string(),
            ],
            env: Vec::new(),
        }
    }

    /// Adds an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// The channel side of a piped process.
pub struct ChannelStdio {
    pub input: mpsc::Receiver<Bytes>,
    pub sink: Arc<dyn ChannelSink>,
}

/// Where the process reads and writes.
pub enum StdioBinding<'a> {
    /// The terminal subordinate, as stdin, stdout, stderr and controlling terminal.
    Terminal(&'a mut Terminal),
    /// Pipes connected to the channel. Stderr is sent as extended data.
    Channel(ChannelStdio),
}

enum ChildHandle {
    Terminal(Box<dyn Child + Send + Sync>),
    Piped(tokio::process::Child),
}

/// A running child process.
pub struct Process {
    pid: Option<u32>,
    child: ChildHandle,
    stdin_pump: Option<JoinHandle<()>>,
    output_pumps: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process").field("pid", &self.pid).finish()
    }
}

/// Starts `spec` with the given stdio binding.
pub fn spawn(spec: LaunchSpec, binding: StdioBinding<'_>) -> Result<Process, SpawnError> {
    match binding {
        StdioBinding::Terminal(terminal) => spawn_on_terminal(spec, terminal),
        StdioBinding::Channel(stdio) => spawn_piped(spec, stdio),
    }
}

fn spawn_on_terminal(spec: LaunchSpec, terminal: &mut Terminal) -> Result<Process, SpawnError> {
    let mut command = CommandBuilder::new(&spec.program);
    command.args(&spec.args);
    for (key, value) in &spec.env {
        command.env(key, value);
    }

    let child = terminal.spawn(command)?;
    let pid = child.process_id();

    tracing::debug!(program = %spec.program, pid = ?pid, "Spawned process on terminal");

    Ok(Process {
        pid,
        child: ChildHandle::Terminal(child),
        stdin_pump: None,
        output_pumps: Vec::new(),
    })
}

fn spawn_piped(spec: LaunchSpec, stdio: ChannelStdio) -> Result<Process, SpawnError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SpawnError::Io {
            program: spec.program.clone(),
            source,
        })?;

    let pid = child.id();
    let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(SpawnError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(SpawnError::MissingPipe("stderr"))?;

    let ChannelStdio { input, sink } = stdio;
    let stdin_pump = tokio::spawn(pump_input(input, stdin));
    let output_pumps = vec![
        tokio::spawn(pump_output(stdout, Arc::clone(&sink), None)),
        tokio::spawn(pump_output(stderr, sink, Some(EXTENDED_DATA_STDERR))),
    ];

    tracing::debug!(program = %spec.program, pid = ?pid, "Spawned piped process");

    Ok(Process {
        pid,
        child: ChildHandle::Piped(child),
        stdin_pump: Some(stdin_pump),
        output_pumps,
    })
}

async fn pump_input(mut input: mpsc::Receiver<Bytes>, mut stdin: ChildStdin) {
    while let Some(data) = input.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            tracing::debug!(error = %e, "Process stdin closed");
            return;
        }
    }
    // Dropping stdin delivers EOF to the process.
}

async fn pump_output<R>(mut reader: R, sink: Arc<dyn ChannelSink>, extended: Option<u32>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "Process output read failed");
                return;
            }
        };

        let data = Bytes::copy_from_slice(&buffer[..n]);
        let sent = match extended {
            Some(code) => sink.extended_data(code, data).await,
            None => sink.data(data).await,
        };
        if sent.is_err() {
            return;
        }
    }
}

impl Process {
    /// Returns the process id, if known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the process to exit and reaps it.
    ///
    /// If `cancel` fires first the process is killed, then reaped. Returns
    /// the exit code when one is available. Piped output is drained before
    /// returning.
    pub async fn wait(self, cancel: CancellationToken) -> Option<u32> {
        let Process {
            pid,
            child,
            stdin_pump,
            output_pumps,
        } = self;

        let code = match child {
            ChildHandle::Terminal(child) => wait_terminal_child(child, &cancel, pid).await,
            ChildHandle::Piped(child) => wait_piped_child(child, &cancel, pid).await,
        };

        for pump in output_pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_GRACE, pump).await.is_err() {
                tracing::debug!(pid = ?pid, "Output still open after exit, abandoning");
                abort.abort();
            }
        }
        if let Some(pump) = stdin_pump {
            pump.abort();
        }

        code
    }
}

async fn wait_terminal_child(
    mut child: Box<dyn Child + Send + Sync>,
    cancel: &CancellationToken,
    pid: Option<u32>,
) -> Option<u32> {
    let mut killer = child.clone_killer();
    let mut waiter = tokio::task::spawn_blocking(move || child.wait());

    let result = tokio::select! {
        result = &mut waiter => result,
        _ = cancel.cancelled() => {
            if let Err(e) = killer.kill() {
                tracing::debug!(pid = ?pid, error = %e, "Kill failed, process may have exited");
            }
            waiter.await
        }
    };

    match result {
        Ok(Ok(status)) => Some(status.exit_code()),
        Ok(Err(e)) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
            None
        }
        Err(e) => {
            tracing::error!(pid = ?pid, error = %e, "Wait task panicked");
            None
        }
    }
}

async fn wait_piped_child(
    mut child: tokio::process::Child,
    cancel: &CancellationToken,
    pid: Option<u32>,
) -> Option<u32> {
    let result = tokio::select! {
        result = child.wait() => result,
        _ = cancel.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = ?pid, error = %e, "Kill failed, process may have exited");
            }
            child.wait().await
        }
    };

    match result {
        Ok(status) => status.code().and_then(|code| u32::try_from(code).ok()),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "Failed to wait for process");
            None
        }
    }
}
