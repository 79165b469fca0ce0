//! Pseudo-terminal allocation.
//!
//! A [`Terminal`] owns both ends of a pseudo-terminal pair. The subordinate
//! end is handed to exactly one process and released here right after that
//! spawn; the controller end stays with the session for the relays and for
//! resizing.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};

use minisshd_protocol::WindowSize;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// How often a waiting controller read checks for cancellation, in milliseconds.
const POLL_INTERVAL_MS: u16 = 100;

/// Errors raised while opening or using a terminal.
#[derive(Error, Debug)]
pub enum TerminalError {
    /// The pseudo-terminal pair could not be opened.
    #[error("failed to open terminal: {0}")]
    OpenFailed(String),

    /// A controller handle could not be obtained.
    #[error("failed to obtain terminal handle: {0}")]
    HandleFailed(String),

    /// The subordinate end was already handed to a process.
    #[error("terminal subordinate already released")]
    SubordinateReleased,

    /// The process could not be started on the subordinate end.
    #[error("failed to spawn on terminal: {0}")]
    SpawnFailed(String),
}

/// A resize that could not be applied to the terminal.
///
/// The requested size is still recorded on the [`Terminal`].
#[derive(Error, Debug)]
#[error("failed to resize terminal to {cols}x{rows}: {reason}")]
pub struct ResizeError {
    pub cols: u16,
    pub rows: u16,
    pub reason: String,
}

/// A pseudo-terminal pair.
pub struct Terminal {
    controller: Box<dyn MasterPty + Send>,
    subordinate: Option<Box<dyn SlavePty + Send>>,
    size: WindowSize,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("size", &self.size)
            .field("subordinate_open", &self.subordinate.is_some())
            .finish()
    }
}

impl Terminal {
    /// Opens a new pseudo-terminal pair with the given size.
    pub fn open(size: WindowSize) -> Result<Self, TerminalError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| TerminalError::OpenFailed(e.to_string()))?;

        tracing::debug!(cols = size.width, rows = size.height, "Opened terminal");

        Ok(Self {
            controller: pair.master,
            subordinate: Some(pair.slave),
            size,
        })
    }

    /// Returns the last requested size.
    pub fn size(&self) -> WindowSize {
        self.size
    }

    /// Returns whether the subordinate end is still held by the server.
    pub fn has_subordinate(&self) -> bool {
        self.subordinate.is_some()
    }

    /// Sets the terminal dimensions.
    ///
    /// The size is recorded before it is applied, so a failed ioctl still
    /// updates [`Terminal::size`].
    pub fn resize(&mut self, size: WindowSize) -> Result<(), ResizeError> {
        self.size = size;
        let applied = pty_size(size);

        self.controller
            .resize(applied)
            .map_err(|e| ResizeError {
                cols: applied.cols,
                rows: applied.rows,
                reason: e.to_string(),
            })?;

        tracing::debug!(cols = applied.cols, rows = applied.rows, "Resized terminal");
        Ok(())
    }

    /// Returns a reader over its own duplicate of the controller descriptor.
    pub fn reader(&self) -> Result<ControllerReader, TerminalError> {
        let raw = self.controller.as_raw_fd().ok_or_else(|| {
            TerminalError::HandleFailed("controller has no file descriptor".to_string())
        })?;

        // SAFETY: `raw` is owned by `self.controller`, which outlives this borrow.
        let fd = unsafe { BorrowedFd::borrow_raw(raw) }
            .try_clone_to_owned()
            .map_err(|e| TerminalError::HandleFailed(e.to_string()))?;

        Ok(ControllerReader {
            file: File::from(fd),
        })
    }

    /// Returns the writer for the controller end. Only one writer can be taken.
    pub fn writer(&self) -> Result<Box<dyn Write + Send>, TerminalError> {
        self.controller
            .take_writer()
            .map_err(|e| TerminalError::HandleFailed(e.to_string()))
    }

    /// Starts `command` with the subordinate end as its controlling terminal
    /// in a new session, then releases the subordinate end.
    pub(crate) fn spawn(
        &mut self,
        command: CommandBuilder,
    ) -> Result<Box<dyn Child + Send + Sync>, TerminalError> {
        let subordinate = self
            .subordinate
            .take()
            .ok_or(TerminalError::SubordinateReleased)?;

        let result = subordinate
            .spawn_command(command)
            .map_err(|e| TerminalError::SpawnFailed(e.to_string()));

        // The child holds its own copy; the server must not keep the end open
        // or the controller never sees EOF.
        drop(subordinate);
        result
    }

    /// Releases both ends.
    pub fn close(self) {
        tracing::debug!(cols = self.size.width, rows = self.size.height, "Closed terminal");
    }
}

/// Blocking reader over the controller end that can be abandoned.
///
/// A background job may keep the subordinate open after the session ends,
/// so a plain read could wait forever. Reads wait in `poll` and give up once
/// the token is cancelled, which lets the caller drop the descriptor.
pub struct ControllerReader {
    file: File,
}

impl ControllerReader {
    /// Reads into `buf`. Returns `Ok(None)` once `cancel` fires.
    pub fn read_until(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> io::Result<Option<usize>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let ready = {
                let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                    Ok(n) => n > 0,
                    Err(Errno::EINTR) => false,
                    Err(e) => return Err(e.into()),
                }
            };
            if !ready {
                continue;
            }

            match self.file.read(buf) {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for ControllerReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerReader").finish_non_exhaustive()
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: saturate(size.height),
        cols: saturate(size.width),
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn saturate(value: u32) -> u16 {
    u16::try_from(value).unwrap_or(u16::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_size_saturates() {
        let size = pty_size(WindowSize::new(70_000, 24));
        assert_eq!(size.cols, u16::MAX);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_open_terminal() {
        let terminal = Terminal::open(WindowSize::new(80, 24)).unwrap();
        assert_eq!(terminal.size(), WindowSize::new(80, 24));
        assert!(terminal.has_subordinate());
        terminal.close();
    }

    #[test]
    fn test_resize_updates_size() {
        let mut terminal = Terminal::open(WindowSize::new(80, 24)).unwrap();

        terminal.resize(WindowSize::new(120, 40)).unwrap();
        assert_eq!(terminal.size(), WindowSize::new(120, 40));

        // Same size again is accepted.
        terminal.resize(WindowSize::new(120, 40)).unwrap();
        assert_eq!(terminal.size(), WindowSize::new(120, 40));
    }

    #[test]
    fn test_spawn_releases_subordinate() {
        let mut terminal = Terminal::open(WindowSize::default()).unwrap();

        let mut command = CommandBuilder::new("/bin/sh");
        command.args(["-c", "exit 3"]);
        let mut child = terminal.spawn(command).unwrap();
        assert!(!terminal.has_subordinate());

        let status = child.wait().unwrap();
        assert_eq!(status.exit_code(), 3);

        let second = terminal.spawn(CommandBuilder::new("/bin/sh"));
        assert!(matches!(second, Err(TerminalError::SubordinateReleased)));
    }

    #[test]
    fn test_spawn_missing_program() {
        let mut terminal = Terminal::open(WindowSize::default()).unwrap();
        let result = terminal.spawn(CommandBuilder::new("/nonexistent/minisshd-shell"));
        assert!(matches!(result, Err(TerminalError::SpawnFailed(_))));
    }

    #[test]
    fn test_reader_sees_subordinate_output() {
        let mut terminal = Terminal::open(WindowSize::default()).unwrap();
        let mut reader = terminal.reader().unwrap();

        let mut command = CommandBuilder::new("/bin/sh");
        command.args(["-c", "printf ready; sleep 1"]);
        let mut child = terminal.spawn(command).unwrap();

        let mut buf = [0u8; 64];
        let n = reader
            .read_until(&mut buf, &CancellationToken::new())
            .unwrap()
            .unwrap();
        assert!(buf[..n].starts_with(b"ready"));
        child.wait().unwrap();
    }

    #[test]
    fn test_reader_gives_up_when_cancelled() {
        let terminal = Terminal::open(WindowSize::default()).unwrap();
        let mut reader = terminal.reader().unwrap();

        // Nothing is ever written, and the subordinate stays open.
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 16];
            reader.read_until(&mut buf, &cancel).unwrap()
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        trigger.cancel();
        assert_eq!(handle.join().unwrap(), None);
        assert!(terminal.has_subordinate());
    }

    #[test]
    fn test_resize_error_display() {
        let err = ResizeError {
            cols: 10,
            rows: 5,
            reason: "bad fd".to_string(),
        };
        assert_eq!(err.to_string(), "failed to resize terminal to 10x5: bad fd");
    }
}
