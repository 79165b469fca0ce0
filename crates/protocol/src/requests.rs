//! Typed channel requests.
//!
//! A channel request arrives as a request type name plus an opaque payload.
//! [`ChannelRequest::decode`] turns the pair into a typed value; the encode
//! helpers build payloads in the same layout for transports that hand out
//! already-parsed fields.

use bytes::Bytes;

use crate::error::Result;
use crate::payload::{PayloadReader, PayloadWriter};

/// The only channel type the server accepts.
pub const SESSION_CHANNEL: &str = "session";

/// Request type names understood by the session layer.
pub mod kind {
    /// Allocate a pseudo-terminal.
    pub const PTY_REQ: &str = "pty-req";
    /// Terminal dimensions changed.
    pub const WINDOW_CHANGE: &str = "window-change";
    /// Start the login shell.
    pub const SHELL: &str = "shell";
    /// Run a single command.
    pub const EXEC: &str = "exec";
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    /// Columns.
    pub width: u32,
    /// Rows.
    pub height: u32,
}

impl WindowSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Decoded `pty-req` payload.
///
/// Terminal modes are carried on the wire but not interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    /// Value for the `TERM` environment variable.
    pub term: String,
    /// Requested dimensions.
    pub size: WindowSize,
    /// Width in pixels, zero when unknown.
    pub pixel_width: u32,
    /// Height in pixels, zero when unknown.
    pub pixel_height: u32,
}

/// A channel request after payload decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    PtyReq(PtyRequest),
    WindowChange(WindowSize),
    /// `shell`. Any payload counts as arguments, which are not supported.
    Shell { has_arguments: bool },
    /// `exec`. The command is arbitrary bytes, not necessarily UTF-8.
    Exec { command: Bytes },
    /// Any request type the session layer does not implement.
    Other { kind: String },
}

impl ChannelRequest {
    /// Decode a request from its type name and payload.
    ///
    /// Trailing bytes after the fields the session layer needs are ignored.
    pub fn decode(kind: &str, payload: &[u8]) -> Result<Self> {
        match kind {
            kind::PTY_REQ => decode_pty_req(payload).map(Self::PtyReq),
            kind::WINDOW_CHANGE => decode_window_change(payload).map(Self::WindowChange),
            kind::SHELL => Ok(Self::Shell {
                has_arguments: !payload.is_empty(),
            }),
            kind::EXEC => {
                let mut reader = PayloadReader::new(payload);
                let command = reader.read_bytes("command")?;
                Ok(Self::Exec {
                    command: Bytes::copy_from_slice(command),
                })
            }
            other => Ok(Self::Other {
                kind: other.to_owned(),
            }),
        }
    }

    /// Request type name.
    pub fn kind(&self) -> &str {
        match self {
            Self::PtyReq(_) => kind::PTY_REQ,
            Self::WindowChange(_) => kind::WINDOW_CHANGE,
            Self::Shell { .. } => kind::SHELL,
            Self::Exec { .. } => kind::EXEC,
            Self::Other { kind } => kind,
        }
    }
}

fn decode_pty_req(payload: &[u8]) -> Result<PtyRequest> {
    let mut reader = PayloadReader::new(payload);
    let term = reader.read_string("term")?;
    let width = reader.read_u32("width")?;
    let height = reader.read_u32("height")?;

    // Pixel dimensions are optional for older clients.
    let pixel_width = optional_u32(&mut reader, "pixel_width")?;
    let pixel_height = optional_u32(&mut reader, "pixel_height")?;

    Ok(PtyRequest {
        term,
        size: WindowSize::new(width, height),
        pixel_width,
        pixel_height,
    })
}

fn decode_window_change(payload: &[u8]) -> Result<WindowSize> {
    let mut reader = PayloadReader::new(payload);
    let width = reader.read_u32("width")?;
    let height = reader.read_u32("height")?;
    Ok(WindowSize::new(width, height))
}

fn optional_u32(reader: &mut PayloadReader<'_>, field: &'static str) -> Result<u32> {
    if reader.is_empty() {
        Ok(0)
    } else {
        reader.read_u32(field)
    }
}

/// Encode a `pty-req` payload with an empty mode list.
pub fn encode_pty_req(request: &PtyRequest) -> Bytes {
    PayloadWriter::new()
        .put_string(&request.term)
        .put_u32(request.size.width)
        .put_u32(request.size.height)
        .put_u32(request.pixel_width)
        .put_u32(request.pixel_height)
        .put_bytes(&[])
        .finish()
}

/// Encode a `window-change` payload.
pub fn encode_window_change(size: WindowSize, pixel_width: u32, pixel_height: u32) -> Bytes {
    PayloadWriter::new()
        .put_u32(size.width)
        .put_u32(size.height)
        .put_u32(pixel_width)
        .put_u32(pixel_height)
        .finish()
}

/// Encode an `exec` payload.
pub fn encode_exec(command: &[u8]) -> Bytes {
    PayloadWriter::new().put_bytes(command).finish()
}
