//! # minisshd Protocol Library
//!
//! This crate decodes the channel request payloads the minisshd session
//! layer acts on.
//!
//! ## Overview
//!
//! The SSH transport delivers each channel request as a type name plus an
//! opaque byte payload. This crate provides:
//!
//! - **Payload Codec**: SSH `string` and `uint32` primitives with strict bounds checks
//! - **Typed Requests**: `pty-req`, `window-change`, `shell` and `exec`
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Session Dispatch               │  minisshd daemon
//! ├─────────────────────────────────────────┤
//! │          ChannelRequest                 │  typed requests
//! ├─────────────────────────────────────────┤
//! │          PayloadReader/Writer           │  string + uint32
//! ├─────────────────────────────────────────┤
//! │          SSH Transport (russh)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use minisshd_protocol::{encode_exec, ChannelRequest};
//!
//! let payload = encode_exec(b"echo hi");
//! let request = ChannelRequest::decode("exec", &payload).unwrap();
//! assert_eq!(request, ChannelRequest::Exec { command: "echo hi".into() });
//! ```
//!
//! ## Modules
//!
//! - [`payload`]: Primitive field reader and writer
//! - [`requests`]: Channel request types and decoding
//! - [`error`]: Error types

pub mod error;
pub mod payload;
pub mod requests;

pub use error::{ProtocolError, Result};
pub use payload::{PayloadReader, PayloadWriter};
pub use requests::{
    encode_exec, encode_pty_req, encode_window_change, kind, ChannelRequest, PtyRequest,
    WindowSize, SESSION_CHANNEL,
};
