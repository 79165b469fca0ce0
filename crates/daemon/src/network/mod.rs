//! Network module for SSH connections.
//!
//! This module defines the contract between the SSH transport and the session
//! layer:
//! - [`Transport`] turns an accepted TCP stream into a stream of logical
//!   channels and a stream of connection-level requests
//! - [`NewChannel`] is an incoming channel that must be accepted or rejected
//! - [`RawRequest`] is a channel request that carries its own reply
//! - [`ChannelSink`] is the outbound half of an accepted channel
//!
//! The russh-backed implementation lives in [`ssh`]; [`connection`] drives a
//! single connection on top of the contract.

pub mod connection;
pub mod ssh;

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

/// Boxed future returned by the object-safe traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Capacity of the per-channel request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 32;

/// Capacity of the per-channel input queue, in data messages.
///
/// A full queue stalls the transport, which stops granting the client more
/// window.
pub const INPUT_QUEUE_CAPACITY: usize = 32;

/// The channel can no longer carry messages.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("channel closed")]
pub struct ChannelClosed;

/// The transport handshake failed for one connection.
#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("handshake with {peer} failed: {reason}")]
    Failed { peer: SocketAddr, reason: String },
}

/// An SSH transport that performs key exchange and authentication.
pub trait Transport: Send + Sync + 'static {
    /// Runs the handshake on `stream` and returns the connection's streams.
    fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> BoxFuture<'_, Result<ConnectionStreams, HandshakeError>>;
}

/// Streams produced by a completed handshake.
///
/// Both streams end when the connection closes.
pub struct ConnectionStreams {
    pub channels: mpsc::Receiver<NewChannel>,
    pub requests: mpsc::Receiver<GlobalRequest>,
}

/// Outbound half of an accepted channel.
pub trait ChannelSink: Send + Sync + 'static {
    /// Sends channel data.
    fn data(&self, data: Bytes) -> BoxFuture<'_, Result<(), ChannelClosed>>;

    /// Sends extended data, e.g. stderr with [`EXTENDED_DATA_STDERR`].
    fn extended_data(&self, code: u32, data: Bytes) -> BoxFuture<'_, Result<(), ChannelClosed>>;

    /// Sends an `exit-status` request.
    fn exit_status(&self, code: u32) -> BoxFuture<'_, Result<(), ChannelClosed>>;

    /// Signals that no more data will be sent.
    fn eof(&self) -> BoxFuture<'_, Result<(), ChannelClosed>>;

    /// Closes the channel.
    fn close(&self) -> BoxFuture<'_, Result<(), ChannelClosed>>;
}

/// Reason codes for rejecting a channel open (RFC 4254 section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    UnknownChannelType = 3,
}

/// Decision on a [`NewChannel`], reported back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDecision {
    Accepted,
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

/// A channel the peer asked to open.
pub struct NewChannel {
    kind: String,
    sink: Arc<dyn ChannelSink>,
    requests: mpsc::Receiver<RawRequest>,
    input: mpsc::Receiver<Bytes>,
    decision: oneshot::Sender<ChannelDecision>,
}

/// Transport side of a [`NewChannel`].
///
/// The transport feeds requests and input data through the senders and
/// learns the accept/reject outcome from `decision`.
pub struct ChannelPeer {
    pub requests: mpsc::Sender<RawRequest>,
    pub input: mpsc::Sender<Bytes>,
    pub decision: oneshot::Receiver<ChannelDecision>,
}

/// An accepted channel, owned by exactly one session.
pub struct AcceptedChannel {
    pub requests: mpsc::Receiver<RawRequest>,
    pub input: mpsc::Receiver<Bytes>,
    pub sink: Arc<dyn ChannelSink>,
}

impl NewChannel {
    /// Creates a channel of type `kind` writing to `sink`.
    pub fn new(kind: impl Into<String>, sink: Arc<dyn ChannelSink>) -> (Self, ChannelPeer) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
        let (decision_tx, decision_rx) = oneshot::channel();

        let channel = Self {
            kind: kind.into(),
            sink,
            requests: request_rx,
            input: input_rx,
            decision: decision_tx,
        };
        let peer = ChannelPeer {
            requests: request_tx,
            input: input_tx,
            decision: decision_rx,
        };
        (channel, peer)
    }

    /// Returns the declared channel type.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Accepts the channel.
    pub fn accept(self) -> AcceptedChannel {
        let _ = self.decision.send(ChannelDecision::Accepted);
        AcceptedChannel {
            requests: self.requests,
            input: self.input,
            sink: self.sink,
        }
    }

    /// Rejects the channel with `reason` and a human-readable `message`.
    pub fn reject(self, reason: RejectReason, message: impl Into<String>) {
        let _ = self.decision.send(ChannelDecision::Rejected {
            reason,
            message: message.into(),
        });
    }
}

/// A channel request with its reply handle.
pub struct RawRequest {
    pub kind: String,
    pub payload: Bytes,
    reply: Option<oneshot::Sender<bool>>,
}

impl std::fmt::Debug for RawRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawRequest")
            .field("kind", &self.kind)
            .field("payload_len", &self.payload.len())
            .field("want_reply", &self.reply.is_some())
            .finish()
    }
}

impl RawRequest {
    /// Creates a request. When `want_reply` is set, the receiver yields the
    /// answer given to [`RawRequest::reply`].
    pub fn new(
        kind: impl Into<String>,
        payload: Bytes,
        want_reply: bool,
    ) -> (Self, Option<oneshot::Receiver<bool>>) {
        let (reply, rx) = if want_reply {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let request = Self {
            kind: kind.into(),
            payload,
            reply,
        };
        (request, rx)
    }

    /// Whether the peer asked for a reply.
    pub fn wants_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Answers the request. Does nothing when no reply was requested.
    pub fn reply(self, ok: bool) {
        if let Some(reply) = self.reply {
            let _ = reply.send(ok);
        }
    }
}

/// A connection-level request, such as `tcpip-forward`.
pub struct GlobalRequest {
    pub kind: String,
    reply: Option<oneshot::Sender<bool>>,
}

impl GlobalRequest {
    pub fn new(kind: impl Into<String>) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            kind: kind.into(),
            reply: Some(tx),
        };
        (request, rx)
    }

    pub fn reply(mut self, ok: bool) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(ok);
        }
    }
}

pub use connection::{discard_requests, handle_connection, serve_channels};
pub use ssh::{
    load_host_key, AuthError, CredentialCheck, HostKeyError, RusshTransport, StaticCredentials,
};
