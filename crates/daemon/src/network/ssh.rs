//! SSH transport backed by russh.
//!
//! russh performs key exchange, host-key handling, password authentication
//! and packet framing. This module turns its per-connection callbacks back
//! into the transport contract of [`super`]: typed request callbacks are
//! re-encoded as wire payloads and queued on the channel's request stream,
//! and replies are sent in the order the requests arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use minisshd_protocol::{
    encode_exec, encode_pty_req, encode_window_change, kind, PtyRequest, WindowSize,
};
use russh::keys::PrivateKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::{
    BoxFuture, ChannelClosed, ChannelDecision, ChannelSink, ConnectionStreams, GlobalRequest,
    HandshakeError, NewChannel, RawRequest, Transport,
};

/// Capacity of the queue of channels waiting for the connection handler.
const CHANNEL_QUEUE_CAPACITY: usize = 16;

/// Capacity of the queue of connection-level requests.
const GLOBAL_REQUEST_QUEUE_CAPACITY: usize = 16;

/// Delay before answering a failed authentication attempt.
const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

/// Authentication failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credentials for user {user}")]
    InvalidCredentials { user: String },
}

/// Host key loading failures.
#[derive(Error, Debug)]
pub enum HostKeyError {
    #[error("host key not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to load host key {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Decides whether a username and password may log in.
pub trait CredentialCheck: Send + Sync + 'static {
    fn check(&self, user: &str, password: &[u8]) -> Result<(), AuthError>;
}

/// A single username and password pair, compared in constant time.
pub struct StaticCredentials {
    username: String,
    password: Vec<u8>,
}

impl StaticCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl CredentialCheck for StaticCredentials {
    fn check(&self, user: &str, password: &[u8]) -> Result<(), AuthError> {
        let user_ok = user.as_bytes().ct_eq(self.username.as_bytes());
        let password_ok = password.ct_eq(&self.password);

        if bool::from(user_ok & password_ok) {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials {
                user: user.to_string(),
            })
        }
    }
}

/// Loads the server's private host key, decrypting it with `passphrase`
/// when given.
pub fn load_host_key(path: &Path, passphrase: Option<&str>) -> Result<PrivateKey, HostKeyError> {
    if !path.exists() {
        return Err(HostKeyError::NotFound(path.to_path_buf()));
    }

    russh::keys::load_secret_key(path, passphrase).map_err(|e| HostKeyError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// [`Transport`] implementation on top of russh.
pub struct RusshTransport {
    config: Arc<server::Config>,
    credentials: Arc<dyn CredentialCheck>,
}

impl RusshTransport {
    pub fn new(host_key: PrivateKey, credentials: Arc<dyn CredentialCheck>) -> Self {
        let mut config = server::Config::default();
        config.keys.push(host_key);
        config.methods = (&[MethodKind::Password][..]).into();
        config.auth_rejection_time = AUTH_REJECTION_TIME;
        config.auth_rejection_time_initial = Some(Duration::ZERO);

        Self {
            config: Arc::new(config),
            credentials,
        }
    }
}

impl Transport for RusshTransport {
    fn handshake(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> BoxFuture<'_, Result<ConnectionStreams, HandshakeError>> {
        Box::pin(async move {
            let (channel_tx, channel_rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
            let (request_tx, request_rx) = mpsc::channel(GLOBAL_REQUEST_QUEUE_CAPACITY);

            let handler = SshHandler {
                peer,
                credentials: Arc::clone(&self.credentials),
                channels: channel_tx,
                global_requests: request_tx,
                open: HashMap::new(),
            };

            let running = server::run_stream(Arc::clone(&self.config), stream, handler)
                .await
                .map_err(|e| HandshakeError::Failed {
                    peer,
                    reason: e.to_string(),
                })?;

            tokio::spawn(async move {
                match running.await {
                    Ok(()) => tracing::debug!(peer = %peer, "SSH connection closed"),
                    // Key exchange and authentication failures end up here.
                    Err(e) => tracing::info!(peer = %peer, error = %e, "SSH connection failed"),
                }
            });

            Ok(ConnectionStreams {
                channels: channel_rx,
                requests: request_rx,
            })
        })
    }
}

/// Outbound half of a russh channel.
struct RusshSink {
    handle: server::Handle,
    id: ChannelId,
}

impl ChannelSink for RusshSink {
    fn data(&self, data: Bytes) -> BoxFuture<'_, Result<(), ChannelClosed>> {
        Box::pin(async move {
            self.handle
                .data(self.id, CryptoVec::from_slice(&data))
                .await
                .map_err(|_| ChannelClosed)
        })
    }

    fn extended_data(&self, code: u32, data: Bytes) -> BoxFuture<'_, Result<(), ChannelClosed>> {
        Box::pin(async move {
            self.handle
                .extended_data(self.id, code, CryptoVec::from_slice(&data))
                .await
                .map_err(|_| ChannelClosed)
        })
    }

    fn exit_status(&self, code: u32) -> BoxFuture<'_, Result<(), ChannelClosed>> {
        Box::pin(async move {
            self.handle
                .exit_status_request(self.id, code)
                .await
                .map_err(|_| ChannelClosed)
        })
    }

    fn eof(&self) -> BoxFuture<'_, Result<(), ChannelClosed>> {
        Box::pin(async move { self.handle.eof(self.id).await.map_err(|_| ChannelClosed) })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ChannelClosed>> {
        Box::pin(async move { self.handle.close(self.id).await.map_err(|_| ChannelClosed) })
    }
}

/// Transport-side state of an accepted channel.
struct OpenChannel {
    requests: mpsc::Sender<RawRequest>,
    input: Option<mpsc::Sender<Bytes>>,
    replies: mpsc::UnboundedSender<oneshot::Receiver<bool>>,
}

/// Per-connection russh handler.
struct SshHandler {
    peer: SocketAddr,
    credentials: Arc<dyn CredentialCheck>,
    channels: mpsc::Sender<NewChannel>,
    global_requests: mpsc::Sender<GlobalRequest>,
    open: HashMap<ChannelId, OpenChannel>,
}

impl SshHandler {
    /// Hands a newly opened channel to the connection handler and waits for
    /// its decision.
    async fn offer_channel(
        &mut self,
        channel_kind: &str,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> bool {
        let id = channel.id();
        let handle = session.handle();
        let sink = Arc::new(RusshSink {
            handle: handle.clone(),
            id,
        });

        let (new_channel, peer) = NewChannel::new(channel_kind, sink);
        if self.channels.send(new_channel).await.is_err() {
            return false;
        }

        match peer.decision.await {
            Ok(ChannelDecision::Accepted) => {
                let (reply_tx, reply_rx) = mpsc::unbounded_channel();
                tokio::spawn(forward_replies(handle, id, reply_rx));

                self.open.insert(
                    id,
                    OpenChannel {
                        requests: peer.requests,
                        input: Some(peer.input),
                        replies: reply_tx,
                    },
                );
                true
            }
            Ok(ChannelDecision::Rejected { reason, message }) => {
                tracing::debug!(
                    peer = %self.peer,
                    channel_type = %channel_kind,
                    reason = ?reason,
                    message = %message,
                    "Channel rejected"
                );
                false
            }
            Err(_) => false,
        }
    }

    /// Queues a request on the channel. The reply, if any, is sent once the
    /// session answers, after the replies of all earlier requests.
    async fn forward_request(
        &mut self,
        id: ChannelId,
        request_kind: &str,
        payload: Bytes,
        want_reply: bool,
        session: &mut Session,
    ) {
        let Some(open) = self.open.get(&id) else {
            if want_reply {
                let _ = session.channel_failure(id);
            }
            return;
        };

        let (request, reply) = RawRequest::new(request_kind, payload, want_reply);
        if let Some(reply) = reply {
            let _ = open.replies.send(reply);
        }

        // A dropped request resolves its reply as failure.
        let _ = open.requests.send(request).await;
    }
}

async fn forward_replies(
    handle: server::Handle,
    id: ChannelId,
    mut pending: mpsc::UnboundedReceiver<oneshot::Receiver<bool>>,
) {
    while let Some(reply) = pending.recv().await {
        let ok = reply.await.unwrap_or(false);
        let sent = if ok {
            handle.channel_success(id).await
        } else {
            handle.channel_failure(id).await
        };
        if sent.is_err() {
            break;
        }
    }
}

impl server::Handler for SshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        match self.credentials.check(user, password.as_bytes()) {
            Ok(()) => {
                tracing::info!(peer = %self.peer, user = %user, "Password accepted");
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "Password rejected");
                Ok(Auth::Reject {
                    proceed_with_methods: Some((&[MethodKind::Password][..]).into()),
                    partial_success: false,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self
            .offer_channel(minisshd_protocol::SESSION_CHANNEL, channel, session)
            .await)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.offer_channel("direct-tcpip", channel, session).await)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_pty_req(&PtyRequest {
            term: term.to_string(),
            size: WindowSize::new(col_width, row_height),
            pixel_width: pix_width,
            pixel_height: pix_height,
        });
        self.forward_request(channel, kind::PTY_REQ, payload, true, session)
            .await;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_window_change(
            WindowSize::new(col_width, row_height),
            pix_width,
            pix_height,
        );
        self.forward_request(channel, kind::WINDOW_CHANGE, payload, false, session)
            .await;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, kind::SHELL, Bytes::new(), true, session)
            .await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.forward_request(channel, kind::EXEC, encode_exec(data), true, session)
            .await;
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, name = %variable_name, "Environment request");
        self.forward_request(channel, "env", Bytes::new(), false, session)
            .await;
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(peer = %self.peer, subsystem = %name, "Subsystem request");
        self.forward_request(channel, "subsystem", Bytes::new(), true, session)
            .await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(input) = self.open.get(&channel).and_then(|open| open.input.clone()) else {
            return Ok(());
        };

        // Waiting here holds back the client's window until the session
        // catches up.
        if input.send(Bytes::copy_from_slice(data)).await.is_err() {
            if let Some(open) = self.open.get_mut(&channel) {
                open.input = None;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(open) = self.open.get_mut(&channel) {
            open.input = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.open.remove(&channel).is_some() {
            tracing::debug!(peer = %self.peer, channel = ?channel, "Channel closed by peer");
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(peer = %self.peer, address = %address, port = %port, "tcpip-forward request");
        Ok(self.global_request("tcpip-forward").await)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.global_request("cancel-tcpip-forward").await)
    }
}

impl SshHandler {
    async fn global_request(&self, request_kind: &str) -> bool {
        let (request, reply) = GlobalRequest::new(request_kind);
        if self.global_requests.send(request).await.is_err() {
            return false;
        }
        reply.await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_credentials_accept() {
        let credentials = StaticCredentials::new("foo", "bar");
        assert!(credentials.check("foo", b"bar").is_ok());
    }

    #[test]
    fn test_static_credentials_reject() {
        let credentials = StaticCredentials::new("foo", "bar");
        assert_eq!(
            credentials.check("foo", b"baz"),
            Err(AuthError::InvalidCredentials {
                user: "foo".to_string()
            })
        );
        assert!(credentials.check("root", b"bar").is_err());
        assert!(credentials.check("foo", b"").is_err());
        assert!(credentials.check("fo", b"bar").is_err());
    }

    #[test]
    fn test_static_credentials_debug_hides_password() {
        let credentials = StaticCredentials::new("foo", "hunter2");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("foo"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_load_host_key_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_missing");
        assert!(matches!(
            load_host_key(&path, None),
            Err(HostKeyError::NotFound(_))
        ));
    }

    #[test]
    fn test_load_host_key_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_garbage");
        std::fs::write(&path, "not a key").unwrap();
        assert!(matches!(
            load_host_key(&path, None),
            Err(HostKeyError::Invalid { .. })
        ));
    }
}
