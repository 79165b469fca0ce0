//! Connection handling.
//!
//! One task per accepted TCP connection: run the transport handshake, answer
//! connection-level requests with failure, and hand every `session` channel
//! to its own [`ChannelSession`] task.

use std::net::SocketAddr;
use std::sync::Arc;

use minisshd_protocol::SESSION_CHANNEL;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{GlobalRequest, HandshakeError, NewChannel, RejectReason, Transport};
use crate::session::{ChannelSession, SessionSettings};

/// Runs one connection until its channel stream ends.
pub async fn handle_connection<T: Transport + ?Sized>(
    transport: &T,
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<SessionSettings>,
) -> Result<(), HandshakeError> {
    let streams = transport.handshake(stream, peer).await?;
    tracing::debug!(peer = %peer, "Handshake complete");

    tokio::spawn(discard_requests(streams.requests));
    serve_channels(streams.channels, settings).await;

    tracing::debug!(peer = %peer, "Connection finished");
    Ok(())
}

/// Accepts `session` channels and rejects everything else.
///
/// Each accepted channel runs in its own task; this loop never waits on a
/// session.
pub async fn serve_channels(
    mut channels: mpsc::Receiver<NewChannel>,
    settings: Arc<SessionSettings>,
) {
    while let Some(channel) = channels.recv().await {
        if channel.kind() != SESSION_CHANNEL {
            let message = format!("unknown channel type: {}", channel.kind());
            tracing::info!(channel_type = %channel.kind(), "Rejecting channel");
            channel.reject(RejectReason::UnknownChannelType, message);
            continue;
        }

        let session = ChannelSession::new(channel.accept(), Arc::clone(&settings));
        tracing::debug!(session_id = %session.id(), "Accepted session channel");
        tokio::spawn(session.run());
    }
}

/// Answers every connection-level request with failure.
pub async fn discard_requests(mut requests: mpsc::Receiver<GlobalRequest>) {
    while let Some(request) = requests.recv().await {
        tracing::debug!(request = %request.kind, "Discarding global request");
        request.reply(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::testing::RecordingSink;
    use crate::network::ChannelDecision;

    #[tokio::test]
    async fn test_discard_requests_replies_false() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(discard_requests(rx));

        let (request, reply) = GlobalRequest::new("tcpip-forward");
        tx.send(request).await.unwrap();
        assert!(!reply.await.unwrap());

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_non_session_channels_rejected() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(serve_channels(rx, Arc::new(SessionSettings::default())));

        for kind in ["direct-tcpip", "x11", "forwarded-tcpip"] {
            let sink = RecordingSink::new();
            let (channel, peer) = NewChannel::new(kind, sink.clone());
            tx.send(channel).await.unwrap();

            assert_eq!(
                peer.decision.await.unwrap(),
                ChannelDecision::Rejected {
                    reason: RejectReason::UnknownChannelType,
                    message: format!("unknown channel type: {kind}"),
                }
            );
            assert!(sink.events().is_empty());
        }

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_channel_accepted() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(serve_channels(rx, Arc::new(SessionSettings::default())));

        let (channel, peer) = NewChannel::new("session", RecordingSink::new());
        tx.send(channel).await.unwrap();
        assert_eq!(peer.decision.await.unwrap(), ChannelDecision::Accepted);

        drop(tx);
        task.await.unwrap();
    }
}
