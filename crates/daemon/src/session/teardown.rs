//! Close-once channel teardown.
//!
//! Every task attached to a session (both relays, the process wait task and
//! the request loop) holds the same [`Teardown`]. Whichever calls
//! [`Teardown::fire`] first closes the channel; later calls do nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::network::ChannelSink;

/// What caused a session to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownReason {
    /// The process exited.
    ProcessExited,
    /// The terminal controller reached end of file.
    OutputClosed,
    /// The client sent EOF on an interactive session.
    InputClosed,
    /// The client closed the channel or the connection went away.
    ChannelClosed,
    /// The process could not be started.
    SpawnFailed,
}

impl std::fmt::Display for TeardownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            Self::ProcessExited => "process exited",
            Self::OutputClosed => "output closed",
            Self::InputClosed => "input closed",
            Self::ChannelClosed => "channel closed",
            Self::SpawnFailed => "spawn failed",
        };
        f.write_str(reason)
    }
}

/// Shared close-once guard for one channel session.
pub struct Teardown {
    session_id: String,
    sink: Arc<dyn ChannelSink>,
    fired: AtomicBool,
    closed: CancellationToken,
    drained: CancellationToken,
    exited: CancellationToken,
    exit_code: Mutex<Option<u32>>,
}

impl Teardown {
    pub fn new(session_id: impl Into<String>, sink: Arc<dyn ChannelSink>) -> Arc<Self> {
        Arc::new(Self {
            session_id: session_id.into(),
            sink,
            fired: AtomicBool::new(false),
            closed: CancellationToken::new(),
            drained: CancellationToken::new(),
            exited: CancellationToken::new(),
            exit_code: Mutex::new(None),
        })
    }

    /// Closes the channel if no one has yet.
    ///
    /// The first caller cancels [`Teardown::token`], then sends `exit-status`
    /// (when the exit code is known), EOF and close. Returns `true` only for
    /// that caller.
    pub async fn fire(&self, reason: TeardownReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        self.closed.cancel();

        let exit_code = *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(code) = exit_code {
            if self.sink.exit_status(code).await.is_err() {
                tracing::debug!(session_id = %self.session_id, "Channel gone before exit-status");
            }
        }

        // The peer may already have closed its side.
        let _ = self.sink.eof().await;
        let _ = self.sink.close().await;

        tracing::info!(
            session_id = %self.session_id,
            reason = %reason,
            exit_code = ?exit_code,
            "Session closed"
        );
        true
    }

    /// Returns whether the channel has been closed.
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Token cancelled when the channel is closed.
    pub fn token(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Records how the process ended. `None` means no exit code is available.
    pub fn record_exit(&self, code: Option<u32>) {
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner) = code;
        self.exited.cancel();
    }

    /// Waits up to `grace` for the process exit and returns its code.
    pub async fn wait_exit(&self, grace: Duration) -> Option<u32> {
        let _ = tokio::time::timeout(grace, self.exited.cancelled()).await;
        *self.exit_code.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks the process output as fully relayed.
    pub fn mark_drained(&self) {
        self.drained.cancel();
    }

    /// Waits up to `grace` for the output relay to finish.
    /// Returns whether it did.
    pub async fn wait_drained(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.drained.cancelled())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Barrier;

    use super::*;
    use crate::network::testing::{RecordingSink, SinkEvent};

    #[tokio::test]
    async fn test_fire_sends_exit_eof_close() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("s1", sink.clone());

        teardown.record_exit(Some(7));
        assert!(teardown.fire(TeardownReason::ProcessExited).await);

        assert_eq!(
            sink.events(),
            vec![SinkEvent::ExitStatus(7), SinkEvent::Eof, SinkEvent::Close]
        );
        assert!(teardown.is_fired());
    }

    #[tokio::test]
    async fn test_fire_without_exit_code() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("s1", sink.clone());

        assert!(teardown.fire(TeardownReason::ChannelClosed).await);
        assert_eq!(sink.events(), vec![SinkEvent::Eof, SinkEvent::Close]);
    }

    #[tokio::test]
    async fn test_second_fire_is_noop() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("s1", sink.clone());

        assert!(teardown.fire(TeardownReason::OutputClosed).await);
        assert!(!teardown.fire(TeardownReason::ProcessExited).await);
        assert!(!teardown.fire(TeardownReason::ChannelClosed).await);
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fire_closes_once() {
        const TRIGGERS: usize = 16;

        let sink = RecordingSink::new();
        let teardown = Teardown::new("race", sink.clone());
        let barrier = Arc::new(Barrier::new(TRIGGERS));

        let reasons = [
            TeardownReason::ProcessExited,
            TeardownReason::OutputClosed,
            TeardownReason::InputClosed,
            TeardownReason::ChannelClosed,
        ];

        let mut handles = Vec::new();
        for i in 0..TRIGGERS {
            let teardown = Arc::clone(&teardown);
            let barrier = Arc::clone(&barrier);
            let reason = reasons[i % reasons.len()];
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                teardown.fire(reason).await
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(sink.count(&SinkEvent::Eof), 1);
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }

    #[tokio::test]
    async fn test_fire_cancels_token() {
        let teardown = Teardown::new("s1", RecordingSink::new());
        let token = teardown.token();
        assert!(!token.is_cancelled());

        teardown.fire(TeardownReason::InputClosed).await;
        assert!(token.is_cancelled());
        teardown.closed().await;
    }

    #[tokio::test]
    async fn test_wait_exit_times_out() {
        let teardown = Teardown::new("s1", RecordingSink::new());
        let code = teardown.wait_exit(Duration::from_millis(20)).await;
        assert_eq!(code, None);
    }

    #[tokio::test]
    async fn test_wait_exit_returns_recorded_code() {
        let teardown = Teardown::new("s1", RecordingSink::new());

        let waiter = {
            let teardown = Arc::clone(&teardown);
            tokio::spawn(async move { teardown.wait_exit(Duration::from_secs(5)).await })
        };
        teardown.record_exit(Some(42));

        assert_eq!(waiter.await.unwrap(), Some(42));
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let teardown = Teardown::new("s1", RecordingSink::new());
        assert!(!teardown.wait_drained(Duration::from_millis(10)).await);

        teardown.mark_drained();
        assert!(teardown.wait_drained(Duration::from_millis(10)).await);
    }
}
