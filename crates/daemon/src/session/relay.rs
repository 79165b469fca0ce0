//! Byte relays between a terminal controller and a channel.
//!
//! Terminal handles are blocking, so every read and write runs on the
//! blocking pool. Either relay finishing closes the session.

use std::io::{self, ErrorKind, Write};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::{ControllerReader, Terminal, TerminalError};
use super::teardown::{Teardown, TeardownReason};
use crate::network::ChannelSink;

/// Buffer size for reading from the terminal.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the output relay waits for the exit code after end of file.
pub const EXIT_GRACE: Duration = Duration::from_secs(1);

/// A blocking read from the terminal that stops waiting once cancelled.
pub trait TerminalRead: Send + 'static {
    /// Reads into `buf`. Returns `Ok(None)` once `cancel` fires.
    fn read_until(&mut self, buf: &mut [u8], cancel: &CancellationToken)
        -> io::Result<Option<usize>>;
}

impl TerminalRead for ControllerReader {
    fn read_until(
        &mut self,
        buf: &mut [u8],
        cancel: &CancellationToken,
    ) -> io::Result<Option<usize>> {
        ControllerReader::read_until(self, buf, cancel)
    }
}

/// Handles for the two relays of an interactive session.
pub struct Relays {
    pub output: JoinHandle<()>,
    pub input: JoinHandle<()>,
}

/// Starts both relays for `terminal`.
pub fn spawn_relays(
    terminal: &Terminal,
    input: mpsc::Receiver<Bytes>,
    sink: Arc<dyn ChannelSink>,
    teardown: Arc<Teardown>,
) -> Result<Relays, TerminalError> {
    let reader = terminal.reader()?;
    let writer = terminal.writer()?;

    Ok(Relays {
        output: tokio::spawn(relay_output(reader, sink, Arc::clone(&teardown))),
        input: tokio::spawn(relay_input(writer, input, teardown)),
    })
}

/// Copies terminal output to the channel until end of file.
///
/// After end of file the relay marks the output drained, gives the process
/// a moment to report its exit code, then closes the session. On teardown
/// the pending read gives up and drops the reader.
pub async fn relay_output<R: TerminalRead>(
    mut reader: R,
    sink: Arc<dyn ChannelSink>,
    teardown: Arc<Teardown>,
) {
    let cancel = teardown.token();
    loop {
        let token = cancel.clone();
        let read = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let result = reader.read_until(&mut buffer, &token).map(|read| {
                read.map(|n| {
                    buffer.truncate(n);
                    buffer
                })
            });
            (reader, result)
        });

        let (returned, result) = tokio::select! {
            biased;
            _ = teardown.closed() => return,
            joined = read => match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(error = %e, "Terminal read task panicked");
                    break;
                }
            },
        };
        reader = returned;

        match result {
            Ok(None) => return,
            Ok(Some(data)) if data.is_empty() => break,
            Ok(Some(data)) => {
                if sink.data(Bytes::from(data)).await.is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Linux reports EIO once every subordinate handle is closed.
            Err(e) => {
                tracing::debug!(error = %e, "Terminal output ended");
                break;
            }
        }
    }

    teardown.mark_drained();
    teardown.wait_exit(EXIT_GRACE).await;
    teardown.fire(TeardownReason::OutputClosed).await;
}

/// Copies channel input to the terminal until the client sends EOF.
pub async fn relay_input(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Bytes>,
    teardown: Arc<Teardown>,
) {
    loop {
        let data = tokio::select! {
            biased;
            _ = teardown.closed() => return,
            data = input.recv() => data,
        };
        let Some(data) = data else {
            break;
        };

        let written = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&data).and_then(|()| writer.flush());
            (writer, result)
        })
        .await;

        match written {
            Ok((returned, Ok(()))) => writer = returned,
            Ok((_, Err(e))) => {
                tracing::debug!(error = %e, "Terminal input closed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Terminal write task panicked");
                break;
            }
        }
    }

    teardown.fire(TeardownReason::InputClosed).await;
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use minisshd_protocol::WindowSize;
    use tokio::time::{timeout, Instant};

    use super::*;
    use crate::network::testing::{RecordingSink, SinkEvent};

    /// Reader over fixed bytes that never blocks.
    struct Scripted(Cursor<Vec<u8>>);

    impl TerminalRead for Scripted {
        fn read_until(
            &mut self,
            buf: &mut [u8],
            _cancel: &CancellationToken,
        ) -> io::Result<Option<usize>> {
            self.0.read(buf).map(Some)
        }
    }

    /// Reader that records when it is dropped.
    struct Tracked<R> {
        inner: R,
        dropped: Arc<AtomicBool>,
    }

    impl<R: TerminalRead> TerminalRead for Tracked<R> {
        fn read_until(
            &mut self,
            buf: &mut [u8],
            cancel: &CancellationToken,
        ) -> io::Result<Option<usize>> {
            self.inner.read_until(buf, cancel)
        }
    }

    impl<R> Drop for Tracked<R> {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    /// Writer that records into a shared buffer.
    #[derive(Clone, Default)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_output_relay_copies_then_closes() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("relay", sink.clone());
        teardown.record_exit(Some(0));

        let reader = Scripted(Cursor::new(b"hello".to_vec()));
        timeout(
            Duration::from_secs(5),
            relay_output(reader, sink.clone(), Arc::clone(&teardown)),
        )
        .await
        .unwrap();

        assert_eq!(
            sink.events(),
            vec![
                SinkEvent::Data(Bytes::from_static(b"hello")),
                SinkEvent::ExitStatus(0),
                SinkEvent::Eof,
                SinkEvent::Close,
            ]
        );
        assert!(teardown.wait_drained(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn test_input_relay_writes_until_eof() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("relay", sink.clone());
        let written = SharedWriter::default();

        let (tx, rx) = mpsc::channel(8);
        tx.send(Bytes::from_static(b"ls\n")).await.unwrap();
        tx.send(Bytes::from_static(b"exit\n")).await.unwrap();
        drop(tx);

        timeout(
            Duration::from_secs(5),
            relay_input(Box::new(written.clone()), rx, Arc::clone(&teardown)),
        )
        .await
        .unwrap();

        assert_eq!(written.0.lock().unwrap().as_slice(), b"ls\nexit\n");
        assert!(teardown.is_fired());
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }

    #[tokio::test]
    async fn test_input_relay_stops_on_teardown() {
        let sink = RecordingSink::new();
        let teardown = Teardown::new("relay", sink.clone());
        let (_tx, rx) = mpsc::channel(8);

        let relay = tokio::spawn(relay_input(
            Box::new(SharedWriter::default()),
            rx,
            Arc::clone(&teardown),
        ));
        teardown.fire(TeardownReason::ProcessExited).await;

        timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(sink.count(&SinkEvent::Close), 1);
    }

    #[tokio::test]
    async fn test_output_relay_releases_reader_on_teardown() {
        // The subordinate stays open, as it would with a background job.
        let terminal = Terminal::open(WindowSize::default()).unwrap();
        let dropped = Arc::new(AtomicBool::new(false));
        let reader = Tracked {
            inner: terminal.reader().unwrap(),
            dropped: Arc::clone(&dropped),
        };

        let sink = RecordingSink::new();
        let teardown = Teardown::new("relay", sink.clone());
        let relay = tokio::spawn(relay_output(reader, sink.clone(), Arc::clone(&teardown)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        teardown.fire(TeardownReason::ChannelClosed).await;
        timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "terminal reader still held after teardown");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(terminal.has_subordinate());
        terminal.close();
    }
}
