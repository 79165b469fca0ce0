//! SSH server: listener and accept loop.
//!
//! The server accepts TCP connections and runs each one in its own task.
//! [`Server::close`] stops the accept loop; connections that were already
//! accepted keep running until their peers disconnect.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::network::{handle_connection, Transport};
use crate::session::SessionSettings;

/// Errors that stop the server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listen address is empty or could not be bound.
    #[error("failed to bind {address:?}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    /// Accepting a connection failed while the server was open.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
}

#[derive(Debug, Default)]
struct ListenerState {
    closed: bool,
    shutdown: Option<CancellationToken>,
}

/// An SSH server over a [`Transport`].
pub struct Server<T: Transport> {
    transport: Arc<T>,
    settings: Arc<SessionSettings>,
    state: Mutex<ListenerState>,
}

impl<T: Transport> Server<T> {
    pub fn new(transport: T, settings: SessionSettings) -> Self {
        Self {
            transport: Arc::new(transport),
            settings: Arc::new(settings),
            state: Mutex::new(ListenerState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Binds `address` and serves until [`Server::close`] is called.
    pub async fn listen_and_serve(&self, address: &str) -> Result<(), ServerError> {
        if address.is_empty() {
            return Err(ServerError::Bind {
                address: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty address"),
            });
        }

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;

        self.serve(listener).await
    }

    /// Accepts connections from `listener` until the server is closed.
    ///
    /// Returns `Ok(())` after [`Server::close`]; an accept error while the
    /// server is still open is returned as [`ServerError::Accept`].
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let shutdown = {
            let mut state = self.state();
            if state.closed {
                return Ok(());
            }
            state
                .shutdown
                .get_or_insert_with(CancellationToken::new)
                .clone()
        };

        match listener.local_addr() {
            Ok(addr) => tracing::info!(address = %addr, "SSH server listening"),
            Err(_) => tracing::info!("SSH server listening"),
        }

        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "Accepted connection");
                    let transport = Arc::clone(&self.transport);
                    let settings = Arc::clone(&self.settings);

                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(transport.as_ref(), stream, peer, settings).await
                        {
                            tracing::warn!(peer = %peer, error = %e, "Connection failed");
                        }
                    });
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    return Err(ServerError::Accept(e));
                }
            }
        }

        tracing::info!("SSH server stopped accepting connections");
        Ok(())
    }

    /// Stops accepting connections. Safe to call more than once and while
    /// [`Server::serve`] is running.
    pub fn close(&self) {
        let mut state = self.state();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.cancel();
        }
        tracing::info!("SSH server closed");
    }

    /// Returns whether [`Server::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}
