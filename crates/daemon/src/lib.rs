//! # minisshd Daemon Library
//!
//! This crate provides the server side of minisshd: a minimal SSH server
//! that gives authenticated clients an interactive shell or runs a single
//! command per `session` channel.
//!
//! ## Overview
//!
//! - **Server**: TCP listener and accept loop with idempotent close
//! - **Connection Handling**: handshake, channel triage, global requests
//! - **Channel Sessions**: request dispatch, terminal allocation, process
//!   launching and exactly-once teardown
//! - **Configuration**: TOML file with environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Server                              │
//! │                 (accept loop, one task per TCP)               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐      ┌────────────────────────────┐  │
//! │  │  Transport (russh) │ ───▶ │     Connection Handler      │  │
//! │  └────────────────────┘      └────────────────────────────┘  │
//! │                                            │                  │
//! │                              one task per session channel     │
//! │                                            ▼                  │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ ChannelSession: dispatch ─ terminal ─ process ─ relays  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use minisshd::network::{load_host_key, RusshTransport, StaticCredentials};
//! use minisshd::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let key = load_host_key(&config.host_key.path, None)?;
//!     let credentials = StaticCredentials::new("foo", "bar");
//!     let transport = RusshTransport::new(key, Arc::new(credentials));
//!
//!     let server = Server::new(transport, config.session_settings());
//!     server.listen_and_serve(&config.server.listen_address).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: Transport contract, russh adapter, connection handling
//! - [`server`]: Listener and accept loop
//! - [`session`]: Per-channel session state machine

pub mod config;
pub mod network;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use minisshd_protocol as protocol;

pub use config::Config;
pub use server::{Server, ServerError};
pub use session::{ChannelSession, SessionSettings};
