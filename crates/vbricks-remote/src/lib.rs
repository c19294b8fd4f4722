//! # vbricks-remote
//!
//! Remote-control protocol between vbricks engines.
//!
//! One engine (the *controller*) homes some bricks on a peer (the *server*).
//! The controller authenticates, uploads those bricks and forwards console
//! commands; the server runs them and pushes state changes back.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────┐   TCP :1050    ┌───────────────────────────┐
//! │ controller                │                │ server                    │
//! │                           │  HELO+nonce    │                           │
//! │  client::connect ─────────┼───────────────▶│  RemoteServer::serve      │
//! │   handshake::login        │◀───────────────┤   handshake::accept       │
//! │                           │  digest / OK   │                           │
//! │  Factory ──RemoteLink──▶  │                │                           │
//! │   write_loop ─────────────┼── commands ───▶│   console::parse          │
//! │                           │                │        │                  │
//! │   read_loop ◀─────────────┼── OK / FAIL ───┤        ▼                  │
//! │    remote_brick_started   │◀── push ───────┤   FactoryEvent broadcast  │
//! └───────────────────────────┘                └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use vbricks_core::{Engine, Settings, REMOTE_PORT};
//! use vbricks_remote::{client, RemoteServer};
//!
//! # async fn example(settings: Settings) -> vbricks_remote::Result<()> {
//! // Server side
//! let engine = Engine::new(settings.clone());
//! let addr = ([0, 0, 0, 0], REMOTE_PORT).into();
//! tokio::spawn(RemoteServer::new(engine, "secret").listen(addr));
//!
//! // Controller side
//! let engine = Engine::new(settings);
//! engine.run(|f| f.remote_host_entry("10.0.0.2").password = "secret".into()).await?;
//! client::connect(&engine, "10.0.0.2").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
mod error;
pub mod handshake;
pub mod protocol;
mod server;

pub use error::{RemoteError, Result};
pub use protocol::{Incoming, Push};
pub use server::RemoteServer;
