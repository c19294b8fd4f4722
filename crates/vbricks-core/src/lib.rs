//! # vbricks-core
//!
//! Orchestration engine for virtual networks built from VDE and QEMU
//! processes.
//!
//! A topology is made of *bricks* (switches, taps, wires, tunnels, virtual
//! machines, ...) linked through *socks* and *plugs*, plus timed *events*.
//! The engine starts and stops the OS processes behind each brick, keeps the
//! link graph consistent, persists projects and executes console commands.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                       vbricks-core                         │
//! ├────────────────────────────────────────────────────────────┤
//! │                                                            │
//! │  console::parse ──┐        ┌──────────────────────────┐    │
//! │  configfile ──────┼──────▶ │  Engine                  │    │
//! │  (remote crate) ──┘        │   Arc<Mutex<Factory>>    │    │
//! │                            └────────────┬─────────────┘    │
//! │                                         │                  │
//! │        ┌────────────────┬───────────────┼──────────────┐   │
//! │        ▼                ▼               ▼              ▼   │
//! │  ┌───────────┐   ┌────────────┐  ┌────────────┐  ┌───────┐ │
//! │  │  Bricks   │   │ LinkGraph  │  │ DiskImages │  │Events │ │
//! │  │ BrickType │   │ Sock/Plug  │  │ master lock│  │timers │ │
//! │  └─────┬─────┘   └────────────┘  └────────────┘  └───────┘ │
//! │        │                                                   │
//! │        ▼                                                   │
//! │  ┌──────────────┐    ┌───────────────────────────┐         │
//! │  │ BrickProcess │    │ vde::bridge (native wire) │         │
//! │  │ sudo, console│    └───────────────────────────┘         │
//! │  └──────────────┘                                          │
//! │                                                            │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use vbricks_core::{Engine, Settings};
//!
//! # async fn example() -> vbricks_core::Result<()> {
//! let engine = Engine::new(Settings::load("settings.toml".as_ref())?);
//! engine.run(|f| {
//!     f.newbrick("switch", "sw1", None)?;
//!     f.newbrick("wire", "w1", None)?;
//!     f.connect_to("w1", "sw1_port")?;
//!     f.poweron("w1")
//! }).await??;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Typed configuration**: per-type parameter schemas with range checks
//! - **Lifecycle**: precondition checks, recursive link checks, sudo and pid files
//! - **Hot reconfiguration**: config changes reach running processes
//! - **Disk images**: copy-on-write overlays and a single-writer master lock
//! - **Persistence**: line-oriented project files with crash recovery
//! - **Remote bricks**: commands forwarded to peer engines

pub mod bricks;
pub mod config;
pub mod configfile;
pub mod console;
mod error;
mod event;
mod factory;
mod image;
mod link;
mod process;
mod remote;
mod settings;
pub mod vde;

pub use bricks::{Brick, BrickType};
pub use config::{Config, Parameter, Value};
pub use console::Outcome;
pub use error::{CoreError, Result};
pub use event::{Action, Event};
pub use factory::{Engine, Factory, FactoryEvent, ProjectParams};
pub use image::DiskImage;
pub use link::{BrickId, LinkGraph, Nic, Plug, PlugId, PlugMode, Sock, SockId};
pub use process::BrickProcess;
pub use remote::{RemoteHost, RemoteLink, REMOTE_PORT};
pub use settings::Settings;
