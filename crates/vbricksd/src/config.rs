//! Daemon configuration.
//!
//! Engine settings live in their own TOML store (see
//! [`vbricks_core::Settings`]); this only covers how the daemon itself runs.
//! Loaded from environment variables with sensible defaults.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use vbricks_core::REMOTE_PORT;

/// Default interval between two automatic project saves.
const DEFAULT_AUTOSAVE_SECS: u64 = 180;

/// Configuration for the vbricks daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Settings store, written back when project ids are allocated.
    pub settings_path: PathBuf,

    /// Project to open instead of the one recorded in the settings.
    pub project: Option<PathBuf>,

    /// Accept remote-control connections (default: false).
    pub server: bool,

    /// Remote-control bind address.
    pub listen: SocketAddr,

    /// Autosave interval. Zero disables autosave.
    pub autosave: Duration,

    /// Read commands from stdin (default: true).
    pub console: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let settings_path = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".config").join("virtualbricks.toml"))
            .unwrap_or_else(|_| PathBuf::from("/etc/virtualbricks.toml"));
        Self {
            settings_path,
            project: None,
            server: false,
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), REMOTE_PORT),
            autosave: Duration::from_secs(DEFAULT_AUTOSAVE_SECS),
            console: true,
        }
    }
}

fn flag(value: &str) -> bool {
    !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

impl DaemonConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `VBRICKSD_SETTINGS` | `~/.config/virtualbricks.toml` |
    /// | `VBRICKSD_PROJECT` | project recorded in the settings |
    /// | `VBRICKSD_SERVER` | `false` |
    /// | `VBRICKSD_LISTEN` | `0.0.0.0:1050` |
    /// | `VBRICKSD_AUTOSAVE_SECS` | `180` |
    /// | `VBRICKSD_CONSOLE` | `true` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            settings_path: std::env::var("VBRICKSD_SETTINGS")
                .map(PathBuf::from)
                .unwrap_or(default.settings_path),
            project: std::env::var("VBRICKSD_PROJECT").ok().map(PathBuf::from),
            server: std::env::var("VBRICKSD_SERVER")
                .map(|v| flag(&v))
                .unwrap_or(default.server),
            listen: std::env::var("VBRICKSD_LISTEN")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.listen),
            autosave: std::env::var("VBRICKSD_AUTOSAVE_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default.autosave),
            console: std::env::var("VBRICKSD_CONSOLE")
                .map(|v| flag(&v))
                .unwrap_or(default.console),
        }
    }
}
