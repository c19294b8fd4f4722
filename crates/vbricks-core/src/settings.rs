//! Engine settings store.
//!
//! Settings are loaded from an optional TOML file layered with `VBRICKS_*`
//! environment variables, and passed explicitly to the [`Factory`].
//!
//! [`Factory`]: crate::Factory

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings shared by every brick of an engine instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Directory holding the VDE tools (`vde_switch`, `dpipe`, ...).
    pub vdepath: PathBuf,
    /// Directory holding `qemu-system-*` and `qemu-img`.
    pub qemupath: PathBuf,
    /// Privilege escalation program, split on whitespace.
    pub sudo: String,
    /// Working directory for COW overlays and pid files.
    pub workspace: PathBuf,
    /// Directory holding control and management sockets.
    pub socket_dir: PathBuf,
    /// Project file currently loaded.
    pub current_project: PathBuf,
    /// Format of copy-on-write overlays.
    pub cowfmt: String,
    /// Use the in-process wire instead of `dpipe vde_plug`.
    pub python: bool,
    /// Refuse to start looped networks.
    pub erroronloop: bool,
    /// Allow plugs to attach to VM sockets.
    pub femaleplugs: bool,
    /// Attempts to open a brick's management console after spawn.
    pub console_retries: u32,
    /// Delay before the first console retry, doubled on each attempt.
    pub console_backoff_ms: u64,
    /// Seconds to wait after SIGTERM before sending SIGKILL.
    pub stop_timeout_secs: u64,
    /// Password expected by the remote-control server.
    pub password: String,
    /// Last project id handed out.
    pub last_project_id: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let workspace = std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".virtualbricks"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/virtualbricks"));
        Self {
            vdepath: PathBuf::from("/usr/bin"),
            qemupath: PathBuf::from("/usr/bin"),
            sudo: "sudo".into(),
            current_project: workspace.join(".virtualbricks.vbl"),
            workspace,
            socket_dir: PathBuf::from("/tmp/vbricks"),
            cowfmt: "qcow2".into(),
            python: false,
            erroronloop: false,
            femaleplugs: false,
            console_retries: 10,
            console_backoff_ms: 100,
            stop_timeout_secs: 30,
            password: String::new(),
            last_project_id: 0,
        }
    }
}

impl Settings {
    /// Load settings from `path` (if present) and `VBRICKS_*` variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `VBRICKS_VDEPATH` | `vdepath` |
    /// | `VBRICKS_QEMUPATH` | `qemupath` |
    /// | `VBRICKS_SUDO` | `sudo` |
    /// | `VBRICKS_WORKSPACE` | `workspace` |
    /// | `VBRICKS_SOCKET_DIR` | `socket_dir` |
    /// | `VBRICKS_PYTHON` | `python` |
    /// | `VBRICKS_ERRORONLOOP` | `erroronloop` |
    /// | `VBRICKS_PASSWORD` | `password` |
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("VBRICKS").try_parsing(true))
            .build()?
            .try_deserialize()?;
        tracing::debug!(path = %path.display(), "Settings loaded");
        Ok(settings)
    }

    /// Write settings back as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        tracing::debug!(path = %path.display(), "Settings saved");
        Ok(())
    }

    /// Hand out the next project id.
    pub fn next_project_id(&mut self) -> u64 {
        self.last_project_id += 1;
        self.last_project_id
    }

    /// Absolute path of a VDE tool.
    pub fn vde_tool(&self, name: &str) -> PathBuf {
        self.vdepath.join(name)
    }

    /// Absolute path of a QEMU tool.
    pub fn qemu_tool(&self, name: &str) -> PathBuf {
        self.qemupath.join(name)
    }

    /// Tokens of the privilege escalation prefix.
    pub fn sudo_prefix(&self) -> Vec<String> {
        self.sudo.split_whitespace().map(str::to_string).collect()
    }

    /// Where the previous good project file is kept while saving.
    pub fn backup_path(&self) -> PathBuf {
        self.workspace.join(".project.bak")
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Initial console retry delay.
    pub fn console_backoff(&self) -> Duration {
        Duration::from_millis(self.console_backoff_ms)
    }

    /// Settings rooted in a scratch directory, used by tests and tools.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            vdepath: root.join("bin"),
            qemupath: root.join("bin"),
            workspace: root.join("workspace"),
            socket_dir: root.join("run"),
            current_project: root.join("workspace").join("project.vbl"),
            console_retries: 1,
            console_backoff_ms: 10,
            stop_timeout_secs: 5,
            ..Self::default()
        }
    }

    /// Validate that the directories the engine writes into exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.workspace, &self.socket_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                CoreError::Settings(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.vdepath, PathBuf::from("/usr/bin"));
        assert_eq!(settings.cowfmt, "qcow2");
        assert!(!settings.python);
        assert_eq!(settings.console_retries, 10);
    }

    #[test]
    fn test_next_project_id_is_monotonic() {
        let mut settings = Settings::default();
        assert_eq!(settings.next_project_id(), 1);
        assert_eq!(settings.next_project_id(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = Settings::rooted_at(dir.path());
        settings.erroronloop = true;
        settings.next_project_id();
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert!(loaded.erroronloop);
        assert_eq!(loaded.last_project_id, 1);
        assert_eq!(loaded.socket_dir, dir.path().join("run"));
    }

    #[test]
    fn test_sudo_prefix() {
        let settings = Settings {
            sudo: "sudo -n".into(),
            ..Settings::default()
        };
        assert_eq!(settings.sudo_prefix(), vec!["sudo", "-n"]);
    }
}
