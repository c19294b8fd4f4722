//! Brick types.
//!
//! A [`Brick`] is a node of the topology. What it runs, which parameters it
//! accepts and how it reacts to live reconfiguration is delegated to a
//! [`BrickType`] implementation chosen at creation time by
//! [`brick_type`].

mod qemu;
mod router;
mod switch;
mod tap;
mod tunnel;
mod wire;

pub use qemu::{
    base_key, cow_path, is_private, random_mac, slot_for_base_key, Qemu, DEFAULT_NIC_MODEL,
    DISK_SLOTS,
};
pub use router::Router;
pub use switch::{Switch, SwitchWrapper};
pub use tap::{Capture, Tap};
pub use tunnel::{TunnelConnect, TunnelListen};
pub use wire::{gui_to_wf_value, NativeWire, Wire, Wirefilter};

use crate::config::{Config, Parameter, Value};
use crate::error::Result;
use crate::image::DiskImage;
use crate::link::{BrickId, Nic, PlugId, PlugMode, SockId};
use crate::process::BrickProcess;
use crate::settings::Settings;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;

// ============================================================================
// Command line building
// ============================================================================

/// Where the value of a command line switch comes from.
#[derive(Clone, Copy)]
pub enum ArgSource {
    /// Value of a config key. `True` booleans emit the bare switch.
    Key(&'static str),
    /// Computed from the build context.
    Call(fn(&BuildContext<'_>) -> Option<String>),
}

impl fmt::Debug for ArgSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSource::Key(k) => write!(f, "Key({k})"),
            ArgSource::Call(_) => write!(f, "Call(..)"),
        }
    }
}

/// A plug as seen by the argument builder.
#[derive(Debug, Clone)]
pub struct PlugView {
    pub mode: PlugMode,
    pub nic: Option<Nic>,
    /// Control socket path of the sock this plug is attached to.
    pub sock_path: Option<PathBuf>,
    pub sock_name: Option<String>,
}

/// A sock as seen by the argument builder.
#[derive(Debug, Clone)]
pub struct SockView {
    pub nickname: String,
    pub path: PathBuf,
    pub nic: Option<Nic>,
}

/// Everything a brick type may read while building its command line.
#[derive(Debug)]
pub struct BuildContext<'a> {
    pub name: &'a str,
    pub config: &'a Config,
    pub settings: &'a Settings,
    pub plugs: Vec<PlugView>,
    pub socks: Vec<SockView>,
    pub images: &'a BTreeMap<String, DiskImage>,
}

impl BuildContext<'_> {
    /// Sock path of the `n`th plug, as a string.
    pub fn plug_path(&self, n: usize) -> Option<String> {
        self.plugs
            .get(n)
            .and_then(|p| p.sock_path.as_ref())
            .map(|p| p.display().to_string())
    }

    /// Path of a per-brick file in the socket directory.
    pub fn run_file(&self, suffix: &str) -> PathBuf {
        self.settings
            .socket_dir
            .join(format!("{}{suffix}", self.name))
    }

    /// Whether every plug has a sock.
    pub fn plugs_attached(&self) -> bool {
        self.plugs.iter().all(|p| p.sock_path.is_some())
    }
}

/// Run the generic command builder of `kind`.
///
/// Switches starting with `#` are skipped, switches starting with `*` emit
/// the bare value. Empty values are omitted; `True` booleans emit the
/// switch alone and `False` ones nothing.
pub fn build_args<T: BrickType + ?Sized>(kind: &T, ctx: &BuildContext<'_>) -> Vec<String> {
    let mut args = Vec::new();
    for (switch, source) in kind.command_builder() {
        if switch.starts_with('#') {
            continue;
        }
        let value = match source {
            ArgSource::Key(key) => match ctx.config.get(key) {
                Some(Value::Bool(true)) => {
                    args.push(switch.to_string());
                    continue;
                }
                Some(Value::Bool(false)) | Some(Value::Object(_)) | None => continue,
                Some(_) => ctx.config.to_string(key),
            },
            ArgSource::Call(f) => f(ctx),
        };
        let Some(value) = value.filter(|v| !v.is_empty()) else {
            continue;
        };
        if switch.starts_with('*') {
            args.push(value);
        } else {
            args.push(switch.to_string());
            args.push(value);
        }
    }
    args
}

// ============================================================================
// BrickType
// ============================================================================

/// Behaviour of one kind of brick.
pub trait BrickType: fmt::Debug + Send {
    /// Type tag used in the console grammar and project file.
    fn type_name(&self) -> &'static str;

    /// Parameter schema.
    fn schema(&self) -> Vec<(&'static str, Parameter)>;

    /// Program to run, `None` for bricks without a process.
    fn prog(&self, settings: &Settings, config: &Config) -> Option<PathBuf>;

    /// Switch table consumed by [`build_args`].
    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        Vec::new()
    }

    /// Full argument list (without the program).
    fn args(&self, ctx: &BuildContext<'_>) -> Vec<String> {
        build_args(self, ctx)
    }

    /// Whether the brick has everything it needs to start.
    fn configured(&self, ctx: &BuildContext<'_>) -> bool;

    /// One-line human summary of the interesting parameters.
    fn summary(&self, ctx: &BuildContext<'_>) -> String;

    /// Fresh instance of the same type, for duplication.
    fn clone_box(&self) -> Box<dyn BrickType>;

    /// Fill per-instance values (identifiers) in a fresh or copied config.
    fn init_config(&self, _config: &mut Config) {}

    /// Plugs created with the brick.
    fn initial_plugs(&self) -> usize {
        0
    }

    /// Whether plugs are created on demand by `connect`.
    fn dynamic_plugs(&self) -> bool {
        false
    }

    /// Control socket of the sock created with the brick, if any.
    fn own_sock_path(&self, _name: &str, _config: &Config, _settings: &Settings) -> Option<PathBuf> {
        None
    }

    fn needs_sudo(&self) -> bool {
        false
    }

    /// Switch used to ask the program for a pid file under sudo.
    fn pidfile_flag(&self) -> &'static str {
        "-P"
    }

    /// Management socket accepting text commands while running.
    fn console_path(&self, _ctx: &BuildContext<'_>) -> Option<PathBuf> {
        None
    }

    /// Management command applying `key` to the running process.
    fn live_reconfigure(&self, _key: &str, _value: &Value, _config: &Config) -> Option<String> {
        None
    }

    /// Disk slots bound to disk images.
    fn disk_slots(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether the brick is bridged in-process instead of spawned.
    fn native_bridge(&self) -> bool {
        false
    }

    /// Work to do before spawning (key files, disk overlays).
    fn prepare(&self, _ctx: &BuildContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Host commands to run once the process is up.
    fn post_poweron(&self, _ctx: &BuildContext<'_>) -> Vec<Vec<String>> {
        Vec::new()
    }

    /// Cleanup once the process is gone.
    fn post_poweroff(&self, _ctx: &BuildContext<'_>) {}

    /// Help text for the `help` console verb.
    fn help(&self) -> String {
        let mut text = format!("{} parameters:\n", self.type_name());
        for (key, param) in self.schema() {
            if param == Parameter::Object {
                continue;
            }
            text.push_str(&format!("  {key}\n"));
        }
        text
    }
}

/// Instantiate a brick type by (case-insensitive) type name.
///
/// `Wire` resolves to the in-process bridge when `settings.python` is set.
pub fn brick_type(type_name: &str, settings: &Settings) -> Option<Box<dyn BrickType>> {
    let kind: Box<dyn BrickType> = match type_name.to_ascii_lowercase().as_str() {
        "switch" => Box::new(Switch),
        "switchwrapper" => Box::new(SwitchWrapper),
        "tap" => Box::new(Tap),
        "capture" => Box::new(Capture),
        "wire" if settings.python => Box::new(NativeWire),
        "wire" => Box::new(Wire),
        "wirefilter" => Box::new(Wirefilter),
        "tunnellisten" | "tunnell" => Box::new(TunnelListen),
        "tunnelconnect" | "tunnelc" => Box::new(TunnelConnect),
        "qemu" | "vm" => Box::new(Qemu),
        "router" => Box::new(Router),
        _ => return None,
    };
    Some(kind)
}

// ============================================================================
// Brick
// ============================================================================

/// A node of the topology.
#[derive(Debug)]
pub struct Brick {
    pub id: BrickId,
    pub name: String,
    pub kind: Box<dyn BrickType>,
    pub config: Config,
    pub plugs: Vec<PlugId>,
    pub socks: Vec<SockId>,
    /// Local subprocess while running.
    pub proc: Option<BrickProcess>,
    /// In-process bridge task while running.
    pub bridge: Option<JoinHandle<()>>,
    /// Address of the remote host running this brick.
    pub homehost: Option<String>,
    /// Run state reported by the remote host.
    pub remote_running: bool,
    /// Started locally. Set for bricks without a process as well.
    pub active: bool,
}

impl Brick {
    pub(crate) fn new(id: BrickId, name: String, kind: Box<dyn BrickType>) -> Self {
        let config = Config::new(&kind.schema());
        Self {
            id,
            name,
            kind,
            config,
            plugs: Vec::new(),
            socks: Vec::new(),
            proc: None,
            bridge: None,
            homehost: None,
            remote_running: false,
            active: false,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn is_running(&self) -> bool {
        self.active || self.remote_running
    }

    pub fn is_remote(&self) -> bool {
        self.homehost.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.proc.as_ref().map(BrickProcess::pid)
    }
}

/// Check that the directory holding `path` exists and is writable.
pub fn writable_parent(path: &Path) -> bool {
    let Some(dir) = path.parent() else {
        return false;
    };
    nix::unistd::access(dir, nix::unistd::AccessFlags::W_OK).is_ok()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::link::PlugMode;

    /// Build context over a bare config, with plugs attached to `paths`.
    pub fn context<'a>(
        name: &'a str,
        config: &'a Config,
        settings: &'a Settings,
        images: &'a BTreeMap<String, DiskImage>,
        paths: &[&str],
    ) -> BuildContext<'a> {
        BuildContext {
            name,
            config,
            settings,
            plugs: paths
                .iter()
                .map(|p| PlugView {
                    mode: PlugMode::Vde,
                    nic: None,
                    sock_path: (!p.is_empty()).then(|| PathBuf::from(p)),
                    sock_name: None,
                })
                .collect(),
            socks: Vec::new(),
            images,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_lookup() {
        let settings = Settings::default();
        assert_eq!(brick_type("switch", &settings).unwrap().type_name(), "Switch");
        assert_eq!(brick_type("VM", &settings).unwrap().type_name(), "Qemu");
        assert_eq!(brick_type("Wire", &settings).unwrap().type_name(), "Wire");
        assert!(brick_type("Toaster", &settings).is_none());
    }

    #[test]
    fn test_native_wire_selection() {
        let settings = Settings {
            python: true,
            ..Settings::default()
        };
        let kind = brick_type("wire", &settings).unwrap();
        assert_eq!(kind.type_name(), "Wire");
        assert!(kind.native_bridge());
    }

    #[test]
    fn test_build_args_rules() {
        #[derive(Debug)]
        struct FakeKind;
        impl BrickType for FakeKind {
            fn type_name(&self) -> &'static str {
                "FakeKind"
            }
            fn schema(&self) -> Vec<(&'static str, Parameter)> {
                vec![
                    ("flag", Parameter::Boolean(true)),
                    ("off", Parameter::Boolean(false)),
                    ("port", Parameter::Integer(7)),
                    ("secret", Parameter::Str("pw")),
                    ("iface", Parameter::Str("eth0")),
                    ("empty", Parameter::Str("")),
                ]
            }
            fn prog(&self, _: &Settings, _: &Config) -> Option<PathBuf> {
                None
            }
            fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
                vec![
                    ("-f", ArgSource::Key("flag")),
                    ("-o", ArgSource::Key("off")),
                    ("-p", ArgSource::Key("port")),
                    ("#secret", ArgSource::Key("secret")),
                    ("*", ArgSource::Key("iface")),
                    ("*-P", ArgSource::Key("port")),
                    ("-e", ArgSource::Key("empty")),
                    ("-s", ArgSource::Call(|ctx| ctx.plug_path(0))),
                ]
            }
            fn configured(&self, _: &BuildContext<'_>) -> bool {
                true
            }
            fn summary(&self, _: &BuildContext<'_>) -> String {
                String::new()
            }
            fn clone_box(&self) -> Box<dyn BrickType> {
                Box::new(FakeKind)
            }
        }

        let settings = Settings::default();
        let config = Config::new(&FakeKind.schema());
        let images = BTreeMap::new();
        let ctx = test_support::context("p", &config, &settings, &images, &["/tmp/a.ctl"]);
        assert_eq!(
            FakeKind.args(&ctx),
            vec!["-f", "-p", "7", "eth0", "7", "-s", "/tmp/a.ctl"]
        );
    }
}
