//! VDE switches.

use super::{writable_parent, ArgSource, BrickType, BuildContext};
use crate::config::{Config, Parameter, Value};
use crate::settings::Settings;
use std::path::PathBuf;

/// `vde_switch` with one auto-created sock named `<name>_port`.
#[derive(Debug, Clone, Copy)]
pub struct Switch;

impl BrickType for Switch {
    fn type_name(&self) -> &'static str {
        "Switch"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![
            (
                "numports",
                Parameter::SpinInt {
                    default: 32,
                    min: 1,
                    max: 128,
                },
            ),
            ("hub", Parameter::Boolean(false)),
            ("fstp", Parameter::Boolean(false)),
            ("macaddr", Parameter::Str("")),
            ("mode", Parameter::Str("")),
            ("group", Parameter::Str("")),
        ]
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_switch"))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            (
                "-s",
                ArgSource::Call(|ctx| ctx.socks.first().map(|s| s.path.display().to_string())),
            ),
            (
                "-M",
                ArgSource::Call(|ctx| Some(ctx.run_file(".mgmt").display().to_string())),
            ),
            ("-x", ArgSource::Key("hub")),
            ("-n", ArgSource::Key("numports")),
            ("-F", ArgSource::Key("fstp")),
            ("--macaddr", ArgSource::Key("macaddr")),
            ("-m", ArgSource::Key("mode")),
            ("-g", ArgSource::Key("group")),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.socks
            .first()
            .map(|s| writable_parent(&s.path))
            .unwrap_or(false)
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        let mut text = format!("Ports: {}", ctx.config.int("numports"));
        if ctx.config.bool("fstp") {
            text.push_str(", FSTP");
        }
        if ctx.config.bool("hub") {
            text.push_str(", HUB");
        }
        text
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn own_sock_path(&self, name: &str, _config: &Config, settings: &Settings) -> Option<PathBuf> {
        Some(settings.socket_dir.join(format!("{name}.ctl")))
    }

    fn console_path(&self, ctx: &BuildContext<'_>) -> Option<PathBuf> {
        Some(ctx.run_file(".mgmt"))
    }

    fn live_reconfigure(&self, key: &str, value: &Value, _config: &Config) -> Option<String> {
        let flag = |v: &Value| if v.as_bool() { 1 } else { 0 };
        match key {
            "numports" => Some(format!("port/setnumports {}", value.as_int())),
            "hub" => Some(format!("port/sethub {}", flag(value))),
            "fstp" => Some(format!("fstp/setfstp {}", flag(value))),
            _ => None,
        }
    }
}

/// Adopts a switch started outside the engine. Runs no process.
#[derive(Debug, Clone, Copy)]
pub struct SwitchWrapper;

impl BrickType for SwitchWrapper {
    fn type_name(&self) -> &'static str {
        "SwitchWrapper"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![("path", Parameter::Str(""))]
    }

    fn prog(&self, _settings: &Settings, _config: &Config) -> Option<PathBuf> {
        None
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        let path = ctx.config.str("path");
        !path.is_empty() && std::path::Path::new(path).exists()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        format!("Path: {}", ctx.config.str("path"))
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn own_sock_path(&self, _name: &str, config: &Config, _settings: &Settings) -> Option<PathBuf> {
        Some(PathBuf::from(config.str("path")))
    }
}
