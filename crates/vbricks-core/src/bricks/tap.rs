//! Bricks bound to host network interfaces. Both need root.

use super::{ArgSource, BrickType, BuildContext};
use crate::config::{Config, Parameter};
use crate::settings::Settings;
use std::path::PathBuf;

/// `vde_plug2tap` creating a host tap interface named after the brick.
#[derive(Debug, Clone, Copy)]
pub struct Tap;

impl BrickType for Tap {
    fn type_name(&self) -> &'static str {
        "Tap"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![
            ("ip", Parameter::Str("10.0.0.1")),
            ("nm", Parameter::Str("255.255.255.0")),
            ("gw", Parameter::Str("")),
            ("mode", Parameter::Str("off")),
        ]
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_plug2tap"))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            ("-s", ArgSource::Call(|ctx| ctx.plug_path(0))),
            ("*", ArgSource::Call(|ctx| Some(ctx.name.to_string()))),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 1 && ctx.plugs_attached()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        match ctx.config.str("mode") {
            "dhcp" => "Address: DHCP".into(),
            "manual" => format!(
                "Address: {}/{}",
                ctx.config.str("ip"),
                ctx.config.str("nm")
            ),
            _ => "Address: unconfigured".into(),
        }
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        1
    }

    fn needs_sudo(&self) -> bool {
        true
    }

    fn post_poweron(&self, ctx: &BuildContext<'_>) -> Vec<Vec<String>> {
        let iface = ctx.name.to_string();
        match ctx.config.str("mode") {
            "dhcp" => vec![vec!["dhclient".into(), iface]],
            "manual" => {
                let mut cmds = vec![vec![
                    "ifconfig".into(),
                    iface,
                    ctx.config.str("ip").into(),
                    "netmask".into(),
                    ctx.config.str("nm").into(),
                    "up".into(),
                ]];
                let gw = ctx.config.str("gw");
                if !gw.is_empty() {
                    cmds.push(vec![
                        "route".into(),
                        "add".into(),
                        "default".into(),
                        "gw".into(),
                        gw.into(),
                    ]);
                }
                cmds
            }
            _ => Vec::new(),
        }
    }
}

/// `vde_pcapplug` bridging an existing host interface.
#[derive(Debug, Clone, Copy)]
pub struct Capture;

impl BrickType for Capture {
    fn type_name(&self) -> &'static str {
        "Capture"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![("iface", Parameter::Str(""))]
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_pcapplug"))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            ("-s", ArgSource::Call(|ctx| ctx.plug_path(0))),
            ("*", ArgSource::Key("iface")),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 1 && ctx.plugs_attached() && !ctx.config.str("iface").is_empty()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        format!("Interface: {}", ctx.config.str("iface"))
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        1
    }

    fn needs_sudo(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::context;
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_tap_args_and_host_commands() {
        let settings = Settings::default();
        let mut config = Config::new(&Tap.schema());
        let images = BTreeMap::new();
        {
            let ctx = context("tap0", &config, &settings, &images, &["/tmp/sw.ctl"]);
            assert_eq!(Tap.args(&ctx), vec!["-s", "/tmp/sw.ctl", "tap0"]);
            assert!(Tap.post_poweron(&ctx).is_empty());
        }

        config.set("mode=manual").unwrap();
        config.set("gw=10.0.0.254").unwrap();
        let ctx = context("tap0", &config, &settings, &images, &["/tmp/sw.ctl"]);
        let cmds = Tap.post_poweron(&ctx);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0][0], "ifconfig");
        assert_eq!(cmds[1].last().map(String::as_str), Some("10.0.0.254"));
    }

    #[test]
    fn test_capture_needs_interface() {
        let settings = Settings::default();
        let mut config = Config::new(&Capture.schema());
        let images = BTreeMap::new();
        assert!(!Capture.configured(&context("cap", &config, &settings, &images, &["/tmp/sw.ctl"])));

        config.set("iface=eth0").unwrap();
        let ctx = context("cap", &config, &settings, &images, &["/tmp/sw.ctl"]);
        assert!(Capture.configured(&ctx));
        assert_eq!(Capture.args(&ctx), vec!["-s", "/tmp/sw.ctl", "eth0"]);
        assert!(Capture.needs_sudo());
    }
}
