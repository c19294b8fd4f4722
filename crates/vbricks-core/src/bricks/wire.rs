//! Point-to-point wires between two socks.

use super::{BrickType, BuildContext};
use crate::config::{Config, Parameter, Value};
use crate::settings::Settings;
use std::path::PathBuf;

/// `dpipe vde_plug <sock0> = vde_plug <sock1>`.
#[derive(Debug, Clone, Copy)]
pub struct Wire;

impl BrickType for Wire {
    fn type_name(&self) -> &'static str {
        "Wire"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        Vec::new()
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("dpipe"))
    }

    fn args(&self, ctx: &BuildContext<'_>) -> Vec<String> {
        let plug = ctx.settings.vde_tool("vde_plug").display().to_string();
        vec![
            plug.clone(),
            ctx.plug_path(0).unwrap_or_default(),
            "=".into(),
            plug,
            ctx.plug_path(1).unwrap_or_default(),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 2 && ctx.plugs_attached()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        endpoints(ctx)
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        2
    }
}

/// Wire bridged by an in-process task speaking the VDE control protocol.
///
/// When the second plug has no sock the far end is a UDP socket, which is
/// how a wire hosted on a remote engine reaches back to its peer.
#[derive(Debug, Clone, Copy)]
pub struct NativeWire;

impl BrickType for NativeWire {
    fn type_name(&self) -> &'static str {
        "Wire"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![
            ("remotehost", Parameter::Str("")),
            ("remoteport", Parameter::Integer(0)),
        ]
    }

    fn prog(&self, _settings: &Settings, _config: &Config) -> Option<PathBuf> {
        None
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 2 && ctx.plugs[0].sock_path.is_some()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        endpoints(ctx)
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        2
    }

    fn native_bridge(&self) -> bool {
        true
    }
}

fn endpoints(ctx: &BuildContext<'_>) -> String {
    let end = |n: usize| {
        ctx.plugs
            .get(n)
            .and_then(|p| p.sock_name.clone())
            .unwrap_or_else(|| "disconnected".into())
    };
    format!("{} <--> {}", end(0), end(1))
}

// ============================================================================
// Wirefilter
// ============================================================================

macro_rules! impairment_keys {
    ($($base:literal),* $(,)?) => {
        &[$(
            (
                $base,
                [
                    concat!($base, "LR"),
                    concat!($base, "RL"),
                    concat!($base, "J"),
                    concat!($base, "LRJ"),
                    concat!($base, "RLJ"),
                    concat!($base, "distrib"),
                    concat!($base, "symm"),
                    concat!($base, "mult"),
                    concat!($base, "unit"),
                ],
            ),
        )*]
    };
}

type ImpairmentKeys = (&'static str, [&'static str; 9]);

/// Impairment families: base key and derived keys.
const IMPAIRMENTS: &[ImpairmentKeys] = impairment_keys![
    "bandwidth",
    "speed",
    "delay",
    "chanbufsize",
    "loss",
    "dup",
    "noise",
    "mtu",
    "lostburst",
];

fn impairment_switch(base: &str) -> &'static str {
    match base {
        "bandwidth" => "-b",
        "speed" => "-s",
        "delay" => "-d",
        "chanbufsize" => "-c",
        "loss" => "-l",
        "dup" => "-D",
        "noise" => "-n",
        "mtu" => "-m",
        _ => "-L",
    }
}

/// Encode a GUI impairment value in wirefilter's grammar.
///
/// `base` alone gives `base{mult}{unit}`; with a jitter the result is
/// `base+jitter{mult}{unit}` followed by `N` for a gaussian distribution
/// or `U` for a uniform one. An empty or zero base yields `None`.
pub fn gui_to_wf_value(
    base: &str,
    jitter: &str,
    distrib: &str,
    mult: &str,
    unit: &str,
) -> Option<String> {
    let base = base.trim();
    if base.is_empty() || base == "0" {
        return None;
    }
    let jitter = jitter.trim();
    if jitter.is_empty() || jitter == "0" {
        return Some(format!("{base}{mult}{unit}"));
    }
    let shape = if distrib.eq_ignore_ascii_case("gaussian") {
        "N"
    } else {
        "U"
    };
    Some(format!("{base}+{jitter}{mult}{unit}{shape}"))
}

/// Directional values of one impairment: `(None, v)` when symmetric,
/// otherwise `(Some("LR"|"RL"), v)` pairs.
fn impairment_values(config: &Config, family: &ImpairmentKeys) -> Vec<(Option<&'static str>, String)> {
    let (base, [lr, rl, j, lrj, rlj, distrib, symm, mult, unit]) = *family;
    let distrib = config.str(distrib);
    let mult = config.str(mult);
    let unit = config.str(unit);
    if config.bool(symm) {
        gui_to_wf_value(config.str(base), config.str(j), distrib, mult, unit)
            .map(|v| vec![(None, v)])
            .unwrap_or_default()
    } else {
        [("LR", lr, lrj), ("RL", rl, rlj)]
            .into_iter()
            .filter_map(|(dir, key, jkey)| {
                gui_to_wf_value(config.str(key), config.str(jkey), distrib, mult, unit)
                    .map(|v| (Some(dir), v))
            })
            .collect()
    }
}

/// `wirefilter` with link impairments and a management console.
#[derive(Debug, Clone, Copy)]
pub struct Wirefilter;

impl BrickType for Wirefilter {
    fn type_name(&self) -> &'static str {
        "Wirefilter"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        let mut schema = vec![("nofifo", Parameter::Boolean(false))];
        for &(base, [lr, rl, j, lrj, rlj, distrib, symm, mult, unit]) in IMPAIRMENTS {
            for key in [base, lr, rl, j, lrj, rlj, mult, unit] {
                schema.push((key, Parameter::Str("")));
            }
            schema.push((distrib, Parameter::Str("uniform")));
            schema.push((symm, Parameter::Boolean(true)));
        }
        schema
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("wirefilter"))
    }

    fn args(&self, ctx: &BuildContext<'_>) -> Vec<String> {
        let mut args = vec![
            "-v".to_string(),
            format!(
                "{}:{}",
                ctx.plug_path(0).unwrap_or_default(),
                ctx.plug_path(1).unwrap_or_default()
            ),
            "-M".to_string(),
            ctx.run_file(".mgmt").display().to_string(),
        ];
        for family in IMPAIRMENTS {
            let switch = impairment_switch(family.0);
            for (dir, value) in impairment_values(ctx.config, family) {
                args.push(switch.to_string());
                args.push(format!("{}{value}", dir.unwrap_or("")));
            }
        }
        if ctx.config.bool("nofifo") {
            args.push("-N".into());
        }
        args
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 2 && ctx.plugs_attached()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        let mut text = endpoints(ctx);
        for family in IMPAIRMENTS {
            for (dir, value) in impairment_values(ctx.config, family) {
                text.push_str(&format!(", {} {}{value}", family.0, dir.unwrap_or("")));
            }
        }
        text
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        2
    }

    fn console_path(&self, ctx: &BuildContext<'_>) -> Option<PathBuf> {
        Some(ctx.run_file(".mgmt"))
    }

    fn live_reconfigure(&self, key: &str, _value: &Value, config: &Config) -> Option<String> {
        let family = IMPAIRMENTS
            .iter()
            .find(|(base, derived)| *base == key || derived.contains(&key))?;
        let commands: Vec<String> = impairment_values(config, family)
            .into_iter()
            .map(|(dir, value)| match dir {
                Some(dir) => format!("{} {dir} {value}", family.0),
                None => format!("{} {value}", family.0),
            })
            .collect();
        if commands.is_empty() {
            Some(format!("{} 0", family.0))
        } else {
            Some(commands.join("\n"))
        }
    }
}
