//! Encrypted tunnel endpoints (`vde_cryptcab`).

use super::{ArgSource, BrickType, BuildContext};
use crate::config::{Config, Parameter};
use crate::error::Result;
use crate::settings::Settings;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Pre-shared key file of a tunnel brick.
fn key_file(ctx: &BuildContext<'_>) -> PathBuf {
    ctx.settings
        .socket_dir
        .join(format!("tunnel_{}.key", ctx.name))
}

/// Write the pre-shared key derived from `password`, readable by the owner only.
fn write_key_file(path: &Path, password: &str) -> Result<()> {
    let digest = hex::encode(Sha256::digest(password.as_bytes()));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(digest.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}

fn remove_key_file(ctx: &BuildContext<'_>) {
    let path = key_file(ctx);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(brick = %ctx.name, path = %path.display(), error = %e, "Failed to remove key file");
        }
    }
}

/// Server side: waits for a `TunnelConnect` peer on `port`.
#[derive(Debug, Clone, Copy)]
pub struct TunnelListen;

impl BrickType for TunnelListen {
    fn type_name(&self) -> &'static str {
        "TunnelListen"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![
            ("port", Parameter::Integer(7667)),
            ("password", Parameter::Str("")),
        ]
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_cryptcab"))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            ("-s", ArgSource::Call(|ctx| ctx.plug_path(0))),
            ("#password", ArgSource::Key("password")),
            ("-p", ArgSource::Key("port")),
            ("-k", ArgSource::Call(|ctx| Some(key_file(ctx).display().to_string()))),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 1 && ctx.plugs_attached()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        format!("Listening on port {}", ctx.config.int("port"))
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        1
    }

    fn prepare(&self, ctx: &BuildContext<'_>) -> Result<()> {
        write_key_file(&key_file(ctx), ctx.config.str("password"))
    }

    fn post_poweroff(&self, ctx: &BuildContext<'_>) {
        remove_key_file(ctx);
    }
}

/// Client side: dials `host:port` from `localport`.
#[derive(Debug, Clone, Copy)]
pub struct TunnelConnect;

impl BrickType for TunnelConnect {
    fn type_name(&self) -> &'static str {
        "TunnelConnect"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        vec![
            ("host", Parameter::Str("")),
            ("port", Parameter::Integer(7667)),
            ("localport", Parameter::Integer(10771)),
            ("password", Parameter::Str("")),
        ]
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_cryptcab"))
    }

    fn command_builder(&self) -> Vec<(&'static str, ArgSource)> {
        vec![
            ("-s", ArgSource::Call(|ctx| ctx.plug_path(0))),
            ("#password", ArgSource::Key("password")),
            ("-p", ArgSource::Key("localport")),
            (
                "-c",
                ArgSource::Call(|ctx| {
                    Some(format!(
                        "{}:{}",
                        ctx.config.str("host"),
                        ctx.config.int("port")
                    ))
                }),
            ),
            ("-k", ArgSource::Call(|ctx| Some(key_file(ctx).display().to_string()))),
        ]
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        ctx.plugs.len() == 1 && ctx.plugs_attached() && !ctx.config.str("host").is_empty()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        format!(
            "Connecting to {}:{}",
            ctx.config.str("host"),
            ctx.config.int("port")
        )
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn initial_plugs(&self) -> usize {
        1
    }

    fn prepare(&self, ctx: &BuildContext<'_>) -> Result<()> {
        write_key_file(&key_file(ctx), ctx.config.str("password"))
    }

    fn post_poweroff(&self, ctx: &BuildContext<'_>) {
        remove_key_file(ctx);
    }
}
