//! Software router with dynamic interfaces.

use super::{BrickType, BuildContext};
use crate::config::{Config, Parameter};
use crate::settings::Settings;
use std::path::PathBuf;

/// `vde_router` with one interface per connected plug.
#[derive(Debug, Clone, Copy)]
pub struct Router;

impl BrickType for Router {
    fn type_name(&self) -> &'static str {
        "Router"
    }

    fn schema(&self) -> Vec<(&'static str, Parameter)> {
        Vec::new()
    }

    fn prog(&self, settings: &Settings, _config: &Config) -> Option<PathBuf> {
        Some(settings.vde_tool("vde_router"))
    }

    fn args(&self, ctx: &BuildContext<'_>) -> Vec<String> {
        let mut args = Vec::new();
        for path in ctx.plugs.iter().filter_map(|p| p.sock_path.as_ref()) {
            args.push("-s".into());
            args.push(path.display().to_string());
        }
        args.push("-M".into());
        args.push(ctx.run_file(".mgmt").display().to_string());
        args
    }

    fn configured(&self, ctx: &BuildContext<'_>) -> bool {
        !ctx.plugs.is_empty() && ctx.plugs_attached()
    }

    fn summary(&self, ctx: &BuildContext<'_>) -> String {
        format!("Interfaces: {}", ctx.plugs.len())
    }

    fn clone_box(&self) -> Box<dyn BrickType> {
        Box::new(*self)
    }

    fn dynamic_plugs(&self) -> bool {
        true
    }

    fn console_path(&self, ctx: &BuildContext<'_>) -> Option<PathBuf> {
        Some(ctx.run_file(".mgmt"))
    }
}
