//! vbricksd: virtual network engine daemon.
//!
//! Loads the settings and the current project, then runs until interrupted:
//!
//! - a console on stdin (logs go to stderr),
//! - a housekeeping ticker reaping exited processes and autosaving,
//! - the remote-control server when enabled,
//! - connections to every `autoconnect` remote host.
//!
//! On shutdown the project is saved and every brick is powered off.

mod config;
mod shell;

use anyhow::Context;
use config::DaemonConfig;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use vbricks_core::{configfile, Engine, Settings};
use vbricks_remote::{client, RemoteServer};

/// How often exited processes are collected.
const REAP_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("vbricksd=info,vbricks_core=info,vbricks_remote=info")),
        )
        .init();

    let config = DaemonConfig::from_env();
    info!(settings = %config.settings_path.display(), "vbricksd starting");

    let mut settings = Settings::load(&config.settings_path)
        .with_context(|| format!("loading settings from {}", config.settings_path.display()))?;
    if let Some(project) = &config.project {
        settings.current_project = project.clone();
    }
    let engine = Engine::new(settings);

    let settings_path = config.settings_path.clone();
    let restored = engine
        .run(move |f| {
            f.settings_path = Some(settings_path);
            let project = f.settings.current_project.clone();
            if project.exists() {
                configfile::restore(f, &project).map(|()| Some(project))
            } else {
                Ok(None)
            }
        })
        .await?;
    match restored {
        Ok(Some(project)) => info!(project = %project.display(), "Project restored"),
        Ok(None) => info!("Starting with an empty project"),
        Err(e) => warn!(error = %e, "Failed to restore project"),
    }

    autoconnect(&engine).await?;

    if config.server {
        let password = engine.run(|f| f.settings.password.clone()).await?;
        if password.is_empty() {
            warn!("Remote-control server runs with an empty password");
        }
        let server = RemoteServer::new(engine.clone(), password);
        let listen = config.listen;
        tokio::spawn(async move {
            if let Err(e) = server.listen(listen).await {
                error!(addr = %listen, error = %e, "Remote-control server stopped");
            }
        });
    }

    tokio::spawn(housekeeping(engine.clone(), config.autosave));

    if config.console {
        let console = shell::run(engine.clone());
        tokio::select! {
            result = console => {
                if let Err(e) = result {
                    error!(error = %e, "Console failed");
                }
            }
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    } else {
        tokio::signal::ctrl_c().await?;
        info!("Interrupted");
    }

    shutdown(&engine).await
}

/// Connect every remote host flagged `autoconnect`.
async fn autoconnect(engine: &Engine) -> anyhow::Result<()> {
    let hosts: Vec<String> = engine
        .run(|f| {
            f.remote_hosts
                .values()
                .filter(|h| h.autoconnect)
                .map(|h| h.addr.clone())
                .collect()
        })
        .await?;
    for host in hosts {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = client::connect(&engine, &host).await {
                warn!(host = %host, error = %e, "Autoconnect failed");
            }
        });
    }
    Ok(())
}

/// Reap exited processes and save the project periodically.
async fn housekeeping(engine: Engine, autosave: Duration) {
    let mut reap = tokio::time::interval(REAP_INTERVAL);
    let mut save = tokio::time::interval(autosave.max(REAP_INTERVAL));
    // Both intervals fire immediately; nothing to save yet.
    save.tick().await;

    loop {
        tokio::select! {
            _ = reap.tick() => {
                match engine.run(|f| f.reap()).await {
                    Ok(reaped) if !reaped.is_empty() => info!(bricks = ?reaped, "Reaped exited bricks"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Reaper failed"),
                }
            }
            _ = save.tick(), if !autosave.is_zero() => {
                match engine.run(save_project).await {
                    Ok(Ok(())) => tracing::debug!("Project autosaved"),
                    Ok(Err(e)) => warn!(error = %e, "Autosave failed"),
                    Err(e) => error!(error = %e, "Autosave failed"),
                }
            }
        }
    }
}

fn save_project(f: &mut vbricks_core::Factory) -> vbricks_core::Result<()> {
    let project = f.settings.current_project.clone();
    configfile::save(f, &project)
}

async fn shutdown(engine: &Engine) -> anyhow::Result<()> {
    info!("Shutting down");
    engine
        .run(|f| {
            let saved = save_project(f);
            f.poweroff_all();
            saved
        })
        .await?
        .context("saving project")?;
    info!("Project saved, all bricks stopped");
    Ok(())
}
