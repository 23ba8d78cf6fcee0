use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use tonika::config::Config;
use tonika::content::{tracks::Pictures, updater, Content};
use tonika::state::AppState;
use tonika::upnp::{self, StateVars};
use tonika::{logging, ssdp, web};

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP/DLNA music server for Linux music libraries")]
struct Args {
    /// Path of the configuration file
    #[arg(short, long, default_value = "/etc/tonika/config.json")]
    config: PathBuf,

    /// Check the configuration for completeness and consistency and exit
    #[arg(long)]
    check_config: bool,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(&args.config)?;
    if let Some(level) = args.log_level {
        cfg.log_level = level;
    }
    cfg.validate().context("invalid configuration")?;
    if args.check_config {
        println!("the configuration is complete and consistent");
        return Ok(());
    }

    logging::init(&cfg.log_dir, &cfg.log_level)?;
    let config = Arc::new(cfg);

    info!("starting tonika ...");
    for dir in &config.content.music_dirs {
        info!("music dir: {}", dir.display());
    }

    let host = ssdp::local_ip();
    let pictures = Arc::new(Pictures::new());
    let content = Arc::new(RwLock::new(Content::new(
        config.clone(),
        pictures.clone(),
        host,
    )));
    let vars = Arc::new(StateVars::load(&config));

    let state = AppState {
        config: config.clone(),
        content,
        pictures,
        vars,
        host,
    };

    // populate the graph from the music dirs before going on the network
    let (del, add) = updater::full_scan(&state)
        .await
        .context("initial scan failed")?;
    let count = {
        let mut content = state.content.write().await;
        content.update(&del, &add).await
    };
    {
        let content = state.content.read().await;
        info!(
            "initial update done: {} tracks, {} albums, {} playlists ({count} object changes)",
            content.num_tracks(),
            content.num_albums(),
            content.num_playlists(),
        );
    }

    let cancel = CancellationToken::new();
    let mut updater = updater::spawn(state.clone(), cancel.clone());
    ssdp::run_ssdp_service(state.clone(), cancel.clone())?;

    let app = web::create_router(state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.upnp.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind to {addr}"))?;
    info!("server UUID: {}", config.upnp.udn);
    info!("listening on http://{}:{}", host, config.upnp.port);

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    // main control loop: consumer side of the update coordination
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down ...");
                break;
            }

            Some(notification) = updater.notifications.recv() => {
                handle_update(&state, notification).await;
            }

            Some(e) = updater.errors.recv() => {
                // a failed cycle aborts the cycle, not the process
                error!("update cycle failed: {e:#}");
            }
        }
    }

    cancel.cancel();
    if let Err(e) = ssdp::send_byebye(&config).await {
        warn!("cannot send ssdp:byebye: {e}");
    }
    if let Err(e) = state.vars.save() {
        warn!("cannot save status file: {e:#}");
    }
    server.await?.context("HTTP server failed")?;

    Ok(())
}

/// Handles one update notification: gives the updater the go-ahead, waits
/// for the change count, publishes ContainerUpdateIDs, bumps
/// SystemUpdateID and runs the service-reset procedure when its value
/// range was exceeded.
async fn handle_update(state: &AppState, notification: updater::UpdateNotification) {
    trace!("received update notification: executing update ...");
    if notification.proceed.send(()).is_err() {
        return;
    }
    let count = match notification.updated.await {
        Ok(count) => count,
        Err(_) => {
            warn!("updater aborted the cycle");
            return;
        }
    };

    let updates = { state.content.read().await.container_update_ids() };
    state.vars.set_container_update_ids(&updates);
    if state.vars.add_system_update_id(count) {
        upnp::service_reset_procedure(state).await;
    }
    if let Err(e) = state.vars.save() {
        warn!("cannot save status file: {e:#}");
    }
}
