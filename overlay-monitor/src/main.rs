//! Overlay Monitor: run the reference authority or watch one.
//!
//! ```text
//! overlay-monitor serve [addr]      # default 127.0.0.1:8000
//! overlay-monitor watch <ws-url>    # e.g. ws://127.0.0.1:8000/ws/overlay
//! ```
//!
//! `RUST_LOG` controls verbosity.

use std::process::ExitCode;

use log::{error, info, warn};
use overlay_core::ItemCollection;
use overlay_sync::{OverlayServer, ServerConfig, SyncClient, SyncConfig, SyncEvent};

const USAGE: &str = "usage: overlay-monitor serve [addr] | watch <ws-url>";

enum Mode {
    Serve(String),
    Watch(String),
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Option<Mode> {
    let mode = match args.next()?.as_str() {
        "serve" => Mode::Serve(
            args.next()
                .unwrap_or_else(|| ServerConfig::default().bind_addr),
        ),
        "watch" => Mode::Watch(args.next()?),
        _ => return None,
    };
    match args.next() {
        Some(_) => None,
        None => Some(mode),
    }
}

async fn serve(bind_addr: String) -> Result<(), Box<dyn std::error::Error>> {
    let server = OverlayServer::new(ServerConfig {
        bind_addr,
        ..ServerConfig::default()
    });
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} messages, {} frames rejected",
                stats.total_connections, stats.total_messages, stats.rejected_frames
            );
            Ok(())
        }
    }
}

fn describe(items: &ItemCollection) -> String {
    let out_of_bounds = items.out_of_bounds().len();
    format!("{} items ({} out of bounds)", items.len(), out_of_bounds)
}

async fn watch(endpoint: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = SyncClient::new(SyncConfig::default());
    let Some(mut events) = client.take_event_rx() else {
        return Err("event receiver already taken".into());
    };
    client.connect(endpoint.as_str()).await?;
    info!("Watching {endpoint}");

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(event) = event else {
            break;
        };
        match event {
            SyncEvent::Connected => info!("Link open"),
            SyncEvent::Disconnected => warn!("Link lost"),
            SyncEvent::ReconnectFailed => {
                error!("Authority unreachable, giving up");
                return Err(overlay_sync::SyncError::ReconnectFailed.into());
            }
            SyncEvent::ItemAdded(item) => {
                info!("+ {} {:?} {}", item.id, item.kind, item.filename)
            }
            SyncEvent::ItemRemoved(id) => info!("- {id}"),
            SyncEvent::PropertyChanged {
                media_id,
                property,
                value,
            } => info!("~ {media_id}.{property} = {value}"),
            SyncEvent::Cleared => info!("Cleared"),
            SyncEvent::StateReplaced { version, .. } => {
                info!("Snapshot v{version}: {}", describe(&client.items().await))
            }
            SyncEvent::VersionDrift { server_version, .. } => {
                warn!("Drift detected, authority at v{server_version}")
            }
        }
    }

    let info = client.debug_info().await?;
    info!(
        "Stopped at v{} ({}), {} items",
        info.version,
        info.checksum,
        client.item_count().await
    );
    client.disconnect().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let Some(mode) = parse_args(std::env::args().skip(1)) else {
        eprintln!("{USAGE}");
        return ExitCode::from(2);
    };
    let result = match mode {
        Mode::Serve(addr) => serve(addr).await,
        Mode::Watch(endpoint) => watch(endpoint).await,
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
