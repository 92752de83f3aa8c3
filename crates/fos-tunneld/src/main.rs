//! fOS Tunnel Daemon
//!
//! Loads the tunnel settings and a relay list, then runs the tunnel actor
//! against the simulated driver. App messages are read as JSON lines on
//! stdin and replies are written to stdout.
//!
//! ```text
//! fos-tunneld [tunnel.toml] [relays.json]
//! ```

use anyhow::{Context, Result};
use fos_tunnel::{
    AppMessageHandler, FileSettingsReader, LaunchSource, NoBypass, OfflineApiProxy,
    RelayDirectory, SharedDirectory, SimulatedDriver, StartOptions, TunnelActor, TunnelConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut args = std::env::args().skip(1);
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| "tunnel.toml".to_string()));
    let relays_path = PathBuf::from(args.next().unwrap_or_else(|| "relays.json".to_string()));

    info!("fOS tunnel daemon starting...");

    let config = TunnelConfig::load(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let directory = RelayDirectory::from_json_file(&relays_path)
        .with_context(|| format!("Failed to load {}", relays_path.display()))?;
    info!("Loaded {} relays from {}", directory.relays().len(), relays_path.display());

    let (actor, task) = TunnelActor::spawn(
        Arc::new(SimulatedDriver::new()),
        Arc::new(FileSettingsReader::new(&config_path)),
        Arc::new(SharedDirectory::new(directory)),
        Arc::new(NoBypass),
        config.timings,
    );

    let mut observer = actor.subscribe();
    tokio::spawn(async move {
        while observer.changed().await.is_ok() {
            let status = observer.borrow_and_update().clone();
            match (status.block_state_reason, &status.tunnel_relays) {
                (Some(reason), _) => warn!("Tunnel {} ({})", status.state, reason),
                (None, Some(relays)) => info!("Tunnel {} via {}", status.state, relays),
                (None, None) => info!("Tunnel {}", status.state),
            }
        }
    });

    let handler = AppMessageHandler::new(actor.clone(), OfflineApiProxy);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        while let Ok(Some(line)) = lines.next_line().await {
            let Some(mut reply) = handler.handle(line.as_bytes()).await else {
                continue;
            };
            reply.push(b'\n');
            if let Err(e) = stdout.write_all(&reply).await {
                warn!("Failed to write reply: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    actor.start(StartOptions {
        selected_relays: None,
        launch_source: LaunchSource::System,
    })?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Stopping tunnel");
    actor.stop()?;
    task.await?;

    info!("fOS tunnel daemon shutting down");
    Ok(())
}
