//! # Occupancy Relay Server
//!
//! Wires the routing core to its collaborators and runs three tasks until
//! Ctrl-C / SIGTERM: the inbound router loop, the configuration reloader and
//! the HTTP control plane.

use anyhow::{Context, Result};
use lib_relay::configs::{ConfigReloader, default_entries, ensure_inbound_queue};
use lib_relay::connections::{
    ConfigSource, Directory, MemoryConfigSource, MemoryDirectory, MemoryTransport, RedisStore, Transport,
};
use lib_relay::core::{LogAlertSink, ReceiveSettings, Router, SharedThresholds, SubscriberRegistry};
use std::sync::Arc;
use tokio::signal;

mod relay_logic;
use relay_logic::{config, control, logger, state};

struct Collaborators {
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
    config_source: Arc<dyn ConfigSource>,
}

async fn build_collaborators(config: &config::Config) -> Result<Collaborators> {
    match config.redis_url.as_deref() {
        Some(url) => {
            let store = RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting to Redis at {}", url))?;
            let config_source: Arc<dyn ConfigSource> = Arc::new(store.config_source());
            config_source
                .insert_default(&default_entries())
                .await
                .context("seeding default configuration")?;
            Ok(Collaborators {
                directory: Arc::new(store.directory()),
                transport: Arc::new(store.transport(config.visibility_timeout())),
                config_source,
            })
        }
        None => {
            log::warn!("No Redis URL configured, running on in-memory collaborators.");
            Ok(Collaborators {
                directory: Arc::new(MemoryDirectory::default()),
                transport: Arc::new(MemoryTransport::new(config.visibility_timeout())),
                config_source: Arc::new(MemoryConfigSource::new(&default_entries())),
            })
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot listen for SIGTERM: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    logger::setup_logging(&config.log_dir(), config.log_level())?;

    let collaborators = build_collaborators(&config).await?;

    // The first load is the only failure that stops the process.
    let thresholds = Arc::new(SharedThresholds::default());
    let reloader = Arc::new(
        ConfigReloader::new(Arc::clone(&collaborators.config_source), Arc::clone(&thresholds))
            .with_transport(Arc::clone(&collaborators.transport)),
    );
    reloader.reload_once().await.context("loading initial configuration")?;
    let inbound = ensure_inbound_queue(&reloader, collaborators.transport.as_ref())
        .await
        .context("bootstrapping inbound queue")?;
    log::info!("Publishers enqueue on {}", inbound);

    let registry = Arc::new(SubscriberRegistry::new(
        Arc::clone(&collaborators.directory),
        Arc::clone(&collaborators.transport),
        config.registration_attempts(),
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&collaborators.directory),
        Arc::clone(&collaborators.transport),
        Arc::new(LogAlertSink),
        Arc::clone(&thresholds),
        ReceiveSettings {
            max_messages: config.max_receive_messages(),
            wait: config.polling_time(),
        },
    ));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);

    let router_handle = {
        let router = Arc::clone(&router);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { router.run(shutdown).await })
    };

    let reload_handle = {
        let reloader = Arc::clone(&reloader);
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { reloader.run(shutdown).await })
    };

    let control_handle = tokio::spawn(control::run(
        config.clone(),
        state::AppState::new(registry, reloader),
        shutdown_tx.subscribe(),
    ));

    wait_for_signal().await;

    // Send shutdown signal to all components
    let _ = shutdown_tx.send(());

    // Wait for components to shut down
    let (router_res, reload_res, control_res) = tokio::join!(router_handle, reload_handle, control_handle);
    router_res.context("router task panicked")?;
    reload_res.context("reload task panicked")?;
    if let Err(e) = control_res.context("control plane task panicked")? {
        log::error!("Control plane stopped with error: {}", e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}
