//! Serve command - run the gateway

use crate::broadcast::EventBroadcaster;
use crate::cli::args::ServeArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{TetherError, TetherResult};
use crate::server;
use crate::session::{validate_session_id, ManagerOptions, SessionManager, SqliteSessionStore};
use crate::transport::{BridgeTransport, PairingMode};
use crate::ui::{self, UiContext};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Execute the serve command
pub async fn execute(args: ServeArgs, config: &Config) -> TetherResult<()> {
    for id in &args.sessions {
        validate_session_id(id)?;
    }

    ConfigManager::ensure_state_dirs().await?;
    let store_path = ConfigManager::store_path(config);
    let store = SqliteSessionStore::open(&store_path)?;
    let transport = BridgeTransport::new(config.transport.bridge_url.clone());
    let manager = SessionManager::new(
        Arc::new(store),
        Arc::new(transport),
        EventBroadcaster::new(config.gateway.event_buffer),
        ManagerOptions::from_config(config),
    );

    let bind = args.bind.unwrap_or_else(|| config.gateway.bind.clone());
    let listener = TcpListener::bind(&bind)
        .await
        .map_err(|source| TetherError::Bind {
            addr: bind.clone(),
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| TetherError::io("reading listen address", e))?;

    let ctx = UiContext::detect();
    ui::intro(&ctx, "Tether gateway");
    ui::key_value(&ctx, "Listening", &format!("ws://{local_addr}/ws"));
    ui::key_value(&ctx, "Store", &store_path.display().to_string());
    ui::key_value(&ctx, "Bridge", &config.transport.bridge_url);
    info!(addr = %local_addr, "Gateway listening");

    let pairing = match args.pairing_phone {
        Some(phone_number) => PairingMode::Code { phone_number },
        None => PairingMode::Qr,
    };
    for id in &args.sessions {
        manager.connect(id, pairing.clone()).await?;
    }

    let restore = if config.session.restore_on_start && !args.no_restore {
        let restorer = manager.clone();
        let stagger = Duration::from_millis(config.session.restore_stagger_ms);
        Some(tokio::spawn(async move {
            if let Err(e) = restorer.restore(stagger).await {
                warn!(error = %e, "Session restore failed");
            }
        }))
    } else {
        ui::step_warn_hint(
            &ctx,
            "Stored sessions will not be reconnected",
            "Drop --no-restore or set [session] restore_on_start = true",
        );
        None
    };

    let served = server::serve(listener, manager.clone(), shutdown_signal()).await;

    if let Some(restore) = restore {
        restore.abort();
    }
    let closed = manager.shutdown().await;
    info!(closed, "Gateway stopped");
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
