// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use anyhow::{Context as _, Result};
use clap::Parser;
use pushbroker::{
    api::{self, AppState},
    bridges::{BaseDelivery, CarrierBridge, PlatformBridge, Pusher},
    config::{BridgeKind, Config},
    crypto::TokenCodec,
    delivery::DeliveryEngine,
    registry::Registry,
    storage::Store,
};
use std::{env, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    // Initialize tracing subscriber for logging
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let config = Config::parse();
    info!("🚀 starting push broker");

    let store = Arc::new(Store::open(&config.db_path).await?);

    let codec = match &config.token_key {
        Some(secret) => TokenCodec::from_base64(secret, config.token_ttl())?,
        None => {
            warn!("no token key configured; sealing with an ephemeral key (tokens will not survive a restart)");
            TokenCodec::random(config.token_ttl())
        }
    };

    let monitors = Arc::new(Registry::new("monitor"));
    let receipts = Arc::new(Registry::new("receipt"));
    let engine = Arc::new(DeliveryEngine::new(
        store,
        monitors.clone(),
        receipts.clone(),
        codec.clone(),
    ));

    let pusher: Arc<dyn Pusher> = match config.bridge {
        BridgeKind::None => Arc::new(BaseDelivery::new(engine.clone())),
        BridgeKind::Carrier => {
            let base_url = config
                .bridge_url
                .as_deref()
                .context("--bridge-url is required for the carrier bridge")?;
            Arc::new(CarrierBridge::new(
                engine.clone(),
                base_url,
                config.bridge_refresh_interval(),
                config.bridge_reconnect_timeout(),
            )?)
        }
        BridgeKind::Platform => {
            let base_url = config
                .bridge_url
                .as_deref()
                .context("--bridge-url is required for the platform bridge")?;
            let api_key = config
                .bridge_api_key
                .clone()
                .context("--bridge-api-key is required for the platform bridge")?;
            Arc::new(PlatformBridge::new(
                engine.clone(),
                base_url,
                api_key,
                config.bridge_dry_run,
            )?)
        }
    };
    pusher.start().await?;

    let state = AppState {
        engine,
        pusher: pusher.clone(),
        codec,
        monitors,
        receipts,
    };

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    api::serve(state, config.addr, shutdown).await?;
    pusher.stop().await;
    info!("push broker stopped");
    Ok(())
}
