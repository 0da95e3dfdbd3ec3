// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Runtime configuration, from CLI flags with environment fallbacks.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BridgeKind {
    /// Plain delivery with no wake-up assistance.
    None,
    /// Carrier wake-up bridge.
    Carrier,
    /// Platform push-gateway bridge.
    Platform,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "pushbroker", about = "WebPush-style push notification broker")]
pub struct Config {
    /// Listen address.
    #[arg(long, env = "PUSH_ADDR", default_value = "127.0.0.1:8080")]
    pub addr: SocketAddr,

    /// Storage directory.
    #[arg(long, env = "PUSH_DB_PATH", default_value = "./db")]
    pub db_path: PathBuf,

    /// Base64-encoded 32-byte token sealing key. An ephemeral key is
    /// generated when unset.
    #[arg(long, env = "PUSH_TOKEN_KEY")]
    pub token_key: Option<String>,

    /// Token lifetime in seconds. Unset means tokens never expire.
    #[arg(long, env = "PUSH_TOKEN_TTL_SECS")]
    pub token_ttl_secs: Option<u64>,

    /// Delivery strategy.
    #[arg(long, env = "PUSH_BRIDGE", value_enum, default_value = "none")]
    pub bridge: BridgeKind,

    /// Bridge base URL (wake-up or gateway endpoint root).
    #[arg(long, env = "PUSH_BRIDGE_URL")]
    pub bridge_url: Option<String>,

    /// Platform gateway API key.
    #[arg(long, env = "PUSH_BRIDGE_API_KEY")]
    pub bridge_api_key: Option<String>,

    /// Gateway dry-run mode.
    #[arg(long, env = "PUSH_BRIDGE_DRY_RUN", default_value_t = false)]
    pub bridge_dry_run: bool,

    /// Carrier routing table refresh interval, in milliseconds.
    #[arg(long, env = "PUSH_BRIDGE_REFRESH_MS", default_value_t = 5_000)]
    pub bridge_refresh_ms: u64,

    /// How long a wake-up waits for the device to reconnect, in
    /// milliseconds.
    #[arg(long, env = "PUSH_BRIDGE_RECONNECT_MS", default_value_t = 10_000)]
    pub bridge_reconnect_ms: u64,
}

impl Config {
    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }

    pub fn bridge_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.bridge_refresh_ms)
    }

    pub fn bridge_reconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.bridge_reconnect_ms)
    }
}
