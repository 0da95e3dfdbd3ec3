// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Carrier wake-up bridge.
//!
//! Keeps a locally cached routing table (network code to addressable range)
//! refreshed by polling the carrier's discovery endpoint. On push, when the
//! target device's network is routable, a best-effort wake request is sent
//! to that network's edge node and delivery waits (bounded) for the device's
//! monitor to reconnect.

use crate::bridges::Pusher;
use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::ids::{SubId, UpdateId};
use crate::storage::models::Update;
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on the discovery response body.
const MAX_NETINFO_BYTES: usize = 8 * 1024;

/// Outbound request timeout for wake and discovery calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-subscription carrier routing parameters, supplied at subscribe time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CarrierParams {
    /// Mobile country code.
    pub mcc: String,
    /// Mobile network code.
    pub mnc: String,
    /// Network ID. Carriers shard users across multiple networks.
    pub netid: String,
    /// The device IP on the carrier's network, recorded by the GGSN.
    pub ip: String,
    /// The device UDP server port.
    pub port: u16,
}

impl CarrierParams {
    fn net_code(&self) -> String {
        format!("{}-{}.{}", self.mcc, self.mnc, self.netid)
    }

    fn validate(&self) -> Result<(), DeliveryError> {
        if self.mcc.is_empty() || self.mnc.is_empty() || self.netid.is_empty() {
            return Err(DeliveryError::InvalidParams(
                "mcc, mnc, and netid are required".to_string(),
            ));
        }
        if self.ip.is_empty() {
            return Err(DeliveryError::InvalidParams("ip is required".to_string()));
        }
        if self.port == 0 {
            return Err(DeliveryError::InvalidParams(
                "port must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct NetInfo {
    nets: Vec<NetNode>,
}

#[derive(Debug, Deserialize)]
struct NetNode {
    mccmnc: String,
    netid: String,
    #[serde(default)]
    offline: bool,
    #[serde(default)]
    range: String,
}

pub struct CarrierBridge {
    engine: Arc<DeliveryEngine>,
    client: reqwest::Client,
    wakeup_url: Url,
    netinfo_url: Url,
    routes: Arc<RwLock<HashMap<String, String>>>,
    subscribers: RwLock<HashMap<SubId, CarrierParams>>,
    refresh_interval: Duration,
    reconnect_timeout: Duration,
    shutdown: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl CarrierBridge {
    pub fn new(
        engine: Arc<DeliveryEngine>,
        base_url: &str,
        refresh_interval: Duration,
        reconnect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        let wakeup_url = base.join("/wakeup/v1")?;
        let netinfo_url = base.join("/netinfo/v1")?;
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            engine,
            client,
            wakeup_url,
            netinfo_url,
            routes: Arc::new(RwLock::new(HashMap::new())),
            subscribers: RwLock::new(HashMap::new()),
            refresh_interval,
            reconnect_timeout,
            shutdown: CancellationToken::new(),
            refresher: Mutex::new(None),
        })
    }

    /// Wake the device's edge node. An unrecognized non-success answer fails
    /// the push attempt.
    async fn wake(&self, params: &CarrierParams) -> Result<(), DeliveryError> {
        let response = self
            .client
            .post(self.wakeup_url.clone())
            .header("x-client-cert-verified", "SUCCESS")
            .form(params)
            .send()
            .await
            .map_err(DeliveryError::WakeTransport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::WakeFailed(status.as_u16()));
        }
        Ok(())
    }

    /// Fetch the discovery endpoint once and fold it into the routing
    /// table. Offline networks are evicted immediately.
    pub async fn refresh_routes(&self) -> anyhow::Result<()> {
        refresh_routes(&self.client, &self.netinfo_url, &self.routes).await
    }
}

async fn refresh_routes(
    client: &reqwest::Client,
    netinfo_url: &Url,
    routes: &RwLock<HashMap<String, String>>,
) -> anyhow::Result<()> {
    let response = client
        .get(netinfo_url.clone())
        .header("x-client-cert-verified", "SUCCESS")
        .send()
        .await?;
    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("discovery endpoint answered {status}");
    }
    let body = response.bytes().await?;
    if body.len() > MAX_NETINFO_BYTES {
        anyhow::bail!("discovery response exceeds {MAX_NETINFO_BYTES} bytes");
    }
    let info: NetInfo = serde_json::from_slice(&body)?;

    let mut routes = routes.write().await;
    fold_netinfo(&mut routes, info);
    debug!(networks = routes.len(), "carrier routing table refreshed");
    Ok(())
}

/// Fold one discovery answer into the routing table. Networks reported
/// offline are evicted immediately.
fn fold_netinfo(routes: &mut HashMap<String, String>, info: NetInfo) {
    for node in info.nets {
        let net_code = format!("{}.{}", node.mccmnc, node.netid);
        if node.offline {
            routes.remove(&net_code);
        } else {
            routes.insert(net_code, node.range);
        }
    }
}

#[async_trait]
impl Pusher for CarrierBridge {
    async fn subscribe(
        &self,
        sub: &SubId,
        params: Option<&serde_json::Value>,
    ) -> Result<(), DeliveryError> {
        let Some(params) = params else {
            return Ok(());
        };
        let params: CarrierParams = serde_json::from_value(params.clone())
            .map_err(|err| DeliveryError::InvalidParams(err.to_string()))?;
        params.validate()?;
        self.subscribers.write().await.insert(*sub, params);
        Ok(())
    }

    async fn push(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        update: &Update,
    ) -> Result<(), DeliveryError> {
        let params = self.subscribers.read().await.get(sub).cloned();
        let Some(params) = params else {
            return self.engine.push(sub, update_id, update).await;
        };
        let routable = self
            .routes
            .read()
            .await
            .contains_key(&params.net_code());
        if !routable {
            debug!(%sub, net_code = %params.net_code(), "network not routable, delivering without wake");
            return self.engine.push(sub, update_id, update).await;
        }

        self.wake(&params).await?;

        // Already connected devices skip the reconnect wait.
        if self.engine.monitors().get(&sub.to_string()).await.is_none() {
            self.engine
                .monitors()
                .wait_for_arrival(&sub.to_string(), self.reconnect_timeout)
                .await?;
        }
        self.engine.push(sub, update_id, update).await
    }

    async fn start(&self) -> Result<(), DeliveryError> {
        let mut refresher = self.refresher.lock().await;
        if refresher.is_some() {
            return Ok(());
        }
        let client = self.client.clone();
        let netinfo_url = self.netinfo_url.clone();
        let routes = self.routes.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.refresh_interval;
        *refresher = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = refresh_routes(&client, &netinfo_url, &routes).await {
                            warn!(error = %err, "carrier route refresh failed");
                        }
                    }
                }
            }
        }));
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.refresher.lock().await.take() {
            let _ = handle.await;
        }
    }
}
