// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Platform push-gateway bridge.
//!
//! Attempts remote delivery through the platform's HTTP gateway first. On a
//! transport error or non-success status it falls back to the base engine
//! (live delivery or store-and-forward); on success delivery stops there,
//! with no local side record.

use crate::bridges::Pusher;
use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::ids::{SubId, UpdateId};
use crate::storage::models::Update;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Gateway payload size bound; larger updates are delivered locally.
pub const MAX_GATEWAY_PAYLOAD: usize = 4096;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-subscription gateway parameters, supplied at subscribe time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlatformParams {
    /// Registration ID.
    pub regid: String,
    /// Collapse key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collapse_key: Option<String>,
    /// Message time-to-live.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

#[derive(Serialize)]
struct GatewayMessage<'a> {
    registration_ids: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    collapse_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<u64>,
    dry_run: bool,
    data: GatewayData<'a>,
}

#[derive(Serialize)]
struct GatewayData<'a> {
    msg: &'a str,
}

pub struct PlatformBridge {
    engine: Arc<DeliveryEngine>,
    client: reqwest::Client,
    send_url: Url,
    api_key: String,
    dry_run: bool,
    subscribers: RwLock<HashMap<SubId, PlatformParams>>,
}

impl PlatformBridge {
    pub fn new(
        engine: Arc<DeliveryEngine>,
        base_url: &str,
        api_key: String,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let send_url = Url::parse(base_url)?.join("/gcm/send")?;
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            engine,
            client,
            send_url,
            api_key,
            dry_run,
            subscribers: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Pusher for PlatformBridge {
    async fn subscribe(
        &self,
        sub: &SubId,
        params: Option<&serde_json::Value>,
    ) -> Result<(), DeliveryError> {
        let Some(params) = params else {
            return Ok(());
        };
        let params: PlatformParams = serde_json::from_value(params.clone())
            .map_err(|err| DeliveryError::InvalidParams(err.to_string()))?;
        if params.regid.is_empty() {
            return Err(DeliveryError::InvalidParams(
                "regid is required".to_string(),
            ));
        }
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
        if update.payload.len() > MAX_GATEWAY_PAYLOAD {
            debug!(%sub, %update_id, bytes = update.payload.len(),
                "payload exceeds gateway bound, delivering locally");
            return self.engine.push(sub, update_id, update).await;
        }

        let msg = String::from_utf8_lossy(&update.payload);
        let message = GatewayMessage {
            registration_ids: [params.regid.as_str()],
            collapse_key: params.collapse_key.as_deref(),
            time_to_live: params.ttl,
            dry_run: self.dry_run,
            data: GatewayData { msg: &msg },
        };

        let result = self
            .client
            .post(self.send_url.clone())
            .header(AUTHORIZATION, format!("key={}", self.api_key))
            .json(&message)
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                // Fire-and-forget: no local delivery, no stored record.
                debug!(%sub, %update_id, "update delivered via platform gateway");
                Ok(())
            }
            Ok(response) => {
                debug!(%sub, %update_id, status = response.status().as_u16(),
                    "gateway rejected update, falling back to local delivery");
                self.engine.push(sub, update_id, update).await
            }
            Err(err) => {
                warn!(%sub, %update_id, error = %err,
                    "gateway unreachable, falling back to local delivery");
                self.engine.push(sub, update_id, update).await
            }
        }
    }

    async fn start(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn stop(&self) {}
}
