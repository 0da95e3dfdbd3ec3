// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Delivery strategies.
//!
//! A [`Pusher`] is the capability used by the HTTP layer to deliver updates.
//! One concrete variant is selected at construction time:
//!
//! - [`BaseDelivery`]: plain engine delivery (live push or store)
//! - [`CarrierBridge`]: carrier wake-up before delivery
//! - [`PlatformBridge`]: platform push gateway with local fallback
//!
//! The bridges wrap the shared [`DeliveryEngine`] by composition; they never
//! reimplement its store-and-forward semantics.

pub mod carrier;
pub mod platform;

pub use carrier::CarrierBridge;
pub use platform::PlatformBridge;

use crate::delivery::{DeliveryEngine, DeliveryError};
use crate::ids::{SubId, UpdateId};
use crate::storage::models::Update;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Pusher: Send + Sync {
    /// Validate and record delivery parameters for a new subscription.
    /// Strategies without parameters accept and ignore the payload.
    async fn subscribe(
        &self,
        sub: &SubId,
        params: Option<&serde_json::Value>,
    ) -> Result<(), DeliveryError>;

    /// Deliver one update to a subscription.
    async fn push(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        update: &Update,
    ) -> Result<(), DeliveryError>;

    /// Start background work (route polling). Idempotent.
    async fn start(&self) -> Result<(), DeliveryError>;

    /// Stop background work.
    async fn stop(&self);
}

/// Plain delivery with no wake-up assistance.
pub struct BaseDelivery {
    engine: Arc<DeliveryEngine>,
}

impl BaseDelivery {
    pub fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Pusher for BaseDelivery {
    async fn subscribe(
        &self,
        _sub: &SubId,
        _params: Option<&serde_json::Value>,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn push(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        update: &Update,
    ) -> Result<(), DeliveryError> {
        self.engine.push(sub, update_id, update).await
    }

    async fn start(&self) -> Result<(), DeliveryError> {
        Ok(())
    }

    async fn stop(&self) {}
}
