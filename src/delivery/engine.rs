// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Push/acknowledge/flush/drop state machine.
//!
//! Per subscription the engine is conceptually in one of two states:
//! **disconnected** (no live monitor; updates accumulate in the store) or
//! **connected** (a monitor channel is registered). The engine owns the
//! decision logic only; all persistence goes through [`Store`] and all
//! channel identity through the two [`Registry`] instances.

use crate::crypto::TokenCodec;
use crate::delivery::channel::{Channel, Frame};
use crate::delivery::DeliveryError;
use crate::ids::{ReceiptId, SubId, UpdateId};
use crate::registry::Registry;
use crate::storage::models::{Ack, Update};
use crate::storage::Store;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DeliveryEngine {
    store: Arc<Store>,
    monitors: Arc<Registry>,
    receipts: Arc<Registry>,
    codec: TokenCodec,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<Store>,
        monitors: Arc<Registry>,
        receipts: Arc<Registry>,
        codec: TokenCodec,
    ) -> Self {
        Self {
            store,
            monitors,
            receipts,
            codec,
        }
    }

    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    pub fn monitors(&self) -> &Arc<Registry> {
        &self.monitors
    }

    /// Deliver an update live if a monitor is connected, otherwise persist
    /// it for replay on reconnect.
    ///
    /// A failed live delivery falls through to storage. A failed storage
    /// write is surfaced to the caller and not retried here.
    pub async fn push(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        update: &Update,
    ) -> Result<(), DeliveryError> {
        if let Some(channel) = self.monitors.get(&sub.to_string()).await {
            match channel.send(Frame::update(update)) {
                Ok(()) => {
                    debug!(%sub, %update_id, "update delivered live");
                    return Ok(());
                }
                Err(_) => {
                    debug!(%sub, %update_id, "live delivery failed, storing update");
                }
            }
        }

        self.store.put_update(sub, update_id, update).await?;

        // The client may have reconnected while the write was in flight;
        // hand the registered channel the update directly rather than
        // leaving it stored until the next reconnect. The stored copy stays
        // until acknowledged either way.
        if let Some(channel) = self.monitors.get(&sub.to_string()).await {
            if channel.send(Frame::update(update)).is_err() {
                debug!(%sub, %update_id, "reconnect-race delivery failed; update remains stored");
            }
        }
        Ok(())
    }

    /// Acknowledge an update by its sealed token, removing it from storage
    /// and delivering or storing a receipt when one was requested.
    pub async fn acknowledge(&self, token: &str) -> Result<(), DeliveryError> {
        let plain = self.codec.unseal(token)?;
        let (sub, update_id, receipt_id) = parse_update_plain(&plain)?;

        let Some(receipt_id) = receipt_id else {
            // Deleting an absent key succeeds, so acknowledging twice is a
            // no-op the second time.
            return Ok(self.store.delete_update(&sub, &update_id).await?);
        };

        let ack = Ack::new(format!("/d/{token}"));
        match self.receipts.get(&receipt_id.to_string()).await {
            None => {
                // Application server offline: drop the update and keep the
                // receipt for the next receipt channel to flush.
                self.store
                    .ack_update_batch(&sub, &update_id, &receipt_id, &ack)
                    .await?;
            }
            Some(channel) => {
                self.store.delete_update(&sub, &update_id).await?;
                // No storage fallback here: a failed live receipt delivery
                // is surfaced directly to the caller.
                channel.send(Frame::ack(&ack)).map_err(DeliveryError::from)?;
                debug!(%sub, %update_id, %receipt_id, "receipt delivered live");
            }
        }
        Ok(())
    }

    /// Replay stored updates onto `channel`, then register it as the live
    /// monitor, superseding any previous one.
    pub async fn open_monitor(&self, sub: &SubId, channel: Channel) -> Result<(), DeliveryError> {
        self.flush_updates(sub, &channel).await?;
        self.monitors.register(&sub.to_string(), channel).await;
        debug!(%sub, "monitor connected");
        Ok(())
    }

    /// Replay stored updates onto `channel` without registering it.
    /// Flush order is the store's key order, not arrival order.
    pub async fn flush_updates(
        &self,
        sub: &SubId,
        channel: &Channel,
    ) -> Result<(), DeliveryError> {
        for update in self.store.scan_updates(sub).await? {
            channel
                .send(Frame::update(&update))
                .map_err(DeliveryError::from)?;
        }
        Ok(())
    }

    /// Drain stored receipts onto `channel` (deleting them), then register
    /// it as the live receipt channel for `receipt_id`.
    pub async fn open_receipt(
        &self,
        sub: &SubId,
        receipt_id: &ReceiptId,
        channel: Channel,
    ) -> Result<(), DeliveryError> {
        for ack in self.store.scan_acks(sub, receipt_id).await? {
            channel
                .send(Frame::ack(&ack))
                .map_err(DeliveryError::from)?;
        }
        self.receipts.register(&receipt_id.to_string(), channel).await;
        debug!(%sub, %receipt_id, "receipt channel connected");
        Ok(())
    }

    /// Destroy a subscription: delete its storage partition and terminally
    /// close any live monitor with a gone status.
    pub async fn drop_subscription(&self, sub: &SubId) -> Result<(), DeliveryError> {
        self.store.drop_subscription(sub).await?;
        if let Some(channel) = self.monitors.remove(&sub.to_string()).await {
            info!(%sub, "closing live monitor for dropped subscription");
            channel.close(Some(410));
        }
        Ok(())
    }
}

/// Split an unsealed update token into `(subId, updateId[, receiptId])`.
pub fn parse_update_plain(
    plain: &str,
) -> Result<(SubId, UpdateId, Option<ReceiptId>), DeliveryError> {
    let mut parts = plain.split(':');
    let sub = parts
        .next()
        .and_then(|part| part.parse().ok())
        .ok_or(DeliveryError::InvalidToken)?;
    let update_id = parts
        .next()
        .and_then(|part| part.parse().ok())
        .ok_or(DeliveryError::InvalidToken)?;
    let receipt_id = match parts.next() {
        None => None,
        Some(part) => Some(part.parse().map_err(|_| DeliveryError::InvalidToken)?),
    };
    if parts.next().is_some() {
        return Err(DeliveryError::InvalidToken);
    }
    Ok((sub, update_id, receipt_id))
}

/// Split an unsealed receipt token into `(subId, receiptId)`.
pub fn parse_receipt_plain(plain: &str) -> Result<(SubId, ReceiptId), DeliveryError> {
    let mut parts = plain.split(':');
    let sub = parts
        .next()
        .and_then(|part| part.parse().ok())
        .ok_or(DeliveryError::InvalidToken)?;
    let receipt_id = parts
        .next()
        .and_then(|part| part.parse().ok())
        .ok_or(DeliveryError::InvalidToken)?;
    if parts.next().is_some() {
        return Err(DeliveryError::InvalidToken);
    }
    Ok((sub, receipt_id))
}
