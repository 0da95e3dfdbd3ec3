// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Live-channel registry: at most one open channel per id.
//!
//! The registry is the single source of truth for "is this subscription
//! currently connected". It is an owned object created at server start, one
//! instance for monitors and one for receipt channels. The hot-swap on
//! `register` is the only mutual-exclusion mechanism for channel identity.

use crate::delivery::channel::Channel;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, RwLock};
use tracing::debug;

#[derive(Debug, Error)]
#[error("timed out waiting for a live channel for {id}")]
pub struct WaitTimeout {
    pub id: String,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<String, Channel>,
    waiters: HashMap<String, Vec<oneshot::Sender<Channel>>>,
}

pub struct Registry {
    name: &'static str,
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Bind `channel` as the live channel for `id`. A previously bound
    /// channel is force-closed before the new binding takes effect. Pending
    /// arrival waiters are completed with the new channel.
    pub async fn register(&self, id: &str, channel: Channel) {
        let mut inner = self.inner.write().await;
        if let Some(prev) = inner.channels.remove(id) {
            debug!(registry = self.name, id, "superseding live channel");
            prev.close(None);
        }
        inner.channels.insert(id.to_string(), channel.clone());
        if let Some(waiters) = inner.waiters.remove(id) {
            for waiter in waiters {
                let _ = waiter.send(channel.clone());
            }
        }
    }

    /// Remove the binding only if `channel` is still the one bound; guards
    /// against a newer registration having already replaced it.
    pub async fn unregister_if_current(&self, id: &str, channel: &Channel) -> bool {
        let mut inner = self.inner.write().await;
        match inner.channels.get(id) {
            Some(current) if current.id() == channel.id() => {
                inner.channels.remove(id);
                debug!(registry = self.name, id, "channel unregistered");
                true
            }
            _ => false,
        }
    }

    /// Remove and return the binding for `id`.
    pub async fn remove(&self, id: &str) -> Option<Channel> {
        self.inner.write().await.channels.remove(id)
    }

    pub async fn get(&self, id: &str) -> Option<Channel> {
        self.inner.read().await.channels.get(id).cloned()
    }

    /// Wait until a channel is live for `id`, bounded by `timeout`. Returns
    /// immediately if one is already bound.
    pub async fn wait_for_arrival(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Channel, WaitTimeout> {
        let rx = {
            let mut inner = self.inner.write().await;
            if let Some(channel) = inner.channels.get(id) {
                return Ok(channel.clone());
            }
            let (tx, rx) = oneshot::channel();
            let waiters = inner.waiters.entry(id.to_string()).or_default();
            waiters.retain(|waiter| !waiter.is_closed());
            waiters.push(tx);
            rx
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(_)) | Err(_) => Err(WaitTimeout { id: id.to_string() }),
        }
    }
}

/// Unregisters its channel when dropped; attached to the response body so
/// deregistration is guaranteed on every exit path of a connection.
pub struct ChannelGuard {
    registry: Arc<Registry>,
    id: String,
    channel: Channel,
}

impl ChannelGuard {
    pub fn new(registry: Arc<Registry>, id: String, channel: Channel) -> Self {
        Self {
            registry,
            id,
            channel,
        }
    }
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        let registry = self.registry.clone();
        let id = std::mem::take(&mut self.id);
        let channel = self.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                registry.unregister_if_current(&id, &channel).await;
            });
        }
    }
}
