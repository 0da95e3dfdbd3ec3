// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! The delivery engine: push, acknowledge, flush, drop.

pub mod channel;
pub mod engine;

pub use channel::{Channel, ChannelClosed, Frame, FrameReceiver};
pub use engine::DeliveryEngine;

use crate::crypto::TokenError;
use crate::registry::WaitTimeout;
use crate::storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Bad, forged, expired, or unparseable token.
    #[error("invalid or expired token")]
    InvalidToken,

    /// The token codec itself failed; a server-side misconfiguration.
    #[error("token codec failure: {0}")]
    Crypto(#[source] TokenError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The live channel went away mid-delivery.
    #[error("live channel closed during delivery")]
    ChannelClosed,

    /// Bridge subscription parameters failed validation.
    #[error("invalid bridge parameters: {0}")]
    InvalidParams(String),

    /// A woken device did not reconnect within the bridge's bound.
    #[error("timed out waiting for {0} to reconnect")]
    ReconnectTimeout(String),

    /// The wake-up endpoint answered with an unrecognized status.
    #[error("wake-up request failed with status {0}")]
    WakeFailed(u16),

    /// The wake-up endpoint was unreachable.
    #[error("wake-up request failed: {0}")]
    WakeTransport(#[source] reqwest::Error),
}

impl From<TokenError> for DeliveryError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::InvalidToken => DeliveryError::InvalidToken,
            TokenError::Crypto(_) => DeliveryError::Crypto(err),
        }
    }
}

impl From<WaitTimeout> for DeliveryError {
    fn from(err: WaitTimeout) -> Self {
        DeliveryError::ReconnectTimeout(err.id)
    }
}

impl From<ChannelClosed> for DeliveryError {
    fn from(_: ChannelClosed) -> Self {
        DeliveryError::ChannelClosed
    }
}
