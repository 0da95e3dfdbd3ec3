// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
pub mod api;
pub mod bridges;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod ids;
pub mod registry;
pub mod storage;

// Re-export main types
pub use api::{router, serve, ApiError, AppState};
pub use bridges::{BaseDelivery, CarrierBridge, PlatformBridge, Pusher};
pub use config::{BridgeKind, Config};
pub use crypto::{TokenCodec, TokenError};
pub use delivery::{Channel, DeliveryEngine, DeliveryError, Frame, FrameReceiver};
pub use ids::{ReceiptId, SubId, UpdateId};
pub use registry::{ChannelGuard, Registry};
pub use storage::{Ack, StorageError, Store, Update};
