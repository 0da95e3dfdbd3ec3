// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Persisted record types and key layout.
//!
//! The store is a single keyed namespace with string keys:
//!
//! - `{subId}:updates:{updateId}` holds an [`Update`] awaiting acknowledgement
//! - `{subId}:acks:{receiptId}:{updateId}` holds an [`Ack`] awaiting flush
//!
//! Values are self-describing JSON; the update payload is base64 inside the
//! record so the stored bytes stay valid UTF-8.

use crate::ids::{ReceiptId, SubId, UpdateId};
use crate::storage::StorageError;
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Named string headers carried with a pushed message. Order is preserved as
/// captured but carries no meaning.
pub type Headers = Vec<(String, String)>;

/// A single message addressed to one subscription.
///
/// Exists in storage exactly while it has not yet been both delivered and
/// acknowledged; removed on acknowledgement or subscription drop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    /// Opaque delivery URL, used as the push-promise target.
    pub path: String,
    /// Content and encryption headers, passed through unchanged.
    pub headers: Headers,
    /// Raw message bytes, possibly empty.
    #[serde(with = "base64_payload")]
    pub payload: Vec<u8>,
    /// Capture timestamp (unix millis). Informational only, never an
    /// ordering key.
    pub last_modified: i64,
}

impl Update {
    pub fn new(path: String, headers: Headers, payload: Vec<u8>) -> Self {
        Self {
            path,
            headers,
            payload,
            last_modified: Utc::now().timestamp_millis(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A delivery-receipt record for an acknowledged update.
///
/// Written only when an update carrying a receipt id is acknowledged while no
/// receipt channel is live; deleted when flushed to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    /// The original delivery URL, used by the application server to
    /// correlate the receipt.
    pub path: String,
    pub headers: Headers,
}

impl Ack {
    pub fn new(path: String) -> Self {
        Self {
            path,
            headers: vec![(
                "last-modified".to_string(),
                Utc::now().timestamp_millis().to_string(),
            )],
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub fn update_key(sub: &SubId, update: &UpdateId) -> String {
    format!("{sub}:updates:{update}")
}

pub fn updates_prefix(sub: &SubId) -> String {
    format!("{sub}:updates:")
}

pub fn ack_key(sub: &SubId, receipt: &ReceiptId, update: &UpdateId) -> String {
    format!("{sub}:acks:{receipt}:{update}")
}

pub fn acks_prefix(sub: &SubId, receipt: &ReceiptId) -> String {
    format!("{sub}:acks:{receipt}:")
}

pub fn sub_prefix(sub: &SubId) -> String {
    format!("{sub}:")
}

/// Serde adapter storing byte payloads as standard base64 strings.
pub mod base64_payload {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_record_round_trip() {
        let update = Update::new(
            "/d/token".to_string(),
            vec![("content-type".to_string(), "text/plain".to_string())],
            b"hello".to_vec(),
        );
        let decoded = Update::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_update_payload_is_base64_in_record() {
        let update = Update::new("/d/token".to_string(), Vec::new(), vec![0xff, 0x00, 0x7f]);
        let raw = update.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["payload"], "/wB/");
    }

    #[test]
    fn test_empty_payload_round_trips() {
        let update = Update::new("/d/token".to_string(), Vec::new(), Vec::new());
        let decoded = Update::decode(&update.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ack_carries_last_modified() {
        let ack = Ack::new("/d/token".to_string());
        assert!(ack.headers.iter().any(|(name, _)| name == "last-modified"));
        let decoded = Ack::decode(&ack.encode().unwrap()).unwrap();
        assert_eq!(decoded, ack);
    }

    #[test]
    fn test_key_layout() {
        let sub: SubId = "9f2c7dbd-23bb-4e4a-8b3a-0aabb84f5f04".parse().unwrap();
        let update: UpdateId = "54c6e8d3-31a2-4c69-b7a7-6bfa0e3cb2f5".parse().unwrap();
        let receipt: ReceiptId = "11f1cf30-64ce-4954-95b0-2ffe3bbc51b0".parse().unwrap();
        assert_eq!(
            update_key(&sub, &update),
            "9f2c7dbd-23bb-4e4a-8b3a-0aabb84f5f04:updates:54c6e8d3-31a2-4c69-b7a7-6bfa0e3cb2f5"
        );
        assert_eq!(
            ack_key(&sub, &receipt, &update),
            "9f2c7dbd-23bb-4e4a-8b3a-0aabb84f5f04:acks:11f1cf30-64ce-4954-95b0-2ffe3bbc51b0:54c6e8d3-31a2-4c69-b7a7-6bfa0e3cb2f5"
        );
        assert!(update_key(&sub, &update).starts_with(&updates_prefix(&sub)));
        assert!(ack_key(&sub, &receipt, &update).starts_with(&acks_prefix(&sub, &receipt)));
        assert!(updates_prefix(&sub).starts_with(&sub_prefix(&sub)));
    }
}
