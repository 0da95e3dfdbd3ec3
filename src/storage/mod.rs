// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Durable keyed storage for pending updates and delivery receipts.

pub mod models;
pub mod store;

pub use models::{Ack, Headers, Update};
pub use store::Store;

use thiserror::Error;

/// Errors surfaced by the store. I/O failures are not retried here; callers
/// report them as transient delivery failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored record: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Corrupt(err.to_string())
    }
}
