// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Append-log backed keyed store.
//!
//! Every mutation is one batch of put/delete operations written as a single
//! JSON line to `ops.log` and fsynced before it is applied to the in-memory
//! ordered index, so multi-key batches are all-or-nothing. On open the log is
//! replayed to rebuild the index; a torn trailing line (crash mid-append) is
//! dropped, matching the all-or-nothing batch contract.
//!
//! Range scans iterate the index in lexicographic byte order over the encoded
//! key. Identifiers are random, so this order is stable but not
//! chronological.

use crate::ids::{ReceiptId, SubId, UpdateId};
use crate::storage::models::{self, Ack, Update};
use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const LOG_FILE: &str = "ops.log";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogOp {
    Put {
        key: String,
        #[serde(with = "models::base64_payload")]
        value: Vec<u8>,
    },
    Del {
        key: String,
    },
}

#[derive(Serialize, Deserialize)]
struct LogEntry {
    ops: Vec<LogOp>,
}

/// Durable keyed store with prefix scans and atomic multi-key batches.
pub struct Store {
    index: RwLock<BTreeMap<String, Vec<u8>>>,
    log: Mutex<File>,
    path: PathBuf,
}

impl Store {
    /// Open the store at `path`, creating it if missing and replaying any
    /// existing operation log.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = path.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let log_path = dir.join(LOG_FILE);

        let mut index = BTreeMap::new();
        match tokio::fs::read(&log_path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                for line in text.lines().filter(|line| !line.is_empty()) {
                    let entry: LogEntry = match serde_json::from_str(line) {
                        Ok(entry) => entry,
                        Err(err) => {
                            // A torn tail from a crash mid-append is expected;
                            // the unfinished batch is discarded.
                            warn!(error = %err, "stopping log replay at unreadable entry");
                            break;
                        }
                    };
                    apply(&mut index, entry.ops);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        debug!(path = %dir.display(), keys = index.len(), "opened store");

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await?;
        Ok(Self {
            index: RwLock::new(index),
            log: Mutex::new(log),
            path: dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist an update. Not retried on failure; the caller surfaces the
    /// error as a transient delivery failure.
    pub async fn put_update(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        update: &Update,
    ) -> Result<(), StorageError> {
        let value = update.encode()?;
        debug!(%sub, %update_id, bytes = value.len(), "persisting update");
        self.commit(vec![LogOp::Put {
            key: models::update_key(sub, update_id),
            value,
        }])
        .await
    }

    /// Remove an update. Idempotent; removing an absent key succeeds.
    pub async fn delete_update(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
    ) -> Result<(), StorageError> {
        self.commit(vec![LogOp::Del {
            key: models::update_key(sub, update_id),
        }])
        .await
    }

    /// Remove an update and record its delivery receipt in one batch; both
    /// apply or neither does.
    pub async fn ack_update_batch(
        &self,
        sub: &SubId,
        update_id: &UpdateId,
        receipt_id: &ReceiptId,
        ack: &Ack,
    ) -> Result<(), StorageError> {
        let value = ack.encode()?;
        debug!(%sub, %update_id, %receipt_id, "storing delivery receipt");
        self.commit(vec![
            LogOp::Del {
                key: models::update_key(sub, update_id),
            },
            LogOp::Put {
                key: models::ack_key(sub, receipt_id, update_id),
                value,
            },
        ])
        .await
    }

    /// All pending updates for a subscription, in key order.
    pub async fn scan_updates(&self, sub: &SubId) -> Result<Vec<Update>, StorageError> {
        let prefix = models::updates_prefix(sub);
        let index = self.index.read().await;
        index
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| Update::decode(value))
            .collect()
    }

    /// All pending receipts for `(sub, receipt_id)`, in key order. The
    /// yielded records are deleted from the store as one batch.
    pub async fn scan_acks(
        &self,
        sub: &SubId,
        receipt_id: &ReceiptId,
    ) -> Result<Vec<Ack>, StorageError> {
        let prefix = models::acks_prefix(sub, receipt_id);
        let drained: Vec<(String, Vec<u8>)> = {
            let index = self.index.read().await;
            index
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        if drained.is_empty() {
            return Ok(Vec::new());
        }
        let acks = drained
            .iter()
            .map(|(_, value)| Ack::decode(value))
            .collect::<Result<Vec<_>, _>>()?;
        self.commit(
            drained
                .into_iter()
                .map(|(key, _)| LogOp::Del { key })
                .collect(),
        )
        .await?;
        Ok(acks)
    }

    /// Delete every key in the subscription's partition in one batch.
    pub async fn drop_subscription(&self, sub: &SubId) -> Result<(), StorageError> {
        let prefix = models::sub_prefix(sub);
        let keys: Vec<String> = {
            let index = self.index.read().await;
            index
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect()
        };
        if keys.is_empty() {
            return Ok(());
        }
        debug!(%sub, keys = keys.len(), "dropping subscription partition");
        self.commit(keys.into_iter().map(|key| LogOp::Del { key }).collect())
            .await
    }

    /// Append a batch to the log, fsync, then apply it to the index. The log
    /// lock is held across the index update so replay order matches apply
    /// order.
    async fn commit(&self, ops: Vec<LogOp>) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut line = serde_json::to_vec(&LogEntry { ops: ops.clone() })?;
        line.push(b'\n');

        let mut log = self.log.lock().await;
        log.write_all(&line).await?;
        log.sync_data().await?;

        let mut index = self.index.write().await;
        apply(&mut index, ops);
        Ok(())
    }
}

fn apply(index: &mut BTreeMap<String, Vec<u8>>, ops: Vec<LogOp>) {
    for op in ops {
        match op {
            LogOp::Put { key, value } => {
                index.insert(key, value);
            }
            LogOp::Del { key } => {
                index.remove(&key);
            }
        }
    }
}
