// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Live delivery channels and push frames.
//!
//! A [`Channel`] is the in-memory binding between an id and one open outbound
//! stream. The engine writes [`Frame`]s into it; the HTTP layer drains the
//! paired [`FrameReceiver`] into the response body. A frame models one
//! server push: the promise target plus the pushed response.
//!
//! The queue is unbounded, like the underlying connection's write buffer: a
//! send fails only once the connection is gone, never blocks on a slow
//! reader. Replay-then-respond flushes rely on this.

use crate::storage::models::{Ack, Headers, Update};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One server-initiated push, or the terminal close of the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Push {
        /// Push-promise target path.
        path: String,
        /// Status of the pushed response.
        status: u16,
        headers: Headers,
        #[serde(with = "crate::storage::models::base64_payload")]
        payload: Vec<u8>,
    },
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
    },
}

impl Frame {
    /// Push frame for a pending or live update.
    pub fn update(update: &Update) -> Self {
        let mut headers = update.headers.clone();
        headers.push(("last-modified".to_string(), update.last_modified.to_string()));
        Frame::Push {
            path: update.path.clone(),
            status: 200,
            headers,
            payload: update.payload.clone(),
        }
    }

    /// Push frame for a delivery receipt. The pushed response is 410 with an
    /// empty body; the update it refers to no longer exists.
    pub fn ack(ack: &Ack) -> Self {
        Frame::Push {
            path: ack.path.clone(),
            status: 410,
            headers: ack.headers.clone(),
            payload: Vec::new(),
        }
    }

    /// Serialize as one newline-delimited JSON wire line.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = serde_json::to_vec(self).unwrap_or_default();
        line.push(b'\n');
        line
    }
}

#[derive(Debug, Error)]
#[error("live channel closed")]
pub struct ChannelClosed;

/// Sender half of a live channel. Cloneable; all clones share one identity
/// used for register/unregister comparisons.
#[derive(Debug, Clone)]
pub struct Channel {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl Channel {
    pub fn new() -> (Self, FrameReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let channel = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: closed.clone(),
        };
        let receiver = FrameReceiver {
            rx,
            cancelled: Box::pin(closed.cancelled_owned()),
            done: false,
        };
        (channel, receiver)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame for the connected client. Fails once the channel is
    /// closed or the connection is gone.
    pub fn send(&self, frame: Frame) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed);
        }
        self.tx.send(frame).map_err(|_| ChannelClosed)
    }

    /// Force-close the channel, optionally with a terminal status frame.
    /// Queued frames are still drained by the receiver; nothing can be sent
    /// afterwards.
    pub fn close(&self, status: Option<u16>) {
        let _ = self.tx.send(Frame::Close { status });
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Receiver half of a live channel; yields frames until the terminal close
/// frame, a force-close, or all senders are gone.
pub struct FrameReceiver {
    rx: mpsc::UnboundedReceiver<Frame>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    done: bool,
}

impl Stream for FrameReceiver {
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => {
                if matches!(frame, Frame::Close { .. }) {
                    this.done = true;
                    this.rx.close();
                }
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                // Queued frames drain first; a force-close only ends the
                // stream once the queue is empty.
                if this.cancelled.as_mut().poll(cx).is_ready() {
                    this.done = true;
                    return Poll::Ready(None);
                }
                Poll::Pending
            }
        }
    }
}
