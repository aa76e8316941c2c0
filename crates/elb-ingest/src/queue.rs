// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off between parsers and uploaders.
//!
//! `push` waits while the queue is full. That wait is what caps memory use:
//! a parser never reads further into an object than the uploaders can take.
//! The queue closes once every [`EventSender`] is dropped, and [`EventReceiver`]
//! keeps returning items until it is drained.

use crate::delivery::DeliveryToken;
use crate::error::ParserError;
use crate::event::LogEvent;
use crate::stats::{Counter, Gauge, StatsRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};

/// An event plus the handle that reports its outcome back to its object.
#[derive(Debug)]
pub struct QueueItem {
    pub event: LogEvent,
    pub token: DeliveryToken,
}

pub struct EventQueue;

impl EventQueue {
    /// Creates a queue holding at most `capacity` items (at least one).
    #[must_use]
    pub fn new(capacity: usize, stats: Arc<StatsRegistry>) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            EventSender {
                tx,
                stats: Arc::clone(&stats),
            },
            EventReceiver {
                rx: Arc::new(Mutex::new(rx)),
                stats,
            },
        )
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<QueueItem>,
    stats: Arc<StatsRegistry>,
}

impl EventSender {
    /// Waits for a free slot, then enqueues `item`. The depth gauge is
    /// raised before the item becomes visible to a receiver.
    pub async fn push(&self, item: QueueItem) -> Result<(), ParserError> {
        let slot = self
            .tx
            .reserve()
            .await
            .map_err(|_| ParserError::QueueClosed)?;
        self.stats.add(Gauge::QueueDepth, 1);
        slot.send(item);
        self.stats.increment(Counter::EventsQueued, 1);
        Ok(())
    }
}

/// The receiving half, shared by every uploader worker.
#[derive(Debug, Clone)]
pub struct EventReceiver {
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    stats: Arc<StatsRegistry>,
}

impl EventReceiver {
    /// Waits for the next item. `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<QueueItem> {
        let item = self.rx.lock().await.recv().await;
        if item.is_some() {
            self.stats.add(Gauge::QueueDepth, -1);
        }
        item
    }

    /// Waits for one item, then keeps taking items until `max` are collected
    /// or `budget` has passed since the first one arrived. `None` once the
    /// queue is closed and empty.
    pub async fn pop_batch(&self, max: usize, budget: Duration) -> Option<Vec<QueueItem>> {
        let mut rx = self.rx.lock().await;
        let first = rx.recv().await?;
        let deadline = Instant::now() + budget;
        let mut batch = Vec::with_capacity(max.max(1));
        batch.push(first);
        while batch.len() < max {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }
        drop(rx);
        self.stats.add(Gauge::QueueDepth, -(batch.len() as i64));
        Some(batch)
    }
}
