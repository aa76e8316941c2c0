// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-object delivery reconciliation.
//!
//! An object may only move to the done prefix once every event parsed from it
//! has been written to the search engine, not merely read from the object.
//! The parser [`register`](ObjectTicket::register)s each event before queueing
//! it and [`seal`](ObjectTicket::seal)s the ticket at end of stream; the
//! uploader acknowledges each event through its [`DeliveryToken`].
//! [`settled`](ObjectTicket::settled) resolves once the ticket is sealed and
//! nothing is outstanding.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Final outcome of one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written (created or replaced) by the search engine.
    Indexed,
    /// Refused for good, e.g. a mapping error. Retrying cannot help.
    Rejected,
    /// Not written after the retry budget ran out, or never attempted.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketSummary {
    pub registered: u64,
    pub indexed: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl TicketSummary {
    /// True when the object may move to done.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug)]
pub struct ObjectTicket {
    key: String,
    registered: AtomicU64,
    indexed: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    sealed: AtomicBool,
    notify: Notify,
}

impl ObjectTicket {
    #[must_use]
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            registered: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            sealed: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Records one more event for this object. The returned token must reach
    /// the uploader; dropping it unacknowledged counts the event as failed.
    #[must_use]
    pub fn register(self: &Arc<Self>) -> DeliveryToken {
        self.registered.fetch_add(1, Ordering::SeqCst);
        DeliveryToken {
            ticket: Some(Arc::clone(self)),
        }
    }

    /// No further events will be registered.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn record(&self, delivery: Delivery) {
        let counter = match delivery {
            Delivery::Indexed => &self.indexed,
            Delivery::Rejected => &self.rejected,
            Delivery::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn summary(&self) -> TicketSummary {
        TicketSummary {
            registered: self.registered.load(Ordering::SeqCst),
            indexed: self.indexed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn try_settled(&self) -> Option<TicketSummary> {
        if !self.sealed.load(Ordering::SeqCst) {
            return None;
        }
        let summary = self.summary();
        (summary.indexed + summary.rejected + summary.failed == summary.registered)
            .then_some(summary)
    }

    /// Waits until the ticket is sealed and every registered event has been
    /// acknowledged.
    pub async fn settled(&self) -> TicketSummary {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(summary) = self.try_settled() {
                return summary;
            }
            notified.await;
        }
    }
}

/// Acknowledgement handle for exactly one registered event.
#[derive(Debug)]
pub struct DeliveryToken {
    ticket: Option<Arc<ObjectTicket>>,
}

impl DeliveryToken {
    pub fn ack(mut self, delivery: Delivery) {
        if let Some(ticket) = self.ticket.take() {
            ticket.record(delivery);
        }
    }

    #[must_use]
    pub fn object_key(&self) -> &str {
        self.ticket.as_deref().map_or("", ObjectTicket::key)
    }
}

impl Drop for DeliveryToken {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.record(Delivery::Failed);
        }
    }
}
