// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::delivery::{Delivery, DeliveryToken};
use crate::error::SinkError;
use crate::event::{IndexDocument, IndexPattern};
use crate::queue::{EventReceiver, QueueItem};
use crate::retry::RetryStrategy;
use crate::sink::{ItemOutcome, SearchSink};
use crate::stats::{Counter, Gauge, StatsRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    pub batch_size: usize,
    /// Longest wait for a batch to fill once its first event arrived.
    pub flush_interval: Duration,
    pub retry: RetryStrategy,
    pub index_pattern: IndexPattern,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_interval: Duration::from_secs(1),
            retry: RetryStrategy::default(),
            index_pattern: IndexPattern::default(),
        }
    }
}

/// Drains the event queue into the search engine in batches.
#[derive(Clone)]
pub struct Uploader {
    sink: Arc<dyn SearchSink>,
    receiver: EventReceiver,
    stats: Arc<StatsRegistry>,
    config: UploaderConfig,
}

struct Pending {
    document: IndexDocument,
    token: DeliveryToken,
}

impl Uploader {
    #[must_use]
    pub fn new(
        sink: Arc<dyn SearchSink>,
        receiver: EventReceiver,
        stats: Arc<StatsRegistry>,
        config: UploaderConfig,
    ) -> Self {
        Self {
            sink,
            receiver,
            stats,
            config,
        }
    }

    /// Uploads batches until the queue is closed and drained.
    pub async fn run(&self) {
        let batch_size = self.config.batch_size.max(1);
        while let Some(batch) = self
            .receiver
            .pop_batch(batch_size, self.config.flush_interval)
            .await
        {
            self.upload(batch).await;
        }
        debug!("event queue closed, uploader stopping");
    }

    /// Writes one batch, retrying transient failures with backoff, and
    /// acknowledges every event in it exactly once.
    pub async fn upload(&self, batch: Vec<QueueItem>) {
        let mut pending: Vec<Pending> = batch
            .into_iter()
            .map(|item| Pending {
                document: IndexDocument::from_event(&item.event, &self.config.index_pattern),
                token: item.token,
            })
            .collect();

        let attempts = self.config.retry.attempts();
        let mut attempt = 1;
        while !pending.is_empty() {
            let documents: Vec<IndexDocument> = pending.iter().map(|p| p.document.clone()).collect();
            let last_attempt = attempt >= attempts;
            match self.sink.bulk_upsert(&documents).await {
                Ok(outcomes) => {
                    pending = self.settle_items(pending, outcomes, last_attempt);
                }
                Err(SinkError::Transient(reason)) if !last_attempt => {
                    warn!(
                        documents = pending.len(),
                        attempt, "bulk write failed, retrying: {reason}"
                    );
                }
                Err(e) => {
                    error!(documents = pending.len(), attempt, "bulk write failed: {e}");
                    self.fail_all(pending);
                    return;
                }
            }
            if pending.is_empty() {
                break;
            }
            self.stats.increment(Counter::IndexRetries, pending.len() as u64);
            tokio::time::sleep(self.config.retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    /// Acknowledges every item with a final outcome and returns the ones to
    /// retry.
    fn settle_items(&self, pending: Vec<Pending>, outcomes: Vec<ItemOutcome>, last_attempt: bool) -> Vec<Pending> {
        let mut retry = Vec::new();
        let mut indexed = 0;
        for (item, outcome) in pending.into_iter().zip(outcomes) {
            match outcome {
                ItemOutcome::Created => {
                    indexed += 1;
                    item.token.ack(Delivery::Indexed);
                }
                ItemOutcome::Replaced => {
                    indexed += 1;
                    self.stats.increment(Counter::DocumentsReplaced, 1);
                    item.token.ack(Delivery::Indexed);
                }
                ItemOutcome::Rejected(reason) => {
                    warn!(id = %item.document.id, "document rejected: {reason}");
                    self.stats.increment(Counter::IndexErrors, 1);
                    item.token.ack(Delivery::Rejected);
                }
                ItemOutcome::Transient(reason) if last_attempt => {
                    error!(id = %item.document.id, "document not written after retries: {reason}");
                    self.stats.increment(Counter::IndexErrors, 1);
                    item.token.ack(Delivery::Failed);
                }
                ItemOutcome::Transient(_) => retry.push(item),
            }
        }
        if indexed > 0 {
            self.stats.increment(Counter::EventsIndexed, indexed);
            self.stats.mark_now(Gauge::LastDocumentIndexedAt);
        }
        retry
    }

    fn fail_all(&self, pending: Vec<Pending>) {
        self.stats
            .increment(Counter::IndexErrors, pending.len() as u64);
        for item in pending {
            item.token.ack(Delivery::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::ObjectTicket;
    use crate::event::LogEvent;
    use crate::queue::EventQueue;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    const LINE: &str = "2015-05-13T23:39:43.945958Z my-loadbalancer 192.168.131.39:2817 10.0.0.1:80 0.000073 0.001048 0.000057 200 200 0 29 \"GET http://www.example.com:80/ HTTP/1.1\" \"curl/7.38.0\" - -";

    /// Stores documents by id. Scripted responses are used first, in order.
    #[derive(Default)]
    struct ScriptedSink {
        documents: Mutex<HashMap<String, Value>>,
        script: Mutex<VecDeque<Result<Option<ItemOutcome>, SinkError>>>,
        calls: Mutex<Vec<usize>>,
    }

    impl ScriptedSink {
        fn with_script(script: Vec<Result<Option<ItemOutcome>, SinkError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }
    }

    #[async_trait]
    impl SearchSink for ScriptedSink {
        async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<Vec<ItemOutcome>, SinkError> {
            self.calls.lock().expect("lock").push(documents.len());
            // Ok(Some(outcome)) applies `outcome` to the first document only
            let scripted = self.script.lock().expect("lock").pop_front();
            let first_outcome = match scripted {
                Some(Err(e)) => return Err(e),
                Some(Ok(outcome)) => outcome,
                None => None,
            };
            let mut stored = self.documents.lock().expect("lock");
            let mut outcomes = Vec::new();
            for (i, document) in documents.iter().enumerate() {
                if i == 0 {
                    if let Some(outcome) = first_outcome.clone() {
                        outcomes.push(outcome);
                        continue;
                    }
                }
                let replaced = stored
                    .insert(document.id.clone(), document.source.clone())
                    .is_some();
                outcomes.push(if replaced {
                    ItemOutcome::Replaced
                } else {
                    ItemOutcome::Created
                });
            }
            Ok(outcomes)
        }

        async fn ping(&self) -> bool {
            true
        }
    }

    fn config() -> UploaderConfig {
        UploaderConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(10),
            retry: RetryStrategy::Immediate(3),
            index_pattern: IndexPattern::default(),
        }
    }

    fn items(ticket: &Arc<ObjectTicket>, lines: &[String]) -> Vec<QueueItem> {
        lines
            .iter()
            .enumerate()
            .map(|(i, raw)| QueueItem {
                event: LogEvent {
                    object_key: ticket.key().to_string(),
                    byte_offset: 0,
                    line_number: i as u64 + 1,
                    raw: raw.clone(),
                    record: raw.parse().expect("line parses"),
                },
                token: ticket.register(),
            })
            .collect()
    }

    fn uploader(sink: Arc<ScriptedSink>) -> (Uploader, Arc<StatsRegistry>) {
        let stats = Arc::new(StatsRegistry::new());
        let (_tx, rx) = EventQueue::new(1, Arc::clone(&stats));
        (
            Uploader::new(sink, rx, Arc::clone(&stats), config()),
            stats,
        )
    }

    fn distinct_lines(n: usize) -> Vec<String> {
        (0..n)
            .map(|i| LINE.replace("0 29", &format!("0 {}", 100 + i)))
            .collect()
    }

    #[tokio::test]
    async fn test_upload_is_idempotent() {
        let sink = ScriptedSink::with_script(vec![]);
        let (uploader, stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        let lines = distinct_lines(3);

        uploader.upload(items(&ticket, &lines)).await;
        uploader.upload(items(&ticket, &lines)).await;
        ticket.seal();

        assert_eq!(sink.documents.lock().expect("lock").len(), 3);
        assert_eq!(stats.counter(Counter::EventsIndexed), 6);
        assert_eq!(stats.counter(Counter::DocumentsReplaced), 3);
        let summary = ticket.settled().await;
        assert_eq!(summary.indexed, 6);
    }

    #[tokio::test]
    async fn test_transient_request_error_is_retried() {
        let sink = ScriptedSink::with_script(vec![Err(SinkError::Transient("503".into()))]);
        let (uploader, stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        uploader.upload(items(&ticket, &distinct_lines(2))).await;
        ticket.seal();

        assert_eq!(*sink.calls.lock().expect("lock"), vec![2, 2]);
        assert_eq!(stats.counter(Counter::IndexRetries), 2);
        assert!(ticket.settled().await.is_complete());
    }

    #[tokio::test]
    async fn test_only_transient_items_are_retried() {
        let sink = ScriptedSink::with_script(vec![Ok(Some(ItemOutcome::Transient("429".into())))]);
        let (uploader, _stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        uploader.upload(items(&ticket, &distinct_lines(3))).await;
        ticket.seal();

        assert_eq!(*sink.calls.lock().expect("lock"), vec![3, 1]);
        assert_eq!(sink.documents.lock().expect("lock").len(), 3);
        assert_eq!(ticket.settled().await.indexed, 3);
    }

    #[tokio::test]
    async fn test_rejected_item_is_not_retried() {
        let sink = ScriptedSink::with_script(vec![Ok(Some(ItemOutcome::Rejected("mapping".into())))]);
        let (uploader, stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        uploader.upload(items(&ticket, &distinct_lines(2))).await;
        ticket.seal();

        assert_eq!(*sink.calls.lock().expect("lock"), vec![2]);
        assert_eq!(stats.counter(Counter::IndexErrors), 1);
        let summary = ticket.settled().await;
        assert_eq!((summary.indexed, summary.rejected), (1, 1));
        assert!(summary.is_complete());
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_fails_events() {
        let sink = ScriptedSink::with_script(vec![
            Err(SinkError::Transient("timeout".into())),
            Err(SinkError::Transient("timeout".into())),
            Err(SinkError::Transient("timeout".into())),
        ]);
        let (uploader, stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        uploader.upload(items(&ticket, &distinct_lines(2))).await;
        ticket.seal();

        assert_eq!(sink.calls.lock().expect("lock").len(), 3);
        assert_eq!(stats.counter(Counter::IndexErrors), 2);
        let summary = ticket.settled().await;
        assert_eq!(summary.failed, 2);
        assert!(!summary.is_complete());
    }

    #[tokio::test]
    async fn test_permanent_request_error_fails_batch() {
        let sink = ScriptedSink::with_script(vec![Err(SinkError::Permanent("401".into()))]);
        let (uploader, _stats) = uploader(Arc::clone(&sink));
        let ticket = ObjectTicket::new("a.log");
        uploader.upload(items(&ticket, &distinct_lines(2))).await;
        ticket.seal();

        assert_eq!(sink.calls.lock().expect("lock").len(), 1);
        assert_eq!(ticket.settled().await.failed, 2);
    }

    #[tokio::test]
    async fn test_run_drains_until_closed() {
        let sink = ScriptedSink::with_script(vec![]);
        let stats = Arc::new(StatsRegistry::new());
        let (tx, rx) = EventQueue::new(16, Arc::clone(&stats));
        let uploader = Uploader::new(sink.clone(), rx, Arc::clone(&stats), config());
        let worker = tokio::spawn(async move { uploader.run().await });

        let ticket = ObjectTicket::new("a.log");
        for item in items(&ticket, &distinct_lines(5)) {
            tx.push(item).await.expect("push");
        }
        ticket.seal();
        drop(tx);

        worker.await.expect("worker");
        assert_eq!(ticket.settled().await.indexed, 5);
        assert_eq!(stats.gauge(Gauge::QueueDepth), 0);
        assert_eq!(sink.documents.lock().expect("lock").len(), 5);
    }
}
