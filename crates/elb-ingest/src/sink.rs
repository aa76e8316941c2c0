// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::{IngestError, SinkError};
use crate::event::IndexDocument;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Result of writing one document of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// No document had this id before.
    Created,
    /// A document with this id existed and was overwritten.
    Replaced,
    /// 429 or 5xx for this item. Worth retrying.
    Transient(String),
    /// Any other item error, e.g. a mapping conflict.
    Rejected(String),
}

/// A search engine that writes documents by id, replacing any document that
/// already has the same id.
#[async_trait]
pub trait SearchSink: Send + Sync {
    /// Writes every document in one request. On success the outcomes are in
    /// the same order as `documents`.
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<Vec<ItemOutcome>, SinkError>;

    /// True when the search engine answers.
    async fn ping(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct ElasticsearchSink {
    client: reqwest::Client,
    base_url: String,
}

impl ElasticsearchSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(270))
            .build()
            .map_err(|e| IngestError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

/// `_bulk` body: an `index` action line followed by the document, for every
/// document. `index` creates or replaces by `_id`.
fn bulk_body(documents: &[IndexDocument]) -> Result<Vec<u8>, SinkError> {
    let mut body = Vec::with_capacity(documents.len() * 1024);
    for document in documents {
        let action = json!({ "index": { "_index": document.index, "_id": document.id } });
        serde_json::to_writer(&mut body, &action)
            .map_err(|e| SinkError::Permanent(format!("failed to serialize action: {e}")))?;
        body.push(b'\n');
        serde_json::to_writer(&mut body, &document.source)
            .map_err(|e| SinkError::Permanent(format!("failed to serialize document: {e}")))?;
        body.push(b'\n');
    }
    Ok(body)
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    status: u16,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

impl BulkItem {
    fn outcome(&self) -> ItemOutcome {
        let reason = || {
            self.error
                .as_ref()
                .map_or_else(|| format!("status {}", self.status), ToString::to_string)
        };
        match self.status {
            200..=299 if self.result.as_deref() == Some("updated") => ItemOutcome::Replaced,
            200..=299 => ItemOutcome::Created,
            429 | 500..=599 => ItemOutcome::Transient(reason()),
            _ => ItemOutcome::Rejected(reason()),
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl SearchSink for ElasticsearchSink {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<Vec<ItemOutcome>, SinkError> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let body = bulk_body(documents)?;
        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("bulk request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("{status}: {text}");
            return Err(if is_transient_status(status) {
                SinkError::Transient(message)
            } else {
                SinkError::Permanent(message)
            });
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| SinkError::Transient(format!("unreadable bulk response: {e}")))?;
        if parsed.items.len() != documents.len() {
            return Err(SinkError::Transient(format!(
                "bulk response has {} items for {} documents",
                parsed.items.len(),
                documents.len()
            )));
        }
        let outcomes: Vec<ItemOutcome> = parsed
            .items
            .iter()
            .map(|item| {
                item.values()
                    .next()
                    .map_or_else(|| ItemOutcome::Transient("empty bulk item".to_string()), BulkItem::outcome)
            })
            .collect();
        debug!(documents = documents.len(), "bulk request done");
        Ok(outcomes)
    }

    async fn ping(&self) -> bool {
        match self.client.head(format!("{}/", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("search engine ping failed: {e}");
                false
            }
        }
    }
}
