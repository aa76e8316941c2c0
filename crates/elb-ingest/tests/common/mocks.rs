// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory search engine and object store for testing

#![allow(dead_code)]

use async_trait::async_trait;
use elb_ingest::error::SinkError;
use elb_ingest::event::IndexDocument;
use elb_ingest::sink::{ItemOutcome, SearchSink};
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore,
    PutMultipartOptions, PutOptions, PutPayload, PutResult,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Barrier;

/// Keeps documents by id, replacing on a repeated id like the real engine.
#[derive(Default)]
pub struct MemorySink {
    documents: Mutex<HashMap<String, (String, Value)>>,
    writes: Mutex<usize>,
}

impl MemorySink {
    pub fn len(&self) -> usize {
        self.documents.lock().expect("lock").len()
    }

    /// Every write of a document, replacements included.
    pub fn writes(&self) -> usize {
        *self.writes.lock().expect("lock")
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.lock().expect("lock").keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn get(&self, id: &str) -> Option<(String, Value)> {
        self.documents.lock().expect("lock").get(id).cloned()
    }
}

#[async_trait]
impl SearchSink for MemorySink {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<Vec<ItemOutcome>, SinkError> {
        let mut stored = self.documents.lock().expect("lock");
        *self.writes.lock().expect("lock") += documents.len();
        Ok(documents
            .iter()
            .map(|document| {
                let previous = stored.insert(
                    document.id.clone(),
                    (document.index.clone(), document.source.clone()),
                );
                if previous.is_some() {
                    ItemOutcome::Replaced
                } else {
                    ItemOutcome::Created
                }
            })
            .collect())
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Writes like [`MemorySink`], but every request takes `delay`.
pub struct SlowSink {
    pub inner: Arc<MemorySink>,
    pub delay: Duration,
}

#[async_trait]
impl SearchSink for SlowSink {
    async fn bulk_upsert(&self, documents: &[IndexDocument]) -> Result<Vec<ItemOutcome>, SinkError> {
        tokio::time::sleep(self.delay).await;
        self.inner.bulk_upsert(documents).await
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// An in-memory bucket with faults injected into chosen calls.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: Arc<InMemory>,
    /// Copies out of this key always fail with a transient error.
    pub broken_copy: Option<String>,
    /// Conditional copies wait here after copying, so racing claims have
    /// both copied before either deletes its source.
    pub copy_gate: Option<Arc<Barrier>>,
    /// Deleting this key works, but reports the key as already gone.
    pub vanished_on_delete: Option<String>,
    pub copy_attempts: Mutex<HashMap<String, usize>>,
}

impl FaultyStore {
    /// Copy requests made with `key` as the source.
    pub fn copy_attempts(&self, key: &str) -> usize {
        self.copy_attempts
            .lock()
            .expect("lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn before_copy(&self, from: &Path) -> object_store::Result<()> {
        *self
            .copy_attempts
            .lock()
            .expect("lock")
            .entry(from.to_string())
            .or_default() += 1;
        if self.broken_copy.as_deref() == Some(from.as_ref()) {
            return Err(object_store::Error::Generic {
                store: "FaultyStore",
                source: "connection reset by peer".into(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FaultyStore")
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    async fn put_opts(
        &self,
        location: &Path,
        payload: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        self.inner.put_opts(location, payload, opts).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOptions,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(&self, location: &Path, options: GetOptions) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        self.inner.delete(location).await?;
        if self.vanished_on_delete.as_deref() == Some(location.as_ref()) {
            return Err(object_store::Error::NotFound {
                path: location.to_string(),
                source: "deleted by another client".into(),
            });
        }
        Ok(())
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'static, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(&self, prefix: Option<&Path>) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.before_copy(from)?;
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.before_copy(from)?;
        let result = self.inner.copy_if_not_exists(from, to).await;
        if let Some(gate) = &self.copy_gate {
            gate.wait().await;
        }
        result
    }
}
