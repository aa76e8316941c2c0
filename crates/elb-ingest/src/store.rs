// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object store access partitioned into the search, working and done
//! prefixes.

use crate::error::StoreError;
use crate::fetcher::ObjectState;
use crate::retry::RetryStrategy;
use crate::stats::{Counter, Gauge, StatsRegistry};
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Streaming, buffered reader over an object's bytes.
pub type ObjectReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// The three lifecycle prefixes, stored without a trailing `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefixes {
    search: String,
    working: String,
    done: String,
}

impl Prefixes {
    #[must_use]
    pub fn new(search: &str, working: &str, done: &str) -> Self {
        Self {
            search: normalize(search),
            working: normalize(working),
            done: normalize(done),
        }
    }

    #[must_use]
    pub fn for_state(&self, state: ObjectState) -> &str {
        match state {
            ObjectState::Discovered => &self.search,
            ObjectState::Working => &self.working,
            ObjectState::Done => &self.done,
        }
    }

    /// The same trailing key moved from `from`'s prefix to `to`'s.
    pub fn rekey(&self, key: &str, from: ObjectState, to: ObjectState) -> Result<String, StoreError> {
        let prefix = self.for_state(from);
        let rest = strip(prefix, key).ok_or_else(|| StoreError::OutsidePrefix {
            key: key.to_string(),
            prefix: prefix.to_string(),
        })?;
        Ok(join(self.for_state(to), rest))
    }

    /// Returns a description of the first pair of prefixes that overlap.
    #[must_use]
    pub fn overlap(&self) -> Option<String> {
        let all = [
            ("search", &self.search),
            ("working", &self.working),
            ("done", &self.done),
        ];
        for (i, (a_name, a)) in all.iter().enumerate() {
            for (b_name, b) in &all[i + 1..] {
                if contains(a, b) || contains(b, a) {
                    return Some(format!("{a_name} prefix '{a}' overlaps {b_name} prefix '{b}'"));
                }
            }
        }
        None
    }
}

impl Default for Prefixes {
    fn default() -> Self {
        Self::new("logs/", "logs-working/", "logs-done/")
    }
}

fn normalize(prefix: &str) -> String {
    prefix.trim().trim_matches('/').to_string()
}

fn join(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{prefix}/{rest}")
    }
}

/// The part of `key` below `prefix`, matching whole path segments only.
fn strip<'a>(prefix: &str, key: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(key);
    }
    key.strip_prefix(prefix)?.strip_prefix('/')
}

/// True when everything under `inner` is also under `outer`.
fn contains(outer: &str, inner: &str) -> bool {
    outer.is_empty() || outer == inner || strip(outer, inner).is_some()
}

/// What identifies one write of an object, used to detect an object that
/// changed between listing and claiming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentVersion {
    pub size: u64,
    pub e_tag: Option<String>,
}

impl ContentVersion {
    #[must_use]
    pub fn of(meta: &ObjectMeta) -> Self {
        Self {
            size: meta.size,
            e_tag: meta.e_tag.clone(),
        }
    }

    /// An e-tag only counts when both sides have one.
    #[must_use]
    pub fn matches(&self, other: &ContentVersion) -> bool {
        self.size == other.size
            && match (&self.e_tag, &other.e_tag) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

/// What a relocation does when the destination key is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// The destination must not exist yet, and the source must still be
    /// there when it is deleted. Of several callers moving the same object,
    /// one succeeds and the others get [`StoreError::ClaimLost`].
    Exclusive,
    /// An existing destination is overwritten.
    Replace,
}

#[derive(Debug, Clone)]
pub struct LogStore {
    store: Arc<dyn ObjectStore>,
    prefixes: Prefixes,
    retry: RetryStrategy,
    stats: Arc<StatsRegistry>,
    // never cancelled: a relocation always runs to its end
    uninterrupted: CancellationToken,
}

impl LogStore {
    #[must_use]
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefixes: Prefixes,
        retry: RetryStrategy,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            store,
            prefixes,
            retry,
            stats,
            uninterrupted: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn prefixes(&self) -> &Prefixes {
        &self.prefixes
    }

    /// Runs one object store operation with retries.
    async fn call<T, F, Fut>(&self, operation: &'static str, key: &str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = object_store::Result<T>>,
    {
        self.retried(operation, key, || {
            let call = f();
            async move { call.await.map_err(StoreError::classify) }
        })
        .await
    }

    /// Runs `f` until it succeeds or fails for good, keeping the error
    /// counters and the health gauge current. This is the only retry layer
    /// around store requests.
    async fn retried<T, F, Fut>(&self, operation: &'static str, key: &str, f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let result = self
            .retry
            .run(
                &self.uninterrupted,
                StoreError::is_transient,
                |attempt, e| {
                    self.stats.increment(Counter::StoreRetries, 1);
                    warn!(operation, key, attempt, "object store call failed, retrying: {e}");
                },
                f,
            )
            .await;
        match &result {
            Ok(_) | Err(StoreError::ClaimLost { .. }) => self.stats.set(Gauge::ObjectStoreHealthy, 1),
            Err(e) => {
                self.stats.increment(Counter::StoreErrors, 1);
                if e.is_transient() {
                    self.stats.set(Gauge::ObjectStoreHealthy, 0);
                } else {
                    self.stats.set(Gauge::ObjectStoreHealthy, 1);
                }
            }
        }
        result
    }

    /// Lists up to `limit` objects under the prefix for `state`, in the
    /// store's listing order.
    pub async fn list(&self, state: ObjectState, limit: Option<usize>) -> Result<Vec<ObjectMeta>, StoreError> {
        let prefix = parse_path(self.prefixes.for_state(state))?;
        let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);
        self.call("list", self.prefixes.for_state(state), || {
            let listing = self.store.list(prefix.as_ref());
            match limit {
                Some(limit) => listing.take(limit).try_collect::<Vec<_>>().boxed(),
                None => listing.try_collect::<Vec<_>>().boxed(),
            }
        })
        .await
    }

    pub async fn head(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let path = parse_path(key)?;
        self.call("head", key, || self.store.head(&path)).await
    }

    /// Opens a streaming reader over the object. Only the fetch of the
    /// response is retried; errors while streaming surface as I/O errors.
    pub async fn reader(&self, key: &str) -> Result<ObjectReader, StoreError> {
        let path = parse_path(key)?;
        let result = self.call("get", key, || self.store.get(&path)).await?;
        let stream = result
            .into_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
            .boxed();
        Ok(StreamReader::new(stream))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = parse_path(key)?;
        self.call("delete", key, || self.store.delete(&path)).await
    }

    /// Moves `key` from the `from` prefix to the `to` prefix with
    /// copy-then-delete, returning the new key.
    ///
    /// With `expected` set, the source must still match that version or
    /// nothing is touched. A copy whose size differs from the source is
    /// deleted and copied again. If the source cannot be deleted the copy is
    /// removed, so a failed relocation leaves the object where it was.
    pub async fn relocate(
        &self,
        key: &str,
        from: ObjectState,
        to: ObjectState,
        expected: Option<&ContentVersion>,
        destination: Destination,
    ) -> Result<String, StoreError> {
        let target = self.prefixes.rekey(key, from, to)?;
        let source_meta = self.head(key).await?;
        let source_version = ContentVersion::of(&source_meta);
        if let Some(expected) = expected {
            if !expected.matches(&source_version) {
                return Err(StoreError::VersionChanged {
                    key: key.to_string(),
                });
            }
        }

        let source = parse_path(key)?;
        let target_path = parse_path(&target)?;
        // set once this relocation's own copy has landed
        let copied = AtomicBool::new(false);
        self.retried("copy", key, || {
            self.copy_verified(&source, &target_path, &source_version, destination, &copied)
        })
        .await?;

        match self.delete(key).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                if destination == Destination::Exclusive {
                    // moved by another fetcher, which now owns the copy
                    debug!(key, target, "source vanished during claim");
                    return Err(StoreError::ClaimLost {
                        key: key.to_string(),
                    });
                }
            }
            Err(e) => {
                error!(key, target, "failed to delete source after copy, rolling back: {e}");
                if let Err(rollback) = self.delete(&target).await {
                    error!(key, target, "rollback failed, object exists under both prefixes: {rollback}");
                }
                return Err(e);
            }
        }
        debug!(key, target, "relocated object");
        Ok(target)
    }

    /// One copy attempt, checked against the source size. A short copy is
    /// removed again.
    async fn copy_verified(
        &self,
        from: &Path,
        to: &Path,
        version: &ContentVersion,
        destination: Destination,
        copied: &AtomicBool,
    ) -> Result<(), StoreError> {
        match destination {
            Destination::Replace => self.store.copy(from, to).await.map_err(StoreError::classify)?,
            Destination::Exclusive => self.copy_exclusive(from, to, copied).await?,
        }
        copied.store(true, Ordering::Release);

        let copy = self.store.head(to).await.map_err(StoreError::classify)?;
        if copy.size != version.size {
            warn!(from = %from, to = %to, expected = version.size, actual = copy.size, "copy size mismatch");
            self.store.delete(to).await.map_err(StoreError::classify)?;
            copied.store(false, Ordering::Release);
            return Err(StoreError::TornCopy {
                key: from.to_string(),
            });
        }
        Ok(())
    }

    /// Copies only if `to` is free. Stores without a conditional copy get a
    /// `head` check first, which narrows the race but cannot close it.
    async fn copy_exclusive(&self, from: &Path, to: &Path, copied: &AtomicBool) -> Result<(), StoreError> {
        let lost = || StoreError::ClaimLost {
            key: from.to_string(),
        };
        match self.store.copy_if_not_exists(from, to).await {
            Ok(()) => Ok(()),
            // an earlier attempt of this relocation already wrote it
            Err(object_store::Error::AlreadyExists { .. }) if copied.load(Ordering::Acquire) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => Err(lost()),
            Err(object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented) => {
                match self.store.head(to).await {
                    Ok(_) if copied.load(Ordering::Acquire) => Ok(()),
                    Ok(_) => Err(lost()),
                    Err(object_store::Error::NotFound { .. }) => {
                        self.store.copy(from, to).await.map_err(StoreError::classify)
                    }
                    Err(e) => Err(StoreError::classify(e)),
                }
            }
            Err(e) => Err(StoreError::classify(e)),
        }
    }
}

fn parse_path(key: &str) -> Result<Path, StoreError> {
    Path::parse(key).map_err(|e| StoreError::Permanent(e.into()))
}
