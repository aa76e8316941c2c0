// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Object discovery and the discovered → working → done lifecycle.
//!
//! An object is claimed (moved into the working prefix) before a single byte
//! of it is read, so no two fetchers can ever parse the same object at once.
//! It only moves on to done after its [`ObjectTicket`] settles without
//! failures, i.e. after every one of its events has been written. Anything
//! that goes wrong on the way leaves the object where it is: in the search
//! prefix if the claim failed, in the working prefix otherwise.

use crate::delivery::ObjectTicket;
use crate::error::{FetchError, StoreError};
use crate::parser::LogParser;
use crate::queue::EventSender;
use crate::stats::{Counter, Gauge, StatsRegistry};
use crate::store::{ContentVersion, Destination, LogStore, ObjectReader};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    Discovered,
    Working,
    Done,
}

impl ObjectState {
    /// Only forward moves are allowed. An operator putting a done object
    /// back into the search prefix creates a new `Discovered` object.
    #[must_use]
    pub fn can_transition_to(self, next: ObjectState) -> bool {
        matches!(
            (self, next),
            (ObjectState::Discovered, ObjectState::Working) | (ObjectState::Working, ObjectState::Done)
        )
    }
}

/// One stored log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogObject {
    key: String,
    state: ObjectState,
    version: ContentVersion,
}

impl LogObject {
    #[must_use]
    pub fn new(key: impl Into<String>, version: ContentVersion) -> Self {
        Self {
            key: key.into(),
            state: ObjectState::Discovered,
            version,
        }
    }

    /// Current key, under the prefix of the current state.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn state(&self) -> ObjectState {
        self.state
    }

    #[must_use]
    pub fn version(&self) -> &ContentVersion {
        &self.version
    }

    fn check_transition(&self, to: ObjectState) -> Result<(), FetchError> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(FetchError::InvalidTransition {
                key: self.key.clone(),
                from: self.state,
                to,
            })
        }
    }
}

/// What happened to one claimed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectOutcome {
    /// Moved to done.
    Completed,
    /// Left in the working prefix.
    Failed,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Objects claimed but not yet completed or failed, at most.
    pub concurrency: usize,
    /// Wait between listings when the search prefix is empty.
    pub poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            poll_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    store: LogStore,
    parser: LogParser,
    queue: EventSender,
    stats: Arc<StatsRegistry>,
    config: FetcherConfig,
}

impl Fetcher {
    #[must_use]
    pub fn new(
        store: LogStore,
        parser: LogParser,
        queue: EventSender,
        stats: Arc<StatsRegistry>,
        config: FetcherConfig,
    ) -> Self {
        Self {
            store,
            parser,
            queue,
            stats,
            config,
        }
    }

    /// Lists up to `limit` objects in the search prefix. Listing again is
    /// harmless: anything already claimed has left the prefix.
    pub async fn discover(&self, limit: usize) -> Result<Vec<LogObject>, FetchError> {
        let listed = self
            .store
            .list(ObjectState::Discovered, Some(limit))
            .await?;
        Ok(listed
            .iter()
            .map(|meta| LogObject::new(meta.location.as_ref(), ContentVersion::of(meta)))
            .collect())
    }

    /// Moves the object into the working prefix, then opens it for reading.
    /// Refuses with [`StoreError::VersionChanged`] if the object was
    /// rewritten since it was discovered, and with [`StoreError::ClaimLost`]
    /// if another fetcher got to it first.
    pub async fn claim(&self, object: &mut LogObject) -> Result<ObjectReader, FetchError> {
        object.check_transition(ObjectState::Working)?;
        let working_key = self
            .store
            .relocate(
                &object.key,
                ObjectState::Discovered,
                ObjectState::Working,
                Some(&object.version),
                Destination::Exclusive,
            )
            .await?;
        object.key = working_key;
        object.state = ObjectState::Working;
        self.stats.increment(Counter::ObjectsFetched, 1);
        self.stats.mark_now(Gauge::LastObjectFetchedAt);
        Ok(self.store.reader(&object.key).await?)
    }

    /// Moves a working object into the done prefix. Only call this once every
    /// event of the object has been written.
    pub async fn complete(&self, object: &mut LogObject) -> Result<(), FetchError> {
        object.check_transition(ObjectState::Done)?;
        let done_key = self
            .store
            .relocate(
                &object.key,
                ObjectState::Working,
                ObjectState::Done,
                None,
                Destination::Replace,
            )
            .await?;
        object.key = done_key;
        object.state = ObjectState::Done;
        Ok(())
    }

    /// Moves every object left in the working prefix back to the search
    /// prefix. Returns how many were moved.
    pub async fn recover_working(&self) -> Result<usize, FetchError> {
        let stranded = self.store.list(ObjectState::Working, None).await?;
        let mut recovered = 0;
        for meta in stranded {
            let key = meta.location.as_ref();
            match self
                .store
                .relocate(
                    key,
                    ObjectState::Working,
                    ObjectState::Discovered,
                    None,
                    Destination::Replace,
                )
                .await
            {
                Ok(search_key) => {
                    info!(key, search_key, "recovered object from working prefix");
                    recovered += 1;
                }
                Err(e) => warn!(key, "could not recover object from working prefix: {e}"),
            }
        }
        Ok(recovered)
    }

    /// Parses a claimed object and, once every event has been written,
    /// completes it.
    pub async fn ingest(&self, mut object: LogObject, reader: ObjectReader) -> ObjectOutcome {
        let ticket = ObjectTicket::new(object.key());
        if let Err(e) = self
            .parser
            .parse_object(object.key(), reader, &ticket, &self.queue)
            .await
        {
            error!(key = object.key(), "failed to parse object, leaving it in working: {e}");
            self.stats.increment(Counter::ObjectsFailed, 1);
            return ObjectOutcome::Failed;
        }

        let delivery = ticket.settled().await;
        if !delivery.is_complete() {
            error!(
                key = object.key(),
                failed = delivery.failed,
                registered = delivery.registered,
                "events were not written, leaving object in working"
            );
            self.stats.increment(Counter::ObjectsFailed, 1);
            return ObjectOutcome::Failed;
        }

        match self.complete(&mut object).await {
            Ok(()) => {
                debug!(
                    key = object.key(),
                    indexed = delivery.indexed,
                    rejected = delivery.rejected,
                    "object done"
                );
                self.stats.increment(Counter::ObjectsCompleted, 1);
                ObjectOutcome::Completed
            }
            Err(e) => {
                error!(key = object.key(), "failed to complete object, leaving it in working: {e}");
                self.stats.increment(Counter::ObjectsFailed, 1);
                ObjectOutcome::Failed
            }
        }
    }

    /// Keeps claiming and ingesting objects, at most `concurrency` at a time,
    /// until `cancel` fires. In-flight objects are always finished.
    pub async fn run(&self, cancel: CancellationToken) {
        self.drive(cancel, false).await;
    }

    /// Ingests everything currently in the search prefix, then returns.
    pub async fn run_until_idle(&self, cancel: CancellationToken) {
        self.drive(cancel, true).await;
    }

    async fn drive(&self, cancel: CancellationToken, stop_when_idle: bool) {
        let concurrency = self.config.concurrency.max(1);
        let slots = Arc::new(Semaphore::new(concurrency));
        let mut in_flight: JoinSet<ObjectOutcome> = JoinSet::new();
        let mut backlog = Backlog::default();
        let mut tally = Tally::default();

        while !cancel.is_cancelled() {
            let free = slots.available_permits();
            if free == 0 {
                tokio::select! {
                    finished = in_flight.join_next() => tally.record(finished),
                    () = cancel.cancelled() => {}
                }
                continue;
            }

            let limit = free + backlog.skipped();
            let discovered = match self.discover(limit).await {
                Ok(objects) => {
                    let fresh = backlog.observe(&objects, objects.len() < limit);
                    self.stats.increment(Counter::ObjectsDiscovered, fresh);
                    objects
                }
                Err(e) => {
                    error!("failed to list objects: {e}");
                    Vec::new()
                }
            };
            let candidates: Vec<LogObject> = discovered
                .into_iter()
                .filter(|object| !backlog.is_skipped(object))
                .take(free)
                .collect();

            // nothing left to try in this pass
            if candidates.is_empty() {
                if stop_when_idle && in_flight.is_empty() {
                    break;
                }
                tokio::select! {
                    finished = in_flight.join_next(), if !in_flight.is_empty() => tally.record(finished),
                    () = tokio::time::sleep(self.config.poll_interval), if !stop_when_idle => {
                        backlog.next_pass();
                    }
                    () = cancel.cancelled() => {}
                }
                continue;
            }

            for mut object in candidates {
                if cancel.is_cancelled() {
                    break;
                }
                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    break;
                };
                let search_key = object.key().to_string();
                match self.claim(&mut object).await {
                    Ok(reader) => {
                        backlog.claimed(&search_key);
                        self.stats.add(Gauge::ObjectsInFlight, 1);
                        let fetcher = self.clone();
                        in_flight.spawn(async move {
                            let outcome = fetcher.ingest(object, reader).await;
                            fetcher.stats.add(Gauge::ObjectsInFlight, -1);
                            drop(permit);
                            outcome
                        });
                    }
                    Err(e) => self.claim_failed(&search_key, &object, &e, &mut backlog),
                }
            }
        }

        while let Some(finished) = in_flight.join_next().await {
            tally.record(Some(finished));
        }
        info!(
            completed = tally.completed,
            failed = tally.failed,
            "fetcher stopped"
        );
    }

    fn claim_failed(&self, key: &str, object: &LogObject, error: &FetchError, backlog: &mut Backlog) {
        match error {
            e if object.state() == ObjectState::Working => {
                error!(key = object.key(), "claimed object could not be opened, leaving it in working: {e}");
                self.stats.increment(Counter::ObjectsFailed, 1);
                backlog.claimed(key);
            }
            FetchError::Store(StoreError::VersionChanged { .. }) => {
                info!(key, "object changed since listing, will retry on next listing");
                self.stats.increment(Counter::ObjectsSkipped, 1);
                // the next listing carries the new version, which is not deferred
                backlog.defer(object);
            }
            FetchError::Store(StoreError::ClaimLost { .. }) => {
                debug!(key, "object claimed by another fetcher");
                self.stats.increment(Counter::ObjectsSkipped, 1);
                // normally gone by the next listing
                backlog.defer(object);
            }
            e if e.is_not_found() => {
                debug!(key, "object vanished before it could be claimed");
                self.stats.increment(Counter::ObjectsSkipped, 1);
                backlog.claimed(key);
            }
            FetchError::Store(e) if e.is_transient() => {
                warn!(key, "could not claim object, will retry on next pass: {e}");
                backlog.defer(object);
            }
            e => {
                error!(key, "could not claim object, leaving it in place: {e}");
                self.stats.increment(Counter::ObjectsFailed, 1);
                backlog.refuse(object);
            }
        }
    }
}

/// What the fetch loop remembers about listed objects it has not claimed.
///
/// A pass ends when a listing turns up no candidate. Deferred objects are
/// retried in the next pass; refused ones only once they are rewritten.
#[derive(Debug, Default)]
struct Backlog {
    /// Counted as discovered, by key and version.
    seen: HashMap<String, ContentVersion>,
    refused: HashMap<String, ContentVersion>,
    deferred: HashMap<String, ContentVersion>,
}

impl Backlog {
    /// Objects a listing returns that will not be tried.
    fn skipped(&self) -> usize {
        self.refused.len() + self.deferred.len()
    }

    fn is_skipped(&self, object: &LogObject) -> bool {
        [&self.refused, &self.deferred]
            .iter()
            .any(|skipped| skipped.get(object.key()) == Some(object.version()))
    }

    /// Records a listing and returns how many objects in it were not seen
    /// before. A `complete` listing covers the whole prefix, so whatever is
    /// remembered but missing from it is gone.
    fn observe(&mut self, listed: &[LogObject], complete: bool) -> u64 {
        if complete {
            let present: HashSet<&str> = listed.iter().map(LogObject::key).collect();
            for remembered in [&mut self.seen, &mut self.refused, &mut self.deferred] {
                remembered.retain(|key, _| present.contains(key.as_str()));
            }
        }
        let mut fresh = 0;
        for object in listed {
            if self.seen.get(object.key()) != Some(object.version()) {
                self.seen
                    .insert(object.key().to_string(), object.version().clone());
                fresh += 1;
            }
        }
        fresh
    }

    fn defer(&mut self, object: &LogObject) {
        self.deferred
            .insert(object.key().to_string(), object.version().clone());
    }

    fn refuse(&mut self, object: &LogObject) {
        self.refused
            .insert(object.key().to_string(), object.version().clone());
    }

    /// The key has left the search prefix.
    fn claimed(&mut self, key: &str) {
        self.seen.remove(key);
        self.refused.remove(key);
        self.deferred.remove(key);
    }

    fn next_pass(&mut self) {
        self.deferred.clear();
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    failed: u64,
}

impl Tally {
    fn record(&mut self, finished: Option<Result<ObjectOutcome, JoinError>>) {
        match finished {
            Some(Ok(ObjectOutcome::Completed)) => self.completed += 1,
            Some(Ok(ObjectOutcome::Failed)) => self.failed += 1,
            Some(Err(e)) => {
                error!("object task failed: {e}");
                self.failed += 1;
            }
            None => {}
        }
    }
}
