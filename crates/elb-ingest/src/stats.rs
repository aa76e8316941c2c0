// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide counters and gauges.
//!
//! Every value is a single atomic, so `increment`, `set` and `add` never block
//! and the registry can be shared by any number of workers through an `Arc`.
//! A [`StatsSnapshot`] copies each value with a relaxed load: every individual
//! value is exact, but two values are not guaranteed to come from the same
//! instant (e.g. `events_indexed` may briefly exceed `events_queued` as seen
//! by the reader).

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic counters. They only ever grow for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    LinesParsed,
    ParseErrors,
    EventsQueued,
    EventsIndexed,
    DocumentsReplaced,
    IndexErrors,
    IndexRetries,
    ObjectsDiscovered,
    ObjectsFetched,
    ObjectsCompleted,
    ObjectsFailed,
    ObjectsSkipped,
    StoreErrors,
    StoreRetries,
}

impl Counter {
    pub const ALL: [Counter; 14] = [
        Counter::LinesParsed,
        Counter::ParseErrors,
        Counter::EventsQueued,
        Counter::EventsIndexed,
        Counter::DocumentsReplaced,
        Counter::IndexErrors,
        Counter::IndexRetries,
        Counter::ObjectsDiscovered,
        Counter::ObjectsFetched,
        Counter::ObjectsCompleted,
        Counter::ObjectsFailed,
        Counter::ObjectsSkipped,
        Counter::StoreErrors,
        Counter::StoreRetries,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Counter::LinesParsed => "lines_parsed",
            Counter::ParseErrors => "parse_errors",
            Counter::EventsQueued => "events_queued",
            Counter::EventsIndexed => "events_indexed",
            Counter::DocumentsReplaced => "documents_replaced",
            Counter::IndexErrors => "index_errors",
            Counter::IndexRetries => "index_retries",
            Counter::ObjectsDiscovered => "objects_discovered",
            Counter::ObjectsFetched => "objects_fetched",
            Counter::ObjectsCompleted => "objects_completed",
            Counter::ObjectsFailed => "objects_failed",
            Counter::ObjectsSkipped => "objects_skipped",
            Counter::StoreErrors => "store_errors",
            Counter::StoreRetries => "store_retries",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Gauges reflect current state and may move in either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    QueueDepth,
    ObjectsInFlight,
    /// 1 when the last object store operation succeeded, 0 otherwise.
    ObjectStoreHealthy,
    /// Unix seconds, 0 when nothing was fetched yet.
    LastObjectFetchedAt,
    /// Unix seconds, 0 when nothing was indexed yet.
    LastDocumentIndexedAt,
}

impl Gauge {
    pub const ALL: [Gauge; 5] = [
        Gauge::QueueDepth,
        Gauge::ObjectsInFlight,
        Gauge::ObjectStoreHealthy,
        Gauge::LastObjectFetchedAt,
        Gauge::LastDocumentIndexedAt,
    ];

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Gauge::QueueDepth => "queue_depth",
            Gauge::ObjectsInFlight => "objects_in_flight",
            Gauge::ObjectStoreHealthy => "object_store_healthy",
            Gauge::LastObjectFetchedAt => "last_object_fetched_at",
            Gauge::LastDocumentIndexedAt => "last_document_indexed_at",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug)]
pub struct StatsRegistry {
    counters: [AtomicU64; Counter::ALL.len()],
    gauges: [AtomicI64; Gauge::ALL.len()],
    started_at: Instant,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
            gauges: std::array::from_fn(|_| AtomicI64::new(0)),
            started_at: Instant::now(),
        }
    }

    pub fn increment(&self, counter: Counter, delta: u64) {
        self.counters[counter.index()].fetch_add(delta, Ordering::Relaxed);
    }

    pub fn set(&self, gauge: Gauge, value: i64) {
        self.gauges[gauge.index()].store(value, Ordering::Relaxed);
    }

    pub fn add(&self, gauge: Gauge, delta: i64) {
        self.gauges[gauge.index()].fetch_add(delta, Ordering::Relaxed);
    }

    /// Stores the current wall clock time, in unix seconds, into `gauge`.
    pub fn mark_now(&self, gauge: Gauge) {
        self.set(gauge, chrono::Utc::now().timestamp());
    }

    #[must_use]
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn gauge(&self, gauge: Gauge) -> i64 {
        self.gauges[gauge.index()].load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            counters: std::array::from_fn(|i| self.counters[i].load(Ordering::Relaxed)),
            gauges: std::array::from_fn(|i| self.gauges[i].load(Ordering::Relaxed)),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Immutable copy of every counter and gauge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    counters: [u64; Counter::ALL.len()],
    gauges: [i64; Gauge::ALL.len()],
    uptime_secs: u64,
}

impl StatsSnapshot {
    #[must_use]
    pub fn counter(&self, counter: Counter) -> u64 {
        self.counters[counter.index()]
    }

    #[must_use]
    pub fn gauge(&self, gauge: Gauge) -> i64 {
        self.gauges[gauge.index()]
    }
}

impl Serialize for StatsSnapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(Counter::ALL.len() + Gauge::ALL.len() + 1))?;
        for counter in Counter::ALL {
            map.serialize_entry(counter.name(), &self.counter(counter))?;
        }
        for gauge in Gauge::ALL {
            map.serialize_entry(gauge.name(), &self.gauge(gauge))?;
        }
        map.serialize_entry("uptime_secs", &self.uptime_secs)?;
        map.end()
    }
}
