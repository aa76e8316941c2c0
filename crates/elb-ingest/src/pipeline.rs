// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::config::Config;
use crate::error::IngestError;
use crate::fetcher::{Fetcher, ObjectState};
use crate::health::HealthExporter;
use crate::parser::LogParser;
use crate::queue::EventQueue;
use crate::sink::SearchSink;
use crate::stats::{Counter, StatsRegistry, StatsSnapshot};
use crate::store::LogStore;
use crate::uploader::{Uploader, UploaderConfig};
use object_store::ObjectStore;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Owns the shared stats and wires fetcher, parsers, queue and uploaders
/// together for one run.
pub struct Pipeline {
    config: Config,
    uploader_config: UploaderConfig,
    store: LogStore,
    sink: Arc<dyn SearchSink>,
    stats: Arc<StatsRegistry>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        store: Arc<dyn ObjectStore>,
        sink: Arc<dyn SearchSink>,
    ) -> Result<Self, IngestError> {
        config.validate()?;
        let stats = Arc::new(StatsRegistry::new());
        let uploader_config = config.uploader_config()?;
        let store = LogStore::new(store, config.prefixes(), config.retry(), Arc::clone(&stats));
        Ok(Self {
            config,
            uploader_config,
            store,
            sink,
            stats,
        })
    }

    #[must_use]
    pub fn stats(&self) -> Arc<StatsRegistry> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn health_exporter(&self) -> HealthExporter {
        HealthExporter::new(Arc::clone(&self.stats), Arc::clone(&self.sink))
    }

    /// One listing call and one search engine ping. Either failing is fatal
    /// at startup.
    pub async fn check_connectivity(&self) -> Result<(), IngestError> {
        self.store
            .list(ObjectState::Discovered, Some(1))
            .await
            .map_err(|e| IngestError::ObjectStoreUnreachable(e.to_string()))?;
        if !self.sink.ping().await {
            return Err(IngestError::SearchEngineUnreachable(
                self.config.elasticsearch_url.clone(),
            ));
        }
        debug!("object store and search engine reachable");
        Ok(())
    }

    /// Runs until `cancel` fires, then finishes in-flight objects and drains
    /// queued events before returning.
    pub async fn run(&self, cancel: CancellationToken) -> StatsSnapshot {
        self.execute(cancel, false).await
    }

    /// Processes every object currently in the search prefix, drains and
    /// returns.
    pub async fn run_once(&self, cancel: CancellationToken) -> StatsSnapshot {
        self.execute(cancel, true).await
    }

    async fn execute(&self, cancel: CancellationToken, once: bool) -> StatsSnapshot {
        let (sender, receiver) =
            EventQueue::new(self.config.event_queue_capacity, Arc::clone(&self.stats));
        let fetcher = Fetcher::new(
            self.store.clone(),
            LogParser::new(Arc::clone(&self.stats)).with_max_line_bytes(self.config.max_line_bytes),
            sender,
            Arc::clone(&self.stats),
            self.config.fetcher_config(),
        );

        if self.config.recover_working {
            match fetcher.recover_working().await {
                Ok(0) => {}
                Ok(recovered) => info!(recovered, "moved objects back from the working prefix"),
                Err(e) => warn!("failed to recover the working prefix: {e}"),
            }
        }

        let uploader = Uploader::new(
            Arc::clone(&self.sink),
            receiver,
            Arc::clone(&self.stats),
            self.uploader_config.clone(),
        );
        let mut uploaders = JoinSet::new();
        for _ in 0..self.config.uploader_workers.max(1) {
            let uploader = uploader.clone();
            uploaders.spawn(async move { uploader.run().await });
        }
        drop(uploader);

        info!(
            concurrency = self.config.start_queue_size,
            uploaders = self.config.uploader_workers,
            "pipeline started"
        );
        if once {
            fetcher.run_until_idle(cancel).await;
        } else {
            fetcher.run(cancel).await;
        }
        // last sender gone: uploaders drain the queue and stop
        drop(fetcher);

        while let Some(finished) = uploaders.join_next().await {
            if let Err(e) = finished {
                error!("uploader task failed: {e}");
            }
        }
        let snapshot = self.stats.snapshot();
        info!(
            objects_completed = snapshot.counter(Counter::ObjectsCompleted),
            events_indexed = snapshot.counter(Counter::EventsIndexed),
            "pipeline stopped"
        );
        snapshot
    }
}
