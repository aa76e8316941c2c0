// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::IngestError;
use crate::event::IndexPattern;
use crate::fetcher::FetcherConfig;
use crate::logger::LOG_LEVELS;
use crate::parser::DEFAULT_MAX_LINE_BYTES;
use crate::retry::RetryStrategy;
use crate::store::Prefixes;
use crate::uploader::UploaderConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Ingestor configuration, read from `ELB_INGESTOR_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bucket holding the access logs
    pub bucket: String,
    pub search_prefix: String,
    pub working_prefix: String,
    pub done_prefix: String,
    /// Objects claimed and not yet completed, at most
    pub start_queue_size: usize,
    pub event_queue_capacity: usize,
    /// Longer lines are counted as parse errors
    pub max_line_bytes: usize,
    pub elasticsearch_url: String,
    /// strftime pattern of the target index
    pub index_pattern: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub uploader_workers: usize,
    /// Wait between listings when there is nothing to claim
    pub poll_interval: Duration,
    /// Attempts per object store call and per bulk write
    pub max_retries: u32,
    pub retry_base: Duration,
    pub request_timeout: Duration,
    /// Move objects left in the working prefix back to the search prefix at
    /// startup
    pub recover_working: bool,
    /// Process what is in the search prefix, drain and exit
    pub run_once: bool,
    pub listen_host: String,
    pub listen_port: u16,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            search_prefix: "logs/".to_string(),
            working_prefix: "logs-working/".to_string(),
            done_prefix: "logs-done/".to_string(),
            start_queue_size: 5,
            event_queue_capacity: 10_000,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            elasticsearch_url: "http://localhost:9200".to_string(),
            index_pattern: "elb-logs-%Y.%m.%d".to_string(),
            batch_size: 500,
            flush_interval: Duration::from_millis(1000),
            uploader_workers: 2,
            poll_interval: Duration::from_secs(30),
            max_retries: 5,
            retry_base: Duration::from_millis(200),
            request_timeout: Duration::from_secs(30),
            recover_working: false,
            run_once: false,
            listen_host: "localhost".to_string(),
            listen_port: 13131,
            log_level: "info".to_string(),
        }
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

/// Unparseable values fall back to the default.
fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| matches!(val.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

impl Config {
    /// Reads the configuration from the environment and validates it.
    pub fn from_env() -> Result<Self, IngestError> {
        let defaults = Self::default();
        let config = Self {
            bucket: env_string("ELB_INGESTOR_BUCKET", &defaults.bucket),
            search_prefix: env_string("ELB_INGESTOR_SEARCH_PREFIX", &defaults.search_prefix),
            working_prefix: env_string("ELB_INGESTOR_WORKING_PREFIX", &defaults.working_prefix),
            done_prefix: env_string("ELB_INGESTOR_DONE_PREFIX", &defaults.done_prefix),
            start_queue_size: env_parse("ELB_START_QUEUE_SIZE", defaults.start_queue_size),
            event_queue_capacity: env_parse(
                "ELB_INGESTOR_EVENT_QUEUE_CAPACITY",
                defaults.event_queue_capacity,
            ),
            max_line_bytes: env_parse("ELB_INGESTOR_MAX_LINE_BYTES", defaults.max_line_bytes),
            elasticsearch_url: env_string(
                "ELB_INGESTOR_ELASTICSEARCH_URL",
                &defaults.elasticsearch_url,
            ),
            index_pattern: env_string("ELB_INGESTOR_INDEX_PATTERN", &defaults.index_pattern),
            batch_size: env_parse("ELB_INGESTOR_BATCH_SIZE", defaults.batch_size),
            flush_interval: Duration::from_millis(env_parse(
                "ELB_INGESTOR_FLUSH_INTERVAL_MS",
                1000,
            )),
            uploader_workers: env_parse("ELB_INGESTOR_UPLOADER_WORKERS", defaults.uploader_workers),
            poll_interval: Duration::from_secs(env_parse("ELB_INGESTOR_POLL_INTERVAL_SECS", 30)),
            max_retries: env_parse("ELB_INGESTOR_MAX_RETRIES", defaults.max_retries),
            retry_base: Duration::from_millis(env_parse("ELB_INGESTOR_RETRY_BASE_MS", 200)),
            request_timeout: Duration::from_secs(env_parse(
                "ELB_INGESTOR_REQUEST_TIMEOUT_SECS",
                30,
            )),
            recover_working: env_bool("ELB_INGESTOR_RECOVER_WORKING", defaults.recover_working),
            run_once: env_bool("ELB_INGESTOR_RUN_ONCE", defaults.run_once),
            listen_host: env_string("ELB_INGESTOR_LISTEN_HOST", &defaults.listen_host),
            listen_port: env_parse("ELB_INGESTOR_LISTEN_PORT", defaults.listen_port),
            log_level: env_string("ELB_INGESTOR_LOG_LEVEL", &defaults.log_level)
                .trim()
                .to_lowercase(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), IngestError> {
        if self.bucket.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "ELB_INGESTOR_BUCKET must be set".to_string(),
            ));
        }

        for (name, prefix) in [
            ("search", &self.search_prefix),
            ("working", &self.working_prefix),
            ("done", &self.done_prefix),
        ] {
            if prefix.trim().trim_matches('/').is_empty() {
                return Err(IngestError::InvalidConfig(format!(
                    "{name} prefix cannot be empty"
                )));
            }
        }
        if let Some(overlap) = self.prefixes().overlap() {
            return Err(IngestError::InvalidConfig(overlap));
        }

        for (name, value) in [
            ("ELB_START_QUEUE_SIZE", self.start_queue_size),
            ("ELB_INGESTOR_EVENT_QUEUE_CAPACITY", self.event_queue_capacity),
            ("ELB_INGESTOR_MAX_LINE_BYTES", self.max_line_bytes),
            ("ELB_INGESTOR_BATCH_SIZE", self.batch_size),
            ("ELB_INGESTOR_UPLOADER_WORKERS", self.uploader_workers),
        ] {
            if value == 0 {
                return Err(IngestError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.max_retries == 0 {
            return Err(IngestError::InvalidConfig(
                "ELB_INGESTOR_MAX_RETRIES must be greater than 0".to_string(),
            ));
        }

        IndexPattern::new(&self.index_pattern)?;

        if self.elasticsearch_url.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "ELB_INGESTOR_ELASTICSEARCH_URL cannot be empty".to_string(),
            ));
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(IngestError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn prefixes(&self) -> Prefixes {
        Prefixes::new(&self.search_prefix, &self.working_prefix, &self.done_prefix)
    }

    #[must_use]
    pub fn retry(&self) -> RetryStrategy {
        RetryStrategy::Exponential {
            attempts: self.max_retries,
            base: self.retry_base,
            max: MAX_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            concurrency: self.start_queue_size,
            poll_interval: self.poll_interval,
        }
    }

    pub fn uploader_config(&self) -> Result<UploaderConfig, IngestError> {
        Ok(UploaderConfig {
            batch_size: self.batch_size,
            flush_interval: self.flush_interval,
            retry: self.retry(),
            index_pattern: IndexPattern::new(&self.index_pattern)?,
        })
    }
}
