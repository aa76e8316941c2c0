// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # ELB log ingestion
//!
//! Moves load balancer access logs from an object store into a search engine
//! without ever silently losing a line.
//!
//! ## Architecture
//!
//! ```text
//!   search prefix ──claim──> working prefix ──complete──> done prefix
//!                                 │
//!                                 v
//!                           ┌───────────┐
//!                           │  Parser   │  (one per in-flight object)
//!                           └─────┬─────┘
//!                                 │ bounded EventQueue (backpressure)
//!                                 v
//!                           ┌───────────┐
//!                           │ Uploader  │  (bulk upsert by deterministic id)
//!                           └─────┬─────┘
//!                                 v
//!                           search engine
//! ```
//!
//! Delivery is at-least-once. Duplicate attempts are harmless because every
//! document is written with an id derived from the raw log line, so a replay
//! replaces the existing document instead of adding a second one.
//!
//! - [`fetcher`]: object discovery and the discovered → working → done lifecycle
//! - [`parser`]: streaming line parser producing typed [`record`]s
//! - [`queue`]: bounded hand-off between parsers and uploaders
//! - [`uploader`]: batching, id derivation and retrying bulk writes via a [`sink`]
//! - [`delivery`]: per-object reconciliation gating the move to done
//! - [`stats`]: lock-free counters and gauges read by [`health`]

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

/// Environment configuration and validation
pub mod config;

/// Per-object delivery reconciliation
pub mod delivery;

/// Error types
pub mod error;

/// Parsed log events and their search documents
pub mod event;

/// Object discovery, claiming and completion
pub mod fetcher;

/// Health and stats HTTP endpoint
pub mod health;

/// Logging setup
pub mod logger;

/// Access log line parser
pub mod parser;

/// Wiring of all pipeline components
pub mod pipeline;

/// Bounded event queue between parsers and uploaders
pub mod queue;

/// Typed access log records
pub mod record;

/// Retry strategies with backoff
pub mod retry;

/// Search engine sinks
pub mod sink;

/// Process-wide counters and gauges
pub mod stats;

/// Object store access and prefix relocation
pub mod store;

/// Batching bulk uploader
pub mod uploader;

/// Value of the `@shipper.name` field on every indexed document.
pub const SHIPPER_NAME: &str = "elb_log_ingestor";

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn log_build_info() {
    tracing::info!("{} version: {}", SHIPPER_NAME, VERSION);
}
