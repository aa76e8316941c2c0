// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use elb_ingest::config::Config;
use elb_ingest::health::HealthExporter;
use elb_ingest::pipeline::Pipeline;
use elb_ingest::sink::ElasticsearchSink;
use elb_ingest::stats::Counter;
use elb_ingest::{log_build_info, logger};
use object_store::aws::AmazonS3Builder;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ELB_INGESTOR | ERROR | invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = logger::init(&config.log_level) {
        eprintln!("ELB_INGESTOR | ERROR | {e}");
        return ExitCode::FAILURE;
    }
    log_build_info();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let store = AmazonS3Builder::from_env()
        .with_bucket_name(&config.bucket)
        .build()
        .context("failed to configure the object store")?;
    let sink = ElasticsearchSink::new(&config.elasticsearch_url, config.request_timeout)
        .context("failed to configure the search engine client")?;

    let run_once = config.run_once;
    let (listen_host, listen_port) = (config.listen_host.clone(), config.listen_port);
    let pipeline = Pipeline::new(config, Arc::new(store), Arc::new(sink))?;
    pipeline
        .check_connectivity()
        .await
        .context("startup connectivity check failed")?;

    let cancel = CancellationToken::new();
    let listener = HealthExporter::bind(&listen_host, listen_port).await?;
    let health = tokio::spawn(pipeline.health_exporter().serve(listener, cancel.child_token()));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown requested, finishing in-flight objects");
        signal_cancel.cancel();
    });

    let snapshot = if run_once {
        pipeline.run_once(cancel.clone()).await
    } else {
        pipeline.run(cancel.clone()).await
    };
    cancel.cancel();
    if let Ok(Err(e)) = health.await {
        error!("health server stopped with an error: {e}");
    }

    info!(
        objects_completed = snapshot.counter(Counter::ObjectsCompleted),
        objects_failed = snapshot.counter(Counter::ObjectsFailed),
        events_indexed = snapshot.counter(Counter::EventsIndexed),
        parse_errors = snapshot.counter(Counter::ParseErrors),
        "ingestor stopped"
    );
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            error!("failed to listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
