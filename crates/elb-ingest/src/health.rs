// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::IngestError;
use crate::sink::SearchSink;
use crate::stats::{Gauge, StatsRegistry};
use bytes::Bytes;
use http_body_util::Full;
use hyper::service::service_fn;
use hyper::{http, Method, Request, Response, StatusCode};
use serde_json::json;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

const STATS_ENDPOINT_PATH: &str = "/stats";
const HEALTH_ENDPOINT_PATH: &str = "/health";

pub type HttpResponse = Response<Full<Bytes>>;

/// Read-only HTTP view of the pipeline: counters on `/stats`, connectivity
/// on `/health`.
#[derive(Clone)]
pub struct HealthExporter {
    stats: Arc<StatsRegistry>,
    sink: Arc<dyn SearchSink>,
}

impl HealthExporter {
    #[must_use]
    pub fn new(stats: Arc<StatsRegistry>, sink: Arc<dyn SearchSink>) -> Self {
        Self { stats, sink }
    }

    pub async fn bind(host: &str, port: u16) -> Result<TcpListener, IngestError> {
        let addr = listen_addr(host, port)
            .ok_or_else(|| IngestError::HealthServer(format!("invalid listen host '{host}'")))?;
        TcpListener::bind(addr)
            .await
            .map_err(|e| IngestError::HealthServer(format!("failed to bind {host}:{port}: {e}")))
    }

    /// Serves requests until `cancel` fires.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<(), IngestError> {
        if let Ok(addr) = listener.local_addr() {
            debug!("health server listening on {addr}");
        }
        let service = service_fn(move |req: Request<hyper::body::Incoming>| {
            let exporter = self.clone();
            async move {
                let response = exporter
                    .route(req.method(), req.uri().path())
                    .await
                    .unwrap_or_else(|e| {
                        error!("failed to build response: {e}");
                        Response::new(Full::new(Bytes::new()))
                    });
                Ok::<_, Infallible>(response)
            }
        });

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        loop {
            let conn = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("health server error: {e}");
                        return Err(IngestError::HealthServer(e.to_string()));
                    }
                    Ok((conn, _)) => conn,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => {
                    if let Err(e) = finished {
                        error!("health connection handler failed: {e}");
                    }
                    continue;
                },
                () = cancel.cancelled() => break,
            };
            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let service = service.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("health connection error: {e}");
                }
            });
        }
        joinset.shutdown().await;
        debug!("health server stopped");
        Ok(())
    }

    pub async fn route(&self, method: &Method, path: &str) -> http::Result<HttpResponse> {
        match (method, path) {
            (&Method::GET, STATS_ENDPOINT_PATH) => self.stats_handler(),
            (&Method::GET, HEALTH_ENDPOINT_PATH) => self.health_handler().await,
            _ => json_response(StatusCode::NOT_FOUND, &json!({ "message": "not found" })),
        }
    }

    fn stats_handler(&self) -> http::Result<HttpResponse> {
        match serde_json::to_value(self.stats.snapshot()) {
            Ok(body) => json_response(StatusCode::OK, &body),
            Err(e) => json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({ "message": format!("failed to serialize stats: {e}") }),
            ),
        }
    }

    async fn health_handler(&self) -> http::Result<HttpResponse> {
        let elasticsearch_connected = self.sink.ping().await;
        let s3_connected = self.stats.gauge(Gauge::ObjectStoreHealthy) == 1;
        let up = elasticsearch_connected && s3_connected;
        let status = if up {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        json_response(
            status,
            &json!({
                "elasticsearch_connected": elasticsearch_connected,
                "s3_connected": s3_connected,
                "status": if up { "UP" } else { "DOWN" },
            }),
        )
    }
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> http::Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
}

/// Resolves the configured listen host, accepting `localhost`.
#[must_use]
pub fn listen_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let ip = match host {
        "localhost" => std::net::Ipv4Addr::LOCALHOST.into(),
        other => other.parse().ok()?,
    };
    Some(SocketAddr::new(ip, port))
}
