// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

#![allow(dead_code)]

use elb_ingest::config::Config;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use std::time::Duration;

pub const CLASSIC_LINE: &str = "2015-05-13T23:39:43.945958Z my-loadbalancer 192.168.131.39:2817 10.0.0.1:80 0.000073 0.001048 0.000057 200 200 0 29 \"GET http://www.example.com:80/ HTTP/1.1\" \"curl/7.38.0\" - -";

pub const APPLICATION_LINE: &str = "https 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.086 0.048 0.037 200 200 0 57 \"GET https://www.example.com:443/ HTTP/1.1\" \"curl/7.46.0\" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 \"Root=1-58337281-1d84f3d73c47ec4e58577259\" \"www.example.com\" \"arn:aws:acm:us-east-2:123456789012:certificate/12345678-1234-1234-1234-123456789012\" 1 2018-07-02T22:22:48.364000Z \"authenticate,forward\" \"-\" \"-\"";

/// `count` distinct classic lines, told apart by their sent bytes.
pub fn classic_lines(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| CLASSIC_LINE.replace(" 0 29 ", &format!(" 0 {} ", 1000 + i)))
        .collect()
}

/// A configuration with short waits, suitable for tests.
pub fn test_config() -> Config {
    Config {
        bucket: "test-bucket".to_string(),
        batch_size: 4,
        flush_interval: Duration::from_millis(10),
        poll_interval: Duration::from_millis(10),
        retry_base: Duration::from_millis(1),
        max_retries: 3,
        ..Default::default()
    }
}

pub async fn put(memory: &InMemory, key: &str, body: String) {
    memory
        .put(&Path::from(key), PutPayload::from(body))
        .await
        .expect("put");
}

pub async fn exists(memory: &InMemory, key: &str) -> bool {
    memory.head(&Path::from(key)).await.is_ok()
}

/// Every key in the bucket, sorted.
pub async fn keys(memory: &InMemory) -> Vec<String> {
    use futures::TryStreamExt;
    let mut keys: Vec<String> = memory
        .list(None)
        .map_ok(|meta| meta.location.to_string())
        .try_collect()
        .await
        .expect("list");
    keys.sort();
    keys
}
