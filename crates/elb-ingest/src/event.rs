// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::IngestError;
use crate::record::{AccessLogRecord, ApplicationRecord, Exchange};
use crate::SHIPPER_NAME;
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// One parsed access log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    /// Key of the object the line was read from.
    pub object_key: String,
    /// Offset of the first byte of the line within the object.
    pub byte_offset: u64,
    /// 1-based line number within the object.
    pub line_number: u64,
    /// The line without its terminator and surrounding whitespace.
    pub raw: String,
    pub record: AccessLogRecord,
}

impl LogEvent {
    #[must_use]
    pub fn document_id(&self) -> String {
        document_id(&self.raw)
    }

    /// Builds the search document for this event.
    #[must_use]
    pub fn to_document(&self) -> Value {
        let exchange = self.record.exchange();
        let mut document = Map::new();
        document.insert("@message".into(), json!(exchange.request.summary()));
        document.insert(
            "@timestamp".into(),
            json!(iso_timestamp(&exchange.timestamp)),
        );
        match &self.record {
            AccessLogRecord::Classic(exchange) => {
                document.insert("@elb".into(), classic_fields(exchange));
            }
            AccessLogRecord::Application(record) => {
                document.insert("@alb".into(), application_fields(record));
            }
        }
        document.insert("@raw".into(), json!(self.raw));
        document.insert("@input".into(), json!("s3"));
        document.insert("@shipper.name".into(), json!(SHIPPER_NAME));
        document.insert("@version".into(), json!("1"));
        document.insert("@level".into(), json!("INFO"));
        document.insert("path".into(), json!(self.object_key));
        let mut document = Value::Object(document);
        prune(&mut document);
        document
    }
}

/// Lowercase hex SHA-256 of the line with its terminator and surrounding
/// whitespace removed. Depends on nothing but the line content, so the same
/// line gets the same id no matter which object, offset or process it came
/// from.
#[must_use]
pub fn document_id(raw: &str) -> String {
    let digest = Sha256::digest(raw.trim().as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

fn iso_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn classic_fields(exchange: &Exchange) -> Value {
    let mut fields = exchange_fields(exchange, "elb");
    fields["request"]["user_agent"] = json!(exchange.user_agent);
    fields
}

fn application_fields(record: &ApplicationRecord) -> Value {
    let exchange = &record.exchange;
    let mut fields = exchange_fields(exchange, "alb");
    fields["type"] = json!(record.request_type);
    fields["user_agent"] = json!(exchange.user_agent);
    fields["target_group_arn"] = json!(record.target_group_arn);
    fields["trace_id"] = json!(record.trace_id);
    fields["domain_name"] = json!(record.domain_name);
    fields["chosen_cert_arn"] = json!(record.chosen_cert_arn);
    fields["matched_rule_priority"] = json!(record.matched_rule_priority);
    fields["actions_executed"] = json!(record.actions_executed);
    fields["redirect_url"] = json!(record.redirect_url);
    fields["error_reason"] = json!(record.error_reason);
    fields["request"]["creation_time"] = json!(record.request_creation_time.as_ref().map(iso_timestamp));
    if !record.extra_fields.is_empty() {
        fields["extra_fields"] = json!(record.extra_fields);
    }
    fields
}

/// The nested shape shared by `@elb` and `@alb`; `name` is the key holding
/// the load balancer id and status.
fn exchange_fields(exchange: &Exchange, name: &str) -> Value {
    let backend = exchange.backend.as_ref();
    let mut fields = json!({
        "client": { "ip": exchange.client.ip, "port": exchange.client.port },
        "target": {
            "ip": backend.map(|b| &b.ip),
            "port": backend.map(|b| b.port),
            "processing_time": exchange.backend_processing_time,
            "status_code": exchange.backend_status_code,
        },
        "request": {
            "verb": exchange.request.verb,
            "url": exchange.request.url,
            "protocol": exchange.request.protocol,
            "processing_time": exchange.request_processing_time,
        },
        "response": { "processing_time": exchange.response_processing_time },
        "received_bytes": exchange.received_bytes,
        "sent_bytes": exchange.sent_bytes,
        "ssl": { "cipher": exchange.ssl_cipher, "protocol": exchange.ssl_protocol },
    });
    fields[name] = json!({ "id": exchange.elb_name, "status_code": exchange.elb_status_code });
    fields
}

/// Recursively removes nulls and objects left empty by that removal.
fn prune(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            prune(child);
        }
        map.retain(|_, child| match child {
            Value::Null => false,
            Value::Object(inner) => !inner.is_empty(),
            _ => true,
        });
    }
}

/// A strftime pattern giving the target index for an event timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPattern(String);

impl IndexPattern {
    pub fn new(pattern: &str) -> Result<Self, IngestError> {
        if pattern.trim().is_empty() {
            return Err(IngestError::InvalidConfig(
                "index pattern cannot be empty".to_string(),
            ));
        }
        if StrftimeItems::new(pattern).any(|item| matches!(item, Item::Error)) {
            return Err(IngestError::InvalidConfig(format!(
                "Invalid index pattern '{pattern}'"
            )));
        }
        Ok(Self(pattern.to_string()))
    }

    /// Index names are lowercased because the search engine rejects
    /// uppercase ones.
    #[must_use]
    pub fn index_for(&self, ts: &DateTime<Utc>) -> String {
        let mut index = String::with_capacity(self.0.len() + 8);
        if write!(&mut index, "{}", ts.format(&self.0)).is_err() {
            index.clear();
            index.push_str(&self.0);
        }
        index.to_lowercase()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for IndexPattern {
    fn default() -> Self {
        Self("elb-logs-%Y.%m.%d".to_string())
    }
}

/// A document ready for a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: String,
    pub index: String,
    pub source: Value,
}

impl IndexDocument {
    #[must_use]
    pub fn from_event(event: &LogEvent, pattern: &IndexPattern) -> Self {
        Self {
            id: event.document_id(),
            index: pattern.index_for(&event.record.timestamp()),
            source: event.to_document(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LINE: &str = "2015-05-13T23:39:43.945958Z my-loadbalancer 192.168.131.39:2817 10.0.0.1:80 0.000073 0.001048 0.000057 200 200 0 29 \"GET http://www.example.com:80/ HTTP/1.1\" \"curl/7.38.0\" - -";

    fn event(key: &str, offset: u64) -> LogEvent {
        LogEvent {
            object_key: key.to_string(),
            byte_offset: offset,
            line_number: 1,
            raw: LINE.to_string(),
            record: LINE.parse().expect("line parses"),
        }
    }

    #[test]
    fn test_id_ignores_position() {
        let original = event("logs/a.log", 0);
        let reprocessed = event("logs-done/a.log", 4096);
        assert_eq!(original.document_id(), reprocessed.document_id());
        assert_eq!(original.document_id().len(), 64);
    }

    #[test]
    fn test_id_ignores_line_terminator() {
        assert_eq!(document_id(LINE), document_id(&format!("{LINE}\r\n")));
        assert_eq!(document_id(LINE), document_id(&format!("  {LINE}\n")));
    }

    #[test]
    fn test_id_is_sha256_hex() {
        assert_eq!(
            document_id("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_classic_document_shape() {
        let doc = event("logs/a.log", 0).to_document();
        assert_eq!(doc["@timestamp"], "2015-05-13T23:39:43.945Z");
        assert_eq!(doc["@message"], "GET http://www.example.com:80/ HTTP/1.1");
        assert_eq!(doc["@elb"]["elb"]["id"], "my-loadbalancer");
        assert_eq!(doc["@elb"]["elb"]["status_code"], 200);
        assert_eq!(doc["@elb"]["client"]["port"], 2817);
        assert_eq!(doc["@elb"]["target"]["ip"], "10.0.0.1");
        assert_eq!(doc["@elb"]["request"]["user_agent"], "curl/7.38.0");
        assert_eq!(doc["@elb"]["sent_bytes"], 29);
        assert_eq!(doc["@shipper.name"], "elb_log_ingestor");
        assert_eq!(doc["@input"], "s3");
        assert_eq!(doc["path"], "logs/a.log");
        // both ssl fields are "-" so the whole object is dropped
        assert!(doc["@elb"].get("ssl").is_none());
        assert!(doc.get("@alb").is_none());
    }

    #[test]
    fn test_prune() {
        let mut value = json!({"a": {"b": {"c": null}}, "d": 0, "e": "", "f": false, "g": [null]});
        prune(&mut value);
        assert_eq!(value, json!({"d": 0, "e": "", "f": false, "g": [null]}));
    }

    #[test]
    fn test_index_pattern() {
        let ts = event("logs/a.log", 0).record.timestamp();
        assert_eq!(IndexPattern::default().index_for(&ts), "elb-logs-2015.05.13");
        let pattern = IndexPattern::new("ELB-%Y-%b").expect("valid pattern");
        assert_eq!(pattern.index_for(&ts), "elb-2015-may");
    }

    #[test]
    fn test_invalid_index_pattern() {
        assert!(IndexPattern::new("").is_err());
        assert!(IndexPattern::new("logs-%Q").is_err());
    }

    proptest! {
        #[test]
        fn prop_id_is_deterministic(line in "[ -~]{1,200}") {
            prop_assert_eq!(document_id(&line), document_id(&line.clone()));
            prop_assert_eq!(document_id(&line), document_id(&format!("{line}\n")));
        }

        #[test]
        fn prop_distinct_lines_distinct_ids(a in "[a-z0-9]{1,64}", b in "[a-z0-9]{1,64}") {
            prop_assume!(a != b);
            prop_assert_ne!(document_id(&a), document_id(&b));
        }
    }
}
