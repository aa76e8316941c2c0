// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed access log records.
//!
//! Two layouts are understood:
//!
//! ```text
//! classic:     <time> <elb> <client:port> <backend:port> <rpt> <bpt> <rspt> <elb_status> <backend_status>
//!              <received> <sent> "<request>" "<user_agent>" <ssl_cipher> <ssl_protocol>
//! application: <type> <time> <elb> ... same as classic ... <target_group_arn> "<trace_id>" "<domain>"
//!              "<cert_arn>" <rule_priority> <request_creation_time> "<actions>" "<redirect_url>"
//!              ["<error_reason>"] [newer fields ...]
//! ```
//!
//! The layout is picked per line from the first field: a timestamp means
//! classic, a request type means application. `-` (or an empty value) is an
//! absent field.

use crate::error::ParseError;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

const CLASSIC_FIELDS: usize = 15;
const APPLICATION_MIN_FIELDS: usize = 24;
const REQUEST_TYPES: [&str; 6] = ["http", "https", "h2", "ws", "wss", "grpcs"];

#[derive(Debug, Clone, PartialEq)]
pub enum AccessLogRecord {
    Classic(Exchange),
    Application(ApplicationRecord),
}

impl AccessLogRecord {
    #[must_use]
    pub fn exchange(&self) -> &Exchange {
        match self {
            AccessLogRecord::Classic(exchange) => exchange,
            AccessLogRecord::Application(record) => &record.exchange,
        }
    }

    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.exchange().timestamp
    }
}

/// Fields shared by both layouts.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub timestamp: DateTime<Utc>,
    pub elb_name: String,
    pub client: Endpoint,
    /// Absent when the request never reached a backend.
    pub backend: Option<Endpoint>,
    pub request_processing_time: Option<f64>,
    pub backend_processing_time: Option<f64>,
    pub response_processing_time: Option<f64>,
    pub elb_status_code: Option<u16>,
    pub backend_status_code: Option<u16>,
    pub received_bytes: Option<u64>,
    pub sent_bytes: Option<u64>,
    pub request: RequestLine,
    pub user_agent: Option<String>,
    pub ssl_cipher: Option<String>,
    pub ssl_protocol: Option<String>,
}

impl Exchange {
    #[must_use]
    pub fn client_address(&self) -> String {
        self.client.to_string()
    }

    #[must_use]
    pub fn backend_address(&self) -> Option<String> {
        self.backend.as_ref().map(ToString::to_string)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApplicationRecord {
    pub request_type: String,
    pub exchange: Exchange,
    pub target_group_arn: Option<String>,
    pub trace_id: Option<String>,
    pub domain_name: Option<String>,
    pub chosen_cert_arn: Option<String>,
    pub matched_rule_priority: Option<String>,
    pub request_creation_time: Option<DateTime<Utc>>,
    pub actions_executed: Option<String>,
    pub redirect_url: Option<String>,
    pub error_reason: Option<String>,
    /// Fields appended by newer log versions, kept verbatim.
    pub extra_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// The quoted request field, kept whole and split into its three parts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestLine {
    pub raw: String,
    pub verb: Option<String>,
    pub url: Option<String>,
    pub protocol: Option<String>,
}

impl RequestLine {
    fn parse(raw: &str) -> Self {
        let mut parts = raw.trim().splitn(3, ' ');
        let mut next = || parts.next().and_then(present).map(str::to_string);
        let verb = next();
        let url = next();
        let protocol = next();
        Self {
            raw: raw.to_string(),
            verb,
            url,
            protocol,
        }
    }

    /// `"<verb> <url> <protocol>"` with `-` standing in for missing parts.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} {} {}",
            self.verb.as_deref().unwrap_or("-"),
            self.url.as_deref().unwrap_or("-"),
            self.protocol.as_deref().unwrap_or("-")
        )
    }
}

impl FromStr for AccessLogRecord {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields = tokenize(line)?;
        let first = fields.first().ok_or(ParseError::UnknownLayout)?;
        if REQUEST_TYPES.contains(first) {
            parse_application(&fields).map(AccessLogRecord::Application)
        } else if DateTime::parse_from_rfc3339(first).is_ok() {
            parse_classic(&fields).map(AccessLogRecord::Classic)
        } else {
            Err(ParseError::UnknownLayout)
        }
    }
}

fn parse_classic(fields: &[&str]) -> Result<Exchange, ParseError> {
    if fields.len() != CLASSIC_FIELDS {
        return Err(ParseError::UnknownLayout);
    }
    parse_exchange(fields)
}

fn parse_application(fields: &[&str]) -> Result<ApplicationRecord, ParseError> {
    if fields.len() < APPLICATION_MIN_FIELDS {
        return Err(ParseError::UnknownLayout);
    }
    let exchange = parse_exchange(&fields[1..=CLASSIC_FIELDS])?;
    let text = |i: usize| fields.get(i).copied().and_then(present).map(str::to_string);
    let request_creation_time = match fields.get(21).copied().and_then(present) {
        Some(value) => Some(timestamp("request_creation_time", value)?),
        None => None,
    };
    Ok(ApplicationRecord {
        request_type: fields[0].to_string(),
        exchange,
        target_group_arn: text(16),
        trace_id: text(17),
        domain_name: text(18),
        chosen_cert_arn: text(19),
        matched_rule_priority: text(20),
        request_creation_time,
        actions_executed: text(22),
        redirect_url: text(23),
        error_reason: text(24),
        extra_fields: fields
            .iter()
            .skip(APPLICATION_MIN_FIELDS + 1)
            .map(|field| (*field).to_string())
            .collect(),
    })
}

/// Parses the fifteen fields both layouts have in common.
fn parse_exchange(fields: &[&str]) -> Result<Exchange, ParseError> {
    let text = |i: usize| present(fields[i]).map(str::to_string);
    Ok(Exchange {
        timestamp: timestamp("timestamp", fields[0])?,
        elb_name: fields[1].to_string(),
        client: endpoint("client", fields[2])?,
        backend: present(fields[3])
            .map(|value| endpoint("backend", value))
            .transpose()?,
        request_processing_time: number("request_processing_time", fields[4])?,
        backend_processing_time: number("backend_processing_time", fields[5])?,
        response_processing_time: number("response_processing_time", fields[6])?,
        elb_status_code: number("elb_status_code", fields[7])?,
        backend_status_code: number("backend_status_code", fields[8])?,
        received_bytes: number("received_bytes", fields[9])?,
        sent_bytes: number("sent_bytes", fields[10])?,
        request: RequestLine::parse(fields[11]),
        user_agent: text(12),
        ssl_cipher: text(13),
        ssl_protocol: text(14),
    })
}

fn present(value: &str) -> Option<&str> {
    match value {
        "" | "-" => None,
        value => Some(value),
    }
}

fn invalid(field: &'static str, value: &str) -> ParseError {
    ParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}

fn number<T: FromStr>(field: &'static str, value: &str) -> Result<Option<T>, ParseError> {
    present(value)
        .map(|v| v.parse::<T>().map_err(|_| invalid(field, v)))
        .transpose()
}

fn timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>, ParseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| invalid(field, value))
}

fn endpoint(field: &'static str, value: &str) -> Result<Endpoint, ParseError> {
    let (ip, port) = value.rsplit_once(':').ok_or_else(|| invalid(field, value))?;
    if ip.is_empty() {
        return Err(invalid(field, value));
    }
    let port = port.parse::<u16>().map_err(|_| invalid(field, value))?;
    Ok(Endpoint {
        ip: ip.to_string(),
        port,
    })
}

/// Splits a line on single spaces, treating a double-quoted run as one field.
/// Quotes are removed; `\"` inside a quoted field does not end it.
fn tokenize(line: &str) -> Result<Vec<&str>, ParseError> {
    let mut fields = Vec::with_capacity(APPLICATION_MIN_FIELDS + 8);
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b' ' {
            i += 1;
            continue;
        }
        if bytes[i] == b'"' {
            let start = i + 1;
            let mut end = start;
            loop {
                match bytes.get(end) {
                    None => return Err(ParseError::UnknownLayout),
                    Some(b'\\') => end += 2,
                    Some(b'"') => break,
                    Some(_) => end += 1,
                }
            }
            fields.push(&line[start..end]);
            i = end + 1;
        } else {
            let start = i;
            while i < bytes.len() && bytes[i] != b' ' {
                i += 1;
            }
            fields.push(&line[start..i]);
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLASSIC: &str = "2015-05-13T23:39:43.945958Z my-loadbalancer 192.168.131.39:2817 10.0.0.1:80 0.000073 0.001048 0.000057 200 200 0 29 \"GET http://www.example.com:80/ HTTP/1.1\" \"curl/7.38.0\" - -";

    const APPLICATION: &str = "https 2018-07-02T22:23:00.186641Z app/my-loadbalancer/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.086 0.048 0.037 200 200 0 57 \"GET https://www.example.com:443/ HTTP/1.1\" \"curl/7.46.0\" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 \"Root=1-58337281-1d84f3d73c47ec4e58577259\" \"www.example.com\" \"arn:aws:acm:us-east-2:123456789012:certificate/12345678-1234-1234-1234-123456789012\" 1 2018-07-02T22:22:48.364000Z \"authenticate,forward\" \"-\" \"-\" \"10.0.0.1:80\" \"200\" \"-\" \"-\"";

    #[test]
    fn test_classic_line() {
        let record: AccessLogRecord = CLASSIC.parse().expect("classic line parses");
        let AccessLogRecord::Classic(exchange) = &record else {
            panic!("expected classic record, got {record:?}");
        };
        assert_eq!(exchange.elb_name, "my-loadbalancer");
        assert_eq!(exchange.client_address(), "192.168.131.39:2817");
        assert_eq!(exchange.backend_address().as_deref(), Some("10.0.0.1:80"));
        assert_eq!(exchange.elb_status_code, Some(200));
        assert_eq!(exchange.backend_status_code, Some(200));
        assert_eq!(exchange.received_bytes, Some(0));
        assert_eq!(exchange.sent_bytes, Some(29));
        assert_eq!(exchange.request.raw, "GET http://www.example.com:80/ HTTP/1.1");
        assert_eq!(exchange.request.verb.as_deref(), Some("GET"));
        assert_eq!(exchange.request.protocol.as_deref(), Some("HTTP/1.1"));
        assert_eq!(exchange.user_agent.as_deref(), Some("curl/7.38.0"));
        assert_eq!(exchange.ssl_cipher, None);
        assert_eq!(exchange.ssl_protocol, None);
        assert_eq!(exchange.request_processing_time, Some(0.000073));
        assert_eq!(
            exchange.timestamp.to_rfc3339(),
            "2015-05-13T23:39:43.945958+00:00"
        );
    }

    #[test]
    fn test_application_line() {
        let record: AccessLogRecord = APPLICATION.parse().expect("application line parses");
        let AccessLogRecord::Application(app) = &record else {
            panic!("expected application record, got {record:?}");
        };
        assert_eq!(app.request_type, "https");
        assert_eq!(app.exchange.elb_name, "app/my-loadbalancer/50dc6c495c0c9188");
        assert_eq!(app.exchange.ssl_protocol.as_deref(), Some("TLSv1.2"));
        assert_eq!(
            app.trace_id.as_deref(),
            Some("Root=1-58337281-1d84f3d73c47ec4e58577259")
        );
        assert_eq!(app.domain_name.as_deref(), Some("www.example.com"));
        assert_eq!(app.matched_rule_priority.as_deref(), Some("1"));
        assert_eq!(app.actions_executed.as_deref(), Some("authenticate,forward"));
        assert_eq!(app.redirect_url, None);
        assert_eq!(app.error_reason, None);
        assert_eq!(app.extra_fields, vec!["10.0.0.1:80", "200", "-", "-"]);
        assert!(app.request_creation_time.is_some());
    }

    #[test]
    fn test_missing_backend() {
        let line = CLASSIC.replace("10.0.0.1:80 0.000073 0.001048 0.000057 200 200", "- -1 -1 -1 503 0");
        let record: AccessLogRecord = line.parse().expect("line parses");
        let exchange = record.exchange();
        assert_eq!(exchange.backend, None);
        assert_eq!(exchange.elb_status_code, Some(503));
        assert_eq!(exchange.request_processing_time, Some(-1.0));
    }

    #[test]
    fn test_dash_request_line() {
        let line = CLASSIC.replace("GET http://www.example.com:80/ HTTP/1.1", "- - - ");
        let record: AccessLogRecord = line.parse().expect("line parses");
        let request = &record.exchange().request;
        assert_eq!(request.verb, None);
        assert_eq!(request.summary(), "- - -");
    }

    #[test]
    fn test_bad_number_fails_line() {
        let line = CLASSIC.replace(" 0 29 ", " 0 lots ");
        assert_eq!(
            line.parse::<AccessLogRecord>(),
            Err(ParseError::InvalidField {
                field: "sent_bytes",
                value: "lots".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_layouts() {
        for line in [
            "",
            "hello world",
            "2015-05-13T23:39:43.945958Z too few fields",
            "https 2018-07-02T22:23:00.186641Z short",
            "2015-05-13T23:39:43.945958Z lb 1.2.3.4:1 \"unterminated",
        ] {
            assert_eq!(
                line.parse::<AccessLogRecord>(),
                Err(ParseError::UnknownLayout),
                "{line}"
            );
        }
    }

    #[test]
    fn test_escaped_quote_in_user_agent() {
        let line = CLASSIC.replace("curl/7.38.0", "Mozilla \\\"quoted\\\" agent");
        let record: AccessLogRecord = line.parse().expect("line parses");
        assert_eq!(
            record.exchange().user_agent.as_deref(),
            Some("Mozilla \\\"quoted\\\" agent")
        );
    }

    #[test]
    fn test_ipv6_client() {
        let line = CLASSIC.replace("192.168.131.39:2817", "2001:db8::1:2817");
        let record: AccessLogRecord = line.parse().expect("line parses");
        assert_eq!(record.exchange().client.ip, "2001:db8::1");
        assert_eq!(record.exchange().client.port, 2817);
    }
}
