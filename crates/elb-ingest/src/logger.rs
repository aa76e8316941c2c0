// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log output prefixed with `ELB_INGESTOR` so ingestor lines stand out in a
//! shared log stream:
//!
//! ```text
//! ELB_INGESTOR | INFO | elb_log_ingestor version: 0.1.0
//! ELB_INGESTOR | WARN | skipping line: unknown line layout object_key="logs-working/a.log" line_number=3
//! ```

use crate::error::IngestError;
use std::fmt;
use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "ELB_INGESTOR | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Filter for `level`, with the HTTP stack silenced.
pub fn env_filter(level: &str) -> Result<EnvFilter, IngestError> {
    let level = level.trim().to_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(IngestError::InvalidConfig(format!("unknown log level '{level}'")));
    }
    EnvFilter::try_new(format!("hyper=off,h2=off,rustls=off,reqwest=warn,{level}"))
        .map_err(|e| IngestError::InvalidConfig(format!("could not parse log level: {e}")))
}

/// Installs the global subscriber. Fails if one is already installed.
pub fn init(level: &str) -> Result<(), IngestError> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter(level)?)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| IngestError::InvalidConfig(format!("setting default subscriber failed: {e}")))
}
