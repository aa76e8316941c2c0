// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::delivery::ObjectTicket;
use crate::error::{ParseError, ParserError};
use crate::event::LogEvent;
use crate::queue::{EventSender, QueueItem};
use crate::record::AccessLogRecord;
use crate::stats::{Counter, StatsRegistry};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

/// Parses one line, without its terminator.
pub fn parse_line(line: &str) -> Result<AccessLogRecord, ParseError> {
    line.trim().parse()
}

/// Longest line kept by default. Access log lines are a few kilobytes at
/// most.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// One line read from an object, with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub byte_offset: u64,
    pub line_number: u64,
    /// The trimmed text, or why the line cannot be parsed at all.
    pub text: Result<String, ParseError>,
}

/// Reads an object's bytes one line at a time, keeping at most
/// `max_line_bytes` of the current line in memory.
pub struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_line_bytes: usize,
    offset: u64,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(reader: R, max_line_bytes: usize) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            max_line_bytes: max_line_bytes.max(1),
            offset: 0,
            line_number: 0,
        }
    }

    /// The next line, or `None` at end of stream. A final line without a
    /// terminator is still returned. The rest of an overlong line is read
    /// and thrown away.
    pub async fn next_line(&mut self) -> std::io::Result<Option<Line>> {
        self.buf.clear();
        let mut read = 0;
        let mut too_long = false;
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                break;
            }
            let (chunk, terminated) = match available.iter().position(|b| *b == b'\n') {
                Some(end) => (&available[..=end], true),
                None => (available, false),
            };
            // room for a CRLF terminator on top of the limit
            let room = (self.max_line_bytes + 2).saturating_sub(self.buf.len());
            if chunk.len() > room {
                too_long = true;
            }
            self.buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
            let used = chunk.len();
            self.reader.consume(used);
            read += used;
            if terminated {
                break;
            }
        }
        if read == 0 {
            return Ok(None);
        }
        let byte_offset = self.offset;
        self.offset += read as u64;
        self.line_number += 1;

        let mut end = self.buf.len();
        while end > 0 && matches!(self.buf[end - 1], b'\n' | b'\r') {
            end -= 1;
        }
        let text = if too_long || end > self.max_line_bytes {
            Err(ParseError::LineTooLong {
                limit: self.max_line_bytes,
            })
        } else {
            std::str::from_utf8(&self.buf[..end])
                .map(|s| s.trim().to_string())
                .map_err(|_| ParseError::InvalidEncoding)
        };
        Ok(Some(Line {
            byte_offset,
            line_number: self.line_number,
            text,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseSummary {
    /// Lines turned into queued events.
    pub parsed: u64,
    /// Lines that matched no layout.
    pub errors: u64,
    /// Blank lines, neither parsed nor errors.
    pub blank: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct LogParser {
    stats: Arc<StatsRegistry>,
    max_line_bytes: usize,
}

impl LogParser {
    #[must_use]
    pub fn new(stats: Arc<StatsRegistry>) -> Self {
        Self {
            stats,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    /// Lines longer than this are counted as parse errors and skipped.
    #[must_use]
    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes;
        self
    }

    /// Streams `reader` line by line, pushing one event per valid line onto
    /// `queue` in file order. Malformed lines are counted and skipped. The
    /// ticket is sealed when this returns, whatever the outcome.
    pub async fn parse_object<R>(
        &self,
        object_key: &str,
        reader: R,
        ticket: &Arc<ObjectTicket>,
        queue: &EventSender,
    ) -> Result<ParseSummary, ParserError>
    where
        R: AsyncBufRead + Unpin,
    {
        let result = self.parse_lines(object_key, reader, ticket, queue).await;
        ticket.seal();
        result
    }

    async fn parse_lines<R>(
        &self,
        object_key: &str,
        reader: R,
        ticket: &Arc<ObjectTicket>,
        queue: &EventSender,
    ) -> Result<ParseSummary, ParserError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = LineReader::new(reader, self.max_line_bytes);
        let mut summary = ParseSummary::default();

        while let Some(line) = lines.next_line().await? {
            let text = match line.text {
                Ok(text) => text,
                Err(e) => {
                    self.parse_error(object_key, line.line_number, &e);
                    summary.errors += 1;
                    continue;
                }
            };
            if text.is_empty() {
                summary.blank += 1;
                continue;
            }
            match parse_line(&text) {
                Ok(record) => {
                    let event = LogEvent {
                        object_key: object_key.to_string(),
                        byte_offset: line.byte_offset,
                        line_number: line.line_number,
                        raw: text,
                        record,
                    };
                    let token = ticket.register();
                    queue.push(QueueItem { event, token }).await?;
                    self.stats.increment(Counter::LinesParsed, 1);
                    summary.parsed += 1;
                }
                Err(e) => {
                    self.parse_error(object_key, line.line_number, &e);
                    summary.errors += 1;
                }
            }
        }
        summary.bytes = lines.offset;

        debug!(
            object_key,
            parsed = summary.parsed,
            errors = summary.errors,
            bytes = summary.bytes,
            "finished parsing object"
        );
        Ok(summary)
    }

    fn parse_error(&self, object_key: &str, line_number: u64, error: &ParseError) {
        self.stats.increment(Counter::ParseErrors, 1);
        warn!(object_key, line_number, "skipping line: {error}");
    }
}
