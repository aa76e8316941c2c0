// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::fetcher::ObjectState;

/// Errors that stop the pipeline from starting. Everything else is absorbed
/// by the component where it happens and only shows up in the stats.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Object store unreachable: {0}")]
    ObjectStoreUnreachable(String),

    #[error("Search engine unreachable: {0}")]
    SearchEngineUnreachable(String),

    #[error("Failed to start health server: {0}")]
    HealthServer(String),
}

/// A single line that did not match either access log grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("line does not match a known access log layout")]
    UnknownLayout,

    #[error("line is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid value {value:?} for field {field}")]
    InvalidField { field: &'static str, value: String },

    #[error("line is longer than {limit} bytes")]
    LineTooLong { limit: usize },
}

/// Failure of a whole parse run over one object.
#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    #[error("failed reading object stream: {0}")]
    Io(#[from] std::io::Error),

    #[error("event queue closed")]
    QueueClosed,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Network, timeout or backend failure that may succeed when retried.
    #[error("transient object store error: {0}")]
    Transient(#[source] object_store::Error),

    /// Missing object, denied access or unsupported operation. Retrying is pointless.
    #[error("permanent object store error: {0}")]
    Permanent(#[source] object_store::Error),

    #[error("object {key} changed while being claimed")]
    VersionChanged { key: String },

    #[error("object {key} is not under the {prefix} prefix")]
    OutsidePrefix { key: String, prefix: String },

    #[error("copy of {key} does not match the source object")]
    TornCopy { key: String },

    /// Another fetcher moved the object first.
    #[error("object {key} was claimed by another fetcher")]
    ClaimLost { key: String },
}

impl StoreError {
    /// Classifies an `object_store` failure.
    #[must_use]
    pub fn classify(error: object_store::Error) -> Self {
        match error {
            object_store::Error::NotFound { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::AlreadyExists { .. }
            | object_store::Error::Precondition { .. }
            | object_store::Error::PermissionDenied { .. }
            | object_store::Error::Unauthenticated { .. }
            | object_store::Error::UnknownConfigurationKey { .. } => Self::Permanent(error),
            other => Self::Transient(other),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::TornCopy { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Permanent(object_store::Error::NotFound { .. })
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cannot move object {key} from {from:?} to {to:?}")]
    InvalidTransition {
        key: String,
        from: ObjectState,
        to: ObjectState,
    },
}

impl FetchError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

/// Failure of a whole bulk request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Connection error, timeout, 429 or 5xx. The batch may be retried.
    #[error("transient search engine error: {0}")]
    Transient(String),

    /// Any other rejection of the whole request.
    #[error("permanent search engine error: {0}")]
    Permanent(String),
}
