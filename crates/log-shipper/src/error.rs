// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for configuration and for the event channel.
//!
//! Configuration mistakes are returned directly from [`crate::config::Config::validate`].
//! Everything that goes wrong after construction is reported as an
//! [`Event::Error`](crate::events::Event::Error) carrying a [`ShipperError`],
//! never as a panic or a returned error across the service boundary.

use std::fmt;

use crate::payload::{LogEntry, PayloadSchema};
use crate::transport::ErrorCode;

/// Errors detected while building or validating a [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Ingestion key is required")]
    MissingKey,

    #[error("Invalid URL protocol for {field}: expected http:// or https://, got '{value}'")]
    InvalidProtocol { field: &'static str, value: String },

    #[error("timeout cannot be longer than {max_ms}ms, got {got_ms}ms")]
    TimeoutTooLong { got_ms: u128, max_ms: u128 },

    #[error("flush_byte_limit must be greater than zero")]
    InvalidFlushLimit,

    #[error("base_backoff must be greater than zero")]
    InvalidBaseBackoff,

    #[error("max_backoff ({max_ms}ms) must be greater than or equal to base_backoff ({base_ms}ms)")]
    InvalidMaxBackoff { base_ms: u128, max_ms: u128 },

    #[error("Invalid level '{got}', expected one of {expected:?}")]
    InvalidLevel { got: String, expected: Vec<String> },

    #[error("levels values must be letters only, got '{0}'")]
    InvalidCustomLevel(String),

    #[error("Invalid hostname '{0}'")]
    InvalidHostname(String),

    #[error("Invalid MAC Address format '{0}'")]
    InvalidMac(String),

    #[error("Invalid IP Address format '{0}'")]
    InvalidIp(String),

    #[error("Compression is only available with the agent payload schema")]
    CompressionUnavailable,

    #[error("Invalid payload schema '{0}', expected 'default' or 'agent'")]
    InvalidPayloadSchema(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnvValue { name: &'static str, value: String },
}

/// Failures reported through the event channel.
///
/// `Clone` is required because every subscriber receives its own copy.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShipperError {
    /// The ingestion method does not match the active payload schema.
    #[error("Invalid method based on payload schema: active schema is '{active}', method requires '{expected}'")]
    InvalidMethod {
        active: PayloadSchema,
        expected: PayloadSchema,
    },

    /// A per-line level was not in the configured level set. The line was
    /// still logged with `used`.
    #[error("Invalid log level '{got}'. Using the default '{used}' instead.")]
    InvalidLevel {
        got: String,
        expected: Vec<String>,
        used: String,
    },

    /// The batch could not be turned into a request body. The batch stays
    /// queued and the attempt counters are untouched.
    #[error("Error serializing buffer: {actual}")]
    Serialization {
        actual: String,
        first_line: String,
        last_line: Option<String>,
        url: String,
        lines: Option<Vec<LogEntry>>,
    },

    /// gzip failed; the batch is sent uncompressed instead.
    #[error("Error gzipping data, will attempt to send data uncompressed: {actual}")]
    Compression { actual: String },

    /// The endpoint rejected one line of a partially accepted batch.
    #[error("Non-200 status while ingesting this line (status {status_code})")]
    LineRejected {
        status_code: u16,
        line: String,
        entry: Option<LogEntry>,
    },

    #[error("{0}")]
    Delivery(DeliveryFailure),
}

impl ShipperError {
    /// `true` when the failure will be followed by another attempt.
    #[must_use]
    pub fn is_retrying(&self) -> bool {
        matches!(self, ShipperError::Delivery(failure) if failure.retrying)
    }
}

/// Diagnostics for a failed delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// Message of the underlying transport error or HTTP status.
    pub actual: String,
    pub code: ErrorCode,
    pub first_line: String,
    pub last_line: Option<String>,
    pub retrying: bool,
    /// Consecutive failed attempts for this batch, including this one.
    pub attempts: u32,
    /// Full request URL, including the query string.
    pub url: String,
    /// The batch, when verbose events are enabled.
    pub lines: Option<Vec<LogEntry>>,
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.retrying {
            write!(
                f,
                "Temporary connection-based error. It will be retried. ({}: {})",
                self.code, self.actual
            )
        } else {
            write!(
                f,
                "A connection-based error occurred that will not be retried. ({}: {})",
                self.code, self.actual
            )
        }
    }
}

/// Non-fatal signals about ignored input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Warning {
    #[error("Log statement was empty. Ignored")]
    EmptyStatement,

    #[error("Property '{key}' is not an existing meta property. Cannot remove.")]
    UnknownMetaProperty { key: String },
}
