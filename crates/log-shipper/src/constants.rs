// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits and endpoint settings for the shipper.
//!
//! The defaults mirror the ingestion service's published limits:
//! - **Flush byte limit**: 5MB of line text per batch
//! - **Flush interval**: 250ms of idle time before a partial batch ships
//! - **Backoff**: 3s base, 30s ceiling, unlimited attempts

use std::time::Duration;

/// Default ingestion endpoint.
pub const DEFAULT_URL: &str = "https://logs.logdna.com/logs/ingest";

/// Bytes of line text that force an immediate flush of the open batch.
///
/// The size counted is the length of each entry's `line` field, not the
/// serialized envelope, so the wire payload is always somewhat larger.
pub const FLUSH_BYTE_LIMIT: usize = 5_000_000;

/// Idle time after the first append before a partial batch is flushed.
pub const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

/// Starting point for retry backoff.
pub const BASE_BACKOFF: Duration = Duration::from_millis(3_000);

/// Upper bound for any single retry delay.
pub const MAX_BACKOFF: Duration = Duration::from_millis(30_000);

/// Per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Largest accepted per-request timeout.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Window around "now" inside which a caller-supplied timestamp is honored.
pub const TIMESTAMP_TOLERANCE_MS: u64 = 86_400_000;

/// Levels known to the ingestion service.
pub const LOG_LEVELS: [&str; 6] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

pub const DEFAULT_LEVEL: &str = "INFO";

pub const DEFAULT_APP: &str = "default";

/// Base user agent; a transport helper name may be appended in parentheses.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Capacity of the broadcast channel carrying [`crate::events::Event`]s.
///
/// Subscribers that fall further behind than this lose the oldest events
/// rather than slowing the shipper down.
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

/// HTTP statuses that are worth retrying.
pub(crate) const RETRYABLE_STATUS_CODES: [u16; 7] = [500, 502, 503, 504, 521, 522, 524];

/// Whole-batch acceptance.
pub(crate) const SUCCESS_STATUS: u16 = 200;

/// Per-line results follow in the response body.
pub(crate) const PARTIAL_SUCCESS_STATUS: u16 = 207;
