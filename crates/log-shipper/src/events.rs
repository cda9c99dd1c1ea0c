// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed notifications published by a running shipper.
//!
//! Every outcome that a caller may care about, including failures, is
//! reported as an [`Event`] on a broadcast channel. Subscribers that lag
//! behind lose the oldest events and never slow the shipper down.

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ShipperError, Warning};
use crate::payload::LogEntry;

#[derive(Debug, Clone)]
pub enum Event {
    /// A batch was accepted, fully or partially.
    Sent(SendReport),
    Error(ShipperError),
    Warn(Warning),
    /// Nothing is left to deliver.
    Cleared(Cleared),
    MetaAdded { key: String, value: Value },
    MetaRemoved { key: String },
}

/// Bookkeeping for an accepted batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    pub http_status: u16,
    pub first_line: String,
    /// Present when the batch held more than one line
    pub last_line: Option<String>,
    /// Lines the endpoint accepted
    pub total_lines_sent: usize,
    /// Lines still queued for delivery
    pub total_lines_ready: usize,
    /// Batches still queued for delivery
    pub buffer_count: usize,
    /// Accepted entries, when verbose events are enabled
    pub lines: Option<Vec<LogEntry>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cleared {
    /// The last queued batch reached a terminal outcome.
    AllSent,
    /// A flush found nothing to deliver.
    NothingToSend,
}

impl Cleared {
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Cleared::AllSent => "All accumulated log entries have been sent",
            Cleared::NothingToSend => "All buffers clear; Nothing to send",
        }
    }
}

/// Publishing side of the event channel.
#[derive(Debug, Clone)]
pub(crate) struct EventEmitter {
    tx: broadcast::Sender<Event>,
}

impl EventEmitter {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is not an error
        if self.tx.send(event).is_err() {
            debug!("SHIPPER | Event dropped, no subscribers");
        }
    }
}
