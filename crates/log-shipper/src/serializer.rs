// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request body serialization.
//!
//! The wire envelope is `{"e":"ls","ls":[<entries>]}`. The serializer is a
//! strategy handed to the shipper at construction so tests can swap in a
//! failing or instrumented one.

use std::fmt::Debug;

use serde::Serialize;

use crate::accumulator::Batch;
use crate::payload::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SerializeError(pub String);

impl From<serde_json::Error> for SerializeError {
    fn from(e: serde_json::Error) -> Self {
        SerializeError(e.to_string())
    }
}

pub trait Serializer: Debug + Send + Sync {
    /// Turns a batch into an uncompressed request body.
    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError>;
}

#[derive(Serialize)]
struct Envelope<'a> {
    e: &'static str,
    ls: &'a [LogEntry],
}

/// Serializes batches to the JSON envelope.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, batch: &Batch) -> Result<Vec<u8>, SerializeError> {
        let envelope = Envelope {
            e: "ls",
            ls: batch.entries(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}
