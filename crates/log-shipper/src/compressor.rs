// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Request body compression.
//!
//! Like the serializer, the compressor is a strategy owned by the flusher.
//! A failing compressor never blocks delivery: the flusher reports the
//! failure and sends the uncompressed body.

use std::fmt::Debug;
use std::io::{self, Write};

use flate2::write::GzEncoder;
use flate2::Compression;

pub trait Compressor: Debug + Send + Sync {
    /// Compresses a serialized request body.
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>>;
}

/// gzip at the default level, sent with `Content-Encoding: gzip`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn compress(&self, data: &[u8]) -> io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }
}
