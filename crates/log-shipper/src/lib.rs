// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Log Shipper
//!
//! Buffers application log lines into batches and delivers them to a remote
//! ingestion endpoint over HTTP.
//!
//! ## Pipeline
//!
//! - [`accumulator`]: the open batch and its running byte size
//! - [`queue`]: closed batches waiting for delivery, strictly FIFO
//! - [`flusher`]: serialization, gzip, the HTTP attempt, 207 reconciliation
//!   and retry orchestration, one attempt in flight at a time
//! - [`backoff`]: exponential backoff with full jitter
//! - [`compressor`]: gzip request bodies, pluggable like the serializer
//! - [`payload`]: the `default` and `agent` line schemas
//! - [`service`]: the actor that ties the pieces together behind a
//!   cloneable [`ShipperHandle`]
//!
//! Failures never surface as panics or returned errors once the service is
//! running; every outcome is published as an [`Event`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use log_shipper::{Config, LogOptions, ShipperService};
//!
//! let (service, handle) = ShipperService::from_config(Config::new(key))?;
//! tokio::spawn(service.run());
//!
//! let mut events = handle.subscribe();
//! handle.log("user signed in", LogOptions::with_level("INFO"))?;
//! handle.flush()?;
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod accumulator;
pub mod backoff;
pub mod compressor;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod flusher;
pub mod hostname;
pub mod payload;
pub mod queue;
pub mod serializer;
pub mod service;
pub mod transport;

pub use compressor::{Compressor, GzipCompressor};
pub use config::Config;
pub use error::{ConfigError, DeliveryFailure, ShipperError, Warning};
pub use events::{Cleared, Event, SendReport};
pub use payload::{AgentLine, LogEntry, LogOptions, PayloadSchema, Statement};
pub use service::{ShipperCommand, ShipperHandle, ShipperService};
pub use transport::{
    DeliveryRequest, DeliveryResponse, ErrorCode, ReqwestTransport, Transport, TransportError,
};
