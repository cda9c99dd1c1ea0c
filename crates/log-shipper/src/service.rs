// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor that owns one shipper instance.
//!
//! ```text
//!    ┌──────────────┐
//!    │   Handles    │ log / agent_log / flush / meta
//!    │  (Clone)     │
//!    └──────┬───────┘
//!           │ commands
//!           v
//!    ┌──────────────┐      ┌─────────────┐
//!    │   Service    │─────>│   Flusher   │── HTTP task
//!    │  event loop  │      │ queue+state │
//!    └──────┬───────┘      └─────────────┘
//!           │ events (broadcast)
//!           v
//!      subscribers
//! ```
//!
//! The service task is the only place the accumulator, the delivery queue
//! and the delivery state are touched, so no locks are needed. Commands,
//! the flush timer, the retry timer and the outstanding HTTP attempt are
//! multiplexed in one `select!` loop.

use std::future::pending;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Sleep;
use tracing::debug;

use crate::accumulator::Accumulator;
use crate::compressor::Compressor;
use crate::config::Config;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::error::ConfigError;
use crate::events::{Cleared, Event, EventEmitter};
use crate::flusher::Flusher;
use crate::payload::{AgentLine, LogEntry, LogOptions, Normalized, SchemaRegistry, Statement};
use crate::serializer::{JsonSerializer, Serializer};
use crate::transport::{ReqwestTransport, Transport};

/// Commands sent from handles to the service task.
#[derive(Debug)]
pub enum ShipperCommand {
    Log {
        statement: Statement,
        options: LogOptions,
        now_ms: u64,
    },
    AgentLog {
        line: AgentLine,
        now_ms: u64,
    },
    Flush,
    AddMetaProperty {
        key: String,
        value: Value,
    },
    RemoveMetaProperty {
        key: String,
    },
    Shutdown,
}

/// Cloneable front end of a running shipper.
///
/// Every method returns immediately. Outcomes, including errors, arrive as
/// [`Event`]s on [`ShipperHandle::subscribe`]; methods only fail once the
/// service has stopped.
#[derive(Clone, Debug)]
pub struct ShipperHandle {
    tx: mpsc::UnboundedSender<ShipperCommand>,
    events: EventEmitter,
}

impl ShipperHandle {
    /// Logs a default-schema statement, stamped with the current time.
    pub fn log(
        &self,
        statement: impl Into<Statement>,
        options: LogOptions,
    ) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::Log {
            statement: statement.into(),
            options,
            now_ms: now_ms(),
        })
    }

    /// Logs an agent-schema line, stamped with the current time unless
    /// `t` is already set.
    pub fn agent_log(&self, line: AgentLine) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::AgentLog {
            line,
            now_ms: now_ms(),
        })
    }

    /// Closes the open batch and starts delivery if idle.
    pub fn flush(&self) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::Flush)
    }

    pub fn add_meta_property(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::AddMetaProperty {
            key: key.into(),
            value: value.into(),
        })
    }

    pub fn remove_meta_property(
        &self,
        key: impl Into<String>,
    ) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx
            .send(ShipperCommand::RemoveMetaProperty { key: key.into() })
    }

    /// Receives every event published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Stops the service. Entries not yet delivered are dropped.
    pub fn shutdown(&self) -> Result<(), mpsc::error::SendError<ShipperCommand>> {
        self.tx.send(ShipperCommand::Shutdown)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

pub struct ShipperService {
    config: Arc<Config>,
    registry: SchemaRegistry,
    accumulator: Accumulator,
    flusher: Flusher,
    events: EventEmitter,
    flush_timer: Option<Pin<Box<Sleep>>>,
    rx: mpsc::UnboundedReceiver<ShipperCommand>,
}

impl ShipperService {
    /// Creates a service with the HTTP transport and JSON serializer.
    ///
    /// Returns both the service (to be spawned) and a handle (to send
    /// commands).
    pub fn from_config(config: Config) -> Result<(Self, ShipperHandle), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let transport = Arc::new(ReqwestTransport::new(&config));
        Ok(Self::build(
            config,
            transport,
            Arc::new(JsonSerializer),
            Box::new(StdRng::from_entropy()),
        ))
    }

    /// Creates a service with explicit collaborators.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<(Self, ShipperHandle), ConfigError> {
        config.validate()?;
        Ok(Self::build(Arc::new(config), transport, serializer, rng))
    }

    fn build(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        rng: Box<dyn RngCore + Send>,
    ) -> (Self, ShipperHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventEmitter::new(EVENT_CHANNEL_CAPACITY);
        let flusher = Flusher::new(
            Arc::clone(&config),
            transport,
            serializer,
            rng,
            events.clone(),
        );

        let service = ShipperService {
            registry: SchemaRegistry::new(Arc::clone(&config)),
            accumulator: Accumulator::new(config.flush_byte_limit),
            flusher,
            events: events.clone(),
            flush_timer: None,
            rx,
            config,
        };
        let handle = ShipperHandle { tx, events };

        (service, handle)
    }

    /// Replaces the gzip compressor used when `compress` is set.
    #[must_use]
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.flusher.set_compressor(compressor);
        self
    }

    /// Runs the service until shutdown.
    ///
    /// The service stops when a `Shutdown` command is received or when all
    /// handles are dropped. An attempt still in flight at that point runs
    /// to completion unobserved.
    pub async fn run(mut self) {
        debug!("SHIPPER | Service started");

        loop {
            // Completions and timers are polled before commands
            tokio::select! {
                biased;

                outcome = wait_in_flight(&mut self.flusher.in_flight) => {
                    self.flusher.on_complete(outcome);
                }
                () = wait_timer(&mut self.flusher.retry_timer) => {
                    self.flusher.retry_due();
                }
                () = wait_timer(&mut self.flush_timer) => {
                    self.flush();
                }
                command = self.rx.recv() => {
                    match command {
                        Some(ShipperCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
            }
        }

        debug!("SHIPPER | Service shutting down");
    }

    fn handle_command(&mut self, command: ShipperCommand) {
        match command {
            ShipperCommand::Log {
                statement,
                options,
                now_ms,
            } => {
                let normalized = self.registry.normalize_log(statement, options, now_ms);
                self.accept(normalized);
            }
            ShipperCommand::AgentLog { line, now_ms } => {
                let normalized = self.registry.normalize_agent(line, now_ms);
                self.accept(normalized);
            }
            ShipperCommand::Flush => self.flush(),
            ShipperCommand::AddMetaProperty { key, value } => {
                self.registry.add_meta_property(key.clone(), value.clone());
                self.events.emit(Event::MetaAdded { key, value });
            }
            ShipperCommand::RemoveMetaProperty { key } => {
                match self.registry.remove_meta_property(&key) {
                    Ok(()) => self.events.emit(Event::MetaRemoved { key }),
                    Err(warning) => self.events.emit(Event::Warn(warning)),
                }
            }
            ShipperCommand::Shutdown => {}
        }
    }

    fn accept(&mut self, normalized: Normalized) {
        match normalized {
            Normalized::Accepted { entry, diagnostics } => {
                for error in diagnostics {
                    self.events.emit(Event::Error(error));
                }
                self.append(entry);
            }
            Normalized::Ignored(warning) => self.events.emit(Event::Warn(warning)),
            Normalized::Rejected(error) => self.events.emit(Event::Error(error)),
        }
    }

    fn append(&mut self, entry: LogEntry) {
        let full = self.accumulator.append(entry);
        if full && !self.flusher.state().is_backed_off() {
            self.flush();
            return;
        }

        if self.flush_timer.is_none() {
            self.flush_timer = Some(Box::pin(tokio::time::sleep(self.config.flush_interval)));
        }
    }

    fn flush(&mut self) {
        self.flush_timer = None;

        if let Some(batch) = self.accumulator.take_batch() {
            debug!("SHIPPER | Closing batch of {} lines", batch.len());
            self.flusher.enqueue(batch);
        }

        if self.flusher.queue().is_empty() {
            self.events.emit(Event::Cleared(Cleared::NothingToSend));
            return;
        }
        self.flusher.send(false);
    }
}

async fn wait_timer(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => pending().await,
    }
}

async fn wait_in_flight<T>(task: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match task {
        Some(handle) => handle.await,
        None => pending().await,
    }
}
