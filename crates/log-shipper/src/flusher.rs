// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of queued batches with compression and retry.
//!
//! ```text
//!   DeliveryQueue (head)
//!       │
//!       v
//!   ┌─────────────┐
//!   │  Serialize  │ (pluggable Serializer)
//!   └──────┬──────┘
//!          v
//!   ┌─────────────┐
//!   │  Compress   │ (gzip, falls back to raw)
//!   └──────┬──────┘
//!          v
//!   ┌─────────────┐
//!   │ HTTP POST   │ (one in flight)
//!   └──────┬──────┘
//!          v
//!   ┌─────────────┐
//!   │  Outcome    │ success / 207 / retry / discard
//!   └─────────────┘
//! ```
//!
//! The flusher is owned by the shipper service and driven from its event
//! loop: [`Flusher::send`] starts an attempt, the loop awaits
//! [`Flusher::in_flight`] and [`Flusher::retry_timer`], and hands the results
//! back to [`Flusher::on_complete`] and [`Flusher::retry_due`]. Only the
//! network call runs on a separate task.

use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::Deserialize;
use serde_json::Value;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Sleep;
use tracing::{debug, error, warn};

use crate::accumulator::Batch;
use crate::backoff::next_delay;
use crate::compressor::{Compressor, GzipCompressor};
use crate::config::Config;
use crate::constants::{PARTIAL_SUCCESS_STATUS, SUCCESS_STATUS};
use crate::error::{DeliveryFailure, ShipperError};
use crate::events::{Cleared, Event, EventEmitter, SendReport};
use crate::queue::DeliveryQueue;
use crate::serializer::Serializer;
use crate::transport::{
    DeliveryRequest, DeliveryResponse, ErrorCode, Transport, TransportError,
};

pub(crate) type InFlight = JoinHandle<Result<DeliveryResponse, TransportError>>;

/// Retry bookkeeping for the batch at the head of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryState {
    attempts: u32,
    backed_off: bool,
    sending: bool,
    current_backoff: Duration,
}

impl DeliveryState {
    /// Consecutive failed attempts for the head batch.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `true` while a retry is pending.
    #[must_use]
    pub fn is_backed_off(&self) -> bool {
        self.backed_off
    }

    /// `true` while an attempt is outstanding or scheduled.
    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// The last computed retry delay.
    #[must_use]
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }

    fn reset(&mut self) {
        *self = DeliveryState::default();
    }
}

#[derive(Deserialize)]
struct PartialSuccessBody {
    #[serde(default)]
    status: Vec<Value>,
}

pub struct Flusher {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    serializer: Arc<dyn Serializer>,
    compressor: Arc<dyn Compressor>,
    rng: Box<dyn RngCore + Send>,
    events: EventEmitter,
    state: DeliveryState,
    queue: DeliveryQueue,
    /// Full URL of the outstanding attempt, for diagnostics
    attempt_url: String,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) retry_timer: Option<Pin<Box<Sleep>>>,
}

impl Flusher {
    pub(crate) fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        serializer: Arc<dyn Serializer>,
        rng: Box<dyn RngCore + Send>,
        events: EventEmitter,
    ) -> Self {
        Flusher {
            config,
            transport,
            serializer,
            compressor: Arc::new(GzipCompressor),
            rng,
            events,
            state: DeliveryState::default(),
            queue: DeliveryQueue::new(),
            attempt_url: String::new(),
            in_flight: None,
            retry_timer: None,
        }
    }

    pub(crate) fn set_compressor(&mut self, compressor: Arc<dyn Compressor>) {
        self.compressor = compressor;
    }

    #[must_use]
    pub fn state(&self) -> &DeliveryState {
        &self.state
    }

    #[must_use]
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub(crate) fn enqueue(&mut self, batch: Batch) {
        self.queue.push_back(batch);
    }

    /// Starts delivery of the head batch.
    ///
    /// Does nothing while another attempt is outstanding unless `forced`,
    /// which only the retry timer uses.
    pub(crate) fn send(&mut self, forced: bool) {
        if self.state.sending && !forced {
            return;
        }
        self.state.sending = true;

        let Some(batch) = self.queue.head() else {
            self.state.sending = false;
            return;
        };

        let data = match self.serializer.serialize(batch) {
            Ok(data) => data,
            Err(e) => {
                error!("SHIPPER | Failed to serialize batch: {}", e);
                let error = ShipperError::Serialization {
                    actual: e.to_string(),
                    first_line: batch.first_line().unwrap_or_default().to_string(),
                    last_line: batch.last_line().map(ToString::to_string),
                    url: self.config.url.clone(),
                    lines: self.config.verbose_events.then(|| batch.entries().to_vec()),
                };
                self.state.sending = false;
                self.events.emit(Event::Error(error));
                return;
            }
        };

        let (body, gzip) = self.compress(data);
        let request = DeliveryRequest {
            url: self.config.url.clone(),
            query: self.query(),
            body,
            gzip,
        };
        self.attempt_url = request.full_url();

        debug!(
            "SHIPPER | Sending batch of {} lines ({} queued batches)",
            batch.len(),
            self.queue.len()
        );
        let transport = Arc::clone(&self.transport);
        self.in_flight = Some(tokio::spawn(async move { transport.post(request).await }));
    }

    /// Fires the pending retry.
    pub(crate) fn retry_due(&mut self) {
        self.retry_timer = None;
        self.send(true);
    }

    /// Handles the outcome of the outstanding attempt.
    pub(crate) fn on_complete(
        &mut self,
        outcome: Result<Result<DeliveryResponse, TransportError>, JoinError>,
    ) {
        self.in_flight = None;
        let result = outcome.unwrap_or_else(|e| {
            Err(TransportError::new(
                ErrorCode::Other("ERR_TASK".to_string()),
                e.to_string(),
            ))
        });

        match result {
            Ok(response) if (200..300).contains(&response.status) => self.on_success(&response),
            Ok(response) => self.on_failure(
                ErrorCode::Status(response.status),
                format!("Request failed with status code {}", response.status),
            ),
            Err(e) => self.on_failure(e.code, e.message),
        }
    }

    fn on_success(&mut self, response: &DeliveryResponse) {
        self.state.reset();
        let Some(mut batch) = self.queue.pop_front() else {
            return;
        };
        let first_line = batch.first_line().unwrap_or_default().to_string();
        let last_line = batch.last_line().map(ToString::to_string);

        if response.status == PARTIAL_SUCCESS_STATUS {
            self.reconcile(&mut batch, &response.body);
        }

        debug!(
            "SHIPPER | Delivered {} lines with status {}",
            batch.len(),
            response.status
        );
        self.events.emit(Event::Sent(SendReport {
            http_status: response.status,
            first_line,
            last_line,
            total_lines_sent: batch.len(),
            total_lines_ready: self.queue.total_lines_ready(),
            buffer_count: self.queue.len(),
            lines: self.config.verbose_events.then(|| batch.entries().to_vec()),
        }));

        self.next_or_clear();
    }

    /// Drops lines the endpoint rejected, reporting each one.
    fn reconcile(&self, batch: &mut Batch, body: &[u8]) {
        let statuses = match serde_json::from_slice::<PartialSuccessBody>(body) {
            Ok(parsed) => parsed.status,
            Err(e) => {
                warn!("SHIPPER | Unreadable partial success body: {}", e);
                Vec::new()
            }
        };

        for (index, status) in statuses.iter().enumerate() {
            let code = status.as_u64().and_then(|c| u16::try_from(c).ok());
            if code == Some(SUCCESS_STATUS) {
                continue;
            }
            let Some(entry) = batch.entries().get(index) else {
                break;
            };
            self.events.emit(Event::Error(ShipperError::LineRejected {
                status_code: code.unwrap_or_default(),
                line: entry.line().to_string(),
                entry: self.config.verbose_events.then(|| entry.clone()),
            }));
        }

        batch.retain_indexed(|index| match statuses.get(index) {
            None => true,
            Some(status) => status.as_u64() == Some(u64::from(SUCCESS_STATUS)),
        });
    }

    fn on_failure(&mut self, code: ErrorCode, actual: String) {
        self.state.attempts += 1;
        let attempts = self.state.attempts;
        let attempts_left = self.config.max_attempts.map_or(true, |max| attempts < max);
        let retrying = attempts_left && code.is_retryable();

        let failure = match self.queue.head() {
            Some(batch) => DeliveryFailure {
                actual,
                code,
                first_line: batch.first_line().unwrap_or_default().to_string(),
                last_line: batch.last_line().map(ToString::to_string),
                retrying,
                attempts,
                url: self.attempt_url.clone(),
                lines: self.config.verbose_events.then(|| batch.entries().to_vec()),
            },
            None => {
                self.state.reset();
                return;
            }
        };

        if retrying {
            let previous = (attempts > 1).then_some(self.state.current_backoff);
            let delay = next_delay(
                self.config.base_backoff,
                self.config.max_backoff,
                previous,
                &mut *self.rng,
            );
            self.state.backed_off = true;
            self.state.current_backoff = delay;
            self.retry_timer = Some(Box::pin(tokio::time::sleep(delay)));

            warn!(
                "SHIPPER | Attempt {} failed ({}), retrying in {} ms",
                attempts,
                failure.code,
                delay.as_millis()
            );
            if !self.config.ignore_retryable_errors {
                self.events.emit(Event::Error(ShipperError::Delivery(failure)));
            }
            return;
        }

        error!(
            "SHIPPER | Discarding batch after {} attempts: {} ({})",
            attempts, failure.actual, failure.code
        );
        self.state.reset();
        self.queue.pop_front();
        self.events.emit(Event::Error(ShipperError::Delivery(failure)));
        self.next_or_clear();
    }

    fn next_or_clear(&mut self) {
        if self.queue.is_empty() {
            self.events.emit(Event::Cleared(Cleared::AllSent));
        } else {
            self.send(false);
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let mut query = vec![("now", now.to_string())];
        let optional = [
            ("hostname", &self.config.hostname),
            ("mac", &self.config.mac),
            ("ip", &self.config.ip),
            ("tags", &self.config.tags),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                query.push((name, value.clone()));
            }
        }
        query
    }

    /// Returns the body to send and whether it is gzip-encoded.
    fn compress(&self, data: Vec<u8>) -> (Vec<u8>, bool) {
        if !self.config.compress {
            return (data, false);
        }

        match self.compressor.compress(&data) {
            Ok(compressed) => (compressed, true),
            Err(e) => {
                debug!("SHIPPER | Failed to compress data: {}", e);
                self.events.emit(Event::Error(ShipperError::Compression {
                    actual: e.to_string(),
                }));
                (data, false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{AgentLine, LogEntry};
    use crate::serializer::{JsonSerializer, SerializeError};
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io;
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    #[derive(Debug)]
    struct FailingSerializer;

    impl Serializer for FailingSerializer {
        fn serialize(&self, _batch: &Batch) -> Result<Vec<u8>, SerializeError> {
            Err(SerializeError("cyclic value".to_string()))
        }
    }

    #[derive(Debug)]
    struct FailingCompressor;

    impl Compressor for FailingCompressor {
        fn compress(&self, _data: &[u8]) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::Other, "encoder closed"))
        }
    }

    #[derive(Default)]
    struct OkTransport {
        requests: Mutex<Vec<DeliveryRequest>>,
    }

    #[async_trait]
    impl Transport for OkTransport {
        async fn post(&self, request: DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
            self.requests.lock().expect("lock").push(request);
            Ok(DeliveryResponse {
                status: 200,
                body: Vec::new(),
            })
        }
    }

    fn batch(lines: &[&str]) -> Batch {
        Batch::from(
            lines
                .iter()
                .map(|l| LogEntry::Agent(AgentLine::new(*l)))
                .collect::<Vec<_>>(),
        )
    }

    fn flusher(
        config: Config,
        serializer: Arc<dyn Serializer>,
    ) -> (Flusher, broadcast::Receiver<Event>) {
        flusher_with(config, serializer, Arc::new(OkTransport::default()))
    }

    fn flusher_with(
        config: Config,
        serializer: Arc<dyn Serializer>,
        transport: Arc<dyn Transport>,
    ) -> (Flusher, broadcast::Receiver<Event>) {
        let events = EventEmitter::new(64);
        let rx = events.subscribe();
        let flusher = Flusher::new(
            Arc::new(config),
            transport,
            serializer,
            Box::new(StdRng::seed_from_u64(3)),
            events,
        );
        (flusher, rx)
    }

    #[test]
    fn test_query_includes_configured_identity() {
        let config = Config {
            hostname: Some("web-1".to_string()),
            mac: None,
            ip: Some("10.0.0.1".to_string()),
            tags: Some("a,b".to_string()),
            ..Config::new("key")
        };
        let (flusher, _rx) = flusher(config, Arc::new(JsonSerializer));
        let query = flusher.query();
        let names: Vec<&str> = query.iter().map(|(name, _)| *name).collect();
        assert_eq!(names, vec!["now", "hostname", "ip", "tags"]);
    }

    #[tokio::test]
    async fn test_serialization_failure_keeps_batch() {
        let (mut flusher, mut rx) = flusher(Config::new("key"), Arc::new(FailingSerializer));
        flusher.enqueue(batch(&["first", "middle", "last"]));
        flusher.send(false);

        assert!(flusher.in_flight.is_none());
        assert!(!flusher.state().is_sending());
        assert_eq!(flusher.state().attempts(), 0);
        assert_eq!(flusher.queue().len(), 1);

        match rx.recv().await {
            Ok(Event::Error(ShipperError::Serialization {
                first_line,
                last_line,
                ..
            })) => {
                assert_eq!(first_line, "first");
                assert_eq!(last_line.as_deref(), Some("last"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_failure_discards_head() {
        let config = Config {
            hostname: None,
            ..Config::new("key")
        };
        let (mut flusher, mut rx) = flusher(config, Arc::new(JsonSerializer));
        flusher.enqueue(batch(&["a"]));
        flusher.enqueue(batch(&["b"]));
        flusher.send(false);
        let task = flusher.in_flight.take().expect("attempt started");
        task.abort();
        let _ = task.await;

        flusher.on_complete(Ok(Ok(DeliveryResponse {
            status: 400,
            body: Vec::new(),
        })));

        match rx.recv().await {
            Ok(Event::Error(ShipperError::Delivery(failure))) => {
                assert!(!failure.retrying);
                assert_eq!(failure.attempts, 1);
                assert_eq!(failure.code, ErrorCode::Status(400));
                assert_eq!(failure.first_line, "a");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(flusher.state().attempts(), 0);
        assert_eq!(flusher.queue().head().and_then(Batch::first_line), Some("b"));
        assert!(flusher.in_flight.is_some(), "next batch should be sent");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_schedules_retry() {
        let config = Config {
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
            ..Config::new("key")
        };
        let (mut flusher, _rx) = flusher(config, Arc::new(JsonSerializer));
        flusher.enqueue(batch(&["a"]));
        flusher.send(false);
        flusher.in_flight.take();

        flusher.on_complete(Ok(Ok(DeliveryResponse {
            status: 503,
            body: Vec::new(),
        })));

        assert!(flusher.state().is_backed_off());
        assert!(flusher.state().is_sending());
        assert_eq!(flusher.state().attempts(), 1);
        assert!(flusher.state().current_backoff() < Duration::from_millis(200));
        assert!(flusher.retry_timer.is_some());
        assert_eq!(flusher.queue().len(), 1);

        // A manual send while backed off is a no-op
        flusher.send(false);
        assert!(flusher.in_flight.is_none());

        flusher.retry_due();
        assert!(flusher.in_flight.is_some());
        assert!(flusher.retry_timer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delay_doubles_previous_delay() {
        let base = Duration::from_millis(1_000);
        let config = Config {
            base_backoff: base,
            max_backoff: Duration::from_millis(1_000_000),
            ..Config::new("key")
        };
        let (mut flusher, _rx) = flusher(config, Arc::new(JsonSerializer));
        flusher.enqueue(batch(&["a"]));
        flusher.send(false);

        let mut delays = Vec::new();
        for _ in 0..6 {
            flusher.in_flight.take().expect("attempt started").abort();
            flusher.on_complete(Ok(Ok(DeliveryResponse {
                status: 503,
                body: Vec::new(),
            })));
            delays.push(flusher.state().current_backoff());
            flusher.retry_due();
        }

        assert_eq!(flusher.state().attempts(), 6);
        assert!(delays[0] < base * 2, "{delays:?}");
        for pair in delays.windows(2) {
            if pair[0].is_zero() {
                assert_eq!(pair[1], base, "{delays:?}");
            } else {
                assert!(pair[1] < pair[0] * 2, "{delays:?}");
            }
        }
    }

    #[tokio::test]
    async fn test_compression_failure_sends_raw_body() {
        let transport = Arc::new(OkTransport::default());
        let config = Config {
            compress: true,
            ..Config::new("key")
        };
        let (mut flusher, mut rx) = flusher_with(
            config,
            Arc::new(JsonSerializer),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        flusher.set_compressor(Arc::new(FailingCompressor));
        flusher.enqueue(batch(&["plain"]));
        flusher.send(false);

        match rx.recv().await {
            Ok(Event::Error(ShipperError::Compression { actual })) => {
                assert_eq!(actual, "encoder closed");
            }
            other => panic!("unexpected event {other:?}"),
        }

        let outcome = flusher.in_flight.take().expect("attempt started").await;
        {
            let requests = transport.requests.lock().expect("lock");
            assert_eq!(requests.len(), 1);
            assert!(!requests[0].gzip);
            let body: Value = serde_json::from_slice(&requests[0].body).expect("raw json body");
            assert_eq!(body["ls"][0]["line"], "plain");
        }

        flusher.on_complete(outcome);
        assert!(matches!(rx.recv().await, Ok(Event::Sent(_))));
        assert_eq!(flusher.queue().len(), 0);
    }

    #[tokio::test]
    async fn test_compressed_body_is_flagged_gzip() {
        let transport = Arc::new(OkTransport::default());
        let config = Config {
            compress: true,
            ..Config::new("key")
        };
        let (mut flusher, _rx) = flusher_with(
            config,
            Arc::new(JsonSerializer),
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        flusher.enqueue(batch(&["squeezed"]));
        flusher.send(false);
        let _ = flusher.in_flight.take().expect("attempt started").await;

        let requests = transport.requests.lock().expect("lock");
        assert!(requests[0].gzip);
        assert_eq!(&requests[0].body[..2], &[0x1f, 0x8b]);
    }
}
