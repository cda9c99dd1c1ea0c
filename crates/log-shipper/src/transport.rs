// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport for request bodies produced by the flusher.
//!
//! The [`Transport`] trait is the seam between the delivery engine and the
//! network. [`ReqwestTransport`] is the production implementation; tests
//! drive the engine with scripted transports instead.
//!
//! A transport returns `Ok` for every HTTP response, whatever its status.
//! Only failures that produced no response at all become a
//! [`TransportError`], classified into an [`ErrorCode`].

use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use tracing::error;

use crate::config::Config;
use crate::constants::RETRYABLE_STATUS_CODES;

const CONTENT_TYPE_JSON: &str = "application/json; charset=UTF-8";

/// Classification of a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The endpoint answered with a non-success status.
    Status(u16),
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    BrokenPipe,
    AddrInUse,
    /// Name resolution failed.
    NotFound,
    NetworkUnreachable,
    AddrNotAvailable,
    Other(String),
}

impl ErrorCode {
    /// Whether a failure with this code is worth another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCode::Status(status) => RETRYABLE_STATUS_CODES.contains(status),
            ErrorCode::Other(_) => false,
            ErrorCode::Timeout
            | ErrorCode::ConnectionReset
            | ErrorCode::ConnectionRefused
            | ErrorCode::BrokenPipe
            | ErrorCode::AddrInUse
            | ErrorCode::NotFound
            | ErrorCode::NetworkUnreachable
            | ErrorCode::AddrNotAvailable => true,
        }
    }

    fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::TimedOut => Some(ErrorCode::Timeout),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Some(ErrorCode::ConnectionReset)
            }
            io::ErrorKind::ConnectionRefused => Some(ErrorCode::ConnectionRefused),
            io::ErrorKind::BrokenPipe => Some(ErrorCode::BrokenPipe),
            io::ErrorKind::AddrInUse => Some(ErrorCode::AddrInUse),
            io::ErrorKind::NotFound => Some(ErrorCode::NotFound),
            io::ErrorKind::NetworkUnreachable => Some(ErrorCode::NetworkUnreachable),
            io::ErrorKind::AddrNotAvailable => Some(ErrorCode::AddrNotAvailable),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Status(status) => write!(f, "{status}"),
            ErrorCode::Timeout => f.write_str("ETIMEDOUT"),
            ErrorCode::ConnectionReset => f.write_str("ECONNRESET"),
            ErrorCode::ConnectionRefused => f.write_str("ECONNREFUSED"),
            ErrorCode::BrokenPipe => f.write_str("EPIPE"),
            ErrorCode::AddrInUse => f.write_str("EADDRINUSE"),
            ErrorCode::NotFound => f.write_str("ENOTFOUND"),
            ErrorCode::NetworkUnreachable => f.write_str("ENETUNREACH"),
            ErrorCode::AddrNotAvailable => f.write_str("EADDRNOTAVAIL"),
            ErrorCode::Other(code) => f.write_str(code),
        }
    }
}

/// A failure that produced no HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub code: ErrorCode,
    pub message: String,
}

impl TransportError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let code = classify(&e);
        TransportError {
            code,
            message: e.to_string(),
        }
    }
}

fn classify(e: &reqwest::Error) -> ErrorCode {
    if e.is_timeout() {
        return ErrorCode::Timeout;
    }

    let mut source: Option<&(dyn Error + 'static)> = e.source();
    while let Some(inner) = source {
        if let Some(io_err) = inner.downcast_ref::<io::Error>() {
            if let Some(code) = ErrorCode::from_io_kind(io_err.kind()) {
                return code;
            }
        }
        source = inner.source();
    }

    if e.is_connect() {
        ErrorCode::ConnectionRefused
    } else {
        ErrorCode::Other("ERR_REQUEST".to_string())
    }
}

/// One delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    /// Endpoint without query string
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    /// Whether `body` is gzip-encoded
    pub gzip: bool,
}

impl DeliveryRequest {
    /// Endpoint with the encoded query string, as used in diagnostics.
    #[must_use]
    pub fn full_url(&self) -> String {
        match reqwest::Url::parse_with_params(&self.url, &self.query) {
            Ok(url) => url.to_string(),
            Err(_) => self.url.clone(),
        }
    }
}

/// Status and body of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and waits for its response.
    async fn post(&self, request: DeliveryRequest) -> Result<DeliveryResponse, TransportError>;
}

/// [`Transport`] backed by a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    key: String,
    user_agent: Option<HeaderValue>,
}

impl ReqwestTransport {
    #[must_use]
    pub fn new(config: &Arc<Config>) -> Self {
        let user_agent = if config.send_user_agent {
            HeaderValue::from_str(&config.user_agent()).ok()
        } else {
            None
        };
        ReqwestTransport {
            client: get_client(config),
            key: config.key.clone(),
            user_agent,
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn post(&self, request: DeliveryRequest) -> Result<DeliveryResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .query(&request.query)
            .basic_auth(&self.key, None::<&str>)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON);
        if request.gzip {
            builder = builder.header(CONTENT_ENCODING, "gzip");
        }
        if let Some(user_agent) = &self.user_agent {
            builder = builder.header(USER_AGENT, user_agent.clone());
        }

        let response = builder.body(request.body).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(DeliveryResponse { status, body })
    }
}

/// Builds the HTTP client, dropping a proxy that cannot be parsed.
#[must_use]
pub fn get_client(config: &Arc<Config>) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "SHIPPER | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "SHIPPER | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &Arc<Config>,
    allow_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut client = reqwest::Client::builder()
        .timeout(config.timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    // Proxy settings come from Config only, not from the process environment
    match config.proxy.as_deref() {
        Some(proxy_url) if allow_proxy => {
            client = client.proxy(reqwest::Proxy::all(proxy_url)?);
        }
        _ => client = client.no_proxy(),
    }

    client.build()
}
