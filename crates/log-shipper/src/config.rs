// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shipper configuration.
//!
//! A [`Config`] is built once, validated, and then shared read-only as
//! `Arc<Config>` by every component of a shipper instance.

use std::env;
use std::net::IpAddr;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::constants;
use crate::error::ConfigError;
use crate::hostname::get_hostname;
use crate::payload::PayloadSchema;

/// Configuration for a single shipper instance
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingestion key, sent as the Basic auth username
    pub key: String,
    /// Ingestion endpoint
    pub url: String,
    pub hostname: Option<String>,
    pub mac: Option<String>,
    pub ip: Option<String>,
    /// Comma-joined tags sent with every request
    pub tags: Option<String>,
    /// Per-request timeout
    pub timeout: Duration,
    /// Line bytes in the open batch that trigger an immediate flush
    pub flush_byte_limit: usize,
    /// Idle time before a partial batch is flushed
    pub flush_interval: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Delivery attempts per batch; `None` retries forever
    pub max_attempts: Option<u32>,
    /// Suppress the error event for failures that will be retried
    pub ignore_retryable_errors: bool,
    /// gzip request bodies (agent schema only)
    pub compress: bool,
    pub payload_schema: PayloadSchema,
    /// Attach batch contents to send and error events
    pub verbose_events: bool,
    /// Default level for lines logged without one
    pub level: String,
    /// Accepted levels, uppercase
    pub levels: Vec<String>,
    pub app: String,
    pub env: Option<String>,
    /// Meta merged into every line
    pub meta: Map<String, Value>,
    /// Send meta as an object instead of a JSON string
    pub index_meta: bool,
    /// Extra option fields copied onto each line
    pub shim_properties: Vec<String>,
    pub send_user_agent: bool,
    /// Name of a transport helper appended to the user agent
    pub user_agent_suffix: Option<String>,
    pub proxy: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key: String::new(),
            url: constants::DEFAULT_URL.to_string(),
            hostname: get_hostname().filter(|name| is_valid_hostname(name)),
            mac: None,
            ip: None,
            tags: None,
            timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            flush_byte_limit: constants::FLUSH_BYTE_LIMIT,
            flush_interval: constants::FLUSH_INTERVAL,
            base_backoff: constants::BASE_BACKOFF,
            max_backoff: constants::MAX_BACKOFF,
            max_attempts: None,
            ignore_retryable_errors: true,
            compress: false,
            payload_schema: PayloadSchema::Default,
            verbose_events: false,
            level: constants::DEFAULT_LEVEL.to_string(),
            levels: constants::LOG_LEVELS.iter().map(ToString::to_string).collect(),
            app: constants::DEFAULT_APP.to_string(),
            env: None,
            meta: Map::new(),
            index_meta: false,
            shim_properties: Vec::new(),
            send_user_agent: true,
            user_agent_suffix: None,
            proxy: None,
        }
    }
}

impl Config {
    /// Default configuration for the given ingestion key.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Sets tags from a list, trimming entries and dropping empty ones.
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = tags
            .into_iter()
            .map(|tag| tag.as_ref().trim().to_string())
            .filter(|tag| !tag.is_empty())
            .collect::<Vec<_>>()
            .join(",");
        self.tags = if joined.is_empty() { None } else { Some(joined) };
        self
    }

    /// Replaces the level set. Levels are uppercased and deduplicated,
    /// keeping first-seen order.
    #[must_use]
    pub fn with_levels<I, S>(mut self, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<String> = Vec::new();
        for level in levels {
            let level = level.as_ref().to_uppercase();
            if !unique.contains(&level) {
                unique.push(level);
            }
        }
        self.levels = unique;
        self
    }

    /// User agent header value, stripped of non-printable characters.
    #[must_use]
    pub fn user_agent(&self) -> String {
        let raw = match &self.user_agent_suffix {
            Some(helper) => format!("{} ({helper})", constants::USER_AGENT),
            None => constants::USER_AGENT.to_string(),
        };
        raw.chars().filter(|c| (' '..='~').contains(c)).collect()
    }

    /// Create configuration from `LOGSHIP_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds a configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = lookup("LOGSHIP_KEY").ok_or(ConfigError::MissingKey)?;
        let mut config = Config::new(key);

        if let Some(url) = lookup("LOGSHIP_URL") {
            config.url = url;
        }
        if let Some(hostname) = lookup("LOGSHIP_HOSTNAME") {
            config.hostname = Some(hostname);
        }
        config.mac = lookup("LOGSHIP_MAC");
        config.ip = lookup("LOGSHIP_IP");
        if let Some(tags) = lookup("LOGSHIP_TAGS") {
            config = config.with_tags(tags.split(','));
        }
        if let Some(app) = lookup("LOGSHIP_APP") {
            config.app = app;
        }
        config.env = lookup("LOGSHIP_ENV");
        if let Some(level) = lookup("LOGSHIP_LEVEL") {
            config.level = level.to_uppercase();
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "LOGSHIP_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = parse_number::<usize>(&lookup, "LOGSHIP_FLUSH_LIMIT")? {
            config.flush_byte_limit = limit;
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "LOGSHIP_FLUSH_INTERVAL_MS")? {
            config.flush_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "LOGSHIP_BASE_BACKOFF_MS")? {
            config.base_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_number::<u64>(&lookup, "LOGSHIP_MAX_BACKOFF_MS")? {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_number::<i64>(&lookup, "LOGSHIP_MAX_ATTEMPTS")? {
            // Negative values mean "retry forever"
            config.max_attempts = u32::try_from(attempts).ok();
        }
        if let Some(schema) = lookup("LOGSHIP_PAYLOAD_SCHEMA") {
            config.payload_schema = schema.parse()?;
        }
        if let Some(compress) = parse_flag(&lookup, "LOGSHIP_COMPRESS") {
            config.compress = compress;
        }
        if let Some(verbose) = parse_flag(&lookup, "LOGSHIP_VERBOSE_EVENTS") {
            config.verbose_events = verbose;
        }
        if let Some(ignore) = parse_flag(&lookup, "LOGSHIP_IGNORE_RETRYABLE_ERRORS") {
            config.ignore_retryable_errors = ignore;
        }
        if let Some(index_meta) = parse_flag(&lookup, "LOGSHIP_INDEX_META") {
            config.index_meta = index_meta;
        }
        if let Some(send) = parse_flag(&lookup, "LOGSHIP_SEND_USER_AGENT") {
            config.send_user_agent = send;
        }
        config.proxy = lookup("LOGSHIP_PROXY").or_else(|| lookup("HTTPS_PROXY"));

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key.trim().is_empty() {
            return Err(ConfigError::MissingKey);
        }

        if !has_http_protocol(&self.url) {
            return Err(ConfigError::InvalidProtocol {
                field: "url",
                value: self.url.clone(),
            });
        }
        if let Some(proxy) = &self.proxy {
            if !has_http_protocol(proxy) {
                return Err(ConfigError::InvalidProtocol {
                    field: "proxy",
                    value: proxy.clone(),
                });
            }
        }

        if self.timeout > constants::MAX_REQUEST_TIMEOUT {
            return Err(ConfigError::TimeoutTooLong {
                got_ms: self.timeout.as_millis(),
                max_ms: constants::MAX_REQUEST_TIMEOUT.as_millis(),
            });
        }

        if self.flush_byte_limit == 0 {
            return Err(ConfigError::InvalidFlushLimit);
        }

        if self.base_backoff.is_zero() {
            return Err(ConfigError::InvalidBaseBackoff);
        }
        if self.max_backoff < self.base_backoff {
            return Err(ConfigError::InvalidMaxBackoff {
                base_ms: self.base_backoff.as_millis(),
                max_ms: self.max_backoff.as_millis(),
            });
        }

        if let Some(bad) = self
            .levels
            .iter()
            .find(|level| level.is_empty() || !level.chars().all(|c| c.is_ascii_alphabetic()))
        {
            return Err(ConfigError::InvalidCustomLevel(bad.clone()));
        }
        if !self.levels.contains(&self.level.to_uppercase()) {
            return Err(ConfigError::InvalidLevel {
                got: self.level.clone(),
                expected: self.levels.clone(),
            });
        }

        if let Some(hostname) = &self.hostname {
            if !is_valid_hostname(hostname) {
                return Err(ConfigError::InvalidHostname(hostname.clone()));
            }
        }
        if let Some(mac) = &self.mac {
            if !is_valid_mac(mac) {
                return Err(ConfigError::InvalidMac(mac.clone()));
            }
        }
        if let Some(ip) = &self.ip {
            if ip.parse::<IpAddr>().is_err() {
                return Err(ConfigError::InvalidIp(ip.clone()));
            }
        }

        if self.compress && self.payload_schema != PayloadSchema::Agent {
            return Err(ConfigError::CompressionUnavailable);
        }

        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvValue { name, value }),
    }
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    lookup(name).map(|val| val.to_lowercase() != "false")
}

fn has_http_protocol(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_valid_hostname(hostname: &str) -> bool {
    !hostname.is_empty()
        && hostname.split('.').all(|label| {
            !label.is_empty()
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        })
}

fn is_valid_mac(mac: &str) -> bool {
    let octets: Vec<&str> = mac.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
}
