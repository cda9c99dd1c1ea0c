// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Payload schemas and entry normalization.
//!
//! Two line shapes are understood by the ingestion endpoint:
//!
//! - **default**: `{timestamp, line, level, app, env, meta}`, produced from a
//!   free-form statement plus [`LogOptions`].
//! - **agent**: `{t, label, line, f, pid, prival, containerid}`, passed
//!   through from a host collector with only `t` filled in.
//!
//! The active schema is fixed by [`Config::payload_schema`]. The
//! [`SchemaRegistry`] turns caller input into a [`LogEntry`] of that shape,
//! or explains why it could not.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::constants::TIMESTAMP_TOLERANCE_MS;
use crate::error::{ConfigError, ShipperError, Warning};

/// Line shape accepted by the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PayloadSchema {
    #[default]
    Default,
    Agent,
}

impl PayloadSchema {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadSchema::Default => "default",
            PayloadSchema::Agent => "agent",
        }
    }
}

impl fmt::Display for PayloadSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayloadSchema {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(PayloadSchema::Default),
            "agent" => Ok(PayloadSchema::Agent),
            _ => Err(ConfigError::InvalidPayloadSchema(s.to_string())),
        }
    }
}

/// Meta attached to a default-schema line.
///
/// The endpoint indexes object meta; string meta is stored as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Meta {
    Indexed(Map<String, Value>),
    Encoded(String),
}

/// A default-schema line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DefaultLine {
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub line: String,
    pub level: String,
    pub app: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    pub meta: Meta,
    #[serde(rename = "logSourceCRN", skip_serializing_if = "Option::is_none")]
    pub log_source_crn: Option<String>,
    #[serde(rename = "saveServiceCopy", skip_serializing_if = "Option::is_none")]
    pub save_service_copy: Option<bool>,
    #[serde(rename = "appOverride", skip_serializing_if = "Option::is_none")]
    pub app_override: Option<String>,
    /// Fields named in [`Config::shim_properties`]
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An agent-schema line.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentLine {
    /// Milliseconds since the Unix epoch, filled in at append time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<Map<String, Value>>,
    pub line: String,
    /// Source file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub f: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Syslog priority value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prival: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub containerid: Option<String>,
}

impl AgentLine {
    #[must_use]
    pub fn new(line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            ..Default::default()
        }
    }
}

/// A normalized line, ready to be buffered.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogEntry {
    Default(DefaultLine),
    Agent(AgentLine),
}

impl LogEntry {
    /// The primary text of the entry.
    #[must_use]
    pub fn line(&self) -> &str {
        match self {
            LogEntry::Default(entry) => &entry.line,
            LogEntry::Agent(entry) => &entry.line,
        }
    }

    /// Bytes counted against the flush limit.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.line().len()
    }
}

/// What the caller wants logged.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Text(String),
    /// Stringified into the line
    Structured(Value),
}

impl Statement {
    fn is_empty(&self) -> bool {
        match self {
            Statement::Text(text) => text.is_empty(),
            Statement::Structured(Value::Null) => true,
            Statement::Structured(Value::String(text)) => text.is_empty(),
            Statement::Structured(_) => false,
        }
    }

    fn into_line(self) -> String {
        match self {
            Statement::Text(text) | Statement::Structured(Value::String(text)) => text,
            Statement::Structured(value) => value.to_string(),
        }
    }
}

impl From<&str> for Statement {
    fn from(text: &str) -> Self {
        Statement::Text(text.to_string())
    }
}

impl From<String> for Statement {
    fn from(text: String) -> Self {
        Statement::Text(text)
    }
}

impl From<Value> for Statement {
    fn from(value: Value) -> Self {
        Statement::Structured(value)
    }
}

/// Per-line overrides for default-schema logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogOptions {
    pub level: Option<String>,
    pub app: Option<String>,
    pub env: Option<String>,
    /// Honored only within one day of the current time
    pub timestamp: Option<u64>,
    pub meta: Option<Map<String, Value>>,
    /// Used as meta when `meta` is not set
    pub context: Option<Map<String, Value>>,
    pub index_meta: Option<bool>,
    pub log_source_crn: Option<String>,
    pub save_service_copy: Option<bool>,
    pub app_override: Option<String>,
    /// Copied onto the line when named in [`Config::shim_properties`]
    pub extra: Map<String, Value>,
}

impl LogOptions {
    /// Options that only set a level.
    #[must_use]
    pub fn with_level(level: impl Into<String>) -> Self {
        Self {
            level: Some(level.into()),
            ..Default::default()
        }
    }
}

/// Outcome of normalizing caller input.
#[derive(Debug)]
pub enum Normalized {
    /// The entry should be buffered. `diagnostics` are reported but do not
    /// stop the entry.
    Accepted {
        entry: LogEntry,
        diagnostics: Vec<ShipperError>,
    },
    Ignored(Warning),
    Rejected(ShipperError),
}

/// Builds entries for the active schema and owns the logger-wide meta.
#[derive(Debug)]
pub struct SchemaRegistry {
    config: Arc<Config>,
    meta: Map<String, Value>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let meta = config.meta.clone();
        Self { config, meta }
    }

    #[must_use]
    pub fn schema(&self) -> PayloadSchema {
        self.config.payload_schema
    }

    /// Logger-wide meta merged under each line's meta.
    #[must_use]
    pub fn meta(&self) -> &Map<String, Value> {
        &self.meta
    }

    pub fn add_meta_property(&mut self, key: String, value: Value) {
        self.meta.insert(key, value);
    }

    pub fn remove_meta_property(&mut self, key: &str) -> Result<(), Warning> {
        self.meta
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Warning::UnknownMetaProperty {
                key: key.to_string(),
            })
    }

    /// Normalizes a default-schema statement stamped at `now_ms`.
    #[must_use]
    pub fn normalize_log(&self, statement: Statement, opts: LogOptions, now_ms: u64) -> Normalized {
        if statement.is_empty() {
            return Normalized::Ignored(Warning::EmptyStatement);
        }
        if let Some(rejected) = self.check_method(PayloadSchema::Default) {
            return Normalized::Rejected(rejected);
        }

        let config = &self.config;
        let mut diagnostics = Vec::new();

        let mut level = config.level.to_uppercase();
        if let Some(requested) = opts.level {
            let requested = requested.to_uppercase();
            if config.levels.contains(&requested) {
                level = requested;
            } else {
                diagnostics.push(ShipperError::InvalidLevel {
                    got: requested,
                    expected: config.levels.clone(),
                    used: level.clone(),
                });
            }
        }

        let timestamp = opts
            .timestamp
            .filter(|ts| ts.abs_diff(now_ms) <= TIMESTAMP_TOLERANCE_MS)
            .unwrap_or(now_ms);

        let line_meta = match (opts.meta, opts.context) {
            (Some(meta), _) => meta,
            (None, Some(context)) => context,
            (None, None) => Map::new(),
        };
        let mut merged = self.meta.clone();
        merged.extend(line_meta);
        let meta = if opts.index_meta.unwrap_or(config.index_meta) {
            Meta::Indexed(merged)
        } else {
            Meta::Encoded(Value::Object(merged).to_string())
        };

        let mut extra = Map::new();
        for prop in &config.shim_properties {
            if let Some(value) = opts.extra.get(prop) {
                extra.insert(prop.clone(), value.clone());
            }
        }

        let entry = DefaultLine {
            timestamp,
            line: statement.into_line(),
            level,
            app: opts
                .app
                .filter(|app| !app.is_empty())
                .unwrap_or_else(|| config.app.clone()),
            env: opts.env.filter(|env| !env.is_empty()).or_else(|| config.env.clone()),
            meta,
            log_source_crn: opts.log_source_crn.filter(|crn| !crn.is_empty()),
            save_service_copy: opts.save_service_copy.filter(|save| *save),
            app_override: opts.app_override.filter(|app| !app.is_empty()),
            extra,
        };

        Normalized::Accepted {
            entry: LogEntry::Default(entry),
            diagnostics,
        }
    }

    /// Normalizes an agent-schema line stamped at `now_ms`.
    #[must_use]
    pub fn normalize_agent(&self, mut line: AgentLine, now_ms: u64) -> Normalized {
        if let Some(rejected) = self.check_method(PayloadSchema::Agent) {
            return Normalized::Rejected(rejected);
        }
        if line.line.is_empty() {
            return Normalized::Ignored(Warning::EmptyStatement);
        }
        line.t = Some(line.t.unwrap_or(now_ms));
        Normalized::Accepted {
            entry: LogEntry::Agent(line),
            diagnostics: Vec::new(),
        }
    }

    fn check_method(&self, expected: PayloadSchema) -> Option<ShipperError> {
        let active = self.schema();
        (active != expected).then_some(ShipperError::InvalidMethod { active, expected })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    fn registry(config: Config) -> SchemaRegistry {
        SchemaRegistry::new(Arc::new(config))
    }

    fn accepted(normalized: Normalized) -> (LogEntry, Vec<ShipperError>) {
        match normalized {
            Normalized::Accepted { entry, diagnostics } => (entry, diagnostics),
            other => panic!("expected accepted entry, got {other:?}"),
        }
    }

    #[test]
    fn test_schema_parse() {
        assert_eq!("agent".parse::<PayloadSchema>(), Ok(PayloadSchema::Agent));
        assert_eq!(" Default ".parse::<PayloadSchema>(), Ok(PayloadSchema::Default));
        assert!(matches!(
            "syslog".parse::<PayloadSchema>(),
            Err(ConfigError::InvalidPayloadSchema(_))
        ));
    }

    #[test]
    fn test_default_line_shape() {
        let registry = registry(Config::new("key"));
        let (entry, diagnostics) =
            accepted(registry.normalize_log("x".into(), LogOptions::with_level("info"), NOW));
        assert!(diagnostics.is_empty());

        let json = serde_json::to_value(&entry).expect("serializable");
        assert_eq!(json["line"], "x");
        assert_eq!(json["level"], "INFO");
        assert_eq!(json["timestamp"], NOW);
        assert_eq!(json["app"], "default");
        assert_eq!(json["meta"], "{}");
        assert!(json.get("env").is_none());
        assert_eq!(entry.size_bytes(), 1);
    }

    #[test]
    fn test_structured_statement_is_stringified() {
        let registry = registry(Config::new("key"));
        let (entry, _) = accepted(registry.normalize_log(
            json!({"event": "login", "ok": true}).into(),
            LogOptions::default(),
            NOW,
        ));
        assert_eq!(entry.line(), r#"{"event":"login","ok":true}"#);
    }

    #[test]
    fn test_empty_statement_is_ignored() {
        let registry = registry(Config::new("key"));
        assert!(matches!(
            registry.normalize_log("".into(), LogOptions::default(), NOW),
            Normalized::Ignored(Warning::EmptyStatement)
        ));
        assert!(matches!(
            registry.normalize_log(Value::Null.into(), LogOptions::default(), NOW),
            Normalized::Ignored(Warning::EmptyStatement)
        ));
    }

    #[test]
    fn test_invalid_level_falls_back_to_default() {
        let registry = registry(Config::new("key"));
        let (entry, diagnostics) =
            accepted(registry.normalize_log("x".into(), LogOptions::with_level("loud"), NOW));
        let LogEntry::Default(line) = entry else {
            panic!("expected default line");
        };
        assert_eq!(line.level, "INFO");
        assert!(matches!(
            diagnostics.as_slice(),
            [ShipperError::InvalidLevel { got, used, .. }] if got == "LOUD" && used == "INFO"
        ));
    }

    #[test]
    fn test_timestamp_window() {
        let registry = registry(Config::new("key"));
        let opts = LogOptions {
            timestamp: Some(NOW - 1_000),
            ..Default::default()
        };
        let (entry, _) = accepted(registry.normalize_log("x".into(), opts, NOW));
        assert!(matches!(entry, LogEntry::Default(ref l) if l.timestamp == NOW - 1_000));

        let opts = LogOptions {
            timestamp: Some(NOW - TIMESTAMP_TOLERANCE_MS - 1),
            ..Default::default()
        };
        let (entry, _) = accepted(registry.normalize_log("x".into(), opts, NOW));
        assert!(matches!(entry, LogEntry::Default(ref l) if l.timestamp == NOW));
    }

    #[test]
    fn test_meta_merging_and_indexing() {
        let mut config = Config::new("key");
        config.meta.insert("service".to_string(), json!("api"));
        config.meta.insert("region".to_string(), json!("us"));
        let mut registry = registry(config);
        registry.add_meta_property("build".to_string(), json!(42));

        let mut line_meta = Map::new();
        line_meta.insert("region".to_string(), json!("eu"));
        let opts = LogOptions {
            meta: Some(line_meta),
            index_meta: Some(true),
            ..Default::default()
        };
        let (entry, _) = accepted(registry.normalize_log("x".into(), opts, NOW));
        let json = serde_json::to_value(&entry).expect("serializable");
        assert_eq!(json["meta"], json!({"service": "api", "region": "eu", "build": 42}));

        let mut context = Map::new();
        context.insert("request".to_string(), json!("abc"));
        let opts = LogOptions {
            context: Some(context),
            ..Default::default()
        };
        let (entry, _) = accepted(registry.normalize_log("x".into(), opts, NOW));
        let LogEntry::Default(line) = entry else {
            panic!("expected default line");
        };
        let Meta::Encoded(encoded) = line.meta else {
            panic!("expected encoded meta");
        };
        let decoded: Value = serde_json::from_str(&encoded).expect("valid json");
        assert_eq!(decoded["request"], "abc");
        assert_eq!(decoded["service"], "api");
    }

    #[test]
    fn test_remove_meta_property() {
        let mut registry = registry(Config::new("key"));
        registry.add_meta_property("a".to_string(), json!(1));
        assert_eq!(registry.remove_meta_property("a"), Ok(()));
        assert_eq!(
            registry.remove_meta_property("a"),
            Err(Warning::UnknownMetaProperty {
                key: "a".to_string()
            })
        );
        assert!(registry.meta().is_empty());
    }

    #[test]
    fn test_shim_properties_and_optional_fields() {
        let config = Config {
            shim_properties: vec!["trace_id".to_string()],
            ..Config::new("key")
        };
        let registry = registry(config);
        let mut extra = Map::new();
        extra.insert("trace_id".to_string(), json!("t-1"));
        extra.insert("ignored".to_string(), json!("nope"));
        let opts = LogOptions {
            extra,
            app_override: Some("billing".to_string()),
            save_service_copy: Some(true),
            log_source_crn: Some("crn:v1:log".to_string()),
            ..Default::default()
        };
        let (entry, _) = accepted(registry.normalize_log("x".into(), opts, NOW));
        let json = serde_json::to_value(&entry).expect("serializable");
        assert_eq!(json["trace_id"], "t-1");
        assert!(json.get("ignored").is_none());
        assert_eq!(json["appOverride"], "billing");
        assert_eq!(json["saveServiceCopy"], true);
        assert_eq!(json["logSourceCRN"], "crn:v1:log");
    }

    #[test]
    fn test_wrong_method_for_schema() {
        let registry = registry(Config::new("key"));
        assert!(matches!(
            registry.normalize_agent(AgentLine::new("x"), NOW),
            Normalized::Rejected(ShipperError::InvalidMethod {
                active: PayloadSchema::Default,
                expected: PayloadSchema::Agent
            })
        ));

        let agent = registry_for_agent();
        assert!(matches!(
            agent.normalize_log("x".into(), LogOptions::default(), NOW),
            Normalized::Rejected(ShipperError::InvalidMethod { .. })
        ));
    }

    fn registry_for_agent() -> SchemaRegistry {
        registry(Config {
            payload_schema: PayloadSchema::Agent,
            ..Config::new("key")
        })
    }

    #[test]
    fn test_agent_line_passthrough() {
        let registry = registry_for_agent();
        let line = AgentLine {
            f: Some("/var/log/syslog".to_string()),
            pid: Some(42),
            ..AgentLine::new("kernel: hello")
        };
        let (entry, _) = accepted(registry.normalize_agent(line, NOW));
        let json = serde_json::to_value(&entry).expect("serializable");
        assert_eq!(json["t"], NOW);
        assert_eq!(json["line"], "kernel: hello");
        assert_eq!(json["f"], "/var/log/syslog");
        assert_eq!(json["pid"], 42);
        assert!(json.get("containerid").is_none());

        assert!(matches!(
            registry.normalize_agent(AgentLine::new(""), NOW),
            Normalized::Ignored(Warning::EmptyStatement)
        ));
    }
}
