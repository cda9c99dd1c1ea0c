// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;

use std::env;
use std::process::ExitCode;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_shipper::{
    AgentLine, Cleared, Config, Event, LogOptions, PayloadSchema, ShipperHandle, ShipperService,
};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LOGSHIP_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    init_logging(&log_level);

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let schema = config.payload_schema;
    let (service, handle) = match ShipperService::from_config(config) {
        Ok(pair) => pair,
        Err(e) => {
            error!("Unable to start shipper: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut events = handle.subscribe();
    let service_task = tokio::spawn(service.run());
    let mut reader = tokio::spawn(read_stdin(handle.clone(), schema));
    let mut input_done = false;
    let mut had_errors = false;

    loop {
        tokio::select! {
            lines = &mut reader, if !input_done => {
                input_done = true;
                match lines {
                    Ok(count) => debug!("Read {} lines from stdin", count),
                    Err(e) => error!("stdin reader failed: {}", e),
                }
                if handle.flush().is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                // Every flush is issued after input ends, so "nothing to
                // send" means every line reached a terminal outcome.
                Ok(Event::Cleared(Cleared::NothingToSend)) if input_done => break,
                Ok(Event::Cleared(Cleared::AllSent)) if input_done => {
                    if handle.flush().is_err() {
                        break;
                    }
                }
                Ok(event) => had_errors |= report(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} shipper events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    if handle.shutdown().is_ok() {
        let _ = service_task.await;
    }

    if had_errors {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn init_logging(log_level: &str) {
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");
    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .event_format(logger::Formatter)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");
}

/// Forwards stdin lines to the shipper until EOF. Returns the line count.
async fn read_stdin(handle: ShipperHandle, schema: PayloadSchema) -> usize {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        let sent = match schema {
            PayloadSchema::Default => handle.log(line, LogOptions::default()),
            PayloadSchema::Agent => handle.agent_log(AgentLine::new(line)),
        };
        if sent.is_err() {
            break;
        }
        count += 1;
    }

    count
}

/// Logs one shipper event. Returns `true` for terminal failures.
fn report(event: &Event) -> bool {
    match event {
        Event::Sent(report) => {
            info!(
                "Shipped {} lines (status {}, {} lines still queued)",
                report.total_lines_sent, report.http_status, report.total_lines_ready
            );
            false
        }
        Event::Error(e) if e.is_retrying() => {
            warn!("{}", e);
            false
        }
        Event::Error(e) => {
            error!("{}", e);
            true
        }
        Event::Warn(warning) => {
            warn!("{}", warning);
            false
        }
        Event::Cleared(cleared) => {
            debug!("{}", cleared.message());
            false
        }
        Event::MetaAdded { key, .. } => {
            debug!("Added meta property {}", key);
            false
        }
        Event::MetaRemoved { key } => {
            debug!("Removed meta property {}", key);
            false
        }
    }
}
