// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hostname detection for the `hostname` query parameter.

use std::env;
use tracing::warn;

/// Get the system hostname
///
/// Tries the `HOSTNAME` environment variable first, then the
/// `gethostname` syscall. Returns `None` when neither yields a non-empty
/// UTF-8 name, in which case requests carry no hostname.
#[must_use]
pub fn get_hostname() -> Option<String> {
    if let Ok(hostname) = env::var("HOSTNAME") {
        if !hostname.is_empty() {
            return Some(hostname);
        }
    }

    system_hostname()
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname
            .to_str()
            .filter(|name| !name.is_empty())
            .map(ToString::to_string),
        Err(e) => {
            warn!("SHIPPER | Failed to get system hostname: {}", e);
            None
        }
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    warn!("SHIPPER | Could not determine hostname");
    None
}
