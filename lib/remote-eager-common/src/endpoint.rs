// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker endpoints.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Errors produced while parsing an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The address is not of the form `host:port`.
    #[error("malformed endpoint '{address}': {reason}")]
    Malformed {
        /// The offending input.
        address: String,
        /// What was wrong with it.
        reason: &'static str,
    },
}

/// Network address of one worker process.
///
/// Identity is the address string: two endpoints are equal iff their address
/// strings are equal, so `localhost:80` and `127.0.0.1:80` are different
/// endpoints and get different connections.
#[derive(Clone)]
pub struct Endpoint {
    address: String,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Parse `host:port` (IPv6 hosts must be bracketed: `[::1]:8080`).
    pub fn parse(address: &str) -> Result<Self, EndpointError> {
        let malformed = |reason| EndpointError::Malformed {
            address: address.to_string(),
            reason,
        };

        if address.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(malformed("unexpected character"));
        }

        let (host, port) = if let Some(rest) = address.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or(malformed("unterminated '['"))?;
            let port = tail.strip_prefix(':').ok_or(malformed("missing port"))?;
            (host, port)
        } else {
            let (host, port) = address.rsplit_once(':').ok_or(malformed("missing port"))?;
            if host.contains(':') {
                return Err(malformed("IPv6 hosts must be bracketed"));
            }
            (host, port)
        };

        if host.is_empty() {
            return Err(malformed("empty host"));
        }
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed("port must be numeric"));
        }
        let port = port.parse::<u16>().map_err(|_| malformed("port out of range"))?;

        Ok(Self {
            address: address.to_string(),
            host: host.to_string(),
            port,
        })
    }

    /// Build an endpoint from a host and a port.
    pub fn from_parts(host: &str, port: u16) -> Result<Self, EndpointError> {
        if host.contains(':') {
            Self::parse(&format!("[{host}]:{port}"))
        } else {
            Self::parse(&format!("{host}:{port}"))
        }
    }

    /// The address string this endpoint was parsed from.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host component (without IPv6 brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port component.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Endpoint {}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Endpoint({})", self.address)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Endpoint::parse(s)
    }
}

impl Serialize for Endpoint {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.address)
    }
}

impl<'de> Deserialize<'de> for Endpoint {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let address = String::deserialize(deserializer)?;
        Endpoint::parse(&address).map_err(serde::de::Error::custom)
    }
}
