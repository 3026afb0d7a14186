// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker transports.
//!
//! A [`WorkerTransport`] turns an [`Endpoint`] into a [`WorkerChannel`]; a
//! channel carries [`RemoteRequest`]s to exactly one worker process and
//! returns its replies. Channels are bound to the endpoint they were created
//! for and never follow a task to a different address.

pub mod loopback;
pub mod tcp;

use bytes::Bytes;
use futures::future::BoxFuture;
use remote_eager_common::{Endpoint, LogicalDevice};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::function::{FunctionDef, FunctionId};

/// Errors returned by individual transports.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No connection could be established to the endpoint.
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: Endpoint, reason: String },

    /// The connection closed before the reply arrived.
    #[error("connection closed before reply")]
    Closed,

    /// The call exceeded its deadline.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The worker received the request and reported a failure.
    #[error("{0}")]
    Remote(String),

    /// The request could not be encoded and was never sent.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// True when the worker ran the request and reported the failure.
    pub fn is_remote(&self) -> bool {
        matches!(self, TransportError::Remote(_))
    }

    /// True when the failure says the connection itself is broken.
    pub fn is_connection_fault(&self) -> bool {
        !matches!(self, TransportError::Remote(_) | TransportError::Rejected(_))
    }
}

/// Error type specific to health check operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckError {
    /// The worker could not be reached.
    #[error("Connection failed or peer unreachable")]
    ConnectionFailed,

    /// The health check exceeded the specified timeout.
    #[error("Health check timed out")]
    Timeout,

    /// The worker answered with something other than a status report.
    #[error("Malformed health report: {0}")]
    Malformed(String),
}

/// Unique key identifying a transport (e.g. `"tcp"`, `"loopback"`).
///
/// A cluster definition names its protocol; it must match the key of the
/// transport the execution context was built with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey(Arc<str>);

impl TransportKey {
    /// Create a new TransportKey from any type that can be converted into Arc<str>.
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One request to a worker. Op inputs and outputs travel as opaque payload
/// bytes next to the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    /// Run a single op on a device owned by the worker.
    RunOp {
        call_id: u64,
        view_id: u64,
        device: LogicalDevice,
        op: String,
    },
    /// Make a traced function invocable on the worker.
    RegisterFunction { function: FunctionDef },
    /// Run one component of a registered function.
    RunComponent {
        call_id: u64,
        view_id: u64,
        function: FunctionId,
        component: usize,
        device: LogicalDevice,
    },
    /// Health check; answered with an encoded [`WorkerStatus`].
    Ping,
}

impl RemoteRequest {
    /// View id the request was resolved against, if it carries one.
    pub fn view_id(&self) -> Option<u64> {
        match self {
            RemoteRequest::RunOp { view_id, .. } | RemoteRequest::RunComponent { view_id, .. } => {
                Some(*view_id)
            }
            RemoteRequest::RegisterFunction { .. } | RemoteRequest::Ping => None,
        }
    }
}

/// Health report of one worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    /// Identity of the worker process; changes when the worker restarts.
    pub instance: Uuid,
    /// Highest view id seen on a call, if any call arrived yet.
    pub last_view_id: Option<u64>,
    pub registered_functions: usize,
}

impl WorkerStatus {
    pub fn encode(&self) -> Result<Bytes, TransportError> {
        rmp_serde::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, HealthCheckError> {
        rmp_serde::from_slice(bytes).map_err(|e| HealthCheckError::Malformed(e.to_string()))
    }
}

/// A connection to one worker.
pub trait WorkerChannel: Send + Sync {
    /// The endpoint this channel was opened to.
    fn endpoint(&self) -> &Endpoint;

    /// Send a request and wait for its reply.
    fn call(
        &self,
        request: RemoteRequest,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, TransportError>>;

    /// Round-trip a `Ping` bounded by `timeout`.
    fn check_health(
        &self,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<WorkerStatus, HealthCheckError>> {
        let reply = self.call(RemoteRequest::Ping, Bytes::new());
        Box::pin(async move {
            match tokio::time::timeout(timeout, reply).await {
                Ok(Ok(bytes)) => WorkerStatus::decode(&bytes),
                Ok(Err(_)) => Err(HealthCheckError::ConnectionFailed),
                Err(_) => Err(HealthCheckError::Timeout),
            }
        })
    }

    /// Cheap local liveness check; false once the channel is known to be broken.
    fn is_healthy(&self) -> bool;

    /// Tear the channel down. Outstanding calls fail with [`TransportError::Closed`].
    fn close(&self);
}

/// Factory for [`WorkerChannel`]s.
pub trait WorkerTransport: Send + Sync {
    /// Unique key identifying this transport.
    fn key(&self) -> TransportKey;

    /// Open a channel to `endpoint`, bounded by `timeout`.
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn WorkerChannel>, TransportError>>;
}
