// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker connection pool.
//!
//! One connection per distinct endpoint, keyed by endpoint identity rather
//! than by task, so a task that moves to a new address always gets a fresh
//! connection. Hot path: a `DashMap` shard read plus one atomic increment for
//! the lease. Cold path (first use, or replacing an unreachable connection)
//! serializes per endpoint on a connect gate so concurrent callers share one
//! connect attempt.
//!
//! Connections whose endpoint leaves the membership are retired by
//! [`ConnectionPool::reconcile`] and torn down once their last lease is
//! released.

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use dashmap::DashMap;
use remote_eager_common::Endpoint;
use std::collections::BTreeSet;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::RemoteError;
use crate::inflight::{InFlightGuard, InFlightTracker};
use crate::transport::{
    HealthCheckError, RemoteRequest, TransportError, WorkerChannel, WorkerStatus, WorkerTransport,
};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Usable for new calls.
    Alive = 0,
    /// A call failed at the transport level; replaced on next use.
    Unreachable = 1,
    /// No current view references the endpoint; closed once leases drain.
    Retired = 2,
    /// Torn down.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Alive,
            1 => ConnectionState::Unreachable,
            2 => ConnectionState::Retired,
            _ => ConnectionState::Closed,
        }
    }
}

/// A channel to one endpoint plus its liveness and lease count.
pub struct Connection {
    id: u64,
    endpoint: Endpoint,
    channel: Arc<dyn WorkerChannel>,
    state: AtomicU8,
    leases: InFlightTracker,
}

impl Connection {
    fn new(id: u64, endpoint: Endpoint, channel: Arc<dyn WorkerChannel>) -> Self {
        Self {
            id,
            endpoint,
            channel,
            state: AtomicU8::new(ConnectionState::Alive as u8),
            leases: InFlightTracker::new(),
        }
    }

    /// Pool-unique id; a replacement connection to the same endpoint gets a new one.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_alive(&self) -> bool {
        self.state() == ConnectionState::Alive && self.channel.is_healthy()
    }

    /// Number of outstanding leases.
    pub fn in_flight_count(&self) -> usize {
        self.leases.in_flight_count()
    }

    fn mark_unreachable(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Alive as u8,
            ConnectionState::Unreachable as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn retire(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state < ConnectionState::Retired as u8).then_some(ConnectionState::Retired as u8)
            });
    }

    fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.channel.close();
    }

    /// Send one request. A connection fault (neither a worker reported
    /// error nor a request rejected before sending) marks the connection
    /// unreachable.
    pub async fn call(
        &self,
        request: RemoteRequest,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Bytes, TransportError> {
        let reply = self.channel.call(request, payload);
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, reply)
                .await
                .unwrap_or(Err(TransportError::Timeout(limit))),
            None => reply.await,
        };
        match &result {
            Err(e) if e.is_connection_fault() => {
                tracing::warn!(endpoint = %self.endpoint, connection = self.id, error = %e, "connection unreachable");
                self.mark_unreachable();
            }
            _ => {}
        }
        result
    }

    pub async fn check_health(&self, timeout: Duration) -> Result<WorkerStatus, HealthCheckError> {
        self.channel.check_health(timeout).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("leases", &self.in_flight_count())
            .finish()
    }
}

/// A connection held for the duration of one call. Teardown of a retired
/// connection waits for every lease to drop.
pub struct ConnectionLease {
    connection: Arc<Connection>,
    _lease: InFlightGuard,
}

impl ConnectionLease {
    fn new(connection: Arc<Connection>) -> Self {
        let lease = connection.leases.acquire();
        Self {
            connection,
            _lease: lease,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

/// Endpoint-keyed pool of worker connections.
pub struct ConnectionPool {
    transport: Arc<dyn WorkerTransport>,
    connections: DashMap<Endpoint, Arc<Connection>>,
    connect_gates: DashMap<Endpoint, Arc<Mutex<()>>>,
    /// Endpoints referenced by the current view; `None` until the first reconcile.
    live: ArcSwapOption<BTreeSet<Endpoint>>,
    connect_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(transport: Arc<dyn WorkerTransport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connections: DashMap::new(),
            connect_gates: DashMap::new(),
            live: ArcSwapOption::const_empty(),
            connect_timeout,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn WorkerTransport> {
        &self.transport
    }

    /// The pooled connection for `endpoint`, if any.
    pub fn connection(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        self.connections
            .get(endpoint)
            .map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of connections ever created by this pool.
    pub fn created_count(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    fn is_live(&self, endpoint: &Endpoint) -> bool {
        self.live
            .load_full()
            .is_none_or(|live| live.contains(endpoint))
    }

    fn try_lease(&self, endpoint: &Endpoint) -> Option<ConnectionLease> {
        let entry = self.connections.get(endpoint)?;
        entry
            .value()
            .is_alive()
            .then(|| ConnectionLease::new(entry.value().clone()))
    }

    /// Return the live connection for `endpoint`, creating it if needed.
    /// A connect failure is returned as `ConnectionUnavailable`; it is not
    /// retried.
    pub async fn get_or_create(&self, endpoint: &Endpoint) -> Result<ConnectionLease, RemoteError> {
        if let Some(lease) = self.try_lease(endpoint) {
            return Ok(lease);
        }

        let gate = self
            .connect_gates
            .entry(endpoint.clone())
            .or_default()
            .value()
            .clone();
        let _gate = gate.lock().await;

        // Another caller may have connected while we waited on the gate.
        if let Some(lease) = self.try_lease(endpoint) {
            return Ok(lease);
        }

        if let Some((_, stale)) = self
            .connections
            .remove_if(endpoint, |_, conn| !conn.is_alive())
        {
            tracing::debug!(%endpoint, connection = stale.id, state = ?stale.state(), "replacing connection");
            stale.retire();
            Self::teardown(stale);
        }

        tracing::debug!(%endpoint, "connecting");
        let channel = self
            .transport
            .connect(endpoint, self.connect_timeout)
            .await
            .map_err(|e| RemoteError::ConnectionUnavailable {
                endpoint: endpoint.clone(),
                reason: e.to_string(),
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(Connection::new(id, endpoint.clone(), channel));
        let lease = ConnectionLease::new(connection.clone());

        if !self.is_live(endpoint) {
            // Resolved against a superseded view: serve this call, keep nothing.
            connection.retire();
            Self::teardown(connection);
            return Ok(lease);
        }

        self.connections.insert(endpoint.clone(), connection);

        // reconcile() publishes the live set before scanning, so either its
        // scan saw the insert above or this check sees the new set.
        if !self.is_live(endpoint) {
            if let Some((_, connection)) = self.connections.remove(endpoint) {
                connection.retire();
                Self::teardown(connection);
            }
        }

        Ok(lease)
    }

    /// Allow pooling connections to `endpoints` in addition to the current
    /// live set. Used while an update waits for the outgoing view to drain.
    pub fn admit(&self, endpoints: &BTreeSet<Endpoint>) {
        self.live.rcu(|live| {
            live.as_ref()
                .map(|live| Arc::new(live.union(endpoints).cloned().collect::<BTreeSet<_>>()))
        });
    }

    /// Retire every connection whose endpoint is not in `endpoints`. Returns
    /// the number of connections retired.
    pub fn reconcile(&self, endpoints: &BTreeSet<Endpoint>) -> usize {
        self.live.store(Some(Arc::new(endpoints.clone())));

        let stale: Vec<Endpoint> = self
            .connections
            .iter()
            .filter(|entry| !endpoints.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut retired = 0;
        for endpoint in stale {
            if let Some((_, connection)) = self
                .connections
                .remove_if(&endpoint, |endpoint, _| !endpoints.contains(endpoint))
            {
                tracing::debug!(%endpoint, connection = connection.id, leases = connection.in_flight_count(), "retiring connection");
                connection.retire();
                Self::teardown(connection);
                retired += 1;
            }
        }
        self.connect_gates
            .retain(|endpoint, _| endpoints.contains(endpoint));
        retired
    }

    /// Health-check `endpoint` without changing the pool: an existing live
    /// connection is reused, otherwise a transient connection is opened and
    /// closed again.
    pub async fn probe(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<WorkerStatus, HealthCheckError> {
        if let Some(lease) = self.try_lease(endpoint) {
            return lease.check_health(timeout).await;
        }

        let channel = self
            .transport
            .connect(endpoint, timeout)
            .await
            .map_err(|_| HealthCheckError::ConnectionFailed)?;
        let status = channel.check_health(timeout).await;
        channel.close();
        status
    }

    fn teardown(connection: Arc<Connection>) {
        tokio::spawn(async move {
            connection.leases.wait_for_drain().await;
            connection.close();
            tracing::debug!(endpoint = %connection.endpoint, connection = connection.id, "connection closed");
        });
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("transport", &self.transport.key())
            .field("connections", &self.connections.len())
            .finish()
    }
}
