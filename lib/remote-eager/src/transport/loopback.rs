// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process transport.
//!
//! Workers are [`WorkerService`]s registered under an endpoint address. A
//! channel is bound to the worker instance that was running when it
//! connected: stopping or replacing that worker breaks the channel, exactly
//! as a socket to a restarted process would break.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use remote_eager_common::Endpoint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use super::{RemoteRequest, TransportError, TransportKey, WorkerChannel, WorkerTransport};
use crate::worker::WorkerService;

/// Key reported by [`LoopbackTransport`].
pub const LOOPBACK_PROTOCOL: &str = "loopback";

struct HostedWorker {
    service: Arc<WorkerService>,
    running: AtomicBool,
}

/// In-process "network" of workers keyed by endpoint.
#[derive(Default)]
pub struct LoopbackTransport {
    workers: DashMap<Endpoint, Arc<HostedWorker>>,
    connects: DashMap<Endpoint, u64>,
    latency: RwLock<Duration>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve `service` at `endpoint`, replacing (and stopping) any worker
    /// already there.
    pub fn start_worker(&self, endpoint: &Endpoint, service: Arc<WorkerService>) {
        let hosted = Arc::new(HostedWorker {
            service,
            running: AtomicBool::new(true),
        });
        if let Some(previous) = self.workers.insert(endpoint.clone(), hosted) {
            previous.running.store(false, Ordering::Release);
        }
        tracing::debug!(%endpoint, "loopback worker started");
    }

    /// Stop the worker at `endpoint`. Channels to it fail from now on.
    pub fn stop_worker(&self, endpoint: &Endpoint) -> Option<Arc<WorkerService>> {
        let (_, hosted) = self.workers.remove(endpoint)?;
        hosted.running.store(false, Ordering::Release);
        tracing::debug!(%endpoint, "loopback worker stopped");
        Some(hosted.service.clone())
    }

    pub fn worker(&self, endpoint: &Endpoint) -> Option<Arc<WorkerService>> {
        self.workers
            .get(endpoint)
            .map(|hosted| hosted.service.clone())
    }

    /// Delay applied to every call before it reaches the worker.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Number of successful connects to `endpoint`.
    pub fn connect_count(&self, endpoint: &Endpoint) -> u64 {
        self.connects.get(endpoint).map_or(0, |count| *count)
    }
}

impl WorkerTransport for LoopbackTransport {
    fn key(&self) -> TransportKey {
        TransportKey::new(LOOPBACK_PROTOCOL)
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn WorkerChannel>, TransportError>> {
        let result = match self.workers.get(endpoint) {
            Some(hosted) if hosted.running.load(Ordering::Acquire) => {
                *self.connects.entry(endpoint.clone()).or_insert(0) += 1;
                let channel: Arc<dyn WorkerChannel> = Arc::new(LoopbackChannel {
                    endpoint: endpoint.clone(),
                    worker: hosted.clone(),
                    latency: *self.latency.read(),
                    closed: Arc::new(AtomicBool::new(false)),
                    calls: AtomicU64::new(0),
                });
                Ok(channel)
            }
            _ => Err(TransportError::ConnectFailed {
                endpoint: endpoint.clone(),
                reason: "no worker listening".to_string(),
            }),
        };
        Box::pin(async move { result })
    }
}

struct LoopbackChannel {
    endpoint: Endpoint,
    worker: Arc<HostedWorker>,
    latency: Duration,
    closed: Arc<AtomicBool>,
    calls: AtomicU64,
}

impl LoopbackChannel {
    fn usable(worker: &HostedWorker, closed: &AtomicBool) -> bool {
        worker.running.load(Ordering::Acquire) && !closed.load(Ordering::Acquire)
    }
}

impl WorkerChannel for LoopbackChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn call(
        &self,
        request: RemoteRequest,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let worker = self.worker.clone();
        let closed = self.closed.clone();
        let latency = self.latency;
        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if !Self::usable(&worker, &closed) {
                return Err(TransportError::Closed);
            }
            worker.service.clone().handle_blocking(request, payload).await
        })
    }

    fn is_healthy(&self) -> bool {
        Self::usable(&self.worker, &self.closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote_eager_common::LogicalDevice;

    fn whoami() -> RemoteRequest {
        RemoteRequest::RunOp {
            call_id: 0,
            view_id: 0,
            device: LogicalDevice::parse("/job:w/replica:0/task:1/device:CPU:0").unwrap(),
            op: "whoami".into(),
        }
    }

    #[tokio::test]
    async fn test_connect_and_call() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("a:1").unwrap();
        transport.start_worker(&endpoint, WorkerService::new("A"));

        let channel = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(channel.endpoint(), &endpoint);
        assert_eq!(
            channel.call(whoami(), Bytes::new()).await.unwrap(),
            Bytes::from_static(b"A")
        );
        assert_eq!(transport.connect_count(&endpoint), 1);
        assert_eq!(transport.key().as_str(), LOOPBACK_PROTOCOL);
    }

    #[tokio::test]
    async fn test_connect_without_worker_fails() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("nobody:1").unwrap();
        let err = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }

    #[tokio::test]
    async fn test_stop_breaks_existing_channel() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("a:1").unwrap();
        transport.start_worker(&endpoint, WorkerService::new("A"));
        let channel = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        transport.stop_worker(&endpoint);
        assert!(!channel.is_healthy());
        assert_eq!(
            channel.call(whoami(), Bytes::new()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_restart_needs_new_channel() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("a:1").unwrap();
        transport.start_worker(&endpoint, WorkerService::new("A"));
        let old = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        transport.start_worker(&endpoint, WorkerService::new("A2"));
        assert!(old.call(whoami(), Bytes::new()).await.is_err());

        let new = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            new.call(whoami(), Bytes::new()).await.unwrap(),
            Bytes::from_static(b"A2")
        );
        assert_eq!(transport.connect_count(&endpoint), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_stopped_during_latency() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("a:1").unwrap();
        transport.start_worker(&endpoint, WorkerService::new("A"));
        transport.set_latency(Duration::from_millis(100));
        let channel = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();

        let pending = channel.call(whoami(), Bytes::new());
        let handle = tokio::spawn(pending);
        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.stop_worker(&endpoint);
        assert_eq!(handle.await.unwrap(), Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_health_check() {
        let transport = LoopbackTransport::new();
        let endpoint = Endpoint::parse("a:1").unwrap();
        let service = WorkerService::new("A");
        transport.start_worker(&endpoint, service.clone());
        let channel = transport
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .unwrap();
        let status = channel.check_health(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status.instance, service.instance());

        channel.close();
        assert!(channel.check_health(Duration::from_secs(1)).await.is_err());
    }
}
