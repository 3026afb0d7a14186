// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP listener serving a [`WorkerService`].
//!
//! Each accepted connection gets a reader loop and a writer task. Requests are
//! executed concurrently; replies carry the request's correlation id and are
//! written in completion order.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::StreamExt;
use remote_eager_common::Endpoint;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::framing::{
    FrameType, RequestHeader, ResponseHeader, TcpFrameCodec, decode_header, encode_header,
};
use crate::transport::TransportError;
use crate::worker::WorkerService;

/// A running worker listener. Dropping it stops the listener and closes every
/// accepted connection.
pub struct WorkerServer {
    local_addr: SocketAddr,
    endpoint: Endpoint,
    service: Arc<WorkerService>,
    cancel_token: CancellationToken,
}

impl WorkerServer {
    /// Bind `addr` (e.g. `127.0.0.1:0`) and start serving `service`.
    pub async fn bind(addr: &str, service: Arc<WorkerService>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind worker listener to {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to get local address")?;
        let endpoint = Endpoint::parse(&local_addr.to_string())
            .context("Listener address is not a valid endpoint")?;
        info!(worker = %service.name(), %endpoint, "worker listener bound");

        let cancel_token = CancellationToken::new();
        tokio::spawn(run_server(listener, service.clone(), cancel_token.clone()));

        Ok(Self {
            local_addr,
            endpoint,
            service,
            cancel_token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address clients connect to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn service(&self) -> &Arc<WorkerService> {
        &self.service
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for WorkerServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn run_server(
    listener: TcpListener,
    service: Arc<WorkerService>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("Accepted TCP connection from {}", peer_addr);
                        let service = service.clone();
                        let cancel_token = cancel_token.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, peer_addr, service, cancel_token).await
                            {
                                warn!("Error handling connection from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                info!(worker = %service.name(), "worker listener shutting down");
                break;
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: Arc<WorkerService>,
    cancel_token: CancellationToken,
) -> Result<()> {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY on {}: {}", peer_addr, e);
    }

    let (read_half, mut write_half) = stream.into_split();
    let (tx, rx) = flume::unbounded::<Bytes>();
    let connection_token = cancel_token.child_token();

    let writer = {
        let connection_token = connection_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = rx.recv_async() => {
                        let Ok(frame) = frame else { break };
                        if let Err(e) = write_half.write_all(&frame).await {
                            debug!("Write to {} failed: {}", peer_addr, e);
                            break;
                        }
                    }
                    _ = connection_token.cancelled() => break,
                }
            }
            let _ = write_half.shutdown().await;
        })
    };

    let mut framed = FramedRead::new(read_half, TcpFrameCodec::new());
    let result = loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = connection_token.cancelled() => break Ok(()),
        };

        match frame {
            Some(Ok((FrameType::Request, header, payload))) => {
                let header: RequestHeader = match decode_header(&header) {
                    Ok(header) => header,
                    Err(e) => {
                        error!("Undecodable request header from {}: {}", peer_addr, e);
                        break Err(anyhow::anyhow!("protocol error: {e}"));
                    }
                };
                let service = service.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let correlation = header.correlation;
                    let outcome = service.handle_blocking(header.request, payload).await;
                    match encode_reply(correlation, outcome) {
                        Ok(frame) => {
                            let _ = tx.send(frame);
                        }
                        Err(e) => error!(correlation, "Failed to encode reply: {}", e),
                    }
                });
            }
            Some(Ok((frame_type, _, _))) => {
                error!("Unexpected {:?} frame from {}", frame_type, peer_addr);
                break Err(anyhow::anyhow!("unexpected {frame_type:?} frame"));
            }
            Some(Err(e)) => {
                error!("Frame decode error from {}: {}", peer_addr, e);
                break Err(e.into());
            }
            None => {
                debug!("Connection from {} closed gracefully", peer_addr);
                break Ok(());
            }
        }
    };

    connection_token.cancel();
    let _ = writer.await;
    result
}

/// Encode the reply for `correlation`. A result that cannot be framed is
/// answered with an error reply so the caller never waits on it.
fn encode_reply(correlation: u64, outcome: Result<Bytes, TransportError>) -> Result<Bytes> {
    reply_frame(correlation, outcome).or_else(|e| {
        warn!(correlation, "Reply could not be framed: {}", e);
        reply_frame(
            correlation,
            Err(TransportError::Remote(format!("reply could not be sent: {e}"))),
        )
    })
}

fn reply_frame(
    correlation: u64,
    outcome: Result<Bytes, TransportError>,
) -> Result<Bytes> {
    let (error, payload) = match outcome {
        Ok(payload) => (None, payload),
        Err(e) => (Some(e.to_string()), Bytes::new()),
    };
    let header = encode_header(&ResponseHeader { correlation, error })?;
    Ok(TcpFrameCodec::encode_frame(
        FrameType::Response,
        &header,
        &payload,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tcp::TcpTransport;
    use crate::transport::{RemoteRequest, WorkerTransport};
    use remote_eager_common::LogicalDevice;
    use std::time::Duration;

    fn run(op: &str) -> RemoteRequest {
        RemoteRequest::RunOp {
            call_id: 0,
            view_id: 2,
            device: LogicalDevice::parse("/job:w/replica:0/task:1/device:CPU:0").unwrap(),
            op: op.into(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let service = WorkerService::new("tcp-worker");
        let server = WorkerServer::bind("127.0.0.1:0", service.clone()).await.unwrap();

        let channel = TcpTransport::new()
            .connect(server.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();
        let out = channel
            .call(run("identity"), Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert_eq!(out, Bytes::from_static(b"payload"));
        assert_eq!(service.last_view_id(), Some(2));

        let err = channel.call(run("missing"), Bytes::new()).await.unwrap_err();
        assert_eq!(err, TransportError::Remote("unknown op 'missing'".into()));
        assert!(channel.is_healthy());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_are_correlated() {
        let service = WorkerService::new("tcp-worker");
        service.register_op("slow_echo", |_, input| {
            std::thread::sleep(Duration::from_millis((input[0] % 5) as u64));
            Ok(input)
        });
        let server = WorkerServer::bind("127.0.0.1:0", service).await.unwrap();
        let channel = TcpTransport::new()
            .connect(server.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();

        let calls = (0u8..64).map(|i| {
            let call = channel.call(run("slow_echo"), Bytes::from(vec![i]));
            async move { (i, call.await) }
        });
        for (i, result) in futures::future::join_all(calls).await {
            assert_eq!(result.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_oversized_reply_is_answered_with_error() {
        let service = WorkerService::new("tcp-worker");
        service.register_op("big", |_, _| Ok(Bytes::from(vec![0u8; 17 * 1024 * 1024])));
        let server = WorkerServer::bind("127.0.0.1:0", service).await.unwrap();
        let channel = TcpTransport::new()
            .connect(server.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), channel.call(run("big"), Bytes::new()))
            .await
            .unwrap()
            .unwrap_err();
        match err {
            TransportError::Remote(message) => assert!(message.contains("exceeds maximum"), "{message}"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(channel.is_healthy());
        assert_eq!(
            channel.call(run("identity"), Bytes::from_static(b"ok")).await.unwrap(),
            Bytes::from_static(b"ok")
        );
    }

    #[tokio::test]
    async fn test_health_check_over_tcp() {
        let service = WorkerService::new("tcp-worker");
        let server = WorkerServer::bind("127.0.0.1:0", service.clone()).await.unwrap();
        let channel = TcpTransport::new()
            .connect(server.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();
        let status = channel.check_health(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status.instance, service.instance());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_fails_outstanding_calls() {
        let service = WorkerService::new("tcp-worker");
        service.register_op("sleep", |_, input| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(input)
        });
        let server = WorkerServer::bind("127.0.0.1:0", service).await.unwrap();
        let channel = TcpTransport::new()
            .connect(server.endpoint(), Duration::from_secs(1))
            .await
            .unwrap();

        let pending = tokio::spawn(channel.call(run("sleep"), Bytes::new()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(TransportError::Closed));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_healthy());
        assert_eq!(
            channel.call(run("identity"), Bytes::new()).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();
        drop(listener);

        let err = TcpTransport::new()
            .connect(&endpoint, Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::ConnectFailed { .. }));
    }
}
