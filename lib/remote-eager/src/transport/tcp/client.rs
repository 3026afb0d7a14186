// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP worker channel.
//!
//! Design: caller → flume queue → writer task → socket → reader task → oneshot.
//! - Callers register a oneshot under a per-connection correlation id, then
//!   push the pre-encoded frame to the writer queue.
//! - The reader task matches replies by correlation id, so replies may arrive
//!   in any order.
//! - When either task exits the channel turns unhealthy and every outstanding
//!   caller is failed with [`TransportError::Closed`].

use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use futures::future::BoxFuture;
use remote_eager_common::Endpoint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::TCP_PROTOCOL;
use super::framing::{
    FrameType, RequestHeader, ResponseHeader, TcpFrameCodec, decode_header, encode_header,
};
use crate::transport::{RemoteRequest, TransportError, TransportKey, WorkerChannel, WorkerTransport};

/// Buffer size for the per-connection writer queue (backpressure control)
const WRITER_CHANNEL_BUFFER: usize = 256;

type PendingMap = DashMap<u64, oneshot::Sender<Result<Bytes, TransportError>>>;

/// Transport that opens one TCP connection per [`connect`](WorkerTransport::connect).
#[derive(Debug, Default, Clone)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl WorkerTransport for TcpTransport {
    fn key(&self) -> TransportKey {
        TransportKey::new(TCP_PROTOCOL)
    }

    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Arc<dyn WorkerChannel>, TransportError>> {
        let endpoint = endpoint.clone();
        Box::pin(async move {
            let channel = TcpChannel::connect(endpoint, timeout).await?;
            let channel: Arc<dyn WorkerChannel> = Arc::new(channel);
            Ok(channel)
        })
    }
}

/// One TCP connection to a worker.
pub struct TcpChannel {
    endpoint: Endpoint,
    tx: flume::Sender<Bytes>,
    pending: Arc<PendingMap>,
    next_correlation: AtomicU64,
    healthy: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl TcpChannel {
    pub async fn connect(endpoint: Endpoint, timeout: Duration) -> Result<Self, TransportError> {
        let connect_failed = |reason: String| TransportError::ConnectFailed {
            endpoint: endpoint.clone(),
            reason,
        };

        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((endpoint.host(), endpoint.port())),
        )
        .await
        .map_err(|_| connect_failed(format!("timed out after {timeout:?}")))?
        .map_err(|e| connect_failed(e.to_string()))?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(%endpoint, "Failed to set TCP_NODELAY: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = flume::bounded(WRITER_CHANNEL_BUFFER);
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let healthy = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        {
            let endpoint = endpoint.clone();
            let pending = pending.clone();
            let healthy = healthy.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = writer_task(write_half, rx, cancel.clone()).await {
                    tracing::debug!(%endpoint, "Writer task failed: {}", e);
                }
                shut_down(&healthy, &cancel, &pending);
            });
        }

        {
            let endpoint = endpoint.clone();
            let pending = pending.clone();
            let healthy = healthy.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = reader_task(read_half, &pending, cancel.clone()).await {
                    tracing::debug!(%endpoint, "Reader task failed: {}", e);
                }
                shut_down(&healthy, &cancel, &pending);
            });
        }

        tracing::debug!(%endpoint, "connected");
        Ok(Self {
            endpoint,
            tx,
            pending,
            next_correlation: AtomicU64::new(0),
            healthy,
            cancel,
        })
    }

    fn submit(
        &self,
        request: RemoteRequest,
        payload: &[u8],
    ) -> Result<(Bytes, oneshot::Receiver<Result<Bytes, TransportError>>, u64), TransportError> {
        let correlation = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let header = encode_header(&RequestHeader {
            correlation,
            request,
        })
        .map_err(|e| TransportError::Rejected(e.to_string()))?;
        let frame = TcpFrameCodec::encode_frame(FrameType::Request, &header, payload)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        let (response_tx, response_rx) = oneshot::channel();
        self.pending.insert(correlation, response_tx);

        // Shutdown flips `healthy` before draining `pending`, so either the
        // drain sees this entry or this check sees the flag.
        if !self.healthy.load(Ordering::SeqCst) {
            self.pending.remove(&correlation);
            return Err(TransportError::Closed);
        }
        Ok((frame, response_rx, correlation))
    }
}

impl WorkerChannel for TcpChannel {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn call(
        &self,
        request: RemoteRequest,
        payload: Bytes,
    ) -> BoxFuture<'static, Result<Bytes, TransportError>> {
        let submitted = self.submit(request, &payload);
        let tx = self.tx.clone();
        let pending = self.pending.clone();
        Box::pin(async move {
            let (frame, response_rx, correlation) = submitted?;
            if tx.send_async(frame).await.is_err() {
                pending.remove(&correlation);
                return Err(TransportError::Closed);
            }
            response_rx.await.unwrap_or(Err(TransportError::Closed))
        })
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn shut_down(healthy: &AtomicBool, cancel: &CancellationToken, pending: &PendingMap) {
    healthy.store(false, Ordering::SeqCst);
    cancel.cancel();
    let outstanding: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for correlation in outstanding {
        if let Some((_, tx)) = pending.remove(&correlation) {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

async fn writer_task(
    mut write_half: OwnedWriteHalf,
    rx: flume::Receiver<Bytes>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            frame = rx.recv_async() => {
                match frame {
                    Ok(frame) => write_half.write_all(&frame).await?,
                    Err(_) => break,
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
    let _ = write_half.shutdown().await;
    Ok(())
}

async fn reader_task(
    read_half: OwnedReadHalf,
    pending: &PendingMap,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut framed = FramedRead::new(read_half, TcpFrameCodec::new());
    loop {
        let frame = tokio::select! {
            frame = framed.next() => frame,
            _ = cancel.cancelled() => return Ok(()),
        };

        let (frame_type, header, payload) = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(TransportError::Codec(e.to_string())),
            // Connection closed by peer
            None => return Ok(()),
        };
        if frame_type != FrameType::Response {
            return Err(TransportError::Codec(format!(
                "unexpected {frame_type:?} frame from worker"
            )));
        }

        let header: ResponseHeader = decode_header(&header)?;
        let Some((_, tx)) = pending.remove(&header.correlation) else {
            tracing::warn!(correlation = header.correlation, "reply for unknown call");
            continue;
        };
        let outcome = match header.error {
            None => Ok(payload),
            Some(message) => Err(TransportError::Remote(message)),
        };
        let _ = tx.send(outcome);
    }
}
