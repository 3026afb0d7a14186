// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Sync and async execution of dispatched work.
//!
//! In [`ExecutionMode::Sync`] a submitted call runs to completion before
//! [`Executor::submit`] returns and its failure is returned directly. In
//! [`ExecutionMode::Async`] the call is spawned and a [`PendingCall`] is
//! returned right away; the first failure of any async call is retained as
//! the executor status and fails every later submission until
//! [`Executor::clear_error`].

use bytes::Bytes;
use parking_lot::Mutex;
use remote_eager_common::LogicalDevice;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::oneshot;

use crate::config::ExecutionMode;
use crate::error::RemoteError;
use crate::inflight::InFlightTracker;

/// Terminal or pending state of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallStatus {
    Pending = 0,
    Completed = 1,
    Failed = 2,
}

impl CallStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CallStatus::Pending,
            1 => CallStatus::Completed,
            _ => CallStatus::Failed,
        }
    }
}

/// Bookkeeping for one dispatched call.
#[derive(Debug)]
pub struct InFlightCall {
    target: LogicalDevice,
    view_id: u64,
    status: AtomicU8,
}

impl InFlightCall {
    fn new(target: LogicalDevice, view_id: u64) -> Self {
        Self {
            target,
            view_id,
            status: AtomicU8::new(CallStatus::Pending as u8),
        }
    }

    pub fn target(&self) -> &LogicalDevice {
        &self.target
    }

    /// View the call was resolved against.
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn status(&self) -> CallStatus {
        CallStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn finish<T>(&self, result: &Result<T, RemoteError>) {
        let status = match result {
            Ok(_) => CallStatus::Completed,
            Err(_) => CallStatus::Failed,
        };
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Handle to a submitted call.
#[derive(Debug)]
pub struct PendingCall {
    call: Arc<InFlightCall>,
    result: oneshot::Receiver<Result<Bytes, RemoteError>>,
}

impl PendingCall {
    pub fn target(&self) -> &LogicalDevice {
        self.call.target()
    }

    pub fn view_id(&self) -> u64 {
        self.call.view_id()
    }

    pub fn status(&self) -> CallStatus {
        self.call.status()
    }

    /// Wait for the call's result.
    pub async fn wait(self) -> Result<Bytes, RemoteError> {
        let target = self.call.target.to_string();
        self.result
            .await
            .unwrap_or_else(|_| {
                Err(RemoteError::RemoteExecution {
                    device: target,
                    message: "call was dropped before completing".into(),
                })
            })
    }
}

/// Runs submitted calls according to the configured [`ExecutionMode`].
#[derive(Debug)]
pub struct Executor {
    mode: ExecutionMode,
    pending: InFlightTracker,
    error: Arc<Mutex<Option<RemoteError>>>,
}

impl Executor {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            pending: InFlightTracker::new(),
            error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// `Err(Executor(cause))` while an async failure is retained.
    pub fn status(&self) -> Result<(), RemoteError> {
        match self.error.lock().as_ref() {
            Some(cause) => Err(RemoteError::Executor(Box::new(cause.clone()))),
            None => Ok(()),
        }
    }

    /// Number of async calls that have not reached a terminal state.
    pub fn pending_count(&self) -> usize {
        self.pending.in_flight_count()
    }

    /// Run `work` for `target`, resolved in view `view_id`.
    pub async fn submit<F>(
        &self,
        target: LogicalDevice,
        view_id: u64,
        work: F,
    ) -> Result<PendingCall, RemoteError>
    where
        F: Future<Output = Result<Bytes, RemoteError>> + Send + 'static,
    {
        self.status()?;

        let call = Arc::new(InFlightCall::new(target, view_id));
        let (tx, rx) = oneshot::channel();

        match self.mode {
            ExecutionMode::Sync => {
                let result = work.await;
                call.finish(&result);
                let output = result?;
                let _ = tx.send(Ok(output));
            }
            ExecutionMode::Async => {
                let guard = self.pending.acquire();
                let error = self.error.clone();
                let task_call = call.clone();
                tokio::spawn(async move {
                    let result = work.await;
                    task_call.finish(&result);
                    if let Err(e) = &result {
                        let mut slot = error.lock();
                        if slot.is_none() {
                            tracing::warn!(target_device = %task_call.target, view_id = task_call.view_id, error = %e, "async call failed");
                            *slot = Some(e.clone());
                        }
                    }
                    let _ = tx.send(result);
                    drop(guard);
                });
            }
        }

        Ok(PendingCall { call, result: rx })
    }

    /// Wait until every async call reached a terminal state, then report
    /// the retained failure, if any.
    pub async fn wait_for_all(&self) -> Result<(), RemoteError> {
        self.pending.wait_for_drain().await;
        match self.error.lock().clone() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    /// Forget the retained failure.
    pub fn clear_error(&self) -> Option<RemoteError> {
        self.error.lock().take()
    }
}
