// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Worker side of remote execution.
//!
//! A [`WorkerService`] owns the ops a worker process can run and the traced
//! functions that have been registered with it. Transports deliver decoded
//! [`RemoteRequest`]s to [`WorkerService::handle`].

use bytes::Bytes;
use dashmap::DashMap;
use remote_eager_common::LogicalDevice;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::function::{FunctionDef, FunctionId};
use crate::transport::{RemoteRequest, TransportError, WorkerStatus};

/// Executes one op on behalf of a remote caller.
pub trait OpHandler: Send + Sync {
    fn run(&self, device: &LogicalDevice, input: Bytes) -> Result<Bytes, String>;
}

impl<F> OpHandler for F
where
    F: Fn(&LogicalDevice, Bytes) -> Result<Bytes, String> + Send + Sync,
{
    fn run(&self, device: &LogicalDevice, input: Bytes) -> Result<Bytes, String> {
        self(device, input)
    }
}

/// Op registry and function table of one worker process.
pub struct WorkerService {
    name: String,
    instance: Uuid,
    ops: DashMap<String, Arc<dyn OpHandler>>,
    functions: DashMap<FunctionId, Arc<FunctionDef>>,
    // view id + 1; 0 until the first tagged call arrives
    last_view: AtomicU64,
    registrations: AtomicU64,
    calls: AtomicU64,
}

impl WorkerService {
    /// A worker with the built-in `identity` and `whoami` ops.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let service = Self {
            name: name.into(),
            instance: Uuid::new_v4(),
            ops: DashMap::new(),
            functions: DashMap::new(),
            last_view: AtomicU64::new(0),
            registrations: AtomicU64::new(0),
            calls: AtomicU64::new(0),
        };

        service.register_op("identity", |_, input| Ok(input));
        let whoami = Bytes::from(service.name.clone());
        service.register_op("whoami", move |_, _| Ok(whoami.clone()));

        Arc::new(service)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    /// Add or replace an op implemented by a closure.
    pub fn register_op<F>(&self, op: impl Into<String>, handler: F)
    where
        F: Fn(&LogicalDevice, Bytes) -> Result<Bytes, String> + Send + Sync + 'static,
    {
        self.ops.insert(op.into(), Arc::new(handler));
    }

    /// Add or replace an op handler.
    pub fn register_handler(&self, op: impl Into<String>, handler: Arc<dyn OpHandler>) {
        self.ops.insert(op.into(), handler);
    }

    pub fn has_function(&self, id: FunctionId) -> bool {
        self.functions.contains_key(&id)
    }

    /// Number of `RegisterFunction` requests received.
    pub fn registration_count(&self) -> u64 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Number of op and component calls executed.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn last_view_id(&self) -> Option<u64> {
        self.last_view.load(Ordering::Acquire).checked_sub(1)
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            instance: self.instance,
            last_view_id: self.last_view_id(),
            registered_functions: self.functions.len(),
        }
    }

    /// Execute one request. `Err` carries a worker-side failure.
    pub fn handle(&self, request: RemoteRequest, payload: Bytes) -> Result<Bytes, TransportError> {
        if let Some(view_id) = request.view_id() {
            self.last_view.fetch_max(view_id + 1, Ordering::AcqRel);
        }

        match request {
            RemoteRequest::RunOp {
                call_id,
                device,
                op,
                ..
            } => {
                tracing::trace!(worker = %self.name, call_id, %device, %op, "run op");
                self.run_op(&device, &op, payload)
            }
            RemoteRequest::RegisterFunction { function } => {
                tracing::debug!(worker = %self.name, function = %function.id, name = %function.name, "register function");
                self.registrations.fetch_add(1, Ordering::Relaxed);
                self.functions.insert(function.id, Arc::new(function));
                Ok(Bytes::new())
            }
            RemoteRequest::RunComponent {
                call_id,
                function,
                component,
                device,
                ..
            } => {
                let def = self
                    .functions
                    .get(&function)
                    .map(|entry| entry.value().clone())
                    .ok_or_else(|| {
                        TransportError::Remote(format!(
                            "function {function} is not registered with worker {}",
                            self.name
                        ))
                    })?;
                let op = def
                    .components
                    .get(component)
                    .map(|c| c.op.clone())
                    .ok_or_else(|| {
                        TransportError::Remote(format!(
                            "function {function} has no component {component}"
                        ))
                    })?;
                tracing::trace!(worker = %self.name, call_id, %device, %function, component, "run component");
                self.run_op(&device, &op, payload)
            }
            RemoteRequest::Ping => self.status().encode(),
        }
    }

    /// [`handle`](Self::handle) on the blocking pool. Op handlers are
    /// synchronous and may block for as long as the op runs.
    pub async fn handle_blocking(
        self: Arc<Self>,
        request: RemoteRequest,
        payload: Bytes,
    ) -> Result<Bytes, TransportError> {
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || self.handle(request, payload))
            .await
            .unwrap_or_else(|e| {
                Err(TransportError::Remote(format!(
                    "op handler on worker {name} did not complete: {e}"
                )))
            })
    }

    fn run_op(&self, device: &LogicalDevice, op: &str, input: Bytes) -> Result<Bytes, TransportError> {
        let handler = self
            .ops
            .get(op)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Remote(format!("unknown op '{op}'")))?;
        self.calls.fetch_add(1, Ordering::Relaxed);
        handler.run(device, input).map_err(TransportError::Remote)
    }
}

impl std::fmt::Debug for WorkerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerService")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("ops", &self.ops.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{ComponentDef, FunctionLibrary};

    fn device() -> LogicalDevice {
        LogicalDevice::parse("/job:worker/replica:0/task:1/device:CPU:0").unwrap()
    }

    fn run(op: &str, view_id: u64) -> RemoteRequest {
        RemoteRequest::RunOp {
            call_id: 1,
            view_id,
            device: device(),
            op: op.into(),
        }
    }

    #[test]
    fn test_builtin_ops() {
        let worker = WorkerService::new("A");
        let out = worker
            .handle(run("identity", 0), Bytes::from_static(b"xyz"))
            .unwrap();
        assert_eq!(out, Bytes::from_static(b"xyz"));
        let out = worker.handle(run("whoami", 0), Bytes::new()).unwrap();
        assert_eq!(out, Bytes::from_static(b"A"));
        assert_eq!(worker.call_count(), 2);
    }

    #[test]
    fn test_unknown_op_and_failing_op() {
        let worker = WorkerService::new("A");
        let err = worker.handle(run("nope", 0), Bytes::new()).unwrap_err();
        assert_eq!(err, TransportError::Remote("unknown op 'nope'".into()));

        worker.register_op("fail", |_, _| Err("kernel failed".to_string()));
        let err = worker.handle(run("fail", 0), Bytes::new()).unwrap_err();
        assert!(err.is_remote());
    }

    #[test]
    fn test_tracks_highest_view_id() {
        let worker = WorkerService::new("A");
        assert_eq!(worker.last_view_id(), None);
        worker.handle(run("identity", 0), Bytes::new()).unwrap();
        assert_eq!(worker.last_view_id(), Some(0));
        worker.handle(run("identity", 5), Bytes::new()).unwrap();
        worker.handle(run("identity", 3), Bytes::new()).unwrap();
        assert_eq!(worker.last_view_id(), Some(5));
    }

    #[test]
    fn test_components_require_registration() {
        let worker = WorkerService::new("A");
        let library = FunctionLibrary::new();
        let def = library
            .register("f", vec![ComponentDef::new("whoami")])
            .unwrap();

        let component = RemoteRequest::RunComponent {
            call_id: 9,
            view_id: 1,
            function: def.id,
            component: 0,
            device: device(),
        };
        assert!(worker.handle(component.clone(), Bytes::new()).is_err());

        worker
            .handle(
                RemoteRequest::RegisterFunction {
                    function: (*def).clone(),
                },
                Bytes::new(),
            )
            .unwrap();
        assert!(worker.has_function(def.id));
        assert_eq!(worker.registration_count(), 1);
        assert_eq!(
            worker.handle(component, Bytes::new()).unwrap(),
            Bytes::from_static(b"A")
        );
    }

    struct Counter(AtomicU64);

    impl OpHandler for Counter {
        fn run(&self, _device: &LogicalDevice, _input: Bytes) -> Result<Bytes, String> {
            let n = self.0.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(Bytes::from(n.to_string()))
        }
    }

    #[test]
    fn test_stateful_handler() {
        let worker = WorkerService::new("A");
        worker.register_handler("count", Arc::new(Counter(AtomicU64::new(0))));
        worker.handle(run("count", 0), Bytes::new()).unwrap();
        assert_eq!(
            worker.handle(run("count", 0), Bytes::new()).unwrap(),
            Bytes::from_static(b"2")
        );

        // Registering again under the same name replaces the handler.
        worker.register_handler("count", Arc::new(Counter(AtomicU64::new(10))));
        assert_eq!(
            worker.handle(run("count", 0), Bytes::new()).unwrap(),
            Bytes::from_static(b"11")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_handler_off_runtime_threads() {
        let worker = WorkerService::new("A");
        worker.register_op("sleep", |_, input| {
            std::thread::sleep(std::time::Duration::from_millis(200));
            Ok(input)
        });

        let slow: Vec<_> = (0..4)
            .map(|_| tokio::spawn(worker.clone().handle_blocking(run("sleep", 0), Bytes::new())))
            .collect();
        // Four sleeping handlers would occupy both runtime threads if they
        // ran inline; this call must not wait behind them.
        let quick = tokio::spawn(worker.clone().handle_blocking(run("whoami", 0), Bytes::new()));
        let quick = tokio::time::timeout(std::time::Duration::from_millis(150), quick)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(quick, Bytes::from_static(b"A"));

        for call in slow {
            call.await.unwrap().unwrap();
        }
        assert_eq!(worker.call_count(), 5);
    }

    #[test]
    fn test_ping_reports_status() {
        let worker = WorkerService::new("A");
        let bytes = worker.handle(RemoteRequest::Ping, Bytes::new()).unwrap();
        let status = WorkerStatus::decode(&bytes).unwrap();
        assert_eq!(status.instance, worker.instance());
        assert_eq!(status.registered_functions, 0);
    }
}
