// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! The execution context.
//!
//! An [`ExecutionContext`] is created once per process and shared by
//! reference (`Arc`) with every call site. It owns the membership table, the
//! connection pool, the dispatcher, the executor and the function library.
//!
//! Dispatch never takes a lock: the current view is read with an atomic
//! load, routed, and the call is counted against that view. A membership
//! update serializes with other updates only; it swaps in the new view,
//! waits (bounded by `membership.quiesce_timeout_ms`) for calls of the old
//! view to reach a terminal state, reconciles the connection pool and then
//! publishes the new context view id.
//!
//! ```no_run
//! # use remote_eager::{ExecutionContext, RemoteEagerConfig};
//! # use remote_eager::transport::tcp::{TcpTransport, TCP_PROTOCOL};
//! # use remote_eager_common::ServerDef;
//! # async fn example() -> Result<(), remote_eager::RemoteError> {
//! let context = ExecutionContext::new(RemoteEagerConfig::default(), TcpTransport::new());
//! context
//!     .set_server_def(ServerDef::single_job(
//!         "worker",
//!         "localhost:0",
//!         ["10.0.0.1:5000"],
//!         TCP_PROTOCOL,
//!     ))
//!     .await?;
//! let output = context
//!     .execute("/job:worker/replica:0/task:1/device:CPU:0", "identity", "x".into())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use remote_eager_common::{LogicalDevice, ServerDef, TaskName};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::config::{ExecutionMode, RemoteEagerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::RemoteError;
use crate::executor::{Executor, PendingCall};
use crate::function::{ComponentDef, FunctionId, FunctionLibrary};
use crate::membership::{ClusterView, MembershipTable, Route};
use crate::pool::ConnectionPool;
use crate::transport::WorkerTransport;
use crate::worker::WorkerService;

/// Name of the in-process worker serving the local task.
const LOCAL_WORKER_NAME: &str = "local";

/// Process-wide remote execution state.
pub struct ExecutionContext {
    config: RemoteEagerConfig,
    membership: MembershipTable,
    pool: Arc<ConnectionPool>,
    dispatcher: Arc<Dispatcher>,
    executor: Executor,
    functions: FunctionLibrary,
    local: Arc<WorkerService>,
    context_view_id: AtomicU64,
}

impl ExecutionContext {
    /// An uninitialized context dispatching through `transport`.
    pub fn new(config: RemoteEagerConfig, transport: Arc<dyn WorkerTransport>) -> Arc<Self> {
        let membership = MembershipTable::new(transport.key());
        let pool = Arc::new(ConnectionPool::new(
            transport,
            config.connection.connect_timeout(),
        ));
        let local = WorkerService::new(LOCAL_WORKER_NAME);
        let dispatcher = Arc::new(Dispatcher::new(
            pool.clone(),
            local.clone(),
            config.connection.call_timeout(),
        ));
        let executor = Executor::new(config.execution.mode);

        Arc::new(Self {
            config,
            membership,
            pool,
            dispatcher,
            executor,
            functions: FunctionLibrary::new(),
            local,
            context_view_id: AtomicU64::new(0),
        })
    }

    /// A context configured from the environment (see [`RemoteEagerConfig::figment`]).
    pub fn from_env(transport: Arc<dyn WorkerTransport>) -> Result<Arc<Self>, RemoteError> {
        let config = RemoteEagerConfig::from_env()?;
        Ok(Self::new(config, transport))
    }

    pub fn config(&self) -> &RemoteEagerConfig {
        &self.config
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.executor.mode()
    }

    /// The in-process worker serving the local task. Ops registered here run
    /// for devices of the local task.
    pub fn local_worker(&self) -> &Arc<WorkerService> {
        &self.local
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn is_initialized(&self) -> bool {
        self.membership.current().is_some()
    }

    /// The current view; `None` before [`set_server_def`](Self::set_server_def).
    pub fn current_view(&self) -> Option<Arc<ClusterView>> {
        self.membership.current()
    }

    /// View id published by the latest completed membership change.
    pub fn context_view_id(&self) -> u64 {
        self.context_view_id.load(Ordering::Acquire)
    }

    fn view(&self) -> Result<Arc<ClusterView>, RemoteError> {
        self.membership
            .current()
            .ok_or(RemoteError::ContextNotInitialized)
    }

    /// Initialize membership. The first view has id 0.
    pub async fn set_server_def(&self, server_def: ServerDef) -> Result<u64, RemoteError> {
        let section = self.membership.begin_update().await;
        let view = section.propose_initial(&server_def)?;
        let endpoints = view.remote_endpoints();
        let view_id = view.view_id();
        section.commit(view);

        self.pool.reconcile(&endpoints);
        self.context_view_id.store(view_id, Ordering::Release);
        tracing::info!(
            view_id,
            local_task = %server_def.local_task(),
            remote_endpoints = endpoints.len(),
            "cluster membership initialized"
        );
        Ok(view_id)
    }

    /// Replace the membership with `server_def` and return the new view id.
    ///
    /// A descriptor that fails validation leaves the current view in place.
    /// Calls resolved against the old view keep the connection they were
    /// bound to: they complete there or fail, and are never sent to an
    /// endpoint of the new view.
    pub async fn update_server_def(&self, server_def: ServerDef) -> Result<u64, RemoteError> {
        let section = self.membership.begin_update().await;
        let view = section.propose_update(&server_def)?;
        let endpoints = view.remote_endpoints();
        let view_id = view.view_id();

        self.pool.admit(&endpoints);
        if let Some(previous) = section.commit(view) {
            let limit = self.config.membership.quiesce_timeout();
            if !previous.tracker().wait_for_drain_timeout(limit).await {
                tracing::warn!(
                    view_id = previous.view_id(),
                    in_flight = previous.in_flight_count(),
                    timeout = ?limit,
                    "calls of superseded view did not finish in time; reconciling anyway"
                );
            }
        }

        let retired = self.pool.reconcile(&endpoints);
        self.dispatcher.forget_endpoints(&endpoints);
        self.context_view_id.store(view_id, Ordering::Release);
        drop(section);

        tracing::info!(view_id, remote_endpoints = endpoints.len(), retired, "cluster membership updated");
        Ok(view_id)
    }

    /// Whether the task named by `target` is reachable. The local task is
    /// always alive; remote tasks are health-checked without changing the
    /// connection pool.
    pub async fn check_alive(&self, target: &str) -> Result<bool, RemoteError> {
        let view = self.view()?;
        let task = TaskName::parse(target)?;
        match view.route_task_name(&task)? {
            Route::Local => Ok(true),
            Route::Remote(endpoint) => {
                let status = self
                    .pool
                    .probe(&endpoint, self.config.health.check_timeout())
                    .await;
                tracing::debug!(%task, %endpoint, ?status, "check_alive");
                Ok(status.is_ok())
            }
        }
    }

    /// Enqueue `op` on `device`. Resolution happens before this returns, so
    /// name and membership errors are reported synchronously in both modes.
    pub async fn enqueue(
        &self,
        device: &str,
        op: &str,
        input: Bytes,
    ) -> Result<PendingCall, RemoteError> {
        let device = LogicalDevice::parse(device)?;
        let view = self.view()?;
        let view_guard = view.enter();
        let route = view.route(&device)?;
        let view_id = view.view_id();
        tracing::debug!(%device, view_id, ?route, %op, "enqueue op");

        let dispatcher = self.dispatcher.clone();
        let target = device.clone();
        let op = op.to_string();
        let work = async move {
            let result = dispatcher.run_op(view_id, target, route, op, input).await;
            drop(view_guard);
            result
        };
        self.executor.submit(device, view_id, work).await
    }

    /// Run `op` on `device` and wait for its output.
    pub async fn execute(&self, device: &str, op: &str, input: Bytes) -> Result<Bytes, RemoteError> {
        self.enqueue(device, op, input).await?.wait().await
    }

    /// Trace a function once. The returned id stays valid across membership
    /// changes.
    pub fn register_function(
        &self,
        name: &str,
        components: Vec<ComponentDef>,
    ) -> Result<FunctionId, RemoteError> {
        Ok(self.functions.register(name, components)?.id)
    }

    /// Number of traces performed by [`register_function`](Self::register_function).
    pub fn function_trace_count(&self) -> u64 {
        self.functions.trace_count()
    }

    /// Enqueue an invocation of `function` on `device`. Every component is
    /// resolved against the same view before this returns.
    pub async fn enqueue_function(
        &self,
        function: FunctionId,
        device: &str,
        input: Bytes,
    ) -> Result<PendingCall, RemoteError> {
        let device = LogicalDevice::parse(device)?;
        let view = self.view()?;
        let definition = self.functions.get(function)?;
        let view_guard = view.enter();
        let plan = self.dispatcher.plan_function(&view, definition, &device)?;
        let view_id = view.view_id();
        tracing::debug!(%device, view_id, %function, endpoints = plan.endpoints().len(), "enqueue function");

        let dispatcher = self.dispatcher.clone();
        let work = async move {
            let result = dispatcher.run_function(plan, input).await;
            drop(view_guard);
            result
        };
        self.executor.submit(device, view_id, work).await
    }

    /// Invoke `function` on `device` and wait for its output.
    pub async fn run_function(
        &self,
        function: FunctionId,
        device: &str,
        input: Bytes,
    ) -> Result<Bytes, RemoteError> {
        self.enqueue_function(function, device, input)
            .await?
            .wait()
            .await
    }

    /// Wait until every async call has finished; returns the first async
    /// failure if one is retained.
    pub async fn wait_for_all_pending_nodes(&self) -> Result<(), RemoteError> {
        self.executor.wait_for_all().await
    }

    /// Number of async calls still running.
    pub fn pending_count(&self) -> usize {
        self.executor.pending_count()
    }

    /// Reset the async executor after a failure.
    pub fn clear_error(&self) -> Option<RemoteError> {
        self.executor.clear_error()
    }

    /// Bound used when health-checking remote tasks.
    pub fn health_check_timeout(&self) -> Duration {
        self.config.health.check_timeout()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("mode", &self.executor.mode())
            .field("view", &self.membership.current().map(|v| v.view_id()))
            .field("pool", &self.pool)
            .finish()
    }
}
