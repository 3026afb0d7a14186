// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote call dispatch.
//!
//! The dispatcher sends already-resolved work to the worker that owns it.
//! Every request is tagged with the id of the view it was resolved against,
//! and is bound to one connection for its whole life: a transport failure is
//! surfaced as [`RemoteError::DeviceUnreachable`] and is never retried
//! against another endpoint.
//!
//! Compiled functions are registered with a worker lazily, on first use over
//! a given connection. The registration cache is keyed by
//! `(function, endpoint)` and remembers which connection performed the
//! registration, so a task moving to a new endpoint, or a worker restarting
//! behind the same endpoint, leads to a fresh registration of the already
//! traced definition.

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::try_join_all;
use remote_eager_common::{Endpoint, LogicalDevice};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::error::RemoteError;
use crate::function::{ComponentInput, FunctionDef, FunctionId};
use crate::membership::{ClusterView, Route};
use crate::pool::{ConnectionLease, ConnectionPool};
use crate::transport::{RemoteRequest, TransportError};
use crate::worker::WorkerService;

struct Registration {
    connection_id: u64,
    done: Arc<OnceCell<()>>,
}

impl Registration {
    fn new(connection_id: u64) -> Self {
        Self {
            connection_id,
            done: Arc::new(OnceCell::new()),
        }
    }
}

/// A compiled function invocation with every component resolved against
/// one view.
#[derive(Debug, Clone)]
pub struct FunctionPlan {
    view_id: u64,
    function: Arc<FunctionDef>,
    devices: Vec<LogicalDevice>,
    routes: Vec<Route>,
}

impl FunctionPlan {
    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn function(&self) -> &Arc<FunctionDef> {
        &self.function
    }

    /// Distinct remote endpoints the invocation touches.
    pub fn endpoints(&self) -> BTreeSet<Endpoint> {
        self.routes
            .iter()
            .filter_map(|route| match route {
                Route::Remote(endpoint) => Some(endpoint.clone()),
                Route::Local => None,
            })
            .collect()
    }

    fn runs_locally(&self) -> bool {
        self.routes.iter().any(|route| *route == Route::Local)
    }
}

/// Sends ops and function components to workers.
pub struct Dispatcher {
    pool: Arc<ConnectionPool>,
    local: Arc<WorkerService>,
    call_timeout: Option<Duration>,
    next_call_id: AtomicU64,
    registrations: DashMap<(FunctionId, Endpoint), Registration>,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ConnectionPool>,
        local: Arc<WorkerService>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            local,
            call_timeout,
            next_call_id: AtomicU64::new(0),
            registrations: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Run one op on `device`, which was resolved to `route` in view `view_id`.
    pub async fn run_op(
        &self,
        view_id: u64,
        device: LogicalDevice,
        route: Route,
        op: String,
        input: Bytes,
    ) -> Result<Bytes, RemoteError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(call_id, view_id, %device, %op, ?route, "dispatch op");
        let request = RemoteRequest::RunOp {
            call_id,
            view_id,
            device: device.clone(),
            op,
        };

        match route {
            Route::Local => self
                .local
                .clone()
                .handle_blocking(request, input)
                .await
                .map_err(|e| local_failure(&device, e)),
            Route::Remote(endpoint) => {
                let lease = self.pool.get_or_create(&endpoint).await?;
                lease
                    .call(request, input, self.call_timeout)
                    .await
                    .map_err(|e| remote_failure(&device, &endpoint, e))
            }
        }
    }

    /// Resolve every component of `function` invoked on `invocation`
    /// against `view`. Fails before anything is sent if any component
    /// device is not part of the view.
    pub fn plan_function(
        &self,
        view: &ClusterView,
        function: Arc<FunctionDef>,
        invocation: &LogicalDevice,
    ) -> Result<FunctionPlan, RemoteError> {
        let mut devices = Vec::with_capacity(function.components.len());
        let mut routes = Vec::with_capacity(function.components.len());
        for index in 0..function.components.len() {
            let device = function
                .component_device(index, invocation)
                .cloned()
                .ok_or_else(|| {
                    RemoteError::invalid_function(&function.name, format!("no component {index}"))
                })?;
            routes.push(view.route(&device)?);
            devices.push(device);
        }
        Ok(FunctionPlan {
            view_id: view.view_id(),
            function,
            devices,
            routes,
        })
    }

    /// Execute a planned invocation and return the output of its last
    /// component. The first component failure fails the whole invocation
    /// and no partial output is returned.
    pub async fn run_function(&self, plan: FunctionPlan, input: Bytes) -> Result<Bytes, RemoteError> {
        let function = plan.function.clone();

        let mut leases: BTreeMap<Endpoint, ConnectionLease> = BTreeMap::new();
        for endpoint in plan.endpoints() {
            let lease = self.pool.get_or_create(&endpoint).await?;
            self.ensure_registered(&function, &lease).await?;
            leases.insert(endpoint, lease);
        }
        if plan.runs_locally() && !self.local.has_function(function.id) {
            let request = RemoteRequest::RegisterFunction {
                function: (*function).clone(),
            };
            self.local
                .handle(request, Bytes::new())
                .map_err(|e| local_failure(&plan.devices[0], e))?;
        }

        let mut outputs: Vec<Option<Bytes>> = vec![None; function.components.len()];
        for wave in function.waves() {
            let mut calls = Vec::with_capacity(wave.len());
            for index in wave {
                let component_input = match function.components[index].input {
                    ComponentInput::Argument => input.clone(),
                    ComponentInput::Output(dep) => outputs[dep].clone().ok_or_else(|| {
                        RemoteError::invalid_function(
                            &function.name,
                            format!("component {index} ran before its input {dep}"),
                        )
                    })?,
                };
                calls.push(self.run_component(&plan, &leases, index, component_input));
            }
            for (index, output) in try_join_all(calls).await? {
                outputs[index] = Some(output);
            }
        }

        outputs
            .pop()
            .flatten()
            .ok_or_else(|| RemoteError::invalid_function(&function.name, "no components"))
    }

    async fn run_component(
        &self,
        plan: &FunctionPlan,
        leases: &BTreeMap<Endpoint, ConnectionLease>,
        index: usize,
        input: Bytes,
    ) -> Result<(usize, Bytes), RemoteError> {
        let device = &plan.devices[index];
        let request = RemoteRequest::RunComponent {
            call_id: self.next_call_id.fetch_add(1, Ordering::Relaxed),
            view_id: plan.view_id,
            function: plan.function.id,
            component: index,
            device: device.clone(),
        };

        let output = match &plan.routes[index] {
            Route::Local => self
                .local
                .clone()
                .handle_blocking(request, input)
                .await
                .map_err(|e| local_failure(device, e))?,
            Route::Remote(endpoint) => {
                let lease = leases.get(endpoint).ok_or_else(|| RemoteError::DeviceUnreachable {
                    device: device.to_string(),
                    endpoint: endpoint.clone(),
                    reason: "no connection leased for endpoint".into(),
                })?;
                lease
                    .call(request, input, self.call_timeout)
                    .await
                    .map_err(|e| remote_failure(device, endpoint, e))?
            }
        };
        Ok((index, output))
    }

    /// Register `function` over `lease` unless that connection already did.
    /// Concurrent callers share one registration request; a failed
    /// registration is attempted again by the next caller.
    async fn ensure_registered(
        &self,
        function: &Arc<FunctionDef>,
        lease: &ConnectionLease,
    ) -> Result<(), RemoteError> {
        let done = {
            let mut entry = self
                .registrations
                .entry((function.id, lease.endpoint().clone()))
                .or_insert_with(|| Registration::new(lease.id()));
            match lease.id().cmp(&entry.connection_id) {
                CmpOrdering::Equal => entry.done.clone(),
                CmpOrdering::Greater => {
                    *entry = Registration::new(lease.id());
                    entry.done.clone()
                }
                // A caller still holding a replaced connection; don't disturb
                // the newer entry.
                CmpOrdering::Less => Arc::new(OnceCell::new()),
            }
        };

        done.get_or_try_init(|| async {
            tracing::debug!(function = %function.id, name = %function.name, endpoint = %lease.endpoint(), connection = lease.id(), "registering function");
            let request = RemoteRequest::RegisterFunction {
                function: (**function).clone(),
            };
            lease
                .call(request, Bytes::new(), self.call_timeout)
                .await
                .map(|_| ())
        })
        .await
        .map(|_| ())
        .map_err(|e| match e {
            TransportError::Remote(message) => RemoteError::RemoteExecution {
                device: lease.endpoint().to_string(),
                message,
            },
            other => RemoteError::DeviceUnreachable {
                device: format!("function {}", function.id),
                endpoint: lease.endpoint().clone(),
                reason: other.to_string(),
            },
        })
    }

    /// Drop registration records for endpoints outside `live`.
    pub fn forget_endpoints(&self, live: &BTreeSet<Endpoint>) {
        self.registrations
            .retain(|(_, endpoint), _| live.contains(endpoint));
    }

    /// Number of `(function, endpoint)` pairs with a registration record.
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }
}

fn local_failure(device: &LogicalDevice, err: TransportError) -> RemoteError {
    let message = match err {
        TransportError::Remote(message) => message,
        other => other.to_string(),
    };
    RemoteError::RemoteExecution {
        device: device.to_string(),
        message,
    }
}

fn remote_failure(device: &LogicalDevice, endpoint: &Endpoint, err: TransportError) -> RemoteError {
    match err {
        TransportError::Remote(message) => RemoteError::RemoteExecution {
            device: device.to_string(),
            message,
        },
        TransportError::Rejected(reason) => RemoteError::InvalidRequest {
            device: device.to_string(),
            reason,
        },
        other => RemoteError::DeviceUnreachable {
            device: device.to_string(),
            endpoint: endpoint.clone(),
            reason: other.to_string(),
        },
    }
}
