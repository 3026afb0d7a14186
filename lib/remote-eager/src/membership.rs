// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership table.
//!
//! The table holds exactly one current [`ClusterView`]. Views are immutable
//! and replaced wholesale with an atomic pointer swap, so readers never block
//! and never observe a mix of two views. Writers serialize on an
//! [`UpdateSection`]: the section that acquires the lock second commits
//! second and receives the higher view id.
//!
//! A view also counts the calls that were resolved against it. After a view
//! is superseded, that count is what a membership update waits on before
//! reconciling connections.

use arc_swap::ArcSwapOption;
use remote_eager_common::{Endpoint, LogicalDevice, ServerDef, TaskKey, TaskName};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::error::RemoteError;
use crate::inflight::{InFlightGuard, InFlightTracker};
use crate::transport::TransportKey;

/// Where a resolved target lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// The local task; served in-process.
    Local,
    /// A remote task served at this endpoint.
    Remote(Endpoint),
}

/// One immutable, versioned snapshot of task-to-endpoint membership.
pub struct ClusterView {
    view_id: u64,
    local_task: TaskKey,
    task_to_endpoint: BTreeMap<TaskKey, Endpoint>,
    in_flight: InFlightTracker,
}

impl ClusterView {
    fn new(view_id: u64, local_task: TaskKey, task_to_endpoint: BTreeMap<TaskKey, Endpoint>) -> Self {
        Self {
            view_id,
            local_task,
            task_to_endpoint,
            in_flight: InFlightTracker::new(),
        }
    }

    pub fn view_id(&self) -> u64 {
        self.view_id
    }

    pub fn local_task(&self) -> &TaskKey {
        &self.local_task
    }

    pub fn endpoint(&self, task: &TaskKey) -> Option<&Endpoint> {
        self.task_to_endpoint.get(task)
    }

    pub fn contains(&self, task: &TaskKey) -> bool {
        self.task_to_endpoint.contains_key(task)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&TaskKey, &Endpoint)> {
        self.task_to_endpoint.iter()
    }

    /// Endpoints of every remote task, deduplicated.
    pub fn remote_endpoints(&self) -> BTreeSet<Endpoint> {
        self.task_to_endpoint
            .iter()
            .filter(|(task, _)| **task != self.local_task)
            .map(|(_, endpoint)| endpoint.clone())
            .collect()
    }

    /// Resolve a logical device. Fails with `UnknownDevice` when its task is
    /// not part of this view.
    pub fn route(&self, device: &LogicalDevice) -> Result<Route, RemoteError> {
        self.route_task(device.replica(), &device.task_key(), device)
    }

    /// Resolve a task-level name.
    pub fn route_task_name(&self, task: &TaskName) -> Result<Route, RemoteError> {
        self.route_task(task.replica(), &task.task_key(), task)
    }

    fn route_task(
        &self,
        replica: u32,
        task: &TaskKey,
        target: &dyn fmt::Display,
    ) -> Result<Route, RemoteError> {
        if replica != 0 {
            return Err(RemoteError::unknown_device(target));
        }
        if *task == self.local_task {
            return Ok(Route::Local);
        }
        self.task_to_endpoint
            .get(task)
            .map(|endpoint| Route::Remote(endpoint.clone()))
            .ok_or_else(|| RemoteError::unknown_device(target))
    }

    /// Count a call against this view until the guard drops.
    pub fn enter(&self) -> InFlightGuard {
        self.in_flight.acquire()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.in_flight_count()
    }

    /// Whether a newer view has been committed.
    pub fn is_superseded(&self) -> bool {
        self.in_flight.is_closed()
    }

    pub(crate) fn tracker(&self) -> &InFlightTracker {
        &self.in_flight
    }
}

impl fmt::Debug for ClusterView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterView")
            .field("view_id", &self.view_id)
            .field("local_task", &self.local_task)
            .field("task_to_endpoint", &self.task_to_endpoint)
            .finish()
    }
}

/// Parse a JSON membership descriptor. Structural validation happens when
/// the descriptor is applied.
pub fn server_def_from_json(json: &str) -> Result<ServerDef, RemoteError> {
    serde_json::from_str(json)
        .map_err(|e| RemoteError::invalid_membership(format!("malformed descriptor: {e}")))
}

/// Holder of the current view.
pub struct MembershipTable {
    protocol: TransportKey,
    current: ArcSwapOption<ClusterView>,
    update_lock: Mutex<()>,
}

impl MembershipTable {
    /// An empty table accepting descriptors for `protocol`.
    pub fn new(protocol: TransportKey) -> Self {
        Self {
            protocol,
            current: ArcSwapOption::const_empty(),
            update_lock: Mutex::new(()),
        }
    }

    /// The latest committed view. Never blocks.
    pub fn current(&self) -> Option<Arc<ClusterView>> {
        self.current.load_full()
    }

    /// Enter the exclusive update section. Sections are granted in the order
    /// they were requested.
    pub async fn begin_update(&self) -> UpdateSection<'_> {
        UpdateSection {
            table: self,
            _guard: self.update_lock.lock().await,
        }
    }

    fn validate(&self, server_def: &ServerDef) -> Result<BTreeMap<TaskKey, Endpoint>, RemoteError> {
        if server_def.protocol != self.protocol.as_str() {
            return Err(RemoteError::invalid_membership(format!(
                "protocol '{}' does not match transport '{}'",
                server_def.protocol, self.protocol
            )));
        }
        Ok(server_def.task_endpoints()?)
    }
}

/// Exclusive right to replace the current view.
pub struct UpdateSection<'a> {
    table: &'a MembershipTable,
    _guard: MutexGuard<'a, ()>,
}

impl UpdateSection<'_> {
    pub fn current(&self) -> Option<Arc<ClusterView>> {
        self.table.current()
    }

    /// Validate the first descriptor and build view 0.
    pub fn propose_initial(&self, server_def: &ServerDef) -> Result<ClusterView, RemoteError> {
        if self.table.current().is_some() {
            return Err(RemoteError::AlreadyInitialized);
        }
        let mapping = self.table.validate(server_def)?;
        Ok(ClusterView::new(0, server_def.local_task(), mapping))
    }

    /// Validate a replacement descriptor and build the next view. Nothing is
    /// installed until [`commit`](Self::commit).
    pub fn propose_update(&self, server_def: &ServerDef) -> Result<ClusterView, RemoteError> {
        let previous = self
            .table
            .current()
            .ok_or(RemoteError::ContextNotInitialized)?;
        let mapping = self.table.validate(server_def)?;
        let local_task = server_def.local_task();
        if local_task != previous.local_task {
            return Err(RemoteError::invalid_membership(format!(
                "local task cannot change from {} to {}",
                previous.local_task, local_task
            )));
        }
        Ok(ClusterView::new(previous.view_id + 1, local_task, mapping))
    }

    /// Install `view` as current and return the view it replaced, now marked
    /// superseded.
    pub fn commit(&self, view: ClusterView) -> Option<Arc<ClusterView>> {
        let previous = self.table.current.swap(Some(Arc::new(view)));
        if let Some(previous) = &previous {
            previous.in_flight.close();
        }
        previous
    }
}
