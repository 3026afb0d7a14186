// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cluster membership descriptor.
//!
//! A [`ServerDef`] names one or more jobs, each mapping task indices to
//! network addresses, plus the local task and the transport protocol tag.
//! It is the only input to a membership update. The JSON form is:
//!
//! ```json
//! {
//!   "cluster": { "jobs": [ { "name": "worker", "tasks": { "0": "localhost:0", "1": "10.0.0.2:2222" } } ] },
//!   "job_name": "worker",
//!   "task_index": 0,
//!   "protocol": "tcp"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::device::validate_job_name;
use crate::{Endpoint, EndpointError, TaskKey};

/// Reasons a [`ServerDef`] is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServerDefError {
    /// The cluster defines no jobs.
    #[error("cluster definition has no jobs")]
    NoJobs,

    /// A job defines no tasks.
    #[error("job '{0}' has no tasks")]
    EmptyJob(String),

    /// A job name is not a valid identifier.
    #[error("invalid job name '{0}'")]
    InvalidJobName(String),

    /// Two jobs share a name.
    #[error("duplicate job '{0}'")]
    DuplicateJob(String),

    /// A task address failed to parse.
    #[error("task {task}: {source}")]
    InvalidAddress {
        /// Task whose address is malformed.
        task: TaskKey,
        /// Parse failure.
        source: EndpointError,
    },

    /// Port 0 is only a placeholder for the local task.
    #[error("task {0} has port 0; only the local task may leave its port unassigned")]
    UnassignedPort(TaskKey),

    /// The local `(job_name, task_index)` is not part of the cluster.
    #[error("local task {0} is not defined in the cluster")]
    MissingLocalTask(TaskKey),

    /// The protocol tag is empty.
    #[error("protocol must not be empty")]
    MissingProtocol,
}

/// One named job: task index to address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDef {
    /// Job name, e.g. `worker`.
    pub name: String,
    /// Task index to `host:port`.
    #[serde(default)]
    pub tasks: BTreeMap<u32, String>,
}

impl JobDef {
    /// Create an empty job.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tasks: BTreeMap::new(),
        }
    }

    /// Add (or replace) a task address.
    pub fn with_task(mut self, index: u32, address: impl Into<String>) -> Self {
        self.tasks.insert(index, address.into());
        self
    }
}

/// Set of jobs making up a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDef {
    /// Jobs in the cluster.
    #[serde(default)]
    pub jobs: Vec<JobDef>,
}

/// Membership descriptor: the cluster, which task is local, and the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDef {
    /// Cluster definition.
    pub cluster: ClusterDef,
    /// Job of the local task.
    pub job_name: String,
    /// Index of the local task within `job_name`.
    pub task_index: u32,
    /// Transport protocol tag, e.g. `tcp`.
    pub protocol: String,
}

impl ServerDef {
    /// A single-job cluster whose task 0 is the local task and whose tasks
    /// 1..=N are `remote_addresses` in order.
    pub fn single_job<I, S>(
        job_name: &str,
        local_address: &str,
        remote_addresses: I,
        protocol: &str,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut job = JobDef::new(job_name).with_task(0, local_address);
        for (index, address) in remote_addresses.into_iter().enumerate() {
            job = job.with_task(index as u32 + 1, address);
        }
        Self {
            cluster: ClusterDef { jobs: vec![job] },
            job_name: job_name.to_string(),
            task_index: 0,
            protocol: protocol.to_string(),
        }
    }

    /// The local task key.
    pub fn local_task(&self) -> TaskKey {
        TaskKey::new(self.job_name.clone(), self.task_index)
    }

    /// Validate the descriptor and flatten it into a task-to-endpoint map.
    pub fn task_endpoints(&self) -> Result<BTreeMap<TaskKey, Endpoint>, ServerDefError> {
        if self.protocol.trim().is_empty() {
            return Err(ServerDefError::MissingProtocol);
        }
        if self.cluster.jobs.is_empty() {
            return Err(ServerDefError::NoJobs);
        }

        let local = self.local_task();
        let mut seen = HashSet::new();
        let mut endpoints = BTreeMap::new();

        for job in &self.cluster.jobs {
            if validate_job_name(&job.name, &job.name).is_err() {
                return Err(ServerDefError::InvalidJobName(job.name.clone()));
            }
            if !seen.insert(job.name.as_str()) {
                return Err(ServerDefError::DuplicateJob(job.name.clone()));
            }
            if job.tasks.is_empty() {
                return Err(ServerDefError::EmptyJob(job.name.clone()));
            }

            for (&index, address) in &job.tasks {
                let task = TaskKey::new(job.name.clone(), index);
                let endpoint = Endpoint::parse(address).map_err(|source| {
                    ServerDefError::InvalidAddress {
                        task: task.clone(),
                        source,
                    }
                })?;
                if endpoint.port() == 0 && task != local {
                    return Err(ServerDefError::UnassignedPort(task));
                }
                endpoints.insert(task, endpoint);
            }
        }

        if !endpoints.contains_key(&local) {
            return Err(ServerDefError::MissingLocalTask(local));
        }

        Ok(endpoints)
    }
}
