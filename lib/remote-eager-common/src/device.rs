// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Logical device names.
//!
//! A logical device is the stable, client-facing name of a device:
//!
//! ```text
//! /job:<job>/replica:<replica>/task:<task>/device:<KIND>:<index>
//! ```
//!
//! The name never changes when cluster membership changes; only the endpoint
//! that serves its task does. [`TaskKey`] is the part of the name that the
//! membership view is keyed by.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced while parsing device or task names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceNameError {
    /// The name does not follow the required component grammar.
    #[error("malformed device name '{name}': {reason}")]
    Malformed {
        /// The offending input.
        name: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl DeviceNameError {
    fn malformed(name: &str, reason: impl Into<String>) -> Self {
        DeviceNameError::Malformed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

/// Device kind component of a logical device name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    #[allow(missing_docs)]
    Cpu,
    #[allow(missing_docs)]
    Gpu,
    #[allow(missing_docs)]
    Tpu,
    #[allow(missing_docs)]
    Ipu,
    /// Any other upper-case kind, e.g. `XLA_CPU`.
    Other(String),
}

impl DeviceKind {
    /// Canonical (upper-case) spelling.
    pub fn as_str(&self) -> &str {
        match self {
            DeviceKind::Cpu => "CPU",
            DeviceKind::Gpu => "GPU",
            DeviceKind::Tpu => "TPU",
            DeviceKind::Ipu => "IPU",
            DeviceKind::Other(kind) => kind,
        }
    }

    fn parse(name: &str, raw: &str) -> Result<Self, DeviceNameError> {
        let upper = raw.to_ascii_uppercase();
        let kind = match upper.as_str() {
            "CPU" => DeviceKind::Cpu,
            "GPU" => DeviceKind::Gpu,
            "TPU" => DeviceKind::Tpu,
            "IPU" => DeviceKind::Ipu,
            _ => {
                let valid = upper
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic())
                    && upper.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return Err(DeviceNameError::malformed(
                        name,
                        format!("invalid device kind '{raw}'"),
                    ));
                }
                DeviceKind::Other(upper)
            }
        };
        Ok(kind)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one task within a cluster view: `(job, task index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    /// Job name.
    pub job: String,
    /// Task index within the job.
    pub task: u32,
}

impl TaskKey {
    /// Create a task key.
    pub fn new(job: impl Into<String>, task: u32) -> Self {
        Self {
            job: job.into(),
            task,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/job:{}/task:{}", self.job, self.task)
    }
}

/// A fully qualified logical device. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogicalDevice {
    job: String,
    replica: u32,
    task: u32,
    kind: DeviceKind,
    index: u32,
}

impl LogicalDevice {
    /// Build a device from its components, validating the job name.
    pub fn new(
        job: impl Into<String>,
        replica: u32,
        task: u32,
        kind: DeviceKind,
        index: u32,
    ) -> Result<Self, DeviceNameError> {
        let job = job.into();
        validate_job_name(&job, &job)?;
        Ok(Self {
            job,
            replica,
            task,
            kind,
            index,
        })
    }

    /// Parse the canonical five-component form.
    pub fn parse(name: &str) -> Result<Self, DeviceNameError> {
        let components = split_components(name)?;
        if components.len() != 4 {
            return Err(DeviceNameError::malformed(
                name,
                "expected /job:J/replica:R/task:T/device:KIND:I",
            ));
        }

        let job = expect_value(name, components[0], "job")?;
        validate_job_name(name, job)?;
        let replica = parse_index(name, expect_value(name, components[1], "replica")?, "replica")?;
        let task = parse_index(name, expect_value(name, components[2], "task")?, "task")?;
        let (kind, index) = parse_device_component(name, components[3])?;

        Ok(Self {
            job: job.to_string(),
            replica,
            task,
            kind,
            index,
        })
    }

    /// Job name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Replica index.
    pub fn replica(&self) -> u32 {
        self.replica
    }

    /// Task index.
    pub fn task(&self) -> u32 {
        self.task
    }

    /// Device kind.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Device index within its kind.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The task this device belongs to.
    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(self.job.clone(), self.task)
    }

    /// The task-level name of this device.
    pub fn task_name(&self) -> TaskName {
        TaskName {
            job: self.job.clone(),
            replica: self.replica,
            task: self.task,
        }
    }
}

impl fmt::Display for LogicalDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/job:{}/replica:{}/task:{}/device:{}:{}",
            self.job, self.replica, self.task, self.kind, self.index
        )
    }
}

impl FromStr for LogicalDevice {
    type Err = DeviceNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogicalDevice::parse(s)
    }
}

/// A task-level target such as `/job:worker/replica:0/task:1`.
///
/// The replica component may be omitted (it defaults to 0) and a trailing
/// device component is accepted and ignored, so any logical device name is
/// also a valid task name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskName {
    job: String,
    replica: u32,
    task: u32,
}

impl TaskName {
    /// Parse a task-level target.
    pub fn parse(name: &str) -> Result<Self, DeviceNameError> {
        let components = split_components(name)?;
        if components.len() < 2 || components.len() > 4 {
            return Err(DeviceNameError::malformed(
                name,
                "expected /job:J[/replica:R]/task:T[/device:KIND:I]",
            ));
        }

        let job = expect_value(name, components[0], "job")?;
        validate_job_name(name, job)?;

        let mut rest = &components[1..];
        let replica = match rest.first().and_then(|c| c.strip_prefix("replica:")) {
            Some(value) => {
                rest = &rest[1..];
                parse_index(name, value, "replica")?
            }
            None => 0,
        };

        let task = match rest.first() {
            Some(component) => parse_index(name, expect_value(name, component, "task")?, "task")?,
            None => return Err(DeviceNameError::malformed(name, "missing task component")),
        };

        match &rest[1..] {
            [] => {}
            [device] => {
                parse_device_component(name, device)?;
            }
            _ => {
                return Err(DeviceNameError::malformed(
                    name,
                    "unexpected trailing components",
                ));
            }
        }

        Ok(Self {
            job: job.to_string(),
            replica,
            task,
        })
    }

    /// Job name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Replica index.
    pub fn replica(&self) -> u32 {
        self.replica
    }

    /// Task index.
    pub fn task(&self) -> u32 {
        self.task
    }

    /// Membership key of this task.
    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(self.job.clone(), self.task)
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/job:{}/replica:{}/task:{}",
            self.job, self.replica, self.task
        )
    }
}

fn split_components(name: &str) -> Result<Vec<&str>, DeviceNameError> {
    let Some(body) = name.strip_prefix('/') else {
        return Err(DeviceNameError::malformed(name, "must start with '/'"));
    };
    let components: Vec<&str> = body.split('/').collect();
    if components.iter().any(|c| c.is_empty()) {
        return Err(DeviceNameError::malformed(name, "empty component"));
    }
    Ok(components)
}

fn expect_value<'a>(name: &str, component: &'a str, key: &str) -> Result<&'a str, DeviceNameError> {
    component
        .strip_prefix(key)
        .and_then(|rest| rest.strip_prefix(':'))
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DeviceNameError::malformed(name, format!("expected '{key}:<value>'")))
}

fn parse_index(name: &str, value: &str, what: &str) -> Result<u32, DeviceNameError> {
    if !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(DeviceNameError::malformed(
            name,
            format!("{what} must be a non-negative integer"),
        ));
    }
    value
        .parse::<u32>()
        .map_err(|_| DeviceNameError::malformed(name, format!("{what} out of range")))
}

fn parse_device_component(
    name: &str,
    component: &str,
) -> Result<(DeviceKind, u32), DeviceNameError> {
    let value = expect_value(name, component, "device")?;
    let Some((kind, index)) = value.rsplit_once(':') else {
        return Err(DeviceNameError::malformed(
            name,
            "device component must be KIND:INDEX",
        ));
    };
    let kind = DeviceKind::parse(name, kind)?;
    let index = parse_index(name, index, "device index")?;
    Ok((kind, index))
}

pub(crate) fn validate_job_name(name: &str, job: &str) -> Result<(), DeviceNameError> {
    let mut chars = job.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DeviceNameError::malformed(
            name,
            format!("invalid job name '{job}'"),
        ))
    }
}
