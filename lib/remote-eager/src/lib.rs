// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote eager execution with dynamic cluster membership.
//!
//! A fixed set of client-visible logical devices
//! (`/job:J/replica:R/task:T/device:KIND:I`) is mapped at runtime onto a
//! changing set of worker processes. The [`ExecutionContext`] resolves each
//! call against the current, immutable [`ClusterView`], dispatches it over a
//! pooled connection to the owning worker and keeps doing so while the
//! membership is replaced underneath it.
//!
//! # Architecture
//!
//! - [`membership`]: versioned views and the exclusive update section.
//! - [`pool`]: one connection per distinct endpoint, retired when no view
//!   references it and torn down once its last call finished.
//! - [`dispatcher`]: view-tagged op and function-component calls, lazy
//!   per-connection function registration.
//! - [`executor`]: sync and async execution of dispatched work.
//! - [`transport`]: the worker channel seam, with in-process and TCP
//!   implementations.
//! - [`worker`]: the worker side that executes ops and components.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod function;
pub mod inflight;
pub mod logging;
pub mod membership;
pub mod pool;
pub mod transport;
pub mod worker;

pub use config::{ExecutionMode, RemoteEagerConfig};
pub use context::ExecutionContext;
pub use error::{ErrorCode, RemoteError};
pub use executor::{CallStatus, PendingCall};
pub use function::{ComponentDef, ComponentInput, FunctionDef, FunctionId};
pub use membership::{ClusterView, Route};
pub use worker::{OpHandler, WorkerService};

pub use remote_eager_common::{
    ClusterDef, DeviceKind, DeviceNameError, Endpoint, JobDef, LogicalDevice, ServerDef, TaskKey,
    TaskName,
};
