// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

#![deny(missing_docs)]

//! Shared value types for remote eager execution.
//!
//! Everything in this crate is pure data: parsing and validation of logical
//! device names, worker endpoints and the cluster membership descriptor.
//! Stateful pieces (membership views, connections, dispatch) live in the
//! `remote-eager` crate.

mod device;
mod endpoint;
mod server_def;

pub use device::{DeviceKind, DeviceNameError, LogicalDevice, TaskKey, TaskName};
pub use endpoint::{Endpoint, EndpointError};
pub use server_def::{ClusterDef, JobDef, ServerDef, ServerDefError};
