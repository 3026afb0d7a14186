// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Remote execution error taxonomy.
//!
//! Every public operation of the execution context reports failures as a
//! [`RemoteError`]. None of them are retried internally; callers inspect
//! [`RemoteError::code`] to decide on their own retry policy.

use remote_eager_common::{DeviceNameError, Endpoint, ServerDefError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a [`RemoteError`].
///
/// Consumers inspect the code to decide what action to take, rather than the
/// error defining its own behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The request itself is wrong (bad name, unknown target, bad membership).
    InvalidArgument,
    /// The target could not be reached; a later attempt may succeed.
    Unavailable,
    /// The context is not in a state that allows the operation.
    FailedPrecondition,
    /// The remote side executed the call and reported a failure.
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidArgument => write!(f, "InvalidArgument"),
            ErrorCode::Unavailable => write!(f, "Unavailable"),
            ErrorCode::FailedPrecondition => write!(f, "FailedPrecondition"),
            ErrorCode::Internal => write!(f, "Internal"),
        }
    }
}

/// Errors returned by the execution context and its collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// A device or task name failed local validation.
    #[error(transparent)]
    MalformedDeviceName(#[from] DeviceNameError),

    /// A membership update was rejected; the previous view stays current.
    #[error("invalid membership: {reason}")]
    InvalidMembership {
        /// Why the update was rejected.
        reason: String,
    },

    /// The current view has no task for the target.
    #[error("unknown device: Client for target {target} not found.")]
    UnknownDevice {
        /// The name that failed to resolve.
        target: String,
    },

    /// A connection to the endpoint could not be established.
    #[error("connection to {endpoint} unavailable: {reason}")]
    ConnectionUnavailable {
        /// Endpoint that could not be reached.
        endpoint: Endpoint,
        /// Transport-level reason.
        reason: String,
    },

    /// The endpoint serving an in-flight call went away before the call was
    /// acknowledged. The call is never redirected to another endpoint.
    #[error("device {device} unreachable at {endpoint}: {reason}")]
    DeviceUnreachable {
        /// Target device of the call.
        device: String,
        /// Endpoint the call was bound to.
        endpoint: Endpoint,
        /// Transport-level reason.
        reason: String,
    },

    /// The worker executed the call and reported a failure.
    #[error("remote execution on {device} failed: {message}")]
    RemoteExecution {
        /// Target device of the call.
        device: String,
        /// Failure reported by the worker.
        message: String,
    },

    /// The call could not be encoded for its target and was never sent.
    #[error("invalid request for {device}: {reason}")]
    InvalidRequest {
        /// Target device of the call.
        device: String,
        /// Why the request was rejected.
        reason: String,
    },

    /// A function definition failed validation while being traced.
    #[error("invalid function '{name}': {reason}")]
    InvalidFunction {
        /// Name of the function.
        name: String,
        /// What was wrong with it.
        reason: String,
    },

    /// No function with this id has been registered with the context.
    #[error("unknown function {function}")]
    UnknownFunction {
        /// Id of the missing function.
        function: String,
    },

    /// The context has no membership yet.
    #[error("Context is not initialized.")]
    ContextNotInitialized,

    /// `set_server_def` was called on an initialized context.
    #[error("context is already initialized; use update_server_def to change membership")]
    AlreadyInitialized,

    /// The async executor holds an error from an earlier call.
    #[error("executor is in an error state: {0}")]
    Executor(Box<RemoteError>),

    /// Configuration could not be loaded or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RemoteError {
    /// Classify this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            RemoteError::MalformedDeviceName(_)
            | RemoteError::InvalidMembership { .. }
            | RemoteError::UnknownDevice { .. }
            | RemoteError::InvalidRequest { .. }
            | RemoteError::InvalidFunction { .. }
            | RemoteError::UnknownFunction { .. } => ErrorCode::InvalidArgument,
            RemoteError::ConnectionUnavailable { .. } | RemoteError::DeviceUnreachable { .. } => {
                ErrorCode::Unavailable
            }
            RemoteError::ContextNotInitialized
            | RemoteError::AlreadyInitialized
            | RemoteError::Config(_) => ErrorCode::FailedPrecondition,
            RemoteError::RemoteExecution { .. } => ErrorCode::Internal,
            RemoteError::Executor(cause) => cause.code(),
        }
    }

    /// Shorthand for [`RemoteError::InvalidMembership`].
    pub fn invalid_membership(reason: impl Into<String>) -> Self {
        RemoteError::InvalidMembership {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`RemoteError::InvalidFunction`].
    pub fn invalid_function(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RemoteError::InvalidFunction {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for [`RemoteError::UnknownDevice`].
    pub fn unknown_device(target: impl fmt::Display) -> Self {
        RemoteError::UnknownDevice {
            target: target.to_string(),
        }
    }
}

impl From<ServerDefError> for RemoteError {
    fn from(err: ServerDefError) -> Self {
        RemoteError::invalid_membership(err.to_string())
    }
}
