// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! TCP transport: framed request/reply over one socket per worker connection.

mod client;
mod framing;
mod server;

pub use client::{TcpChannel, TcpTransport};
pub use server::WorkerServer;

/// Key reported by [`TcpTransport`].
pub const TCP_PROTOCOL: &str = "tcp";
