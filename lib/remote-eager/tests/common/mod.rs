// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Common test utilities for cluster integration tests
//!
//! A [`LoopbackCluster`] hosts in-process workers behind named endpoints and
//! an execution context that dispatches to them, so membership scenarios can
//! be run deterministically in either execution mode.

#![allow(dead_code)]

use bytes::Bytes;
use remote_eager::transport::loopback::{LOOPBACK_PROTOCOL, LoopbackTransport};
use remote_eager::{
    Endpoint, ExecutionContext, ExecutionMode, RemoteEagerConfig, ServerDef, WorkerService,
};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::FmtSubscriber;

pub mod scenarios;

static INIT: Once = Once::new();

pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = FmtSubscriber::builder()
            .with_env_filter("remote_eager=debug")
            .with_test_writer()
            .try_init();
    });
}

pub const JOB: &str = "worker";
pub const LOCAL_ADDRESS: &str = "localhost:0";

/// Upper bound for any single scenario step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Full logical device name of CPU:0 on `task`.
pub fn device(task: u32) -> String {
    format!("/job:{JOB}/replica:0/task:{task}/device:CPU:0")
}

/// Task-level name of `task`.
pub fn task(task: u32) -> String {
    format!("/job:{JOB}/replica:0/task:{task}")
}

pub fn endpoint(address: &str) -> Endpoint {
    Endpoint::parse(address).unwrap()
}

/// Descriptor with the local task 0 and `remotes` as tasks 1..=N.
pub fn server_def(protocol: &str, remotes: &[&str]) -> ServerDef {
    ServerDef::single_job(JOB, LOCAL_ADDRESS, remotes.iter().copied(), protocol)
}

/// Worker whose `whoami` answers `name` and which can `append` its task index.
pub fn worker(name: &str) -> Arc<WorkerService> {
    let service = WorkerService::new(name);
    service.register_op("append", |device, input| {
        let mut out = input.to_vec();
        out.extend_from_slice(format!("|{}", device.task()).as_bytes());
        Ok(Bytes::from(out))
    });
    service.register_op("fail", |_, _| Err("injected failure".to_string()));
    service
}

pub struct LoopbackCluster {
    pub transport: Arc<LoopbackTransport>,
    pub context: Arc<ExecutionContext>,
}

impl LoopbackCluster {
    pub fn new(mode: ExecutionMode) -> Self {
        Self::with_config(RemoteEagerConfig::with_mode(mode))
    }

    pub fn with_config(config: RemoteEagerConfig) -> Self {
        init_tracing();
        let transport = LoopbackTransport::new();
        let context = ExecutionContext::new(config, transport.clone());
        context.local_worker().register_op("append", |device, input| {
            let mut out = input.to_vec();
            out.extend_from_slice(format!("|{}", device.task()).as_bytes());
            Ok(Bytes::from(out))
        });
        Self { transport, context }
    }

    /// Start a worker named `name` at `address`.
    pub fn start(&self, address: &str, name: &str) -> Arc<WorkerService> {
        let service = worker(name);
        self.transport.start_worker(&endpoint(address), service.clone());
        service
    }

    pub fn def(&self, remotes: &[&str]) -> ServerDef {
        server_def(LOOPBACK_PROTOCOL, remotes)
    }

    /// `whoami` on `task`, as a string.
    pub async fn whoami(&self, task: u32) -> Result<String, remote_eager::RemoteError> {
        let out = self
            .context
            .execute(&device(task), "whoami", Bytes::new())
            .await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
