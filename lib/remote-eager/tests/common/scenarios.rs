// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dynamic membership scenarios that run in either execution mode

use super::*;
use remote_eager::{ComponentDef, ErrorCode, LogicalDevice, RemoteError};
use tokio::time::timeout;

fn logical(task: u32) -> LogicalDevice {
    LogicalDevice::parse(&device(task)).unwrap()
}

/// Wait until the current view counts `count` calls.
async fn until_in_flight(cluster: &LoopbackCluster, count: usize) {
    timeout(STEP_TIMEOUT, async {
        while cluster.context.current_view().unwrap().in_flight_count() < count {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

pub async fn add_then_remove_tasks(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.start("c:3", "C");

    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    assert_eq!(cluster.whoami(1).await.unwrap(), "A");

    let view = cluster
        .context
        .update_server_def(cluster.def(&["a:1", "b:2", "c:3"]))
        .await
        .unwrap();
    assert_eq!(view, 1);
    assert_eq!(cluster.whoami(3).await.unwrap(), "C");

    cluster
        .context
        .update_server_def(cluster.def(&["a:1"]))
        .await
        .unwrap();
    let err = cluster.whoami(2).await.unwrap_err();
    assert!(matches!(err, RemoteError::UnknownDevice { .. }), "{err}");
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(matches!(
        cluster.whoami(3).await,
        Err(RemoteError::UnknownDevice { .. })
    ));
    assert_eq!(cluster.whoami(1).await.unwrap(), "A");

    cluster.context.wait_for_all_pending_nodes().await.unwrap();
}

pub async fn view_ids_increase_with_each_update(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");

    assert_eq!(cluster.context.set_server_def(cluster.def(&["a:1"])).await.unwrap(), 0);
    let sequences: [&[&str]; 5] = [&["a:1", "b:2"], &["b:2"], &["b:2", "a:1"], &["a:1"], &["a:1", "b:2"]];
    for (position, remotes) in sequences.iter().enumerate() {
        let view_id = cluster.context.update_server_def(cluster.def(remotes)).await.unwrap();
        assert_eq!(view_id, position as u64 + 1);
        assert_eq!(cluster.context.current_view().unwrap().view_id(), view_id);
        assert_eq!(cluster.context.context_view_id(), view_id);
    }

    // The worker saw the id of the view its last call was resolved against.
    cluster.whoami(1).await.unwrap();
    let a = cluster.transport.worker(&endpoint("a:1")).unwrap();
    assert_eq!(a.last_view_id(), Some(5));
}

pub async fn moved_task_resolves_to_new_endpoint(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.start("c:3", "C");

    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    assert_eq!(cluster.whoami(1).await.unwrap(), "A");
    assert_eq!(cluster.whoami(2).await.unwrap(), "B");

    cluster
        .context
        .update_server_def(cluster.def(&["c:3", "b:2"]))
        .await
        .unwrap();
    assert_eq!(cluster.whoami(1).await.unwrap(), "C");
    assert_eq!(cluster.whoami(2).await.unwrap(), "B");

    // The connection to the surviving endpoint was kept.
    assert_eq!(cluster.transport.connect_count(&endpoint("b:2")), 1);
    assert!(cluster.context.pool().connection(&endpoint("a:1")).is_none());
}

pub async fn readded_task_gets_fresh_connection(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.start("d:4", "D");

    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    assert_eq!(cluster.whoami(2).await.unwrap(), "B");
    let old = cluster.context.pool().connection(&endpoint("b:2")).unwrap();

    cluster.context.update_server_def(cluster.def(&["a:1"])).await.unwrap();
    assert!(matches!(
        cluster.whoami(2).await,
        Err(RemoteError::UnknownDevice { .. })
    ));

    // Task 2 comes back under a different endpoint.
    cluster
        .context
        .update_server_def(cluster.def(&["a:1", "d:4"]))
        .await
        .unwrap();
    assert_eq!(cluster.whoami(2).await.unwrap(), "D");
    let fresh = cluster.context.pool().connection(&endpoint("d:4")).unwrap();
    assert_ne!(fresh.id(), old.id());
    assert!(!old.is_alive());

    // And later under its original endpoint: still a new connection.
    cluster
        .context
        .update_server_def(cluster.def(&["a:1", "b:2"]))
        .await
        .unwrap();
    assert_eq!(cluster.whoami(2).await.unwrap(), "B");
    let again = cluster.context.pool().connection(&endpoint("b:2")).unwrap();
    assert_ne!(again.id(), old.id());
    assert_eq!(cluster.transport.connect_count(&endpoint("b:2")), 2);
}

pub async fn in_flight_call_keeps_its_endpoint(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    let a = cluster.start("a:1", "A");
    let c = cluster.start("c:3", "C");
    cluster.context.set_server_def(cluster.def(&["a:1"])).await.unwrap();
    cluster.transport.set_latency(Duration::from_millis(200));

    let context = cluster.context.clone();
    let call = tokio::spawn(async move {
        context.execute(&device(1), "whoami", Bytes::new()).await
    });
    until_in_flight(&cluster, 1).await;

    // Move task 1 while the call is still on its way to A.
    let view_id = timeout(
        STEP_TIMEOUT,
        cluster.context.update_server_def(cluster.def(&["c:3"])),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(view_id, 1);

    // The update waited for the old view's call to reach A.
    assert_eq!(a.call_count(), 1);
    assert_eq!(c.call_count(), 0);
    let out = call.await.unwrap().unwrap();
    assert_eq!(out, Bytes::from_static(b"A"));
    assert_eq!(cluster.whoami(1).await.unwrap(), "C");

    assert_eq!(a.last_view_id(), Some(0));
    assert_eq!(c.last_view_id(), Some(1));
}

pub async fn in_flight_call_fails_cleanly_when_endpoint_dies(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    cluster.transport.set_latency(Duration::from_millis(200));

    let context = cluster.context.clone();
    let call = tokio::spawn(async move {
        context.execute(&device(2), "whoami", Bytes::new()).await
    });
    until_in_flight(&cluster, 1).await;

    // Task 2 is removed and its worker goes away before the call lands.
    cluster.transport.stop_worker(&endpoint("b:2"));
    cluster
        .context
        .update_server_def(cluster.def(&["a:1"]))
        .await
        .unwrap();

    let err = call.await.unwrap().unwrap_err();
    match &err {
        RemoteError::DeviceUnreachable { endpoint: ep, .. } => assert_eq!(ep, &endpoint("b:2")),
        other => panic!("expected DeviceUnreachable, got {other}"),
    }
    assert_eq!(err.code(), ErrorCode::Unavailable);

    // Nothing was redirected to the surviving worker.
    let a = cluster.transport.worker(&endpoint("a:1")).unwrap();
    assert_eq!(a.call_count(), 0);

    if mode == ExecutionMode::Async {
        assert_eq!(
            cluster.context.wait_for_all_pending_nodes().await.unwrap_err(),
            err
        );
        cluster.context.clear_error();
    }
    cluster.context.wait_for_all_pending_nodes().await.unwrap();
}

pub async fn functions_reregister_without_retracing(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    let c = cluster.start("c:3", "C");
    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();

    let function = cluster
        .context
        .register_function(
            "pipeline",
            vec![
                ComponentDef::new("append").on(logical(1)),
                ComponentDef::new("append").on(logical(2)),
                ComponentDef::new("append").after(0),
            ],
        )
        .unwrap();

    let out = cluster
        .context
        .run_function(function, &device(0), Bytes::from_static(b"x"))
        .await
        .unwrap();
    assert_eq!(out, Bytes::from_static(b"x|1|0"));
    let out = cluster
        .context
        .run_function(function, &device(0), Bytes::from_static(b"y"))
        .await
        .unwrap();
    assert_eq!(out, Bytes::from_static(b"y|1|0"));

    let a = cluster.transport.worker(&endpoint("a:1")).unwrap();
    assert_eq!(a.registration_count(), 1);

    // Task 1 moves to C: the definition is registered there, not traced again.
    cluster
        .context
        .update_server_def(cluster.def(&["c:3", "b:2"]))
        .await
        .unwrap();
    let out = cluster
        .context
        .run_function(function, &device(0), Bytes::from_static(b"z"))
        .await
        .unwrap();
    assert_eq!(out, Bytes::from_static(b"z|1|0"));
    assert_eq!(c.registration_count(), 1);
    assert_eq!(a.registration_count(), 1);
    assert_eq!(cluster.context.function_trace_count(), 1);

    // A component device that left the membership fails the whole invocation.
    cluster.context.update_server_def(cluster.def(&["c:3"])).await.unwrap();
    assert!(matches!(
        cluster.context.run_function(function, &device(0), Bytes::new()).await,
        Err(RemoteError::UnknownDevice { .. })
    ));
}

pub async fn function_failure_is_all_or_nothing(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();

    let function = cluster
        .context
        .register_function(
            "partial",
            vec![
                ComponentDef::new("append").on(logical(1)),
                ComponentDef::new("fail").on(logical(2)),
                ComponentDef::new("append").after(0),
            ],
        )
        .unwrap();

    let err = cluster
        .context
        .run_function(function, &device(0), Bytes::new())
        .await
        .unwrap_err();
    match &err {
        RemoteError::RemoteExecution { message, .. } => assert!(message.contains("injected failure")),
        other => panic!("expected RemoteExecution, got {other}"),
    }

    if mode == ExecutionMode::Async {
        cluster.context.wait_for_all_pending_nodes().await.unwrap_err();
        cluster.context.clear_error();
    }
}

pub async fn check_alive_is_idempotent(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");

    let err = cluster.context.check_alive(&task(1)).await.unwrap_err();
    assert_eq!(err, RemoteError::ContextNotInitialized);
    assert_eq!(err.to_string(), "Context is not initialized.");

    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    let view_before = cluster.context.current_view().unwrap().view_id();
    for _ in 0..2 {
        assert!(cluster.context.check_alive(&task(1)).await.unwrap());
        assert!(cluster.context.check_alive("/job:worker/task:2").await.unwrap());
        assert!(cluster.context.check_alive(&device(0)).await.unwrap());
    }
    assert!(cluster.context.pool().is_empty());
    assert_eq!(cluster.context.current_view().unwrap().view_id(), view_before);

    let err = cluster.context.check_alive("/job:worker/replica:0/task:9").await.unwrap_err();
    assert!(
        err.to_string()
            .contains("Client for target /job:worker/replica:0/task:9 not found."),
        "{err}"
    );
    assert!(matches!(
        cluster.context.check_alive("/job:worker").await,
        Err(RemoteError::MalformedDeviceName(_))
    ));

    cluster.transport.stop_worker(&endpoint("b:2"));
    assert!(!cluster.context.check_alive(&task(2)).await.unwrap());
    assert!(cluster.context.check_alive(&task(1)).await.unwrap());
}

pub async fn pending_nodes_survive_updates(mode: ExecutionMode) {
    let cluster = LoopbackCluster::new(mode);
    cluster.start("a:1", "A");
    cluster.start("b:2", "B");
    cluster.start("c:3", "C");
    cluster.context.set_server_def(cluster.def(&["a:1", "b:2"])).await.unwrap();
    cluster.transport.set_latency(Duration::from_millis(20));

    let mut calls = Vec::new();
    for i in 0..16u8 {
        let task = 1 + u32::from(i % 2);
        calls.push(
            cluster
                .context
                .enqueue(&device(task), "append", Bytes::from(vec![b'0' + i % 10]))
                .await
                .unwrap(),
        );
    }

    // Task 3 joins while calls may still be pending.
    cluster
        .context
        .update_server_def(cluster.def(&["a:1", "b:2", "c:3"]))
        .await
        .unwrap();
    cluster.context.wait_for_all_pending_nodes().await.unwrap();
    assert_eq!(cluster.context.pending_count(), 0);

    for (i, call) in calls.into_iter().enumerate() {
        assert_eq!(call.view_id(), 0);
        let task = 1 + i % 2;
        let out = call.wait().await.unwrap();
        assert_eq!(out, Bytes::from(format!("{}|{task}", i % 10)));
    }
    assert_eq!(cluster.whoami(3).await.unwrap(), "C");
}
