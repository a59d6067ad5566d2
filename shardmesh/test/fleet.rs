/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Integration tests that run fleets of real worker processes.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use serde_json::json;
use shardmesh::worker::ExitReason;
use shardmesh::ChannelAddr;
use shardmesh::Error;
use shardmesh::Fleet;
use shardmesh::FleetConfig;
use shardmesh::FleetEvent;
use shardmesh::RetryPolicy;
use shardmesh::ShardCount;
use shardmesh::WorkerStatus;
use tempfile::TempDir;
use tokio::time::timeout;

const TEST_WORKER: &str = env!("CARGO_BIN_EXE_shardmesh_test_worker");
const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

fn config(dir: &TempDir, shards: u32, clusters: usize) -> FleetConfig {
    FleetConfig {
        program: PathBuf::from(TEST_WORKER),
        shard_count: ShardCount::Fixed(shards),
        cluster_count: clusters,
        spawn_delay_ms: 0,
        respawn_delay_ms: 50,
        ready_timeout_ms: 10_000,
        ipc_addr: ChannelAddr::Unix(dir.path().join("fleet.sock")),
        eval: true,
        retry: RetryPolicy {
            max_attempts: Some(3),
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
            multiplier: 2.0,
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ten_shards_three_clusters() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 10, 3)).listen().await.unwrap();
    let mut events = fleet.subscribe();
    fleet.spawn_fleet().await.unwrap();

    let shards: Vec<Vec<u32>> = fleet
        .workers()
        .iter()
        .map(|worker| worker.shards().to_vec())
        .collect();
    assert_eq!(
        shards,
        vec![vec![0, 1, 2, 3], vec![4, 5, 6], vec![7, 8, 9]]
    );
    assert!(fleet.workers().iter().all(|worker| worker.is_ready()));

    let mut lifecycle = Vec::new();
    let mut shards_ready = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            FleetEvent::Spawn { cluster, pid } => {
                assert!(pid.is_some());
                lifecycle.push(("spawn", cluster));
            }
            FleetEvent::Ready { cluster } => lifecycle.push(("ready", cluster)),
            FleetEvent::ShardReady { shard, .. } => shards_ready.push(shard),
            _ => {}
        }
    }
    // Each worker is spawned only once the previous one is ready, and
    // becomes ready exactly once.
    assert_eq!(
        lifecycle,
        vec![
            ("spawn", 0),
            ("ready", 0),
            ("spawn", 1),
            ("ready", 1),
            ("spawn", 2),
            ("ready", 2),
        ]
    );
    shards_ready.sort_unstable();
    assert_eq!(shards_ready, (0..10).collect::<Vec<_>>());

    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(0), json!(1), json!(2)]
    );
    assert_eq!(
        fleet.fetch_client_values("total_shards").await.unwrap(),
        vec![json!(10), json!(10), json!(10)]
    );
    assert!(matches!(fleet.spawn_fleet().await, Err(Error::AlreadySpawned)));

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_and_fetch() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 2, 2)).listen().await.unwrap();
    fleet.spawn_fleet().await.unwrap();

    assert_eq!(
        fleet.broadcast("hello").await.unwrap(),
        vec![
            json!({"cluster": 0, "echo": "hello"}),
            json!({"cluster": 1, "echo": "hello"}),
        ]
    );
    match fleet.broadcast("fail").await {
        Err(Error::Broadcast { peer, error }) => {
            assert_eq!(peer, "Cluster 0");
            assert_eq!(error.descriptor().name, "TypeError");
            assert_eq!(error.descriptor().message, "boom in cluster 0");
        }
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(
        fleet.fetch_user("u1").await.unwrap(),
        json!({"id": "u1", "cluster": 1})
    );
    assert!(matches!(
        fleet.fetch_user("u9").await,
        Err(Error::NotFound { .. })
    ));

    let worker = fleet.worker(1).unwrap();
    assert_eq!(
        worker.eval("x").await.unwrap(),
        json!({"cluster": 1, "echo": "x"})
    );
    assert_eq!(
        fleet
            .worker(0)
            .unwrap()
            .fetch_client_value("shards")
            .await
            .unwrap(),
        json!([0])
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_crash_recovery() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 1, 1)).listen().await.unwrap();
    fleet.spawn_fleet().await.unwrap();

    let worker = fleet.worker(0).unwrap();
    assert!(worker.is_ready());
    let pid = worker.pid().await.unwrap();
    let mut status = worker.subscribe();

    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    let exited = timeout(
        STATUS_TIMEOUT,
        status.wait_for(|status| matches!(status, WorkerStatus::Exited(_))),
    )
    .await
    .unwrap()
    .map(|status| (*status).clone())
    .unwrap();
    assert_eq!(
        exited,
        WorkerStatus::Exited(ExitReason::Killed(Signal::SIGKILL as i32, false))
    );

    timeout(STATUS_TIMEOUT, status.wait_for(WorkerStatus::is_ready))
        .await
        .unwrap()
        .unwrap();
    let respawned = worker.pid().await.unwrap();
    assert_ne!(pid, respawned);
    assert_eq!(
        worker.fetch_client_value("id").await.unwrap(),
        json!(0)
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_crash_without_respawn() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 2, 2);
    config.respawn = false;
    let fleet = Fleet::builder(config).listen().await.unwrap();
    let mut events = fleet.subscribe();
    fleet.spawn_fleet().await.unwrap();

    let worker = fleet.worker(0).unwrap();
    let pid = worker.pid().await.unwrap();
    let mut status = worker.subscribe();
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();

    timeout(
        STATUS_TIMEOUT,
        status.wait_for(|status| matches!(status, WorkerStatus::Exited(_))),
    )
    .await
    .unwrap()
    .unwrap();

    // Give a respawn every chance to happen.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        worker.status(),
        WorkerStatus::Exited(ExitReason::Killed(Signal::SIGKILL as i32, false))
    );
    assert_eq!(worker.pid().await, None);
    let spawns = std::iter::from_fn(|| events.try_recv().ok())
        .filter(|event| matches!(event, FleetEvent::Spawn { cluster: 0, .. }))
        .count();
    assert_eq!(spawns, 1);

    // The survivor alone answers broadcasts.
    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(1)]
    );
    // An explicit restart still brings the worker back.
    fleet.restart(0).await.unwrap();
    assert!(worker.is_ready());
    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(0), json!(1)]
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 1, 1)).listen().await.unwrap();
    fleet.spawn_fleet().await.unwrap();

    let worker = fleet.worker(0).unwrap();
    worker.kill().await;
    assert_eq!(worker.status(), WorkerStatus::Killed);
    worker.kill().await;
    assert_eq!(worker.status(), WorkerStatus::Killed);

    // An explicit kill does not trigger a respawn.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(worker.status(), WorkerStatus::Killed);
    assert_eq!(worker.pid().await, None);

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_restart() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 4, 2)).listen().await.unwrap();
    fleet.spawn_fleet().await.unwrap();

    let worker = fleet.worker(1).unwrap();
    let pid = worker.pid().await.unwrap();
    fleet.restart(1).await.unwrap();
    assert!(worker.is_ready());
    assert_ne!(worker.pid().await.unwrap(), pid);

    match fleet.restart(7).await {
        Err(Error::NotFound { kind, id }) => {
            assert_eq!(kind, "cluster");
            assert_eq!(id, "7");
        }
        other => panic!("unexpected {:?}", other),
    }

    let mut pids = Vec::new();
    for worker in fleet.workers() {
        pids.push(worker.pid().await.unwrap());
    }
    fleet.restart_all().await.unwrap();
    for (worker, pid) in fleet.workers().iter().zip(pids) {
        assert!(worker.is_ready());
        assert_ne!(worker.pid().await.unwrap(), pid);
    }
    assert_eq!(
        fleet.fetch_client_values("shards").await.unwrap(),
        vec![json!([0, 1]), json!([2, 3])]
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_order_survives_restart() {
    let dir = TempDir::new().unwrap();
    let fleet = Fleet::builder(config(&dir, 2, 2)).listen().await.unwrap();
    fleet.spawn_fleet().await.unwrap();

    fleet.restart(0).await.unwrap();
    assert_eq!(fleet.hub().peers(), vec!["Cluster 0", "Cluster 1"]);
    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(0), json!(1)]
    );

    fleet.restart_all().await.unwrap();
    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(0), json!(1)]
    );

    fleet.shutdown().await;
}

#[tokio::test]
async fn test_never_ready_exhausts_retries() {
    let dir = TempDir::new().unwrap();
    let mut config = config(&dir, 1, 1);
    config.ready_timeout_ms = 200;
    config.retry.max_attempts = Some(2);
    config.env.insert(
        "SHARDMESH_TEST_WORKER_MODE".to_string(),
        "never_ready".to_string(),
    );
    let fleet = Fleet::builder(config).listen().await.unwrap();
    let mut events = fleet.subscribe();

    match fleet.spawn_fleet().await {
        Err(Error::RetriesExhausted { clusters }) => assert_eq!(clusters, vec![0]),
        other => panic!("unexpected {:?}", other),
    }
    let worker = fleet.worker(0).unwrap();
    assert_eq!(worker.status(), WorkerStatus::ReadinessTimedOut);

    let mut spawns = 0;
    while let Ok(event) = events.try_recv() {
        if let FleetEvent::Spawn { .. } = event {
            spawns += 1;
        }
    }
    // The first start, and two retries.
    assert_eq!(spawns, 3);

    fleet.shutdown().await;
    assert_eq!(worker.status(), WorkerStatus::Killed);
}

#[tokio::test]
async fn test_retry_recovers_failed_start() {
    let dir = TempDir::new().unwrap();
    let markers = TempDir::new().unwrap();
    let mut config = config(&dir, 3, 3);
    config.env.insert(
        "SHARDMESH_TEST_WORKER_MODE".to_string(),
        "ready_on_second_attempt".to_string(),
    );
    config.env.insert(
        "SHARDMESH_TEST_MARKER_DIR".to_string(),
        markers.path().display().to_string(),
    );
    let fleet = Fleet::builder(config).listen().await.unwrap();

    fleet.spawn_fleet().await.unwrap();
    assert!(fleet.workers().iter().all(|worker| worker.is_ready()));
    for cluster in 0..3 {
        assert!(markers.path().join(format!("cluster-{}", cluster)).exists());
    }
    assert_eq!(
        fleet.fetch_client_values("id").await.unwrap(),
        vec![json!(0), json!(1), json!(2)]
    );

    fleet.shutdown().await;
}
