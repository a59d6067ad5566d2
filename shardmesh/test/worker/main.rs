/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A worker for integration tests. Its behavior is selected with
//! `SHARDMESH_TEST_WORKER_MODE`:
//!
//! - unset: report every shard ready, then the cluster ready;
//! - `never_ready`: connect, but never report ready;
//! - `ready_on_second_attempt`: exit with an error the first time each
//!   cluster starts, recording the attempt in `SHARDMESH_TEST_MARKER_DIR`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use shardmesh::bootstrap::bootstrap_or_die;
use shardmesh::bootstrap::BootstrapConfig;
use shardmesh::logging::initialize_logging;
use shardmesh::ClusterId;
use shardmesh::EntityKind;
use shardmesh::ErrorDescriptor;
use shardmesh::EvalRequest;
use shardmesh::Evaluator;

const MODE_ENV: &str = "SHARDMESH_TEST_WORKER_MODE";
const MARKER_DIR_ENV: &str = "SHARDMESH_TEST_MARKER_DIR";

struct TestEvaluator {
    cluster: ClusterId,
    shards: Vec<u32>,
    total_shards: u32,
}

#[async_trait]
impl Evaluator for TestEvaluator {
    async fn evaluate(&self, request: EvalRequest) -> Result<Value, ErrorDescriptor> {
        match request {
            EvalRequest::Property { path } => match path.as_str() {
                "id" => Ok(json!(self.cluster)),
                "shards" => Ok(json!(self.shards)),
                "total_shards" => Ok(json!(self.total_shards)),
                _ => Ok(Value::Null),
            },
            EvalRequest::Lookup { entity, id } => {
                if entity == EntityKind::User && id == format!("u{}", self.cluster) {
                    Ok(json!({ "id": id, "cluster": self.cluster }))
                } else {
                    Ok(Value::Null)
                }
            }
            EvalRequest::Script { code } if code == "fail" => Err(ErrorDescriptor::new(
                "TypeError",
                format!("boom in cluster {}", self.cluster),
            )),
            EvalRequest::Script { code } => Ok(json!({ "cluster": self.cluster, "echo": code })),
        }
    }
}

fn evaluator(config: &BootstrapConfig) -> Arc<dyn Evaluator> {
    Arc::new(TestEvaluator {
        cluster: config.cluster_id,
        shards: config.shards.clone(),
        total_shards: config.total_shards,
    })
}

/// Whether this is the first start of `cluster`, recording that it
/// happened.
fn first_attempt(cluster: ClusterId) -> bool {
    let Some(dir) = std::env::var_os(MARKER_DIR_ENV) else {
        return false;
    };
    let marker = PathBuf::from(dir).join(format!("cluster-{}", cluster));
    if marker.exists() {
        return false;
    }
    std::fs::write(&marker, b"started").is_ok()
}

#[tokio::main]
async fn main() {
    initialize_logging();
    let client = bootstrap_or_die(evaluator).await;
    let mode = std::env::var(MODE_ENV).unwrap_or_default();

    match mode.as_str() {
        "never_ready" => {}
        "ready_on_second_attempt" if first_attempt(client.id()) => {
            tracing::error!("cluster {} failing its first start", client.id());
            std::process::exit(1);
        }
        _ => {
            for &shard in client.shards() {
                if let Err(err) = client.shard_ready(shard).await {
                    tracing::error!("reporting shard {} ready: {}", shard, err);
                }
            }
            if let Err(err) = client.ready().await {
                tracing::error!("reporting ready: {}", err);
                std::process::exit(1);
            }
        }
    }

    // Serve until the supervisor goes away.
    client.peer().closed().await;
}
