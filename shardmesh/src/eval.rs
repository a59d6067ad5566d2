/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Evaluation of [`EvalRequest`]s against application state.

use async_trait::async_trait;
use serde_json::Value;
use shardmesh_ipc::ErrorDescriptor;
use shardmesh_ipc::EvalRequest;
use shardmesh_ipc::Incoming;
use shardmesh_ipc::Reply;

use crate::Error;

/// Answers evaluation requests. Workers install one to serve broadcasts
/// and lookups; the supervisor may install one to serve master
/// evaluations.
#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluate `request`. Lookups of absent entities evaluate to `null`.
    async fn evaluate(&self, request: EvalRequest) -> Result<Value, ErrorDescriptor>;
}

/// An evaluator with no state: properties and lookups evaluate to `null`,
/// and scripts are refused.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvaluator;

#[async_trait]
impl Evaluator for NullEvaluator {
    async fn evaluate(&self, request: EvalRequest) -> Result<Value, ErrorDescriptor> {
        match request {
            EvalRequest::Script { .. } => Err(ErrorDescriptor::new(
                "Unsupported",
                "this process cannot evaluate scripts",
            )),
            _ => Ok(Value::Null),
        }
    }
}

/// Evaluate `request`, refusing scripts unless `eval_enabled`.
pub(crate) async fn evaluate(
    evaluator: &dyn Evaluator,
    request: EvalRequest,
    eval_enabled: bool,
) -> Result<Value, ErrorDescriptor> {
    if matches!(request, EvalRequest::Script { .. }) && !eval_enabled {
        return Err(Error::EvalDisabled.descriptor());
    }
    evaluator.evaluate(request).await
}

/// Answer an incoming evaluation request.
pub(crate) async fn answer(evaluator: &dyn Evaluator, incoming: Incoming, eval_enabled: bool) {
    let reply = match incoming.payload_as::<EvalRequest>() {
        Ok(request) => match evaluate(evaluator, request, eval_enabled).await {
            Ok(value) => Reply::ok(value),
            Err(descriptor) => Reply::err(descriptor),
        },
        Err(err) => Reply::err(ErrorDescriptor::new(
            "InvalidRequest",
            format!("malformed evaluation request: {}", err),
        )),
    };
    incoming.reply(reply);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Echo;

    #[async_trait]
    impl Evaluator for Echo {
        async fn evaluate(&self, request: EvalRequest) -> Result<Value, ErrorDescriptor> {
            Ok(serde_json::to_value(request).unwrap())
        }
    }

    #[tokio::test]
    async fn test_scripts_gated() {
        let script = EvalRequest::Script {
            code: "1 + 1".to_string(),
        };
        let err = evaluate(&Echo, script.clone(), false).await.unwrap_err();
        assert_eq!(err.name, "EvalDisabled");
        assert_eq!(
            evaluate(&Echo, script, true).await.unwrap(),
            json!({"kind": "script", "code": "1 + 1"})
        );

        // Properties and lookups never need the flag.
        let property = EvalRequest::Property {
            path: "guilds.size".to_string(),
        };
        assert!(evaluate(&Echo, property, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_null_evaluator() {
        let lookup = EvalRequest::Lookup {
            entity: shardmesh_ipc::EntityKind::User,
            id: "1".to_string(),
        };
        assert_eq!(NullEvaluator.evaluate(lookup).await.unwrap(), Value::Null);
        assert!(NullEvaluator
            .evaluate(EvalRequest::Script {
                code: String::new()
            })
            .await
            .is_err());
    }
}
