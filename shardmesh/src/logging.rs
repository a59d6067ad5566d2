/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use tracing_subscriber::EnvFilter;

/// Filter directives for shardmesh processes. Falls back to `RUST_LOG`.
pub const LOG_ENV: &str = "SHARDMESH_LOG";

const DEFAULT_FILTER: &str = "info";

/// Install a global subscriber that writes formatted events to stderr,
/// filtered by `SHARDMESH_LOG`, then `RUST_LOG`, then `info`.
///
/// Workers write their own logs to stderr too, where the supervisor picks
/// them up and re-emits them with a cluster prefix. Calling this more than
/// once is harmless; only the first call installs a subscriber.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
