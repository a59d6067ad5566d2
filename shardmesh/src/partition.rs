/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Splitting the shard range across workers.

/// Errors from [`partition`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// There are no shards to assign.
    #[error("cannot partition zero shards")]
    NoShards,
    /// There are no workers to assign shards to.
    #[error("cannot partition shards across zero clusters")]
    NoClusters,
    /// More workers than shards would leave some workers empty.
    #[error("{clusters} clusters exceed {shards} shards")]
    TooManyClusters {
        /// Requested workers.
        clusters: usize,
        /// Available shards.
        shards: u32,
    },
}

/// Split shards `0..total` into `clusters` contiguous, non-empty,
/// ascending groups whose sizes differ by at most one. The first
/// `total % clusters` groups take the extra shard.
pub fn partition(total: u32, clusters: usize) -> Result<Vec<Vec<u32>>, PartitionError> {
    if total == 0 {
        return Err(PartitionError::NoShards);
    }
    if clusters == 0 {
        return Err(PartitionError::NoClusters);
    }
    if clusters > total as usize {
        return Err(PartitionError::TooManyClusters {
            clusters,
            shards: total,
        });
    }

    let base = total as usize / clusters;
    let extra = total as usize % clusters;
    let mut next = 0u32;
    Ok((0..clusters)
        .map(|index| {
            let size = (base + usize::from(index < extra)) as u32;
            let group = (next..next + size).collect();
            next += size;
            group
        })
        .collect())
}

/// The shard count to use given the session endpoint's recommendation,
/// which assumes 1000 guilds per shard.
pub fn recommended_shard_count(recommended: u32, guilds_per_shard: u32) -> u32 {
    let guilds = u64::from(recommended) * 1000;
    let shards = guilds.div_ceil(u64::from(guilds_per_shard.max(1)));
    u32::try_from(shards).unwrap_or(u32::MAX).max(1)
}
