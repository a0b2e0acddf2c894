//! Weight vectors and weight maps
//!
//! A weight map scopes and scales a neighbor-restricted operation. Absent
//! maps are resolved by the pure functions here against the active
//! topology, so there is never a shared mutable default.

use crate::topology::Topology;
use crate::{CommError, Result};
use std::collections::BTreeMap;

/// Rank to weight, iterated in ascending rank order
pub type WeightMap = BTreeMap<usize, f64>;

/// Incoming weights of `rank`: slot 0 is the self weight (0.0 without a
/// self-loop), followed by predecessor weights in ascending rank order
pub fn get_weights(topology: &Topology, rank: usize) -> Vec<f64> {
    let mut weights = vec![0.0];
    for (src, weight) in topology.predecessors(rank) {
        if src == rank {
            weights[0] = weight;
        } else {
            weights.push(weight);
        }
    }
    weights
}

/// Same weight for every rank in `ranks`
pub fn uniform(ranks: &[usize], weight: f64) -> WeightMap {
    ranks.iter().map(|&r| (r, weight)).collect()
}

/// Fail unless every key of `weights` is in `allowed`
pub fn check_subset(argument: &'static str, weights: &WeightMap, allowed: &[usize]) -> Result<()> {
    match weights.keys().find(|rank| !allowed.contains(rank)) {
        Some(&rank) => Err(CommError::InvalidWeights {
            argument,
            rank,
            allowed: allowed.to_vec(),
        }),
        None => Ok(()),
    }
}

/// Destination weights for put/accumulate: given map checked against the
/// out-neighbors, or 1.0 to each of them
pub fn resolve_dst_weights(given: Option<WeightMap>, out_neighbors: &[usize]) -> Result<WeightMap> {
    match given {
        Some(map) => {
            check_subset("dst_weights", &map, out_neighbors)?;
            Ok(map)
        }
        None => Ok(uniform(out_neighbors, 1.0)),
    }
}

/// Source weights for get: given map checked against the in-neighbors, or
/// 1.0 from each of them
pub fn resolve_src_weights(given: Option<WeightMap>, in_neighbors: &[usize]) -> Result<WeightMap> {
    match given {
        Some(map) => {
            check_subset("src_weights", &map, in_neighbors)?;
            Ok(map)
        }
        None => Ok(uniform(in_neighbors, 1.0)),
    }
}

/// Combination weights over self and in-neighbors when the caller gives
/// none: topology weights if the topology is weighted, otherwise a uniform
/// mean over `indegree + 1` terms
pub fn default_sync_weights(topology: &Topology, rank: usize, weighted: bool) -> WeightMap {
    let in_neighbors = topology.in_neighbors(rank);
    if weighted {
        let mut map = WeightMap::new();
        map.insert(rank, topology.weight(rank, rank).unwrap_or(0.0));
        for (src, weight) in topology.predecessors(rank) {
            if src != rank {
                map.insert(src, weight);
            }
        }
        map
    } else {
        let share = 1.0 / (in_neighbors.len() + 1) as f64;
        let mut map = uniform(&in_neighbors, share);
        map.insert(rank, share);
        map
    }
}

/// Weights for the collect pattern: every in-neighbor and self at 1.0,
/// followed by draining every in-neighbor's receive slot
pub fn collect_weights(rank: usize, in_neighbors: &[usize]) -> (WeightMap, WeightMap) {
    let mut weights = uniform(in_neighbors, 1.0);
    weights.insert(rank, 1.0);
    (weights, uniform(in_neighbors, 0.0))
}
