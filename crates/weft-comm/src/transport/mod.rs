//! Transport provider boundary
//!
//! The core validates arguments, resolves weights against the topology and
//! hands the provider a fully specified [`Request`]. Providers never look at
//! the topology themselves.

pub mod local;
mod rendezvous;
mod replica;

use crate::handle::Handle;
use crate::ops::OpKind;
use crate::weights::WeightMap;
use crate::Result;
use weft_core::{Storage, Tensor};

pub use local::{LocalFabric, LocalTransport};

/// How a neighbor allreduce combines self and sources
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// Self plus every source
    Sum,
    /// Sum divided by the number of terms
    Mean,
    /// Self scaled by `self_weight`, source `i` scaled by `source_weights[i]`
    Weighted {
        self_weight: f64,
        source_weights: Vec<f64>,
    },
}

/// A dispatched operation, fully resolved by the core
#[derive(Debug, Clone)]
pub enum Request {
    /// Reduce across all ranks
    Allreduce {
        name: String,
        input: Tensor,
        output: Tensor,
        average: bool,
    },
    /// Replicate the root's buffer
    Broadcast {
        name: String,
        input: Tensor,
        output: Tensor,
        root: usize,
    },
    /// Concatenate every rank's buffer along axis 0
    Allgather {
        name: String,
        input: Tensor,
        output: Tensor,
    },
    /// Concatenate the sources' buffers along axis 0
    NeighborAllgather {
        name: String,
        input: Tensor,
        output: Tensor,
        sources: Vec<usize>,
    },
    /// Combine self with the sources' buffers
    NeighborAllreduce {
        name: String,
        input: Tensor,
        output: Tensor,
        sources: Vec<usize>,
        reduction: Reduction,
    },
    /// Replace each destination's receive slot with `input * weight`
    WinPut {
        window: String,
        input: Tensor,
        weights: WeightMap,
    },
    /// Add `input * weight` into each destination's receive slot
    WinAccumulate {
        window: String,
        input: Tensor,
        weights: WeightMap,
    },
    /// Copy each source's exposed buffer times weight into the local
    /// receive slot for that source
    WinGet { window: String, weights: WeightMap },
}

impl Request {
    /// Operation kind
    pub fn kind(&self) -> OpKind {
        match self {
            Request::Allreduce { .. } => OpKind::Allreduce,
            Request::Broadcast { .. } => OpKind::Broadcast,
            Request::Allgather { .. } => OpKind::Allgather,
            Request::NeighborAllgather { .. } => OpKind::NeighborAllgather,
            Request::NeighborAllreduce { .. } => OpKind::NeighborAllreduce,
            Request::WinPut { .. } => OpKind::WinPut,
            Request::WinAccumulate { .. } => OpKind::WinAccumulate,
            Request::WinGet { .. } => OpKind::WinGet,
        }
    }

    /// Rendezvous name, or window name for one-sided operations
    pub fn name(&self) -> &str {
        match self {
            Request::Allreduce { name, .. }
            | Request::Broadcast { name, .. }
            | Request::Allgather { name, .. }
            | Request::NeighborAllgather { name, .. }
            | Request::NeighborAllreduce { name, .. } => name,
            Request::WinPut { window, .. }
            | Request::WinAccumulate { window, .. }
            | Request::WinGet { window, .. } => window,
        }
    }
}

/// Moves data between ranks on behalf of one [`Communicator`](crate::Communicator)
pub trait Transport: Send + Sync {
    /// This rank
    fn rank(&self) -> usize;

    /// Number of ranks
    fn size(&self) -> usize;

    /// Rank among the ranks of this host
    fn local_rank(&self) -> usize;

    /// Number of ranks on this host
    fn local_size(&self) -> usize;

    /// Start an operation without blocking
    fn dispatch(&self, request: Request) -> Result<Handle>;

    /// Whether the operation behind `handle` has finished
    fn poll(&self, handle: Handle) -> bool;

    /// Block until the operation behind `handle` has finished
    fn wait(&self, handle: Handle) -> Result<()>;

    /// Block until every rank has finished its dispatched operations and
    /// reached the barrier
    fn barrier(&self) -> Result<()>;

    /// Collectively expose `buffer` under `name`, with one zeroed receive
    /// slot per in-neighbor
    fn win_create(&self, name: &str, buffer: &Tensor, in_neighbors: &[usize]) -> Result<()>;

    /// Release this rank's resources for `name`
    fn win_free(&self, name: &str) -> Result<()>;

    /// Weighted combination of the exposed buffer (for this rank's key) and
    /// the receive slots, then rescale the slots named in `update_weights`
    fn win_sync(&self, name: &str, weights: &WeightMap, update_weights: &WeightMap)
        -> Result<Storage>;

    /// Collective barrier scoped to window `name`
    fn win_fence(&self, name: &str) -> Result<()>;

    /// Take this rank's access lock on `name`
    fn win_lock(&self, name: &str) -> Result<()>;

    /// Release this rank's access lock on `name`
    fn win_unlock(&self, name: &str) -> Result<()>;

    /// Release provider resources held for this rank
    fn shutdown(&self) -> Result<()>;
}
