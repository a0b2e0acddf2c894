//! Global and neighbor-restricted collectives
//!
//! Every collective is keyed by a name that must agree across ranks. Each
//! `*_async` call validates its arguments, dispatches to the provider and
//! registers the handle; the blocking form is the async form followed by
//! [`Communicator::synchronize`].

use crate::context::Communicator;
use crate::handle::Handle;
use crate::ops::{check_average, check_tensor, OpKind};
use crate::transport::{Reduction, Request};
use crate::weights::get_weights;
use crate::{CommError, Result};
use tracing::{debug, error, warn};
use weft_core::Tensor;

impl Communicator {
    fn op_name(&self, op: OpKind, name: Option<&str>) -> String {
        match name {
            Some(name) if !name.is_empty() => op.op_name(Some(name), 0),
            _ => op.op_name(None, self.next_sequence()),
        }
    }

    fn dispatch_collective(&self, request: Request, input: &Tensor, output: Tensor) -> Result<Handle> {
        let name = request.name().to_string();
        if !self.registry.claim_name(&name) {
            return Err(CommError::DuplicateName(name));
        }
        let handle = match self.transport.dispatch(request) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.release_name(&name);
                return Err(e);
            }
        };
        debug!(
            "Rank {} dispatched {} ({} bytes) as {}",
            self.rank(),
            name,
            input.numel() * input.dtype().size_in_bytes(),
            handle
        );
        self.registry
            .register_collective(handle, name, input.clone(), output);
        Ok(handle)
    }

    fn block_on(&self, handle: Handle) -> Result<Tensor> {
        self.synchronize(handle)?
            .ok_or(CommError::HandleNotFound(handle))
    }

    /// Wait for a collective and take its output. Unknown or already
    /// consumed handles yield `None`.
    pub fn synchronize(&self, handle: Handle) -> Result<Option<Tensor>> {
        let Some((input, output)) = self.registry.take_collective(handle) else {
            warn!("Rank {} cannot synchronize unknown handle {}", self.rank(), handle);
            return Ok(None);
        };

        let result = self.transport.wait(handle);
        // The provider is done with the input only once the wait returns.
        drop(input);
        if let Err(e) = result {
            error!(
                "Rank {} operation {} failed ({}): {}",
                self.rank(),
                handle,
                e.category(),
                e
            );
            return Err(e);
        }
        debug!("Rank {} completed {}", self.rank(), handle);
        Ok(Some(output))
    }

    /// Start a sum (or mean) over all ranks; `tensor` is not modified
    pub fn allreduce_async(&self, tensor: &Tensor, average: bool, name: Option<&str>) -> Result<Handle> {
        self.ensure_active()?;
        check_tensor(OpKind::Allreduce, tensor)?;
        check_average(OpKind::Allreduce, tensor, average)?;

        let output = tensor.zeros_like();
        let request = Request::Allreduce {
            name: self.op_name(OpKind::Allreduce, name),
            input: tensor.clone(),
            output: output.clone(),
            average,
        };
        self.dispatch_collective(request, tensor, output)
    }

    /// Sum (or mean) over all ranks into a new tensor
    pub fn allreduce(&self, tensor: &Tensor, average: bool, name: Option<&str>) -> Result<Tensor> {
        let handle = self.allreduce_async(tensor, average, name)?;
        self.block_on(handle)
    }

    fn broadcast_into(
        &self,
        tensor: &Tensor,
        output: Tensor,
        root_rank: usize,
        name: Option<&str>,
    ) -> Result<Handle> {
        self.ensure_active()?;
        check_tensor(OpKind::Broadcast, tensor)?;
        if root_rank >= self.size() {
            return Err(CommError::InvalidRank {
                rank: root_rank,
                size: self.size(),
            });
        }

        let request = Request::Broadcast {
            name: self.op_name(OpKind::Broadcast, name),
            input: tensor.clone(),
            output: output.clone(),
            root: root_rank,
        };
        self.dispatch_collective(request, tensor, output)
    }

    /// Start replicating `root_rank`'s tensor into a new tensor
    pub fn broadcast_async(&self, tensor: &Tensor, root_rank: usize, name: Option<&str>) -> Result<Handle> {
        self.broadcast_into(tensor, tensor.zeros_like(), root_rank, name)
    }

    /// Replicate `root_rank`'s tensor into a new tensor
    pub fn broadcast(&self, tensor: &Tensor, root_rank: usize, name: Option<&str>) -> Result<Tensor> {
        let handle = self.broadcast_async(tensor, root_rank, name)?;
        self.block_on(handle)
    }

    /// Start overwriting `tensor` with `root_rank`'s value
    pub fn broadcast_in_place_async(
        &self,
        tensor: &Tensor,
        root_rank: usize,
        name: Option<&str>,
    ) -> Result<Handle> {
        self.broadcast_into(tensor, tensor.clone(), root_rank, name)
    }

    /// Overwrite `tensor` with `root_rank`'s value
    pub fn broadcast_in_place(&self, tensor: &Tensor, root_rank: usize, name: Option<&str>) -> Result<Tensor> {
        let handle = self.broadcast_in_place_async(tensor, root_rank, name)?;
        self.block_on(handle)
    }

    /// Start concatenating every rank's tensor along axis 0
    pub fn allgather_async(&self, tensor: &Tensor, name: Option<&str>) -> Result<Handle> {
        self.ensure_active()?;
        check_tensor(OpKind::Allgather, tensor)?;

        let output = Tensor::empty(tensor.dtype());
        let request = Request::Allgather {
            name: self.op_name(OpKind::Allgather, name),
            input: tensor.clone(),
            output: output.clone(),
        };
        self.dispatch_collective(request, tensor, output)
    }

    /// Concatenate every rank's tensor along axis 0
    pub fn allgather(&self, tensor: &Tensor, name: Option<&str>) -> Result<Tensor> {
        let handle = self.allgather_async(tensor, name)?;
        self.block_on(handle)
    }

    /// Start concatenating the in-neighbors' tensors along axis 0, in
    /// ascending rank order, self excluded
    pub fn neighbor_allgather_async(&self, tensor: &Tensor, name: Option<&str>) -> Result<Handle> {
        self.ensure_active()?;
        check_tensor(OpKind::NeighborAllgather, tensor)?;

        let output = Tensor::empty(tensor.dtype());
        let request = Request::NeighborAllgather {
            name: self.op_name(OpKind::NeighborAllgather, name),
            input: tensor.clone(),
            output: output.clone(),
            sources: self.in_neighbor_ranks(),
        };
        self.dispatch_collective(request, tensor, output)
    }

    /// Concatenate the in-neighbors' tensors along axis 0
    pub fn neighbor_allgather(&self, tensor: &Tensor, name: Option<&str>) -> Result<Tensor> {
        let handle = self.neighbor_allgather_async(tensor, name)?;
        self.block_on(handle)
    }

    /// Start reducing self and in-neighbors. With `average` on a weighted
    /// topology the result is the topology's weighted average; otherwise a
    /// plain sum or mean.
    pub fn neighbor_allreduce_async(
        &self,
        tensor: &Tensor,
        average: bool,
        name: Option<&str>,
    ) -> Result<Handle> {
        self.ensure_active()?;
        check_tensor(OpKind::NeighborAllreduce, tensor)?;
        check_average(OpKind::NeighborAllreduce, tensor, average)?;

        let state = self.topology_state();
        let rank = self.rank();
        let sources = state.topology.in_neighbors(rank);
        let reduction = match (average, state.weighted) {
            (false, _) => Reduction::Sum,
            (true, false) => Reduction::Mean,
            (true, true) => {
                let weights = get_weights(&state.topology, rank);
                Reduction::Weighted {
                    self_weight: weights[0],
                    source_weights: weights[1..].to_vec(),
                }
            }
        };

        let output = tensor.zeros_like();
        let request = Request::NeighborAllreduce {
            name: self.op_name(OpKind::NeighborAllreduce, name),
            input: tensor.clone(),
            output: output.clone(),
            sources,
            reduction,
        };
        self.dispatch_collective(request, tensor, output)
    }

    /// Reduce self and in-neighbors into a new tensor
    pub fn neighbor_allreduce(&self, tensor: &Tensor, average: bool, name: Option<&str>) -> Result<Tensor> {
        let handle = self.neighbor_allreduce_async(tensor, average, name)?;
        self.block_on(handle)
    }
}
