//! One-sided remote memory windows
//!
//! A window associates a name with a caller-owned buffer on every rank.
//! Neighbors write into (`win_put`, `win_accumulate`) or read from
//! (`win_get`) it, and the owner folds what it received into its buffer with
//! the local `win_sync`. The table here only holds the name to buffer
//! association; receive buffers belong to the provider.

use crate::context::Communicator;
use crate::handle::Handle;
use crate::ops::{check_tensor, OpKind};
use crate::transport::Request;
use crate::weights::{
    check_subset, collect_weights, default_sync_weights, resolve_dst_weights, resolve_src_weights,
    WeightMap,
};
use crate::{CommError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use weft_core::Tensor;

/// Observable lifecycle state of a window on this rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowState {
    /// Created, nothing synchronized yet
    Created,
    /// Last settled by `win_sync`
    Synced,
    /// The newest outstanding one-sided operation
    Pending(OpKind),
}

#[derive(Debug)]
struct WindowRecord {
    buffer: Tensor,
    synced: bool,
    locked: bool,
}

/// Name to buffer association for one rank
#[derive(Debug, Default)]
pub(crate) struct WindowTable {
    windows: DashMap<String, WindowRecord>,
}

impl WindowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.windows.contains_key(name)
    }

    fn insert(&self, name: &str, buffer: Tensor) {
        self.windows.insert(
            name.to_string(),
            WindowRecord {
                buffer,
                synced: false,
                locked: false,
            },
        );
    }

    pub fn remove(&self, name: &str) -> bool {
        self.windows.remove(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.windows.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    fn buffer(&self, name: &str) -> Result<Tensor> {
        self.windows
            .get(name)
            .map(|record| record.buffer.clone())
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))
    }

    fn is_locked(&self, name: &str) -> Result<bool> {
        self.windows
            .get(name)
            .map(|record| record.locked)
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))
    }

    fn is_synced(&self, name: &str) -> Result<bool> {
        self.windows
            .get(name)
            .map(|record| record.synced)
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))
    }

    fn update(&self, name: &str, f: impl FnOnce(&mut WindowRecord)) -> Result<()> {
        let mut record = self
            .windows
            .get_mut(name)
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))?;
        f(&mut record);
        Ok(())
    }
}

impl Communicator {
    /// Collectively create window `name` exposing `tensor`. Blocks until
    /// every rank has created its replica.
    pub fn win_create(&self, tensor: &Tensor, name: &str) -> Result<()> {
        self.ensure_active()?;
        check_tensor(OpKind::WinCreate, tensor)?;
        if self.windows.contains(name) {
            return Err(CommError::WindowExists(name.to_string()));
        }

        let in_neighbors = self.in_neighbor_ranks();
        if let Err(e) = self.transport.win_create(name, tensor, &in_neighbors) {
            // Leave no half-created replica behind
            let _ = self.transport.win_free(name);
            return Err(e);
        }
        self.windows.insert(name, tensor.clone());
        info!(
            "Rank {} created window {} ({} receive slots)",
            self.rank(),
            name,
            in_neighbors.len()
        );
        Ok(())
    }

    /// Free window `name`, or every window when `None`
    pub fn win_free(&self, name: Option<&str>) -> Result<()> {
        self.ensure_active()?;
        let names = match name {
            Some(name) => {
                if !self.windows.contains(name) {
                    return Err(CommError::WindowNotFound(name.to_string()));
                }
                vec![name.to_string()]
            }
            None => self.windows.names(),
        };

        for name in names {
            // Drop the local record only once the provider released its replica
            self.transport.win_free(&name)?;
            self.windows.remove(&name);
            debug!("Rank {} freed window {}", self.rank(), name);
        }
        Ok(())
    }

    /// Combine the received neighbor contributions (and optionally self)
    /// with `weights`, then rescale receive slots by `update_weights`.
    ///
    /// Without `weights`, the topology weights are used on a weighted
    /// topology and a uniform mean over self and in-neighbors otherwise.
    /// The result is written into the window buffer, or returned as a new
    /// tensor when `clone` is set.
    pub fn win_sync(
        &self,
        name: &str,
        weights: Option<WeightMap>,
        update_weights: Option<WeightMap>,
        clone: bool,
    ) -> Result<Tensor> {
        self.ensure_active()?;
        let buffer = self.windows.buffer(name)?;
        let state = self.topology_state();
        let rank = self.rank();
        let in_neighbors = state.topology.in_neighbors(rank);

        let weights = match weights {
            Some(weights) => {
                let mut allowed = in_neighbors.clone();
                allowed.push(rank);
                check_subset("weights", &weights, &allowed)?;
                weights
            }
            None => default_sync_weights(&state.topology, rank, state.weighted),
        };
        let update_weights = match update_weights {
            Some(update) => {
                check_subset("update_weights", &update, &in_neighbors)?;
                update
            }
            None => WeightMap::new(),
        };

        let combined = self
            .transport
            .win_sync(name, &weights, &update_weights)
            .map_err(|e| match e {
                CommError::WindowSync { .. } => e,
                other => CommError::WindowSync {
                    name: name.to_string(),
                    reason: other.to_string(),
                },
            })?;

        let result = if clone {
            Tensor::from_storage(combined, buffer.shape())?
        } else {
            buffer.assign(combined)?;
            buffer
        };
        self.windows.update(name, |record| record.synced = true)?;
        Ok(result)
    }

    /// Sum self with every in-neighbor's received contribution, then drain
    /// those contributions
    pub fn win_sync_then_collect(&self, name: &str) -> Result<Tensor> {
        let (weights, update_weights) = collect_weights(self.rank(), &self.in_neighbor_ranks());
        self.win_sync(name, Some(weights), Some(update_weights), false)
    }

    fn check_window_buffer(&self, op: OpKind, tensor: &Tensor, name: &str) -> Result<()> {
        check_tensor(op, tensor)?;
        let buffer = self.windows.buffer(name)?;
        if tensor.dtype() != buffer.dtype() {
            return Err(weft_core::Error::dtype_mismatch(buffer.dtype(), tensor.dtype()).into());
        }
        if tensor.numel() != buffer.numel() {
            return Err(weft_core::Error::shape_mismatch(&buffer.shape(), &tensor.shape()).into());
        }
        Ok(())
    }

    fn dispatch_window(&self, request: Request) -> Result<Handle> {
        let op = request.kind();
        let name = request.name().to_string();
        let handle = self.transport.dispatch(request)?;
        self.registry.register_window(handle, name, op);
        Ok(handle)
    }

    /// Start replacing each destination's receive slot for this rank with
    /// `tensor * weight`. Destinations default to every out-neighbor at 1.0.
    pub fn win_put(&self, tensor: &Tensor, name: &str, dst_weights: Option<WeightMap>) -> Result<Handle> {
        self.ensure_active()?;
        self.check_window_buffer(OpKind::WinPut, tensor, name)?;
        let weights = resolve_dst_weights(dst_weights, &self.out_neighbor_ranks())?;
        self.dispatch_window(Request::WinPut {
            window: name.to_string(),
            input: tensor.clone(),
            weights,
        })
    }

    /// [`win_put`](Self::win_put) and wait for it
    pub fn win_put_blocking(&self, tensor: &Tensor, name: &str, dst_weights: Option<WeightMap>) -> Result<bool> {
        let handle = self.win_put(tensor, name, dst_weights)?;
        self.win_wait(handle)
    }

    /// Start adding `tensor * weight` into each destination's receive slot
    /// for this rank. Destinations default to every out-neighbor at 1.0.
    pub fn win_accumulate(
        &self,
        tensor: &Tensor,
        name: &str,
        dst_weights: Option<WeightMap>,
    ) -> Result<Handle> {
        self.ensure_active()?;
        self.check_window_buffer(OpKind::WinAccumulate, tensor, name)?;
        let weights = resolve_dst_weights(dst_weights, &self.out_neighbor_ranks())?;
        self.dispatch_window(Request::WinAccumulate {
            window: name.to_string(),
            input: tensor.clone(),
            weights,
        })
    }

    /// [`win_accumulate`](Self::win_accumulate) and wait for it
    pub fn win_accumulate_blocking(
        &self,
        tensor: &Tensor,
        name: &str,
        dst_weights: Option<WeightMap>,
    ) -> Result<bool> {
        let handle = self.win_accumulate(tensor, name, dst_weights)?;
        self.win_wait(handle)
    }

    /// Start pulling each source's exposed buffer times weight into this
    /// rank's receive slot for that source. Sources default to every
    /// in-neighbor at 1.0. Results become visible through `win_sync`.
    pub fn win_get(&self, name: &str, src_weights: Option<WeightMap>) -> Result<Handle> {
        self.ensure_active()?;
        if !self.windows.contains(name) {
            return Err(CommError::WindowNotFound(name.to_string()));
        }
        let weights = resolve_src_weights(src_weights, &self.in_neighbor_ranks())?;
        self.dispatch_window(Request::WinGet {
            window: name.to_string(),
            weights,
        })
    }

    /// [`win_get`](Self::win_get) and wait for it
    pub fn win_get_blocking(&self, name: &str, src_weights: Option<WeightMap>) -> Result<bool> {
        let handle = self.win_get(name, src_weights)?;
        self.win_wait(handle)
    }

    /// Non-blocking completion check for a window handle
    pub fn win_poll(&self, handle: Handle) -> Result<bool> {
        if !self.registry.is_window(handle) {
            return Err(CommError::HandleNotFound(handle));
        }
        Ok(self.transport.poll(handle))
    }

    /// Wait for a window operation. Unknown or consumed handles log a
    /// warning and return `false`.
    pub fn win_wait(&self, handle: Handle) -> Result<bool> {
        let Some(name) = self.registry.take_window(handle) else {
            warn!("Rank {} win_wait on unknown handle {}", self.rank(), handle);
            return Ok(false);
        };
        self.transport.wait(handle)?;
        debug!("Rank {} completed {} on window {}", self.rank(), handle, name);
        Ok(true)
    }

    /// Collective barrier scoped to window `name`. Refused while this rank
    /// has outstanding one-sided operations on the window or holds its lock.
    pub fn win_fence(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        if self.windows.is_locked(name)? {
            return Err(CommError::FenceConflict {
                name: name.to_string(),
                reason: "window is locked by this rank".into(),
            });
        }
        let pending = self.registry.pending_on_window(name);
        if !pending.is_empty() {
            return Err(CommError::FenceConflict {
                name: name.to_string(),
                reason: format!("{} one-sided operations are outstanding", pending.len()),
            });
        }
        self.transport.win_fence(name)
    }

    /// Take this rank's window lock, excluding remote access until
    /// [`win_unlock`](Self::win_unlock)
    pub fn win_lock(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        if self.windows.is_locked(name)? {
            return Err(CommError::Lock {
                name: name.to_string(),
                reason: "already locked by this rank".into(),
            });
        }
        self.transport.win_lock(name)?;
        self.windows.update(name, |record| record.locked = true)
    }

    /// Release this rank's window lock
    pub fn win_unlock(&self, name: &str) -> Result<()> {
        self.ensure_active()?;
        if !self.windows.is_locked(name)? {
            return Err(CommError::Lock {
                name: name.to_string(),
                reason: "not locked by this rank".into(),
            });
        }
        self.transport.win_unlock(name)?;
        self.windows.update(name, |record| record.locked = false)
    }

    /// Current state of window `name` on this rank
    pub fn win_state(&self, name: &str) -> Result<WindowState> {
        let synced = self.windows.is_synced(name)?;
        if let Some((_, op)) = self.registry.pending_on_window(name).last() {
            return Ok(WindowState::Pending(*op));
        }
        Ok(if synced {
            WindowState::Synced
        } else {
            WindowState::Created
        })
    }

    /// Names of the windows registered on this rank
    pub fn window_names(&self) -> Vec<String> {
        self.windows.names()
    }
}
