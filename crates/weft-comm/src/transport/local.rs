//! In-process provider: N ranks inside one process
//!
//! [`LocalFabric`] owns a tokio runtime shared by all of its ranks. Each
//! rank talks to the fabric through its own [`LocalTransport`]; a rank is
//! usually driven by one OS thread. Dispatched operations run as runtime
//! tasks and meet their peers in a [`Rendezvous`] keyed by operation name.

use super::rendezvous::{Contribution, Payload, Rendezvous};
use super::replica::Replica;
use super::{Reduction, Request, Transport};
use crate::config::CommConfig;
use crate::context::Communicator;
use crate::handle::{Handle, HandleAllocator};
use crate::ops::OpKind;
use crate::weights::WeightMap;
use crate::{CommError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::{Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error};
use weft_core::{Storage, Tensor};

/// Count of dispatched, unfinished operations of one rank
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

/// Decrements the owning rank's in-flight count when the task ends
struct InFlightGuard {
    shared: Arc<FabricShared>,
    rank: usize,
}

impl InFlightGuard {
    fn enter(shared: &Arc<FabricShared>, rank: usize) -> Self {
        shared.inflight[rank].count.fetch_add(1, Ordering::SeqCst);
        Self {
            shared: Arc::clone(shared),
            rank,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let inflight = &self.shared.inflight[self.rank];
        if inflight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            inflight.drained.notify_waiters();
        }
    }
}

/// State shared by every rank of a fabric
struct FabricShared {
    size: usize,
    local_size: usize,
    rendezvous: Rendezvous,
    windows: DashMap<(String, usize), Arc<Replica>>,
    inflight: Vec<InFlight>,
}

impl FabricShared {
    fn replica(&self, name: &str, rank: usize) -> Result<Arc<Replica>> {
        self.windows
            .get(&(name.to_string(), rank))
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))
    }
}

/// Group of in-process ranks sharing one runtime
pub struct LocalFabric {
    shared: Arc<FabricShared>,
    runtime: Arc<Runtime>,
}

impl LocalFabric {
    /// Create a fabric of `size` ranks
    pub fn new(size: usize, config: &CommConfig) -> Result<Self> {
        if size == 0 {
            return Err(CommError::Configuration("world size must be positive".into()));
        }
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads)
            .thread_name("weft-fabric")
            .enable_all()
            .build()?;

        let shared = FabricShared {
            size,
            local_size: config.local_size_for(size),
            rendezvous: Rendezvous::new(size, config.stall_warning),
            windows: DashMap::new(),
            inflight: (0..size).map(|_| InFlight::default()).collect(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            runtime: Arc::new(runtime),
        })
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Provider for `rank`
    pub fn transport(&self, rank: usize) -> Result<LocalTransport> {
        if rank >= self.shared.size {
            return Err(CommError::InvalidRank {
                rank,
                size: self.shared.size,
            });
        }
        Ok(LocalTransport {
            rank,
            shared: Arc::clone(&self.shared),
            runtime: Arc::clone(&self.runtime),
            handles: HandleAllocator::new(),
            tasks: DashMap::new(),
            locks: DashMap::new(),
            barrier_epoch: AtomicU64::new(0),
            fence_epochs: DashMap::new(),
        })
    }

    /// One communicator per rank, in rank order
    pub fn communicators(&self, config: &CommConfig) -> Result<Vec<Communicator>> {
        (0..self.shared.size)
            .map(|rank| {
                let transport: Arc<dyn Transport> = Arc::new(self.transport(rank)?);
                Communicator::init(transport, config.clone())
            })
            .collect()
    }

    /// Build a fabric and return its communicators
    pub fn group(size: usize, config: CommConfig) -> Result<Vec<Communicator>> {
        Self::new(size, &config)?.communicators(&config)
    }
}

/// One rank's connection to a [`LocalFabric`]
pub struct LocalTransport {
    rank: usize,
    shared: Arc<FabricShared>,
    runtime: Arc<Runtime>,
    handles: HandleAllocator,
    tasks: DashMap<Handle, JoinHandle<Result<()>>>,
    locks: DashMap<String, OwnedMutexGuard<()>>,
    barrier_epoch: AtomicU64,
    fence_epochs: DashMap<String, u64>,
}

impl LocalTransport {
    fn block_on_exchange(
        &self,
        name: String,
        kind: OpKind,
        payload: Option<Payload>,
    ) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let rank = self.rank;
        self.runtime.block_on(async move {
            shared
                .rendezvous
                .exchange(&name, rank, Contribution::new(kind, payload))
                .await
                .map(|_| ())
        })
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn local_rank(&self) -> usize {
        self.rank % self.shared.local_size
    }

    fn local_size(&self) -> usize {
        self.shared.local_size
    }

    fn dispatch(&self, request: Request) -> Result<Handle> {
        let handle = self.handles.next();
        debug!(
            "Rank {} dispatching {} ({}) as {}",
            self.rank,
            request.kind(),
            request.name(),
            handle
        );

        let guard = InFlightGuard::enter(&self.shared, self.rank);
        let shared = Arc::clone(&self.shared);
        let rank = self.rank;
        let task = self.runtime.spawn(async move {
            let _guard = guard;
            execute(&shared, rank, request).await
        });
        self.tasks.insert(handle, task);
        Ok(handle)
    }

    fn poll(&self, handle: Handle) -> bool {
        self.tasks
            .get(&handle)
            .is_some_and(|task| task.is_finished())
    }

    fn wait(&self, handle: Handle) -> Result<()> {
        let (_, task) = self
            .tasks
            .remove(&handle)
            .ok_or(CommError::HandleNotFound(handle))?;
        match self.runtime.block_on(task) {
            Ok(result) => result,
            Err(e) => {
                error!("Rank {} lost task {}: {}", self.rank, handle, e);
                Err(CommError::Transport(e.to_string()))
            }
        }
    }

    fn barrier(&self) -> Result<()> {
        let inflight = &self.shared.inflight[self.rank];
        self.runtime.block_on(async {
            loop {
                let drained = inflight.drained.notified();
                tokio::pin!(drained);
                drained.as_mut().enable();
                if inflight.count.load(Ordering::SeqCst) == 0 {
                    break;
                }
                drained.await;
            }
        });

        let epoch = self.barrier_epoch.fetch_add(1, Ordering::SeqCst);
        self.block_on_exchange(format!("barrier.{}", epoch), OpKind::Barrier, None)
    }

    fn win_create(&self, name: &str, buffer: &Tensor, in_neighbors: &[usize]) -> Result<()> {
        let key = (name.to_string(), self.rank);
        if self.shared.windows.contains_key(&key) {
            return Err(CommError::WindowExists(name.to_string()));
        }
        self.shared
            .windows
            .insert(key, Arc::new(Replica::new(buffer, in_neighbors)));

        let payload = Payload {
            shape: buffer.shape(),
            data: Storage::zeros(buffer.dtype(), 0),
        };
        self.block_on_exchange(
            OpKind::WinCreate.op_name(Some(name), 0),
            OpKind::WinCreate,
            Some(payload),
        )
    }

    fn win_free(&self, name: &str) -> Result<()> {
        self.locks.remove(name);
        self.fence_epochs.remove(name);
        self.shared
            .windows
            .remove(&(name.to_string(), self.rank))
            .map(|_| ())
            .ok_or_else(|| CommError::WindowNotFound(name.to_string()))
    }

    fn win_sync(
        &self,
        name: &str,
        weights: &WeightMap,
        update_weights: &WeightMap,
    ) -> Result<Storage> {
        let replica = self.shared.replica(name, self.rank)?;
        replica.combine(name, self.rank, weights, update_weights)
    }

    fn win_fence(&self, name: &str) -> Result<()> {
        self.shared.replica(name, self.rank)?;
        let epoch = {
            let mut entry = self.fence_epochs.entry(name.to_string()).or_insert(0);
            let epoch = *entry;
            *entry += 1;
            epoch
        };
        self.block_on_exchange(
            format!("{}.{}", OpKind::WinFence.op_name(Some(name), 0), epoch),
            OpKind::WinFence,
            None,
        )
    }

    fn win_lock(&self, name: &str) -> Result<()> {
        let replica = self.shared.replica(name, self.rank)?;
        let guard = self
            .runtime
            .block_on(Arc::clone(&replica.access).lock_owned());
        self.locks.insert(name.to_string(), guard);
        Ok(())
    }

    fn win_unlock(&self, name: &str) -> Result<()> {
        self.locks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CommError::Lock {
                name: name.to_string(),
                reason: "not locked by this rank".into(),
            })
    }

    fn shutdown(&self) -> Result<()> {
        self.locks.clear();
        self.tasks.clear();
        self.shared.windows.retain(|(_, rank), _| *rank != self.rank);
        Ok(())
    }
}

async fn execute(shared: &FabricShared, rank: usize, request: Request) -> Result<()> {
    let kind = request.kind();
    let result = match request {
        Request::Allreduce {
            name,
            input,
            output,
            average,
        } => {
            let all = exchange(shared, &name, rank, kind, &input).await?;
            let first = all[0].payload(&name)?;
            let mut sum = first.data.clone();
            for other in &all[1..] {
                let other = other.payload(&name)?;
                check_same_shape(&name, &first.shape, &other.shape)?;
                sum.add_assign(&other.data)?;
            }
            if average {
                sum.scale(1.0 / shared.size as f64);
            }
            output.replace(first.shape.clone(), sum)?;
            Ok(())
        }
        Request::Broadcast {
            name,
            input,
            output,
            root,
        } => {
            let all = exchange(shared, &name, rank, kind, &input).await?;
            let root = all
                .get(root)
                .ok_or(CommError::InvalidRank {
                    rank: root,
                    size: shared.size,
                })?
                .payload(&name)?;
            output.replace(root.shape.clone(), root.data.clone())?;
            Ok(())
        }
        Request::Allgather {
            name,
            input,
            output,
        } => {
            let all = exchange(shared, &name, rank, kind, &input).await?;
            let parts = all
                .iter()
                .map(|c| c.payload(&name))
                .collect::<Result<Vec<_>>>()?;
            gather_into(&name, &output, &input, &parts)
        }
        Request::NeighborAllgather {
            name,
            input,
            output,
            sources,
        } => {
            let all = exchange(shared, &name, rank, kind, &input).await?;
            let parts = sources
                .iter()
                .map(|&src| all[src].payload(&name))
                .collect::<Result<Vec<_>>>()?;
            gather_into(&name, &output, &input, &parts)
        }
        Request::NeighborAllreduce {
            name,
            input,
            output,
            sources,
            reduction,
        } => {
            let all = exchange(shared, &name, rank, kind, &input).await?;
            let own = all[rank].payload(&name)?;
            let mut result = match &reduction {
                Reduction::Weighted { self_weight, .. } => own.data.scaled(*self_weight),
                Reduction::Sum | Reduction::Mean => own.data.clone(),
            };
            for (i, &src) in sources.iter().enumerate() {
                let other = all[src].payload(&name)?;
                check_same_shape(&name, &own.shape, &other.shape)?;
                match &reduction {
                    Reduction::Weighted { source_weights, .. } => {
                        let weight = source_weights.get(i).copied().unwrap_or(0.0);
                        result.axpy(weight, &other.data)?;
                    }
                    Reduction::Sum | Reduction::Mean => result.add_assign(&other.data)?,
                }
            }
            if reduction == Reduction::Mean {
                result.scale(1.0 / (sources.len() + 1) as f64);
            }
            output.replace(own.shape.clone(), result)?;
            Ok(())
        }
        Request::WinPut {
            window,
            input,
            weights,
        } => {
            let data = input.snapshot();
            for (&dst, &weight) in &weights {
                let target = shared.replica(&window, dst)?;
                let _access = target.access.lock().await;
                target.store(rank, data.scaled(weight));
            }
            Ok(())
        }
        Request::WinAccumulate {
            window,
            input,
            weights,
        } => {
            let data = input.snapshot();
            for (&dst, &weight) in &weights {
                let target = shared.replica(&window, dst)?;
                let _access = target.access.lock().await;
                target.accumulate(rank, &data.scaled(weight))?;
            }
            Ok(())
        }
        Request::WinGet { window, weights } => {
            let local = shared.replica(&window, rank)?;
            for (&src, &weight) in &weights {
                let source = shared.replica(&window, src)?;
                let _access = source.access.lock().await;
                local.store(src, source.exposed.snapshot().scaled(weight));
            }
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Rank {} {} failed ({}): {}", rank, kind, e.category(), e);
    }
    result
}

async fn exchange(
    shared: &FabricShared,
    name: &str,
    rank: usize,
    kind: OpKind,
    input: &Tensor,
) -> Result<Vec<Arc<Contribution>>> {
    let payload = Payload {
        shape: input.shape(),
        data: input.snapshot(),
    };
    shared
        .rendezvous
        .exchange(name, rank, Contribution::new(kind, Some(payload)))
        .await
}

fn check_same_shape(name: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(CommError::Mismatch {
            name: name.to_string(),
            reason: format!("shape {:?} does not match {:?}", actual, expected),
        });
    }
    Ok(())
}

/// Concatenate `parts` along axis 0 into `output`; scalars count as one row
fn gather_into(name: &str, output: &Tensor, input: &Tensor, parts: &[&Payload]) -> Result<()> {
    let own_shape = input.shape();
    let trailing: &[usize] = if own_shape.is_empty() { &[] } else { &own_shape[1..] };

    let mut rows = 0;
    for part in parts {
        let (part_rows, part_trailing) = match part.shape.split_first() {
            Some((first, rest)) => (*first, rest),
            None => (1, &[][..]),
        };
        if part_trailing != trailing {
            return Err(CommError::Mismatch {
                name: name.to_string(),
                reason: format!(
                    "trailing dimensions {:?} do not match {:?}",
                    part_trailing, trailing
                ),
            });
        }
        rows += part_rows;
    }

    let data: Vec<&Storage> = parts.iter().map(|p| &p.data).collect();
    let storage = Storage::concat(input.dtype(), &data)?;
    let mut shape = Vec::with_capacity(trailing.len() + 1);
    shape.push(rows);
    shape.extend_from_slice(trailing);
    output.replace(shape, storage)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::uniform;

    fn fabric(size: usize) -> LocalFabric {
        LocalFabric::new(size, &CommConfig::default().with_worker_threads(2)).unwrap()
    }

    #[test]
    fn test_transport_identity() {
        let config = CommConfig::default().with_local_size(2);
        let fabric = LocalFabric::new(4, &config).unwrap();
        let t = fabric.transport(3).unwrap();
        assert_eq!(t.rank(), 3);
        assert_eq!(t.size(), 4);
        assert_eq!(t.local_rank(), 1);
        assert_eq!(t.local_size(), 2);
        assert!(fabric.transport(4).is_err());
    }

    #[test]
    fn test_single_rank_allreduce() {
        let fabric = fabric(1);
        let t = fabric.transport(0).unwrap();
        let input = Tensor::from_vec(vec![1i32, 2], [2]).unwrap();
        let output = input.zeros_like();
        let handle = t
            .dispatch(Request::Allreduce {
                name: "allreduce.x".into(),
                input: input.clone(),
                output: output.clone(),
                average: false,
            })
            .unwrap();
        t.wait(handle).unwrap();
        assert_eq!(output.to_vec::<i32>().unwrap(), vec![1, 2]);
        assert!(matches!(t.wait(handle), Err(CommError::HandleNotFound(_))));
    }

    #[test]
    fn test_window_put_then_sync() {
        let fabric = fabric(2);
        let t0 = fabric.transport(0).unwrap();
        let t1 = fabric.transport(1).unwrap();
        let b0 = Tensor::from_vec(vec![1.0f64], [1]).unwrap();
        let b1 = Tensor::from_vec(vec![10.0f64], [1]).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| t0.win_create("w", &b0, &[1]).unwrap());
            s.spawn(|| t1.win_create("w", &b1, &[0]).unwrap());
        });

        let handle = t0
            .dispatch(Request::WinPut {
                window: "w".into(),
                input: b0.clone(),
                weights: uniform(&[1], 0.5),
            })
            .unwrap();
        t0.wait(handle).unwrap();

        let weights: WeightMap = [(0, 1.0), (1, 1.0)].into_iter().collect();
        let out = t1.win_sync("w", &weights, &WeightMap::new()).unwrap();
        assert_eq!(out, Storage::F64(vec![10.5]));

        assert!(matches!(
            t1.win_create("w", &b1, &[0]),
            Err(CommError::WindowExists(_))
        ));
        t0.win_free("w").unwrap();
        assert!(matches!(t0.win_free("w"), Err(CommError::WindowNotFound(_))));
    }

    #[test]
    fn test_unlock_without_lock() {
        let fabric = fabric(1);
        let t = fabric.transport(0).unwrap();
        let buffer = Tensor::from_vec(vec![0.0f32], [1]).unwrap();
        t.win_create("w", &buffer, &[]).unwrap();
        assert!(matches!(t.win_unlock("w"), Err(CommError::Lock { .. })));
        t.win_lock("w").unwrap();
        t.win_unlock("w").unwrap();
    }
}
