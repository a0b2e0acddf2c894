//! Named all-to-all exchange between in-process ranks
//!
//! Every rank deposits one contribution under an operation name and waits
//! until all ranks have deposited. Each rank then receives every
//! contribution and picks what it needs. A slot is dropped once all ranks
//! have collected from it, so a name may be reused by the next operation.

use crate::ops::OpKind;
use crate::{CommError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;
use weft_core::Storage;

/// Shape and data a rank brings to an exchange
#[derive(Debug, Clone)]
pub(crate) struct Payload {
    pub shape: Vec<usize>,
    pub data: Storage,
}

/// One rank's deposit
#[derive(Debug)]
pub(crate) struct Contribution {
    pub kind: OpKind,
    pub payload: Option<Payload>,
}

impl Contribution {
    pub fn new(kind: OpKind, payload: Option<Payload>) -> Self {
        Self { kind, payload }
    }

    /// Payload, or a transport error naming the operation
    pub fn payload(&self, name: &str) -> Result<&Payload> {
        self.payload.as_ref().ok_or_else(|| CommError::Mismatch {
            name: name.to_string(),
            reason: format!("{} contribution carries no buffer", self.kind),
        })
    }
}

struct Slot {
    contributions: Vec<Option<Arc<Contribution>>>,
    arrived: usize,
    departed: usize,
}

impl Slot {
    fn new(size: usize) -> Self {
        Self {
            contributions: vec![None; size],
            arrived: 0,
            departed: 0,
        }
    }
}

/// Exchange table shared by every rank of a fabric
pub(crate) struct Rendezvous {
    size: usize,
    slots: Mutex<HashMap<String, Slot>>,
    notify: Notify,
    stall_warning: Duration,
}

impl Rendezvous {
    pub fn new(size: usize, stall_warning: Duration) -> Self {
        Self {
            size,
            slots: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            stall_warning,
        }
    }

    /// Deposit `contribution` for `rank` under `name` and return every
    /// rank's contribution, indexed by rank
    pub async fn exchange(
        &self,
        name: &str,
        rank: usize,
        contribution: Contribution,
    ) -> Result<Vec<Arc<Contribution>>> {
        let contribution = Arc::new(contribution);
        let size = self.size;

        // A slot still draining from the previous use of this name blocks
        // the deposit until every rank has collected from it.
        self.wait_until(name, rank, |slots| {
            let slot = slots
                .entry(name.to_string())
                .or_insert_with(|| Slot::new(size));
            if slot.contributions[rank].is_some() {
                return None;
            }
            slot.contributions[rank] = Some(Arc::clone(&contribution));
            slot.arrived += 1;
            Some(())
        })
        .await;
        self.notify.notify_waiters();

        let all = self
            .wait_until(name, rank, |slots| {
                let slot = slots.get_mut(name)?;
                if slot.arrived < size {
                    return None;
                }
                let all: Vec<Arc<Contribution>> =
                    slot.contributions.iter().flatten().cloned().collect();
                slot.departed += 1;
                if slot.departed == size {
                    slots.remove(name);
                }
                Some(all)
            })
            .await;
        self.notify.notify_waiters();

        check_agreement(name, &all)?;
        Ok(all)
    }

    async fn wait_until<T>(
        &self,
        name: &str,
        rank: usize,
        mut ready: impl FnMut(&mut HashMap<String, Slot>) -> Option<T>,
    ) -> T {
        let started = Instant::now();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut slots = self.slots.lock();
                if let Some(value) = ready(&mut slots) {
                    return value;
                }
            }

            if tokio::time::timeout(self.stall_warning, notified.as_mut())
                .await
                .is_err()
            {
                warn!(
                    "Rank {} still waiting on {} after {:?}; are all ranks issuing it?",
                    rank,
                    name,
                    started.elapsed()
                );
            }
        }
    }

    /// Number of names with an open slot
    #[cfg(test)]
    pub fn open_slots(&self) -> usize {
        self.slots.lock().len()
    }
}

/// Operations whose buffers must have one shape on every rank
fn requires_same_shape(kind: OpKind) -> bool {
    matches!(kind, OpKind::Allreduce | OpKind::WinCreate)
}

fn check_agreement(name: &str, all: &[Arc<Contribution>]) -> Result<()> {
    let Some(first) = all.first() else {
        return Ok(());
    };
    for (rank, other) in all.iter().enumerate().skip(1) {
        if other.kind != first.kind {
            return Err(CommError::Mismatch {
                name: name.to_string(),
                reason: format!("rank 0 issued {} but rank {} issued {}", first.kind, rank, other.kind),
            });
        }
        if let (Some(a), Some(b)) = (&first.payload, &other.payload) {
            if a.data.dtype() != b.data.dtype() {
                return Err(CommError::Mismatch {
                    name: name.to_string(),
                    reason: format!(
                        "rank 0 sent {} but rank {} sent {}",
                        a.data.dtype(),
                        rank,
                        b.data.dtype()
                    ),
                });
            }
            if requires_same_shape(first.kind) && a.shape != b.shape {
                return Err(CommError::Mismatch {
                    name: name.to_string(),
                    reason: format!(
                        "rank 0 has shape {:?} but rank {} has shape {:?}",
                        a.shape, rank, b.shape
                    ),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(values: Vec<f32>) -> Option<Payload> {
        let shape = vec![values.len()];
        Some(Payload {
            shape,
            data: Storage::F32(values),
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exchange_all_ranks() {
        let rendezvous = Arc::new(Rendezvous::new(3, Duration::from_secs(5)));
        let mut tasks = Vec::new();
        for rank in 0..3 {
            let rendezvous = Arc::clone(&rendezvous);
            tasks.push(tokio::spawn(async move {
                rendezvous
                    .exchange(
                        "allreduce.x",
                        rank,
                        Contribution::new(OpKind::Allreduce, payload(vec![rank as f32])),
                    )
                    .await
            }));
        }
        for task in tasks {
            let all = task.await.unwrap().unwrap();
            let values: Vec<f32> = all
                .iter()
                .map(|c| c.payload.as_ref().unwrap().data.as_slice::<f32>().unwrap()[0])
                .collect();
            assert_eq!(values, vec![0.0, 1.0, 2.0]);
        }
        assert_eq!(rendezvous.open_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_name_reuse() {
        let rendezvous = Arc::new(Rendezvous::new(2, Duration::from_secs(5)));
        let mut tasks = Vec::new();
        for rank in 0..2 {
            let rendezvous = Arc::clone(&rendezvous);
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    rendezvous
                        .exchange("barrier", rank, Contribution::new(OpKind::Barrier, None))
                        .await?;
                }
                Ok::<_, CommError>(())
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(rendezvous.open_slots(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_kind_mismatch_reported_everywhere() {
        let rendezvous = Arc::new(Rendezvous::new(2, Duration::from_secs(5)));
        let a = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move {
                rendezvous
                    .exchange("op", 0, Contribution::new(OpKind::Allreduce, payload(vec![1.0])))
                    .await
            })
        };
        let b = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move {
                rendezvous
                    .exchange("op", 1, Contribution::new(OpKind::Broadcast, payload(vec![1.0])))
                    .await
            })
        };
        assert!(matches!(a.await.unwrap(), Err(CommError::Mismatch { .. })));
        assert!(matches!(b.await.unwrap(), Err(CommError::Mismatch { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shape_mismatch_only_where_shapes_must_agree() {
        for (kind, expect_mismatch) in [
            (OpKind::WinCreate, true),
            (OpKind::Allreduce, true),
            (OpKind::Allgather, false),
        ] {
            let rendezvous = Arc::new(Rendezvous::new(2, Duration::from_secs(5)));
            let tasks: Vec<_> = (0..2usize)
                .map(|rank| {
                    let rendezvous = Arc::clone(&rendezvous);
                    tokio::spawn(async move {
                        let values = vec![0.0f32; rank + 1];
                        rendezvous
                            .exchange("shaped", rank, Contribution::new(kind, payload(values)))
                            .await
                    })
                })
                .collect();
            for task in tasks {
                let result = task.await.unwrap();
                assert_eq!(
                    matches!(result, Err(CommError::Mismatch { .. })),
                    expect_mismatch,
                    "{kind}"
                );
            }
        }
    }
}
