//! Per-rank window replicas of the in-process provider

use crate::weights::WeightMap;
use crate::{CommError, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use weft_core::{Storage, Tensor};

/// One rank's view of a window
pub(crate) struct Replica {
    /// The caller's buffer, aliased
    pub exposed: Tensor,
    /// Held for the duration of every remote access to this replica
    pub access: Arc<tokio::sync::Mutex<()>>,
    /// Receive slot per source rank
    recv: Mutex<BTreeMap<usize, Storage>>,
}

impl Replica {
    /// Replica exposing `buffer` with a zeroed slot per in-neighbor
    pub fn new(buffer: &Tensor, in_neighbors: &[usize]) -> Self {
        let dtype = buffer.dtype();
        let len = buffer.numel();
        let recv = in_neighbors
            .iter()
            .map(|&src| (src, Storage::zeros(dtype, len)))
            .collect();
        Self {
            exposed: buffer.clone(),
            access: Arc::new(tokio::sync::Mutex::new(())),
            recv: Mutex::new(recv),
        }
    }

    /// Replace the slot for `src`
    pub fn store(&self, src: usize, data: Storage) {
        self.recv.lock().insert(src, data);
    }

    /// Add into the slot for `src`, creating it if absent
    pub fn accumulate(&self, src: usize, data: &Storage) -> Result<()> {
        let mut recv = self.recv.lock();
        match recv.get_mut(&src) {
            Some(slot) => slot.add_assign(data)?,
            None => {
                recv.insert(src, data.clone());
            }
        }
        Ok(())
    }

    /// Weighted combination of the exposed buffer (key `me`) and the
    /// receive slots, followed by rescaling the slots in `update_weights`
    pub fn combine(
        &self,
        name: &str,
        me: usize,
        weights: &WeightMap,
        update_weights: &WeightMap,
    ) -> Result<Storage> {
        let own = self.exposed.snapshot();
        let mut result = Storage::zeros(own.dtype(), own.len());
        let mut recv = self.recv.lock();

        for (&src, &weight) in weights {
            if src == me {
                result.axpy(weight, &own)?;
                continue;
            }
            let slot = recv.get(&src).ok_or_else(|| CommError::WindowSync {
                name: name.to_string(),
                reason: format!("no receive buffer for rank {}", src),
            })?;
            result.axpy(weight, slot)?;
        }

        for (&src, &weight) in update_weights {
            if let Some(slot) = recv.get_mut(&src) {
                slot.scale(weight);
            }
        }

        Ok(result)
    }

    /// Copy of the slot for `src`
    #[cfg(test)]
    pub fn slot(&self, src: usize) -> Option<Storage> {
        self.recv.lock().get(&src).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::uniform;

    #[test]
    fn test_fresh_replica_combines_to_self() {
        let buffer = Tensor::from_vec(vec![3.0f64, 4.0], [2]).unwrap();
        let replica = Replica::new(&buffer, &[1, 2]);

        let mut weights = uniform(&[1, 2], 1.0);
        weights.insert(0, 1.0);
        let out = replica.combine("w", 0, &weights, &WeightMap::new()).unwrap();
        assert_eq!(out, Storage::F64(vec![3.0, 4.0]));
    }

    #[test]
    fn test_combine_then_drain() {
        let buffer = Tensor::from_vec(vec![1.0f32], [1]).unwrap();
        let replica = Replica::new(&buffer, &[1]);
        replica.store(1, Storage::F32(vec![2.0]));
        replica.accumulate(1, &Storage::F32(vec![1.0])).unwrap();

        let weights: WeightMap = [(0, 0.5), (1, 0.5)].into_iter().collect();
        let drain = uniform(&[1], 0.0);
        let out = replica.combine("w", 0, &weights, &drain).unwrap();
        assert_eq!(out, Storage::F32(vec![2.0]));
        assert_eq!(replica.slot(1), Some(Storage::F32(vec![0.0])));
    }

    #[test]
    fn test_unknown_source_fails() {
        let buffer = Tensor::from_vec(vec![1.0f32], [1]).unwrap();
        let replica = Replica::new(&buffer, &[]);
        let err = replica
            .combine("w", 0, &uniform(&[5], 1.0), &WeightMap::new())
            .unwrap_err();
        assert!(matches!(err, CommError::WindowSync { .. }));
    }
}
