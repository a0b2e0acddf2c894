//! Operation kinds and the dtype registration table
//!
//! Every (operation, dtype) pair the provider implements is listed here.
//! Resolution happens before dispatch, so an unsupported combination is a
//! recoverable [`CommError::UnsupportedDtype`] instead of a provider fault.

use crate::{CommError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use weft_core::{DataType, Tensor};

/// Kind of communication operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    /// Global reduction
    Allreduce,
    /// Root-to-all replication
    Broadcast,
    /// Global concatenation along axis 0
    Allgather,
    /// Concatenation over in-neighbors
    NeighborAllgather,
    /// Reduction over in-neighbors and self
    NeighborAllreduce,
    /// Process-wide synchronization point
    Barrier,
    /// Collective window creation
    WinCreate,
    /// Local weighted window reduction
    WinSync,
    /// One-sided replace into out-neighbors
    WinPut,
    /// One-sided read from in-neighbors
    WinGet,
    /// One-sided sum into out-neighbors
    WinAccumulate,
    /// Window-scoped collective barrier
    WinFence,
}

const REDUCIBLE: &[DataType] = &[DataType::I32, DataType::I64, DataType::F32, DataType::F64];
const FLOATING: &[DataType] = &[DataType::F32, DataType::F64];
const ANY: &[DataType] = &DataType::ALL;

impl OpKind {
    /// Prefix used to build rendezvous names
    pub fn prefix(self) -> &'static str {
        match self {
            OpKind::Allreduce => "allreduce",
            OpKind::Broadcast => "broadcast",
            OpKind::Allgather => "allgather",
            OpKind::NeighborAllgather => "neighbor.allgather",
            OpKind::NeighborAllreduce => "neighbor.allreduce",
            OpKind::Barrier => "barrier",
            OpKind::WinCreate => "win.create",
            OpKind::WinSync => "win.sync",
            OpKind::WinPut => "win.put",
            OpKind::WinGet => "win.get",
            OpKind::WinAccumulate => "win.accumulate",
            OpKind::WinFence => "win.fence",
        }
    }

    /// Element types with a registered entry point, if the operation
    /// carries a buffer at all
    pub fn supported_dtypes(self) -> Option<&'static [DataType]> {
        match self {
            OpKind::Allreduce | OpKind::NeighborAllreduce => Some(REDUCIBLE),
            OpKind::Broadcast | OpKind::Allgather | OpKind::NeighborAllgather => Some(ANY),
            OpKind::WinCreate | OpKind::WinSync | OpKind::WinPut | OpKind::WinAccumulate => {
                Some(FLOATING)
            }
            OpKind::Barrier | OpKind::WinGet | OpKind::WinFence => None,
        }
    }

    /// Whether `dtype` has a registered entry point for this operation
    pub fn supports(self, dtype: DataType) -> bool {
        self.supported_dtypes()
            .is_some_and(|dtypes| dtypes.contains(&dtype))
    }

    /// Rendezvous name for a named or auto-numbered operation
    pub fn op_name(self, name: Option<&str>, sequence: u64) -> String {
        match name {
            Some(name) if !name.is_empty() => format!("{}.{}", self.prefix(), name),
            _ => format!("{}.noname.{}", self.prefix(), sequence),
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Resolve the entry point for `tensor` and check the buffer contract
pub fn check_tensor(op: OpKind, tensor: &Tensor) -> Result<()> {
    let dtype = tensor.dtype();
    if !op.supports(dtype) {
        return Err(CommError::UnsupportedDtype { op, dtype });
    }
    if !tensor.is_contiguous() {
        return Err(CommError::NonContiguous { op });
    }
    Ok(())
}

/// Reject `average` on integer buffers
pub fn check_average(op: OpKind, tensor: &Tensor, average: bool) -> Result<()> {
    let dtype = tensor.dtype();
    if average && !dtype.is_floating_point() {
        return Err(CommError::AverageRequiresFloat { op, dtype });
    }
    Ok(())
}
