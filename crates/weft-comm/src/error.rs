//! Error types for communication operations

use crate::handle::Handle;
use crate::ops::OpKind;
use thiserror::Error;
use weft_core::DataType;

/// Communication errors
#[derive(Debug, Error)]
pub enum CommError {
    /// Buffer-level failure
    #[error(transparent)]
    Buffer(#[from] weft_core::Error),

    /// No provider entry point for this (operation, dtype) pair
    #[error("Tensor type {dtype} is not supported for {op}")]
    UnsupportedDtype { op: OpKind, dtype: DataType },

    /// Input buffer is not contiguous
    #[error("Tensor is required to be contiguous for {op}")]
    NonContiguous { op: OpKind },

    /// Averaging requested on a non floating-point buffer
    #[error("If average is set in {op}, only float or double tensor is allowed (got {dtype})")]
    AverageRequiresFloat { op: OpKind, dtype: DataType },

    /// Weight map names a rank outside the legal set
    #[error("The key {rank} of {argument} should only contain ranks in {allowed:?}")]
    InvalidWeights {
        argument: &'static str,
        rank: usize,
        allowed: Vec<usize>,
    },

    /// Rank outside the world
    #[error("Rank {rank} is out of range for world size {size}")]
    InvalidRank { rank: usize, size: usize },

    /// Topology does not fit the world
    #[error("Topology error: {0}")]
    Topology(String),

    /// Topology change refused while state depends on the current one
    #[error("Cannot set the topology: {0}")]
    TopologyBusy(String),

    /// No window registered under this name
    #[error("Window not found: {0}")]
    WindowNotFound(String),

    /// A window with this name already exists
    #[error("Window already exists: {0}")]
    WindowExists(String),

    /// Local window synchronization failed
    #[error("Cannot apply win_sync on {name}: {reason}")]
    WindowSync { name: String, reason: String },

    /// Fence mixed with lock-bracketed access
    #[error("Cannot fence window {name}: {reason}")]
    FenceConflict { name: String, reason: String },

    /// Explicit lock misuse
    #[error("Lock error on window {name}: {reason}")]
    Lock { name: String, reason: String },

    /// Ranks disagree on an operation sharing one name
    #[error("Mismatched participation in {name}: {reason}")]
    Mismatch { name: String, reason: String },

    /// An unconsumed collective already uses this name
    #[error("A collective named {0} is still in flight; synchronize it before reusing the name")]
    DuplicateName(String),

    /// Handle was never issued or has already been consumed
    #[error("Handle not found: {0}")]
    HandleNotFound(Handle),

    /// Provider failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Communicator has been shut down
    #[error("Communicator has been shut down")]
    ShutDown,

    /// Configuration could not be parsed or is inconsistent
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommError {
    /// Whether the error was raised before dispatch and can be fixed by
    /// correcting the call's arguments
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            CommError::Buffer(_)
                | CommError::UnsupportedDtype { .. }
                | CommError::NonContiguous { .. }
                | CommError::AverageRequiresFloat { .. }
                | CommError::InvalidWeights { .. }
                | CommError::InvalidRank { .. }
                | CommError::Topology(_)
                | CommError::TopologyBusy(_)
                | CommError::WindowNotFound(_)
                | CommError::WindowExists(_)
                | CommError::FenceConflict { .. }
                | CommError::Lock { .. }
                | CommError::DuplicateName(_)
                | CommError::Configuration(_)
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CommError::Buffer(e) => e.category(),
            CommError::UnsupportedDtype { .. } => "unsupported_dtype",
            CommError::NonContiguous { .. } => "non_contiguous",
            CommError::AverageRequiresFloat { .. } => "average_requires_float",
            CommError::InvalidWeights { .. } => "invalid_weights",
            CommError::InvalidRank { .. } => "invalid_rank",
            CommError::Topology(_) => "topology",
            CommError::TopologyBusy(_) => "topology_busy",
            CommError::WindowNotFound(_) => "window_not_found",
            CommError::WindowExists(_) => "window_exists",
            CommError::WindowSync { .. } => "window_sync",
            CommError::FenceConflict { .. } => "fence_conflict",
            CommError::Lock { .. } => "lock",
            CommError::Mismatch { .. } => "mismatch",
            CommError::DuplicateName(_) => "duplicate_name",
            CommError::HandleNotFound(_) => "handle_not_found",
            CommError::Transport(_) => "transport",
            CommError::ShutDown => "shut_down",
            CommError::Configuration(_) => "configuration",
            CommError::Io(_) => "io",
        }
    }
}

/// Result type for communication operations
pub type Result<T> = std::result::Result<T, CommError>;
