//! Decentralized collective communication over a weighted topology
//!
//! This crate provides:
//! - Canonical weighted topologies (ring, bidirectional ring, power-of-two
//!   ring, star) and the per-rank incoming weight vector
//! - Handle-based asynchronous collectives: allreduce, broadcast, allgather
//!   and their neighbor-restricted forms
//! - One-sided windows with weighted put, get and accumulate, and local
//!   weighted synchronization of what neighbors sent
//! - An in-process provider that runs every rank of a group in one process
//!
//! ```no_run
//! use weft_comm::{CommConfig, LocalFabric, TopologyKind};
//! use weft_core::Tensor;
//!
//! let config = CommConfig::default().with_topology(TopologyKind::BiRing);
//! let comms = LocalFabric::group(4, config)?;
//! std::thread::scope(|s| {
//!     for comm in &comms {
//!         s.spawn(move || {
//!             let x = Tensor::scalar(comm.rank() as f64);
//!             comm.neighbor_allreduce(&x, true, Some("x"))
//!         });
//!     }
//! });
//! # Ok::<(), weft_comm::CommError>(())
//! ```

pub mod collective;
pub mod config;
pub mod context;
mod error;
pub mod handle;
pub mod ops;
pub mod registry;
pub mod topology;
pub mod transport;
pub mod weights;
pub mod window;

pub use config::CommConfig;
pub use context::Communicator;
pub use error::{CommError, Result};
pub use handle::Handle;
pub use ops::OpKind;
pub use topology::{is_topology_equivalent, Topology, TopologyKind};
pub use transport::{LocalFabric, LocalTransport, Reduction, Request, Transport};
pub use weights::{get_weights, WeightMap};
pub use window::WindowState;

/// Commonly used items
pub mod prelude {
    pub use super::{
        CommConfig, CommError, Communicator, Handle, LocalFabric, Topology, TopologyKind,
        WeightMap, WindowState,
    };
    pub use weft_core::{DataType, Tensor};
}
