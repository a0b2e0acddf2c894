//! Per-rank communication context
//!
//! [`Communicator`] owns everything a rank needs between init and shutdown:
//! the provider, the active topology, the table of in-flight handles and the
//! window table. Collective and window operations live in
//! [`collective`](crate::collective) and [`window`](crate::window).

use crate::config::CommConfig;
use crate::handle::Handle;
use crate::registry::OperationRegistry;
use crate::topology::Topology;
use crate::transport::Transport;
use crate::window::WindowTable;
use crate::{CommError, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Active topology and whether its weights are used
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub topology: Arc<Topology>,
    pub weighted: bool,
}

/// One rank's communication context
pub struct Communicator {
    config: CommConfig,
    pub(crate) transport: Arc<dyn Transport>,
    topology: RwLock<TopologyState>,
    pub(crate) registry: OperationRegistry,
    pub(crate) windows: WindowTable,
    sequence: AtomicU64,
    shut_down: AtomicBool,
}

impl Communicator {
    /// Initialize a context on top of `transport`, installing the topology
    /// named by `config`
    pub fn init(transport: Arc<dyn Transport>, config: CommConfig) -> Result<Self> {
        config.validate()?;
        let size = transport.size();
        let topology = config.topology.build(size)?;

        info!(
            "Rank {}/{} initialized with {:?} topology (weighted: {})",
            transport.rank(),
            size,
            config.topology,
            config.weighted
        );

        Ok(Self {
            topology: RwLock::new(TopologyState {
                topology: Arc::new(topology),
                weighted: config.weighted,
            }),
            config,
            transport,
            registry: OperationRegistry::new(),
            windows: WindowTable::new(),
            sequence: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Tear down: free every window, drop outstanding handles and release
    /// provider resources. Later operations fail with [`CommError::ShutDown`].
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for name in self.windows.names() {
            self.windows.remove(&name);
            if let Err(e) = self.transport.win_free(&name) {
                warn!("Rank {} could not free window {}: {}", self.rank(), name, e);
            }
        }

        let dropped = self.registry.clear();
        if dropped > 0 {
            warn!(
                "Rank {} shutting down with {} outstanding handles",
                self.rank(),
                dropped
            );
        }

        self.transport.shutdown()?;
        info!("Rank {} shut down", self.rank());
        Ok(())
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(CommError::ShutDown);
        }
        Ok(())
    }

    /// Configuration this context was initialized with
    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    /// This rank
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.transport.size()
    }

    /// Rank within this host
    pub fn local_rank(&self) -> usize {
        self.transport.local_rank()
    }

    /// Ranks on this host
    pub fn local_size(&self) -> usize {
        self.transport.local_size()
    }

    /// Active topology
    pub fn load_topology(&self) -> Arc<Topology> {
        Arc::clone(&self.topology.read().topology)
    }

    /// Whether the active topology's weights drive weighted averages
    pub fn is_topology_weighted(&self) -> bool {
        self.topology.read().weighted
    }

    pub(crate) fn topology_state(&self) -> TopologyState {
        self.topology.read().clone()
    }

    /// Ranks this rank receives from, ascending
    pub fn in_neighbor_ranks(&self) -> Vec<usize> {
        self.load_topology().in_neighbors(self.rank())
    }

    /// Ranks this rank sends to, ascending
    pub fn out_neighbor_ranks(&self) -> Vec<usize> {
        self.load_topology().out_neighbors(self.rank())
    }

    /// Number of in-neighbors
    pub fn neighbor_size(&self) -> usize {
        self.in_neighbor_ranks().len()
    }

    /// Install a new topology. Refused while any window exists or any
    /// handle is outstanding, since both depend on the current neighbors.
    pub fn set_topology(&self, topology: Topology, is_weighted: bool) -> Result<()> {
        self.ensure_active()?;
        if topology.node_count() != self.size() {
            return Err(CommError::Topology(format!(
                "topology has {} nodes but the world has {} ranks",
                topology.node_count(),
                self.size()
            )));
        }
        if !self.windows.is_empty() {
            return Err(CommError::TopologyBusy(format!(
                "{} windows are still registered",
                self.windows.len()
            )));
        }
        if !self.registry.is_empty() {
            return Err(CommError::TopologyBusy(format!(
                "{} operations are still outstanding",
                self.registry.len()
            )));
        }
        if !topology.is_connected() {
            warn!("Rank {} installing a disconnected topology", self.rank());
        }

        let mut state = self.topology.write();
        if state.topology.is_equivalent(&topology) && state.weighted == is_weighted {
            debug!("Rank {} topology unchanged", self.rank());
            return Ok(());
        }
        *state = TopologyState {
            topology: Arc::new(topology),
            weighted: is_weighted,
        };
        info!(
            "Rank {} installed topology with {} edges (weighted: {})",
            self.rank(),
            state.topology.edge_count(),
            is_weighted
        );
        Ok(())
    }

    /// Next auto-generated operation sequence number
    pub(crate) fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Non-blocking completion check for a collective or window handle;
    /// never consumes the handle
    pub fn poll(&self, handle: Handle) -> Result<bool> {
        if !self.registry.is_collective(handle) && !self.registry.is_window(handle) {
            return Err(CommError::HandleNotFound(handle));
        }
        Ok(self.transport.poll(handle))
    }

    /// Block until every rank has reached this barrier and every operation
    /// dispatched before it has completed
    pub fn barrier(&self) -> Result<()> {
        self.ensure_active()?;
        debug!("Rank {} entering barrier", self.rank());
        self.transport.barrier()
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .field("outstanding", &self.registry.len())
            .field("windows", &self.windows.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
