//! Virtual communication topology
//!
//! A topology is a weighted directed graph over ranks `0..size`. An edge
//! `src -> dst` with weight `w` means `dst` receives data from `src` and
//! weighs it by `w`; self-loops carry a rank's own weight. All builders
//! produce row-stochastic adjacency matrices.

use crate::{CommError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Canonical topology families
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TopologyKind {
    /// Offsets that are powers of two (including zero)
    #[default]
    PowerTwoRing,
    /// Every rank connected to one center, both directions
    Star { center_rank: usize },
    /// Unidirectional ring
    Ring { left_connect: bool },
    /// Bidirectional ring
    BiRing,
}

impl TopologyKind {
    /// Build the topology of this kind over `size` ranks
    pub fn build(&self, size: usize) -> Result<Topology> {
        match *self {
            TopologyKind::PowerTwoRing => Topology::power_two_ring(size),
            TopologyKind::Star { center_rank } => Topology::star(size, center_rank),
            TopologyKind::Ring { left_connect } => Topology::ring(size, left_connect),
            TopologyKind::BiRing => Topology::bi_ring(size),
        }
    }
}

/// Weighted directed graph over ranks
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    /// Number of ranks
    size: usize,
    /// Edge weights keyed by (src, dst); row-major iteration order
    edges: BTreeMap<(usize, usize), f64>,
}

impl Topology {
    /// Graph with `size` nodes and no edges
    pub fn new(size: usize) -> Self {
        Self {
            size,
            edges: BTreeMap::new(),
        }
    }

    /// Graph from a dense matrix where `matrix[src][dst]` is the edge
    /// weight; zero entries are not edges
    pub fn from_weight_matrix(matrix: &[Vec<f64>]) -> Result<Self> {
        let size = matrix.len();
        let mut topology = Self::new(size);
        for (src, row) in matrix.iter().enumerate() {
            if row.len() != size {
                return Err(CommError::Topology(format!(
                    "row {} has {} columns, expected {}",
                    src,
                    row.len(),
                    size
                )));
            }
            for (dst, &weight) in row.iter().enumerate() {
                if weight != 0.0 {
                    topology.edges.insert((src, dst), weight);
                }
            }
        }
        Ok(topology)
    }

    /// Every row is `roll(base, row)`
    fn circulant(base: &[f64]) -> Self {
        let size = base.len();
        let matrix: Vec<Vec<f64>> = (0..size)
            .map(|row| (0..size).map(|col| base[(col + size - row) % size]).collect())
            .collect();
        // Square by construction
        Self::from_square(matrix)
    }

    fn from_square(matrix: Vec<Vec<f64>>) -> Self {
        let mut topology = Self::new(matrix.len());
        for (src, row) in matrix.into_iter().enumerate() {
            for (dst, weight) in row.into_iter().enumerate() {
                if weight != 0.0 {
                    topology.edges.insert((src, dst), weight);
                }
            }
        }
        topology
    }

    fn check_size(size: usize) -> Result<()> {
        if size == 0 {
            return Err(CommError::Topology("size must be positive".into()));
        }
        Ok(())
    }

    /// Each rank connects to ranks at power-of-two circular offsets
    /// (offset 0 included), with uniform row-normalized weights
    pub fn power_two_ring(size: usize) -> Result<Self> {
        Self::check_size(size)?;
        let mut base: Vec<f64> = (0..size)
            .map(|i| if i & i.wrapping_sub(1) == 0 { 1.0 } else { 0.0 })
            .collect();
        let total: f64 = base.iter().sum();
        for w in &mut base {
            *w /= total;
        }
        Ok(Self::circulant(&base))
    }

    /// Star centered on `center_rank`, weights `1/size`
    pub fn star(size: usize, center_rank: usize) -> Result<Self> {
        Self::check_size(size)?;
        if center_rank >= size {
            return Err(CommError::InvalidRank {
                rank: center_rank,
                size,
            });
        }
        let share = 1.0 / size as f64;
        let mut matrix = vec![vec![0.0; size]; size];
        for i in 0..size {
            matrix[i][i] = 1.0 - share;
            matrix[center_rank][i] = share;
            matrix[i][center_rank] = share;
        }
        Ok(Self::from_square(matrix))
    }

    /// Unidirectional ring: weight 0.5 to self and 0.5 to the next rank
    /// (or the previous one with `left_connect`)
    pub fn ring(size: usize, left_connect: bool) -> Result<Self> {
        Self::check_size(size)?;
        if size == 1 {
            return Ok(Self::circulant(&[1.0]));
        }
        let mut base = vec![0.0; size];
        base[0] = 0.5;
        if left_connect {
            base[size - 1] = 0.5;
        } else {
            base[1] = 0.5;
        }
        Ok(Self::circulant(&base))
    }

    /// Bidirectional ring: weight 1/3 to self, next and previous rank
    pub fn bi_ring(size: usize) -> Result<Self> {
        Self::check_size(size)?;
        if size == 1 {
            return Ok(Self::circulant(&[1.0]));
        }
        // With two ranks next and previous coincide and share one edge.
        let mut base = vec![0.0; size];
        base[0] += 1.0 / 3.0;
        base[1] += 1.0 / 3.0;
        base[size - 1] += 1.0 / 3.0;
        Ok(Self::circulant(&base))
    }

    /// Add or overwrite an edge
    pub fn add_edge(&mut self, src: usize, dst: usize, weight: f64) -> Result<()> {
        for rank in [src, dst] {
            if rank >= self.size {
                return Err(CommError::InvalidRank {
                    rank,
                    size: self.size,
                });
            }
        }
        self.edges.insert((src, dst), weight);
        Ok(())
    }

    /// Number of ranks
    pub fn node_count(&self) -> usize {
        self.size
    }

    /// Number of edges, self-loops included
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Weight of `src -> dst`, if that edge exists
    pub fn weight(&self, src: usize, dst: usize) -> Option<f64> {
        self.edges.get(&(src, dst)).copied()
    }

    /// Sources of edges into `rank`, ascending, with their weights
    pub fn predecessors(&self, rank: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.edges
            .iter()
            .filter(move |((_, dst), _)| *dst == rank)
            .map(|((src, _), w)| (*src, *w))
    }

    /// Targets of edges out of `rank`, ascending, with their weights
    pub fn successors(&self, rank: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.edges
            .range((rank, 0)..(rank + 1, 0))
            .map(|((_, dst), w)| (*dst, *w))
    }

    /// Ranks `rank` receives from, self excluded
    pub fn in_neighbors(&self, rank: usize) -> Vec<usize> {
        self.predecessors(rank)
            .map(|(src, _)| src)
            .filter(|&src| src != rank)
            .collect()
    }

    /// Ranks `rank` sends to, self excluded
    pub fn out_neighbors(&self, rank: usize) -> Vec<usize> {
        self.successors(rank)
            .map(|(dst, _)| dst)
            .filter(|&dst| dst != rank)
            .collect()
    }

    /// Dense adjacency, `matrix[src][dst]`
    pub fn weight_matrix(&self) -> Vec<Vec<f64>> {
        let mut matrix = vec![vec![0.0; self.size]; self.size];
        for (&(src, dst), &w) in &self.edges {
            matrix[src][dst] = w;
        }
        matrix
    }

    /// Sum of each adjacency row
    pub fn row_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.size];
        for (&(src, _), &w) in &self.edges {
            sums[src] += w;
        }
        sums
    }

    /// Adjacency equality: same node count, same edge count and identical
    /// dense matrices. Node order matters; this is not an isomorphism test.
    pub fn is_equivalent(&self, other: &Topology) -> bool {
        self.size == other.size
            && self.edge_count() == other.edge_count()
            && self.weight_matrix() == other.weight_matrix()
    }

    /// Whether every rank is reachable ignoring edge direction
    pub fn is_connected(&self) -> bool {
        if self.size == 0 {
            return true;
        }

        let mut undirected = vec![Vec::new(); self.size];
        for &(src, dst) in self.edges.keys() {
            undirected[src].push(dst);
            undirected[dst].push(src);
        }

        let mut visited = vec![false; self.size];
        let mut stack = vec![0usize];
        while let Some(node) = stack.pop() {
            if !visited[node] {
                visited[node] = true;
                stack.extend(undirected[node].iter().copied());
            }
        }

        visited.iter().all(|&v| v)
    }
}

/// Equivalence check that tolerates absent topologies
pub fn is_topology_equivalent(a: Option<&Topology>, b: Option<&Topology>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is_equivalent(b),
        _ => false,
    }
}
