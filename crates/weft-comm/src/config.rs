//! Communicator configuration

use crate::topology::TopologyKind;
use crate::{CommError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Communicator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Topology installed at init
    pub topology: TopologyKind,
    /// Whether the initial topology's edge weights drive weighted averages
    pub weighted: bool,
    /// Worker threads of the in-process provider's runtime
    pub worker_threads: usize,
    /// How long a rendezvous may wait before a stall warning is logged
    pub stall_warning: Duration,
    /// Ranks per host; the whole world when unset
    pub local_size: Option<usize>,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            topology: TopologyKind::PowerTwoRing,
            weighted: false,
            worker_threads: 4,
            stall_warning: Duration::from_secs(10),
            local_size: None,
        }
    }
}

impl CommConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CommError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the initial topology
    pub fn with_topology(mut self, topology: TopologyKind) -> Self {
        self.topology = topology;
        self
    }

    /// Use the topology's edge weights
    pub fn with_weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    /// Set worker thread count
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the rendezvous stall warning threshold
    pub fn with_stall_warning(mut self, after: Duration) -> Self {
        self.stall_warning = after;
        self
    }

    /// Set ranks per host
    pub fn with_local_size(mut self, local_size: usize) -> Self {
        self.local_size = Some(local_size);
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(CommError::Configuration(
                "worker_threads must be positive".into(),
            ));
        }
        if self.stall_warning.is_zero() {
            return Err(CommError::Configuration(
                "stall_warning must be positive".into(),
            ));
        }
        if self.local_size == Some(0) {
            return Err(CommError::Configuration("local_size must be positive".into()));
        }
        Ok(())
    }

    /// Ranks per host for a world of `size`
    pub fn local_size_for(&self, size: usize) -> usize {
        self.local_size.unwrap_or(size).min(size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CommConfig::default();
        assert_eq!(config.topology, TopologyKind::PowerTwoRing);
        assert!(!config.weighted);
        assert!(config.validate().is_ok());
        assert_eq!(config.local_size_for(8), 8);
    }

    #[test]
    fn test_builders() {
        let config = CommConfig::default()
            .with_topology(TopologyKind::Star { center_rank: 2 })
            .with_weighted(true)
            .with_local_size(2)
            .with_stall_warning(Duration::from_millis(250));

        assert!(config.weighted);
        assert_eq!(config.local_size_for(8), 2);
        assert_eq!(config.stall_warning, Duration::from_millis(250));
    }

    #[test]
    fn test_from_json() {
        let config = CommConfig::from_json(
            r#"{"topology": {"kind": "ring", "left_connect": true}, "weighted": true}"#,
        )
        .unwrap();
        assert_eq!(config.topology, TopologyKind::Ring { left_connect: true });
        assert!(config.weighted);
        assert_eq!(config.worker_threads, 4);

        let err = CommConfig::from_json(r#"{"worker_threads": 0}"#).unwrap_err();
        assert_eq!(err.category(), "configuration");
        assert!(CommConfig::from_json("not json").is_err());
    }
}
