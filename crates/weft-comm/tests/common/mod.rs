//! Shared helpers for multi-rank integration tests.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use weft_comm::{CommConfig, Communicator, LocalFabric, Topology};

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once; filtered by `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Small runtime, short stall warnings.
pub fn test_config() -> CommConfig {
    CommConfig::default()
        .with_worker_threads(2)
        .with_stall_warning(Duration::from_secs(2))
}

/// Drive every rank of a fresh group on its own thread and collect the
/// per-rank results in rank order.
pub fn run_ranks<T, F>(size: usize, config: CommConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Communicator) -> T + Sync,
{
    init_tracing();
    let comms = LocalFabric::group(size, config).expect("fabric");
    let f = &f;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms.iter().map(|comm| s.spawn(move || f(comm))).collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Like [`run_ranks`], installing `topology` on every rank first.
pub fn run_on<T, F>(topology: Topology, weighted: bool, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&Communicator) -> T + Sync,
{
    let size = topology.node_count();
    run_ranks(size, test_config(), |comm| {
        comm.set_topology(topology.clone(), weighted)
            .expect("set_topology");
        f(comm)
    })
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() < 1e-9,
        "expected {}, got {}",
        expected,
        actual
    );
}
