//! Handle lifecycle, barrier ordering and context teardown.

mod common;

use common::{init_tracing, run_on, run_ranks, test_config};
use weft_comm::{CommConfig, CommError, Handle, LocalFabric, Topology, TopologyKind};
use weft_core::Tensor;

#[test]
fn test_consumed_handle_is_not_found() {
    let results = run_ranks(2, test_config(), |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as f32], [1]).unwrap();
        let handle = comm.allreduce_async(&x, false, Some("once")).unwrap();

        let first = comm.synchronize(handle).unwrap();
        let second = comm.synchronize(handle).unwrap();
        let as_window = comm.win_wait(handle).unwrap();
        let polled = comm.poll(handle);
        (
            first.map(|t| t.to_vec::<f32>().unwrap()),
            second.is_none(),
            as_window,
            matches!(polled, Err(CommError::HandleNotFound(_))),
        )
    });

    for (first, second_missing, as_window, poll_missing) in results {
        assert_eq!(first, Some(vec![1.0]));
        assert!(second_missing);
        assert!(!as_window);
        assert!(poll_missing);
    }
}

#[test]
fn test_poll_does_not_consume() {
    let results = run_ranks(3, test_config(), |comm| {
        let x = Tensor::from_vec(vec![1i32], [1]).unwrap();
        let handle = comm.allreduce_async(&x, false, None).unwrap();
        while !comm.poll(handle).unwrap() {
            std::thread::yield_now();
        }
        // Still registered after completion was observed
        assert!(comm.poll(handle).unwrap());
        comm.synchronize(handle)
            .unwrap()
            .map(|t| t.to_vec::<i32>().unwrap())
    });
    assert!(results.into_iter().all(|r| r == Some(vec![3])));
}

#[test]
fn test_window_handle_not_synchronizable() {
    let results = run_on(Topology::ring(2, false).unwrap(), false, |comm| {
        let buffer = Tensor::from_vec(vec![1.0f64], [1]).unwrap();
        comm.win_create(&buffer, "w").unwrap();
        let handle = comm.win_put(&buffer, "w", None).unwrap();

        let via_collective = comm.synchronize(handle).unwrap().is_none();
        let waited = comm.win_wait(handle).unwrap();
        let again = comm.win_wait(handle).unwrap();
        comm.barrier().unwrap();
        (via_collective, waited, again)
    });
    assert!(results.into_iter().all(|r| r == (true, true, false)));
}

#[test]
fn test_barrier_completes_prior_dispatches() {
    // Puts are left unwaited until after the barrier; the barrier alone
    // must guarantee their data has landed.
    let results = run_on(Topology::ring(4, false).unwrap(), false, |comm| {
        let buffer = Tensor::from_vec(vec![comm.rank() as f64 + 1.0], [1]).unwrap();
        comm.win_create(&buffer, "b").unwrap();
        let handle = comm.win_put(&buffer, "b", None).unwrap();
        comm.barrier().unwrap();

        let collected = comm.win_sync_then_collect("b").unwrap();
        assert!(comm.win_wait(handle).unwrap());
        comm.barrier().unwrap();
        collected.to_vec::<f64>().unwrap()[0]
    });
    assert_eq!(results, vec![1.0 + 4.0, 2.0 + 1.0, 3.0 + 2.0, 4.0 + 3.0]);
}

#[test]
fn test_in_flight_name_refused_until_synchronized() {
    for _ in 0..20 {
        let results = run_ranks(2, test_config(), |comm| {
            let small = Tensor::from_vec(vec![1.0f64], [1]).unwrap();
            let large = Tensor::from_vec(vec![100.0f64], [1]).unwrap();

            let first = comm.allreduce_async(&small, false, Some("dup")).unwrap();
            let refused = matches!(
                comm.allreduce_async(&large, false, Some("dup")),
                Err(CommError::DuplicateName(_))
            );
            let first = comm.synchronize(first).unwrap().unwrap();
            let second = comm.allreduce(&large, false, Some("dup")).unwrap();
            (
                refused,
                first.to_vec::<f64>().unwrap()[0],
                second.to_vec::<f64>().unwrap()[0],
            )
        });
        assert!(results.into_iter().all(|r| r == (true, 2.0, 200.0)));
    }
}

#[test]
fn test_set_topology_refused_with_outstanding_handle() {
    let results = run_ranks(2, test_config(), |comm| {
        let x = Tensor::from_vec(vec![1.0f32], [1]).unwrap();
        let handle = comm.allreduce_async(&x, false, None).unwrap();
        let refused = matches!(
            comm.set_topology(Topology::ring(2, false).unwrap(), false),
            Err(CommError::TopologyBusy(_))
        );
        comm.synchronize(handle).unwrap();
        comm.set_topology(Topology::ring(2, false).unwrap(), true)
            .unwrap();
        refused && comm.is_topology_weighted()
    });
    assert_eq!(results, vec![true, true]);
}

#[test]
fn test_shutdown_releases_everything() {
    let results = run_ranks(2, test_config(), |comm| {
        let buffer = Tensor::from_vec(vec![0.0f32], [1]).unwrap();
        comm.win_create(&buffer, "w").unwrap();
        comm.barrier().unwrap();
        comm.shutdown().unwrap();

        let after = comm.allreduce_async(&buffer, false, None);
        (
            comm.window_names().is_empty(),
            matches!(after, Err(CommError::ShutDown)),
            matches!(comm.win_free(None), Err(CommError::ShutDown)),
        )
    });
    assert!(results.into_iter().all(|r| r == (true, true, true)));
}

#[test]
fn test_config_from_json_drives_group() {
    init_tracing();
    let config = CommConfig::from_json(
        r#"{
            "topology": {"kind": "star", "center_rank": 1},
            "weighted": true,
            "worker_threads": 2,
            "local_size": 2
        }"#,
    )
    .unwrap();
    assert_eq!(config.topology, TopologyKind::Star { center_rank: 1 });

    let comms = LocalFabric::group(4, config).unwrap();
    assert_eq!(comms[1].in_neighbor_ranks(), vec![0, 2, 3]);
    assert_eq!(comms[3].in_neighbor_ranks(), vec![1]);
    assert_eq!(comms[3].local_rank(), 1);
    assert_eq!(comms[3].local_size(), 2);
    assert!(comms[0].is_topology_weighted());
}

#[test]
fn test_unknown_handles() {
    let comms = LocalFabric::group(1, test_config()).unwrap();
    let comm = &comms[0];
    let stranger = Handle::from_raw(1_000);
    assert!(comm.synchronize(stranger).unwrap().is_none());
    assert!(!comm.win_wait(stranger).unwrap());
    assert!(comm.win_poll(stranger).is_err());
}
