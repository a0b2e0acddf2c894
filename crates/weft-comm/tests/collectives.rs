//! Multi-rank collectives over the in-process provider.

mod common;

use common::{assert_close, run_on, run_ranks, test_config};
use weft_comm::{CommError, Topology};
use weft_core::Tensor;

#[test]
fn test_allreduce_sum_and_average() {
    let results = run_ranks(4, test_config(), |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as f64 + 1.0, 1.0], [2]).unwrap();
        let sum = comm.allreduce(&x, false, Some("sum")).unwrap();
        let mean = comm.allreduce(&x, true, None).unwrap();
        // Input untouched
        assert_eq!(x.to_vec::<f64>().unwrap()[0], comm.rank() as f64 + 1.0);
        (sum.to_vec::<f64>().unwrap(), mean.to_vec::<f64>().unwrap())
    });

    for (sum, mean) in results {
        assert_eq!(sum, vec![10.0, 4.0]);
        assert_eq!(mean, vec![2.5, 1.0]);
    }
}

#[test]
fn test_allreduce_integers() {
    let results = run_ranks(3, test_config(), |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as i64; 3], [3]).unwrap();
        comm.allreduce(&x, false, None).unwrap().to_vec::<i64>().unwrap()
    });
    assert!(results.iter().all(|r| r == &vec![3, 3, 3]));
}

#[test]
fn test_broadcast_variants() {
    let results = run_ranks(4, test_config(), |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as u8; 2], [2]).unwrap();
        let copy = comm.broadcast(&x, 2, None).unwrap();
        assert_eq!(x.to_vec::<u8>().unwrap(), vec![comm.rank() as u8; 2]);

        let same = comm.broadcast_in_place(&x, 1, Some("inplace")).unwrap();
        assert!(same.same_buffer(&x));
        (copy.to_vec::<u8>().unwrap(), x.to_vec::<u8>().unwrap())
    });

    for (copy, in_place) in results {
        assert_eq!(copy, vec![2, 2]);
        assert_eq!(in_place, vec![1, 1]);
    }
}

#[test]
fn test_allgather_uneven_first_axis() {
    let results = run_ranks(4, test_config(), |comm| {
        let rows = comm.rank() + 1;
        let x = Tensor::from_vec(vec![comm.rank() as i16; rows * 2], [rows, 2]).unwrap();
        let out = comm.allgather(&x, Some("rows")).unwrap();
        (out.shape(), out.to_vec::<i16>().unwrap())
    });

    let mut expected = Vec::new();
    for rank in 0..4i16 {
        expected.extend(std::iter::repeat(rank).take((rank as usize + 1) * 2));
    }
    for (shape, data) in results {
        assert_eq!(shape, vec![10, 2]);
        assert_eq!(data, expected);
    }
}

#[test]
fn test_neighbor_allgather_ring() {
    let results = run_on(Topology::ring(4, false).unwrap(), false, |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as i32], [1]).unwrap();
        comm.neighbor_allgather(&x, None)
            .unwrap()
            .to_vec::<i32>()
            .unwrap()
    });
    assert_eq!(results, vec![vec![3], vec![0], vec![1], vec![2]]);
}

#[test]
fn test_neighbor_allgather_bi_ring_order() {
    let results = run_on(Topology::bi_ring(4).unwrap(), false, |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as f32 * 10.0], [1]).unwrap();
        comm.neighbor_allgather(&x, None)
            .unwrap()
            .to_vec::<f32>()
            .unwrap()
    });
    assert_eq!(results[0], vec![10.0, 30.0]);
    assert_eq!(results[2], vec![10.0, 30.0]);
    assert_eq!(results[3], vec![0.0, 20.0]);
}

#[test]
fn test_neighbor_allreduce_ring_average() {
    // Data flows along edges: with left_connect rank 0 hears from rank 1,
    // otherwise from rank 3.
    for (left_connect, expected) in [(true, 1.5), (false, 2.5)] {
        for weighted in [false, true] {
            let results = run_on(Topology::ring(4, left_connect).unwrap(), weighted, |comm| {
                let x = Tensor::scalar(comm.rank() as f64 + 1.0);
                comm.neighbor_allreduce(&x, true, None)
                    .unwrap()
                    .to_vec::<f64>()
                    .unwrap()[0]
            });
            assert_close(results[0], expected);
        }
    }
}

#[test]
fn test_neighbor_allreduce_weighted_star() {
    let results = run_on(Topology::star(4, 0).unwrap(), true, |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as f64 + 1.0], [1]).unwrap();
        comm.neighbor_allreduce(&x, true, Some("star"))
            .unwrap()
            .to_vec::<f64>()
            .unwrap()[0]
    });
    assert_close(results[0], 2.5);
    assert_close(results[1], 0.75 * 2.0 + 0.25 * 1.0);
    assert_close(results[3], 0.75 * 4.0 + 0.25 * 1.0);
}

#[test]
fn test_neighbor_allreduce_star_unweighted_mean() {
    let results = run_on(Topology::star(4, 0).unwrap(), false, |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as f64 + 1.0], [1]).unwrap();
        comm.neighbor_allreduce(&x, true, None)
            .unwrap()
            .to_vec::<f64>()
            .unwrap()[0]
    });
    assert_close(results[0], 2.5);
    assert_close(results[1], 1.5);
}

#[test]
fn test_neighbor_allreduce_sum() {
    let results = run_on(Topology::bi_ring(4).unwrap(), true, |comm| {
        let x = Tensor::from_vec(vec![comm.rank() as i32 + 1], [1]).unwrap();
        comm.neighbor_allreduce(&x, false, None)
            .unwrap()
            .to_vec::<i32>()
            .unwrap()[0]
    });
    assert_eq!(results, vec![1 + 2 + 4, 2 + 1 + 3, 3 + 2 + 4, 4 + 3 + 1]);
}

#[test]
fn test_interleaved_handles() {
    let results = run_ranks(3, test_config(), |comm| {
        let a = Tensor::from_vec(vec![1.0f32], [1]).unwrap();
        let b = Tensor::from_vec(vec![comm.rank() as f32], [1]).unwrap();
        let ha = comm.allreduce_async(&a, false, Some("a")).unwrap();
        let hb = comm.allgather_async(&b, Some("b")).unwrap();

        let gathered = comm.synchronize(hb).unwrap().unwrap();
        let reduced = comm.synchronize(ha).unwrap().unwrap();
        (reduced.to_vec::<f32>().unwrap(), gathered.to_vec::<f32>().unwrap())
    });

    for (reduced, gathered) in results {
        assert_eq!(reduced, vec![3.0]);
        assert_eq!(gathered, vec![0.0, 1.0, 2.0]);
    }
}

#[test]
fn test_dtype_mismatch_under_one_name() {
    let results = run_ranks(2, test_config(), |comm| {
        let x = if comm.rank() == 0 {
            Tensor::from_vec(vec![1.0f32], [1]).unwrap()
        } else {
            Tensor::from_vec(vec![1.0f64], [1]).unwrap()
        };
        comm.allreduce(&x, false, Some("clash"))
    });

    for result in results {
        assert!(matches!(result, Err(CommError::Mismatch { .. })));
    }
}

#[test]
fn test_shape_mismatch_under_one_name() {
    let results = run_ranks(2, test_config(), |comm| {
        let x = Tensor::from_vec(vec![1i32; comm.rank() + 1], [comm.rank() + 1]).unwrap();
        comm.allreduce(&x, false, Some("shapes"))
    });

    for result in results {
        assert!(matches!(result, Err(CommError::Mismatch { .. })));
    }
}
