//! Property-based tests for buffer arithmetic and layouts.

use proptest::prelude::*;

use weft_core::{DataType, Storage, Tensor};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    /// Property: axpy matches the elementwise formula.
    #[test]
    fn prop_axpy_elementwise(
        a in prop::collection::vec(-1.0e3f64..1.0e3, 1..32),
        weight in -4.0f64..4.0,
    ) {
        let b: Vec<f64> = a.iter().map(|x| x * 0.5 + 1.0).collect();
        let mut out = Storage::F64(a.clone());
        out.axpy(weight, &Storage::F64(b.clone())).unwrap();

        let out = out.as_slice::<f64>().unwrap().to_vec();
        for ((o, x), y) in out.iter().zip(&a).zip(&b) {
            prop_assert!((o - (x + weight * y)).abs() < 1e-9);
        }
    }

    /// Property: a transposed strided view reads back as the transpose.
    #[test]
    fn prop_transpose_view(rows in 1usize..6, cols in 1usize..6) {
        let data: Vec<i32> = (0..(rows * cols) as i32).collect();
        let view = Tensor::from_vec_strided(data.clone(), [cols, rows], [1, cols]).unwrap();
        prop_assert_eq!(view.is_contiguous(), rows == 1 || cols == 1);

        let mut expected = Vec::with_capacity(data.len());
        for c in 0..cols {
            for r in 0..rows {
                expected.push(data[r * cols + c]);
            }
        }
        prop_assert_eq!(view.to_vec::<i32>().unwrap(), expected);
    }

    /// Property: concatenation preserves total length and order.
    #[test]
    fn prop_concat_lengths(parts in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..8), 0..6)) {
        let storages: Vec<Storage> = parts.iter().cloned().map(Storage::U8).collect();
        let refs: Vec<&Storage> = storages.iter().collect();
        let out = Storage::concat(DataType::U8, &refs).unwrap();

        let flat: Vec<u8> = parts.into_iter().flatten().collect();
        prop_assert_eq!(out.as_slice::<u8>().unwrap(), flat.as_slice());
    }
}
