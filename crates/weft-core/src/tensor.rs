//! Shaped, shareable buffer handle.
//!
//! A [`Tensor`] is a reference-counted handle: cloning it yields another
//! handle onto the same buffer. This is what lets the communication layer
//! keep an input alive until an asynchronous operation has finished reading
//! it, and lets a window alias the caller's buffer for its whole lifetime.
//! Use [`Tensor::deep_clone`] for an independent copy.

use crate::{DataType, Element, Error, Result, Storage};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::fmt;
use std::sync::Arc;

/// Row-major strides for `shape`.
pub fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1;
    for (stride, dim) in strides.iter_mut().zip(shape).rev() {
        *stride = acc;
        acc *= *dim;
    }
    strides
}

fn numel_of(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Storage offsets of every logical element, in row-major logical order.
fn logical_offsets(shape: &[usize], strides: &[usize]) -> Vec<usize> {
    let n = numel_of(shape);
    let mut offsets = Vec::with_capacity(n);
    if n == 0 {
        return offsets;
    }
    let mut index = vec![0usize; shape.len()];
    for _ in 0..n {
        offsets.push(index.iter().zip(strides).map(|(i, s)| i * s).sum());
        for axis in (0..shape.len()).rev() {
            index[axis] += 1;
            if index[axis] < shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    offsets
}

/// Layout and data behind a [`Tensor`] handle.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorData {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage: Storage,
}

impl TensorData {
    /// Logical shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Element strides.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Underlying elements in storage order.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.storage.dtype()
    }

    /// Logical element count.
    pub fn numel(&self) -> usize {
        numel_of(&self.shape)
    }

    /// Whether the layout is dense row-major.
    pub fn is_contiguous(&self) -> bool {
        let expected = contiguous_strides(&self.shape);
        self.shape
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(dim, (actual, expected))| *dim <= 1 || actual == expected)
            && self.storage.len() == self.numel()
    }

    /// Elements in logical order, as a fresh contiguous storage.
    pub fn to_contiguous_storage(&self) -> Storage {
        if self.is_contiguous() {
            self.storage.clone()
        } else {
            self.storage
                .gather(&logical_offsets(&self.shape, &self.strides))
        }
    }
}

/// Shared handle to a shaped numeric buffer.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<RwLock<TensorData>>,
}

impl Tensor {
    /// Wrap a storage with a contiguous shape.
    pub fn from_storage(storage: Storage, shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        let expected = numel_of(&shape);
        if storage.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: storage.len(),
            });
        }
        let strides = contiguous_strides(&shape);
        Ok(Self::from_data(TensorData {
            shape,
            strides,
            storage,
        }))
    }

    /// Build a contiguous tensor from a typed vector.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: impl Into<Vec<usize>>) -> Result<Self> {
        Self::from_storage(T::into_storage(data), shape)
    }

    /// Build a strided (possibly non-contiguous) view over `data`.
    pub fn from_vec_strided<T: Element>(
        data: Vec<T>,
        shape: impl Into<Vec<usize>>,
        strides: impl Into<Vec<usize>>,
    ) -> Result<Self> {
        let shape = shape.into();
        let strides = strides.into();
        let max_offset: usize = shape
            .iter()
            .zip(&strides)
            .map(|(dim, stride)| dim.saturating_sub(1) * stride)
            .sum();
        if strides.len() != shape.len() || (numel_of(&shape) > 0 && max_offset >= data.len()) {
            return Err(Error::InvalidStrides { shape, strides });
        }
        Ok(Self::from_data(TensorData {
            shape,
            strides,
            storage: T::into_storage(data),
        }))
    }

    /// Zero-dimensional tensor holding one value.
    pub fn scalar<T: Element>(value: T) -> Self {
        Self::from_data(TensorData {
            shape: Vec::new(),
            strides: Vec::new(),
            storage: T::into_storage(vec![value]),
        })
    }

    /// Zero-filled contiguous tensor.
    pub fn zeros(dtype: DataType, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let strides = contiguous_strides(&shape);
        let storage = Storage::zeros(dtype, numel_of(&shape));
        Self::from_data(TensorData {
            shape,
            strides,
            storage,
        })
    }

    /// Unsized placeholder; filled in later by whoever knows the final shape.
    pub fn empty(dtype: DataType) -> Self {
        Self::zeros(dtype, vec![0])
    }

    /// Zero-filled tensor with the same dtype and shape as `self`.
    pub fn zeros_like(&self) -> Self {
        let data = self.read();
        Self::zeros(data.dtype(), data.shape.clone())
    }

    fn from_data(data: TensorData) -> Self {
        Self {
            inner: Arc::new(RwLock::new(data)),
        }
    }

    /// Shared access to layout and data.
    pub fn read(&self) -> RwLockReadGuard<'_, TensorData> {
        self.inner.read()
    }

    fn write(&self) -> RwLockWriteGuard<'_, TensorData> {
        self.inner.write()
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.read().dtype()
    }

    /// Logical shape.
    pub fn shape(&self) -> Vec<usize> {
        self.read().shape.clone()
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.read().shape.len()
    }

    /// Logical element count.
    pub fn numel(&self) -> usize {
        self.read().numel()
    }

    /// Whether the layout is dense row-major.
    pub fn is_contiguous(&self) -> bool {
        self.read().is_contiguous()
    }

    /// Whether two handles refer to the same buffer.
    pub fn same_buffer(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Elements in logical order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let data = self.read();
        let storage = data.to_contiguous_storage();
        Ok(storage.as_slice::<T>()?.to_vec())
    }

    /// Contiguous copy of the elements in logical order.
    pub fn snapshot(&self) -> Storage {
        self.read().to_contiguous_storage()
    }

    /// Independent contiguous copy.
    pub fn deep_clone(&self) -> Self {
        let data = self.read();
        let storage = data.to_contiguous_storage();
        let shape = data.shape.clone();
        let strides = contiguous_strides(&shape);
        Self::from_data(TensorData {
            shape,
            strides,
            storage,
        })
    }

    /// Replace shape and data in one step; `storage` must hold exactly the
    /// elements `shape` requires.
    pub fn replace(&self, shape: impl Into<Vec<usize>>, storage: Storage) -> Result<()> {
        let shape = shape.into();
        let mut data = self.write();
        if storage.dtype() != data.dtype() {
            return Err(Error::dtype_mismatch(data.dtype(), storage.dtype()));
        }
        let expected = numel_of(&shape);
        if storage.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: storage.len(),
            });
        }
        data.strides = contiguous_strides(&shape);
        data.shape = shape;
        data.storage = storage;
        Ok(())
    }

    /// Overwrite the elements, keeping the shape.
    pub fn assign(&self, storage: Storage) -> Result<()> {
        let shape = self.shape();
        self.replace(shape, storage)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("Tensor")
            .field("dtype", &data.dtype())
            .field("shape", &data.shape)
            .field("contiguous", &data.is_contiguous())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec() {
        let t = Tensor::from_vec(vec![1i32, 2, 3, 4, 5, 6], [2, 3]).unwrap();
        assert_eq!(t.shape(), vec![2, 3]);
        assert_eq!(t.numel(), 6);
        assert_eq!(t.dtype(), DataType::I32);
        assert!(t.is_contiguous());
        assert_eq!(t.read().strides(), &[3, 1]);
    }

    #[test]
    fn test_from_vec_length_mismatch() {
        let err = Tensor::from_vec(vec![1.0f32; 5], [2, 3]).unwrap_err();
        assert_eq!(
            err,
            Error::LengthMismatch {
                expected: 6,
                actual: 5
            }
        );
    }

    #[test]
    fn test_scalar() {
        let t = Tensor::scalar(2.5f64);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.numel(), 1);
        assert_eq!(t.to_vec::<f64>().unwrap(), vec![2.5]);
    }

    #[test]
    fn test_strided_transpose_view() {
        // 2x3 row-major data viewed as its 3x2 transpose.
        let t = Tensor::from_vec_strided(vec![1, 2, 3, 4, 5, 6i64], [3, 2], [1, 3]).unwrap();
        assert!(!t.is_contiguous());
        assert_eq!(t.to_vec::<i64>().unwrap(), vec![1, 4, 2, 5, 3, 6]);

        let dense = t.deep_clone();
        assert!(dense.is_contiguous());
        assert_eq!(dense.to_vec::<i64>().unwrap(), vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn test_strided_out_of_bounds() {
        let err = Tensor::from_vec_strided(vec![1u8, 2, 3], [2, 2], [2, 1]).unwrap_err();
        assert!(matches!(err, Error::InvalidStrides { .. }));
    }

    #[test]
    fn test_clone_shares_buffer() {
        let a = Tensor::from_vec(vec![1.0f32, 2.0], [2]).unwrap();
        let b = a.clone();
        assert!(a.same_buffer(&b));

        b.assign(Storage::F32(vec![5.0, 6.0])).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![5.0, 6.0]);

        let c = a.deep_clone();
        assert!(!a.same_buffer(&c));
        c.assign(Storage::F32(vec![0.0, 0.0])).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![5.0, 6.0]);
    }

    #[test]
    fn test_empty_then_replace() {
        let t = Tensor::empty(DataType::F64);
        assert_eq!(t.numel(), 0);

        t.replace([2, 2], Storage::F64(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(t.shape(), vec![2, 2]);

        let err = t.replace([3], Storage::F64(vec![1.0])).unwrap_err();
        assert!(matches!(err, Error::LengthMismatch { .. }));
        let err = t.replace([1], Storage::I64(vec![1])).unwrap_err();
        assert!(matches!(err, Error::DtypeMismatch { .. }));
    }

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<usize>::new());
    }
}
