//! Typed element storage.
//!
//! [`Storage`] is a closed tagged variant over the primitives of
//! [`DataType`]. Arithmetic is written once, generically over [`Element`],
//! and dispatched with [`with_storage!`](crate::with_storage) so every
//! supported type is resolved at compile time.

use crate::{DataType, Element, Error, Result};

/// Flat, typed element vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Storage {
    U8(Vec<u8>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

/// Run `$body` with `$v` bound to the inner `Vec<T>` of a storage variant.
#[macro_export]
macro_rules! with_storage {
    ($storage:expr, $v:ident => $body:expr) => {
        match $storage {
            $crate::Storage::U8($v) => $body,
            $crate::Storage::I8($v) => $body,
            $crate::Storage::I16($v) => $body,
            $crate::Storage::I32($v) => $body,
            $crate::Storage::I64($v) => $body,
            $crate::Storage::F32($v) => $body,
            $crate::Storage::F64($v) => $body,
        }
    };
}

fn axpy_slice<T: Element>(dst: &mut [T], weight: f64, src: &[T]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = T::from_f64(d.to_f64() + weight * s.to_f64());
    }
}

fn add_slice<T: Element>(dst: &mut [T], src: &[T]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = d.add(*s);
    }
}

fn scale_slice<T: Element>(dst: &mut [T], weight: f64) {
    for d in dst.iter_mut() {
        *d = T::from_f64(d.to_f64() * weight);
    }
}

impl Storage {
    /// Zero-filled storage of `len` elements.
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::U8 => Storage::U8(vec![0; len]),
            DataType::I8 => Storage::I8(vec![0; len]),
            DataType::I16 => Storage::I16(vec![0; len]),
            DataType::I32 => Storage::I32(vec![0; len]),
            DataType::I64 => Storage::I64(vec![0; len]),
            DataType::F32 => Storage::F32(vec![0.0; len]),
            DataType::F64 => Storage::F64(vec![0.0; len]),
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        match self {
            Storage::U8(_) => DataType::U8,
            Storage::I8(_) => DataType::I8,
            Storage::I16(_) => DataType::I16,
            Storage::I32(_) => DataType::I32,
            Storage::I64(_) => DataType::I64,
            Storage::F32(_) => DataType::F32,
            Storage::F64(_) => DataType::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }

    /// Whether the storage holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed view, if `T` matches the variant.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        T::slice(self).ok_or_else(|| Error::dtype_mismatch(T::DTYPE, self.dtype()))
    }

    fn check_compatible(&self, other: &Storage) -> Result<()> {
        if self.dtype() != other.dtype() {
            return Err(Error::dtype_mismatch(self.dtype(), other.dtype()));
        }
        if self.len() != other.len() {
            return Err(Error::LengthMismatch {
                expected: self.len(),
                actual: other.len(),
            });
        }
        Ok(())
    }

    /// Elementwise `self += other`.
    pub fn add_assign(&mut self, other: &Storage) -> Result<()> {
        self.check_compatible(other)?;
        match (self, other) {
            (Storage::U8(d), Storage::U8(s)) => add_slice(d, s),
            (Storage::I8(d), Storage::I8(s)) => add_slice(d, s),
            (Storage::I16(d), Storage::I16(s)) => add_slice(d, s),
            (Storage::I32(d), Storage::I32(s)) => add_slice(d, s),
            (Storage::I64(d), Storage::I64(s)) => add_slice(d, s),
            (Storage::F32(d), Storage::F32(s)) => add_slice(d, s),
            (Storage::F64(d), Storage::F64(s)) => add_slice(d, s),
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }

    /// Elementwise `self += weight * other`.
    pub fn axpy(&mut self, weight: f64, other: &Storage) -> Result<()> {
        self.check_compatible(other)?;
        match (self, other) {
            (Storage::U8(d), Storage::U8(s)) => axpy_slice(d, weight, s),
            (Storage::I8(d), Storage::I8(s)) => axpy_slice(d, weight, s),
            (Storage::I16(d), Storage::I16(s)) => axpy_slice(d, weight, s),
            (Storage::I32(d), Storage::I32(s)) => axpy_slice(d, weight, s),
            (Storage::I64(d), Storage::I64(s)) => axpy_slice(d, weight, s),
            (Storage::F32(d), Storage::F32(s)) => axpy_slice(d, weight, s),
            (Storage::F64(d), Storage::F64(s)) => axpy_slice(d, weight, s),
            _ => unreachable!("dtype checked above"),
        }
        Ok(())
    }

    /// Multiply every element by `weight`.
    pub fn scale(&mut self, weight: f64) {
        with_storage!(self, v => scale_slice(v, weight))
    }

    /// Copy scaled by `weight`.
    pub fn scaled(&self, weight: f64) -> Storage {
        let mut out = self.clone();
        out.scale(weight);
        out
    }

    /// Concatenate storages of one dtype, in order.
    pub fn concat(dtype: DataType, parts: &[&Storage]) -> Result<Storage> {
        let total = parts.iter().map(|p| p.len()).sum();
        let mut out = Storage::zeros(dtype, 0);
        with_storage!(&mut out, v => v.reserve(total));
        for part in parts {
            if part.dtype() != dtype {
                return Err(Error::dtype_mismatch(dtype, part.dtype()));
            }
            match (&mut out, *part) {
                (Storage::U8(d), Storage::U8(s)) => d.extend_from_slice(s),
                (Storage::I8(d), Storage::I8(s)) => d.extend_from_slice(s),
                (Storage::I16(d), Storage::I16(s)) => d.extend_from_slice(s),
                (Storage::I32(d), Storage::I32(s)) => d.extend_from_slice(s),
                (Storage::I64(d), Storage::I64(s)) => d.extend_from_slice(s),
                (Storage::F32(d), Storage::F32(s)) => d.extend_from_slice(s),
                (Storage::F64(d), Storage::F64(s)) => d.extend_from_slice(s),
                _ => unreachable!("dtype checked above"),
            }
        }
        Ok(out)
    }

    /// Gather elements in the order given by `indices`.
    pub(crate) fn gather(&self, indices: &[usize]) -> Storage {
        match self {
            Storage::U8(v) => Storage::U8(indices.iter().map(|&i| v[i]).collect()),
            Storage::I8(v) => Storage::I8(indices.iter().map(|&i| v[i]).collect()),
            Storage::I16(v) => Storage::I16(indices.iter().map(|&i| v[i]).collect()),
            Storage::I32(v) => Storage::I32(indices.iter().map(|&i| v[i]).collect()),
            Storage::I64(v) => Storage::I64(indices.iter().map(|&i| v[i]).collect()),
            Storage::F32(v) => Storage::F32(indices.iter().map(|&i| v[i]).collect()),
            Storage::F64(v) => Storage::F64(indices.iter().map(|&i| v[i]).collect()),
        }
    }
}
