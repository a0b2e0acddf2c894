//! Element types understood by the transport.

use crate::Storage;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

/// Runtime type tag of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned byte
    U8 = 0,
    /// Signed byte
    I8 = 1,
    /// 16-bit signed integer
    I16 = 2,
    /// 32-bit signed integer
    I32 = 3,
    /// 64-bit signed integer
    I64 = 4,
    /// 32-bit float
    F32 = 5,
    /// 64-bit float
    F64 = 6,
}

impl DataType {
    /// Every supported type, in tag order.
    pub const ALL: [DataType; 7] = [
        DataType::U8,
        DataType::I8,
        DataType::I16,
        DataType::I32,
        DataType::I64,
        DataType::F32,
        DataType::F64,
    ];

    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::I16 => 2,
            DataType::I32 | DataType::F32 => 4,
            DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Whether the type is a floating-point type.
    pub const fn is_floating_point(self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }

    /// Short lowercase name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::U8 => "u8",
            DataType::I8 => "i8",
            DataType::I16 => "i16",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::F32 => "f32",
            DataType::F64 => "f64",
        }
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A Rust primitive that can live in a [`Storage`].
///
/// Implemented for exactly the primitives listed in [`DataType`], so matching
/// on a storage variant is always exhaustive.
pub trait Element: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// Type tag of this primitive.
    const DTYPE: DataType;

    /// Sum of two elements; integers wrap.
    fn add(self, other: Self) -> Self;

    /// Widen to f64 for weighted arithmetic.
    fn to_f64(self) -> f64;

    /// Narrow from f64 (saturating `as` semantics for integers).
    fn from_f64(value: f64) -> Self;

    /// Wrap a vector into the matching storage variant.
    fn into_storage(data: Vec<Self>) -> Storage;

    /// Borrow the storage as a typed slice if the variant matches.
    fn slice(storage: &Storage) -> Option<&[Self]>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident, |$a:ident, $b:ident| $add:expr) => {
        impl Element for $ty {
            const DTYPE: DataType = DataType::$variant;

            fn add(self, other: Self) -> Self {
                let ($a, $b) = (self, other);
                $add
            }

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(value: f64) -> Self {
                value as $ty
            }

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(u8, U8, |a, b| a.wrapping_add(b));
impl_element!(i8, I8, |a, b| a.wrapping_add(b));
impl_element!(i16, I16, |a, b| a.wrapping_add(b));
impl_element!(i32, I32, |a, b| a.wrapping_add(b));
impl_element!(i64, I64, |a, b| a.wrapping_add(b));
impl_element!(f32, F32, |a, b| a + b);
impl_element!(f64, F64, |a, b| a + b);
