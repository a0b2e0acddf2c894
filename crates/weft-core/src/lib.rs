//! # Weft Core
//!
//! Numeric buffer types shared by the weft communication layer.
//!
//! A weft process exchanges dense numeric buffers with its neighbors. This
//! crate owns the in-memory side of that exchange:
//!
//! - [`DataType`] - the closed set of element types the transport understands
//! - [`Element`] - static per-type dispatch from Rust primitives to [`DataType`]
//! - [`Storage`] - a tagged, typed element vector with the arithmetic the
//!   collectives need (sum, weighted scale, axpy, concatenation)
//! - [`Tensor`] - a shaped, shareable handle over a [`Storage`]
//!
//! ## Example
//!
//! ```
//! use weft_core::{DataType, Tensor};
//!
//! let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], [2, 2]).unwrap();
//! assert_eq!(t.dtype(), DataType::F32);
//! assert_eq!(t.shape(), vec![2, 2]);
//! assert!(t.is_contiguous());
//! ```

pub mod dtype;
pub mod error;
pub mod storage;
pub mod tensor;

pub use dtype::{DataType, Element};
pub use error::{Error, Result};
pub use storage::Storage;
pub use tensor::{Tensor, TensorData};
