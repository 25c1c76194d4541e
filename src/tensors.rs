//! Core tensor data structures and operations.
//!
//! # Core Tensor Utilities
//!
//! This module defines the minimal tensor the operators in this crate work on:
//! a flat row-major buffer, a shape, and the [`Backend`] tag that decides where
//! operators run.
//!
//! It supports:
//! - Construction of N-dimensional tensors with shape and row-major data layout
//! - Elementwise comparison against a scalar, producing a boolean mask tensor
//! - Masked in-place scalar multiply
//! - Full copies (`Clone`) and `empty_like` allocation
//! - Gradient accumulation and `WithGrad` pairing for closure-style autograd
//! - The `tensor!` macro for ergonomic tensor literals
//!
//! ## Limitations
//! - Row-major only
//! - No broadcasting, slicing, or shape inference

use crate::backend::{get_backend, Backend};
use crate::error::{Error, Result};
use core::ops::{Add, Mul};

/// The float used by operators on both backends (`f32`).
pub type TensorFloat = f32;

/// Tensor of [`TensorFloat`]s.
pub type Ten32 = Tensor<TensorFloat>;

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - All elements must be the same type (`T`).
/// - `shape` defines the structure, e.g., `[2, 3]` for a 2×3 matrix.
/// - `data` holds the flattened content in row-major order.
/// - the backend tag selects the execution path of operators applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
    backend: Backend,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data, tagged with
    /// the process-wide default backend.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape.iter().product::<usize>(),
            data.len(),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self {
            shape,
            data,
            backend: get_backend(),
        }
    }

    /// Retags the tensor for another backend. The data is left untouched.
    #[must_use]
    pub fn on(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// The backend operators applied to this tensor run on.
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the tensor holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fails with [`Error::ShapeMismatch`] unless `other` has the same shape.
    pub fn check_same_shape<U>(&self, other: &Tensor<U>) -> Result<()> {
        if self.shape == other.shape {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                found: other.shape.clone(),
            })
        }
    }

    /// Elementwise `self < rhs`, as a boolean tensor of the same shape.
    #[must_use]
    pub fn lt(&self, rhs: T) -> Tensor<bool>
    where
        T: PartialOrd,
    {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|x| *x < rhs).collect(),
            backend: self.backend,
        }
    }

    /// Multiplies by `k`, in place, every element whose mask entry is set.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if `mask` does not have the shape of `self`.
    pub fn scale_where(&mut self, mask: &Tensor<bool>, k: T) -> Result<()>
    where
        T: Copy + Mul<Output = T>,
    {
        self.check_same_shape(mask)?;
        self.data
            .iter_mut()
            .zip(&mask.data)
            .filter(|(_, hit)| **hit)
            .for_each(|(x, _)| *x = *x * k);
        Ok(())
    }

    /// Tensor of the same shape and backend filled with `value`.
    #[must_use]
    pub fn full_like(&self, value: T) -> Self
    where
        T: Clone,
    {
        Self {
            shape: self.shape.clone(),
            data: vec![value; self.data.len()],
            backend: self.backend,
        }
    }

    /// Allocation matching the shape and backend of `self`, meant to be
    /// overwritten by a kernel. Elements start at `T::default()`.
    #[must_use]
    pub fn empty_like(&self) -> Self
    where
        T: Clone + Default,
    {
        self.full_like(T::default())
    }

    /// Adds `other` elementwise into `self`.
    ///
    /// # Errors
    /// [`Error::ShapeMismatch`] if the shapes differ.
    pub fn accumulate(&mut self, other: &Self) -> Result<()>
    where
        T: Copy + Add<Output = T>,
    {
        self.check_same_shape(other)?;
        for (acc, &x) in self.data.iter_mut().zip(&other.data) {
            *acc = *acc + x;
        }
        Ok(())
    }
}

/// A container for tracking gradients of values (used in autograd).
///
/// Typically used as `WithGrad<Ten32>`.
#[derive(Debug, Clone)]
pub struct WithGrad<T> {
    pub value: T,
    pub grad: T,
}

impl<T: Clone + Default> WithGrad<Tensor<T>> {
    /// Pairs `value` with a zeroed gradient of the same shape.
    pub fn new(value: Tensor<T>) -> Self {
        let grad = value.empty_like();
        Self { value, grad }
    }
}

/// Defines a [`Ten32`] from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use leaky_relu::tensor;
/// let t = tensor!([[1.0, 2.0], [3.0, 4.0]]);
/// assert_eq!(t.shape, vec![2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(
            Vec::<usize>::new(),
            vec![$lit as $crate::tensors::TensorFloat],
        )
    };

    ([ $( $lit:literal ),+ $(,)? ]) => {{
        let data = vec![ $( $lit as $crate::tensors::TensorFloat ),+ ];
        $crate::tensors::Tensor::new(vec![data.len()], data)
    }};

    ([ $( [ $( $inner:tt )* ] ),+ $(,)? ]) => {{
        let children: Vec<$crate::tensors::Ten32> = vec![ $( $crate::tensor!([ $( $inner )* ]) ),+ ];
        let first_shape = children[0].shape.clone();
        assert!(children.iter().all(|c| c.shape == first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
