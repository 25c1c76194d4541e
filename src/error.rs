//! Error type shared by tensors, kernels and the autodiff protocol.
//!
//! Operators never define errors of their own. Whatever goes wrong in a
//! tensor operation or a kernel launch is propagated unchanged with `?`.

use thiserror::Error;

#[cfg(feature = "wgpu")]
use crate::ops::wgpu::GpuFailure;

/// Everything that can go wrong while running an operator.
#[derive(Debug, Error)]
pub enum Error {
    /// Two tensors that must line up elementwise have different shapes.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        /// Shape of the tensor the operation was called on.
        expected: Vec<usize>,
        /// Shape of the offending operand.
        found: Vec<usize>,
    },
    /// A function or kernel received the wrong number of operands.
    #[error("`{function}` expects {expected} operand(s), got {found}")]
    Arity {
        /// Label of the function or kernel.
        function: &'static str,
        /// Number of operands it takes.
        expected: usize,
        /// Number of operands it was given.
        found: usize,
    },
    /// `backward` was started from a non-scalar variable with no gradient set.
    #[error("cannot seed the gradient of a variable with {0} elements; set it explicitly")]
    MissingGradient(usize),
    /// An elementwise kernel definition failed validation.
    #[error("invalid elementwise kernel `{0}`")]
    InvalidKernel(String),
    /// The accelerator failed.
    #[cfg(feature = "wgpu")]
    #[error(transparent)]
    Gpu(#[from] GpuFailure),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = core::result::Result<T, E>;
