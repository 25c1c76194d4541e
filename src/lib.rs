//! leaky_relu: a leaky rectified linear unit for a small autodiff framework.
//!
//! The operator computes `f(x) = x` for non-negative inputs and
//! `f(x) = slope * x` otherwise, together with its gradient, and runs either
//! sequentially on the host or data-parallel through a cached elementwise
//! kernel, depending on the backend tag of its input.
//!
//! # Modules
//!
//! - [`tensors`]: Tensor data structure with a backend tag and masked operations.
//! - [`backend`]: Backend tags and the process-wide default.
//! - [`function`]: The `Function` node protocol and graph `Variable`s.
//! - [`activation`]: The `LeakyReLU` operator.
//! - [`backprop`]: Public entry points, graph and closure style.
//! - [`ops`]: Elementwise kernels, the kernel cache and their executors.
//! - [`error`]: Crate error type.
//!
//! # Example
//!
//! ```rust
//! use leaky_relu::backend::Backend;
//! use leaky_relu::backprop::leaky_relu;
//! use leaky_relu::function::Variable;
//! use leaky_relu::tensor;
//!
//! let x = Variable::new(tensor!([-2.0, -0.5, 0.0, 1.5]).on(Backend::Wgpu));
//! let y = leaky_relu(&x, 0.1)?;
//! y.set_grad(tensor!([1.0, 1.0, 1.0, 1.0]));
//! y.backward()?;
//! assert_eq!(x.grad().unwrap().data, vec![0.1, 0.1, 1.0, 1.0]);
//! # Ok::<(), leaky_relu::error::Error>(())
//! ```

pub mod activation;
pub mod backend;
pub mod backprop;
pub mod error;
pub mod function;
pub mod ops;
pub mod tensors;

pub use activation::LeakyReLU;
pub use error::{Error, Result};
