//! # Parallel Execution Layer
//!
//! Operators that run on a parallel backend ([`Backend::Wgpu`] or
//! [`Backend::Cuda`]) do their work through elementwise kernels. This module
//! holds the kernel definitions and cache, and the executors behind them.
//!
//! ## Submodules
//!
//! - [`kernel`]: kernel definitions and the process-wide compiled-kernel cache
//! - [`cpu`]: data-parallel host executor built on `rayon`
//! - [`wgpu`] *(opt-in)*: compute-shader executor using `wgpu`
//!
//! ## Fallback
//!
//! A kernel runs on the GPU when the `wgpu` feature is enabled and a device
//! could be acquired; otherwise, or when a device launch fails, it runs on
//! the host executor. Both apply the same per-element rule.
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables `wgpu` (WebGPU) execution
//! - `cuda`: Enables the `Cuda` tag's device path (dispatches to WGPU)
//!
//! [`Backend::Wgpu`]: crate::backend::Backend::Wgpu
//! [`Backend::Cuda`]: crate::backend::Backend::Cuda

pub mod kernel;
pub(crate) mod cpu;
#[cfg(feature = "wgpu")]
pub mod wgpu;
