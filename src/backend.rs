//! Backend selection module.
//!
//! Every tensor carries a [`Backend`] tag, and operators pick their execution
//! path from the tag on their first input. This module defines the tag and a
//! process-wide default that freshly created tensors inherit.
//!
//! # Supported Backends
//!
//! - `Cpu`: sequential host execution (default).
//! - `Wgpu`: data-parallel execution through cached elementwise kernels,
//!   on the GPU when the `wgpu` feature is enabled and a device exists,
//!   otherwise spread across host threads with `rayon`.
//! - `Cuda`: routed to the same parallel path as `Wgpu`.
//!
//! The default is stored globally using an `AtomicU8`, enabling fast
//! switching between CPU and GPU modes at runtime.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Backend {
    /// Sequential host execution (default).
    #[default]
    Cpu = 0,
    /// Data-parallel execution through compiled elementwise kernels.
    Wgpu,
    /// Placeholder for CUDA; shares the `Wgpu` execution path.
    Cuda,
}

impl Backend {
    /// Returns `true` for backends that run through the elementwise kernel cache.
    #[must_use]
    pub const fn is_parallel(self) -> bool {
        matches!(self, Self::Wgpu | Self::Cuda)
    }
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            2 => Ok(Self::Cuda),
            _ => Err(()),
        }
    }
}

/// Backend tag given to tensors created without an explicit one.
static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the backend newly created tensors are tagged with.
///
/// Tensors that already exist keep their tag.
///
/// # Example
///
/// ```
/// use leaky_relu::backend::{set_backend, Backend};
/// set_backend(Backend::Wgpu);
/// # set_backend(Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the backend newly created tensors are tagged with.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
