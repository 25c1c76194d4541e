//! Elementwise kernels and the process-wide kernel cache.
//!
//! An [`ElementwiseKernel`] describes a per-element rule twice: as a WGSL
//! expression for the device and as a plain function for the host. Kernels
//! are compiled once, on first use, and kept for the lifetime of the process
//! in a cache keyed by their [signature](ElementwiseKernel::signature).
//!
//! Operands are bound positionally: tensor operands first, in the order of
//! [`ElementwiseKernel::inputs`], then scalar parameters in the order of
//! [`ElementwiseKernel::scalars`]. The result is written to a separate output
//! tensor of the same shape.

use crate::error::{Error, Result};
use crate::tensors::{Ten32, TensorFloat};
use briny::prelude::*;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Per-element host rule: `(tensor operand values, scalars) -> output value`.
pub type HostRule = fn(&[TensorFloat], &[TensorFloat]) -> TensorFloat;

/// Definition of an elementwise kernel.
#[derive(Debug, Clone, Copy)]
pub struct ElementwiseKernel {
    /// Kernel name, also used as the label of device objects.
    pub name: &'static str,
    /// Names of the tensor operands, in binding order.
    pub inputs: &'static [&'static str],
    /// Names of the scalar parameters, in binding order.
    pub scalars: &'static [&'static str],
    /// WGSL expression producing the output element. It may refer to every
    /// operand and scalar by name.
    pub operation: &'static str,
    /// The same rule evaluated on the host.
    pub host: HostRule,
}

impl ElementwiseKernel {
    /// Cache key: name, operand list and operation.
    #[must_use]
    pub fn signature(&self) -> String {
        format!(
            "{}({};{}) -> {}",
            self.name,
            self.inputs.join(","),
            self.scalars.join(","),
            self.operation
        )
    }

    /// Compute shader source for the kernel.
    ///
    /// Bindings `0..n` hold the tensor operands, binding `n` the scalar
    /// parameters and binding `n + 1` the output.
    #[must_use]
    pub fn wgsl(&self) -> String {
        let n = self.inputs.len();
        let mut src = String::new();

        for (binding, input) in self.inputs.iter().enumerate() {
            let _ = writeln!(
                src,
                "@group(0) @binding({binding}) var<storage, read> in_{input}: array<f32>;"
            );
        }
        let _ = writeln!(
            src,
            "@group(0) @binding({n}) var<storage, read> scalars: array<f32>;"
        );
        let _ = writeln!(
            src,
            "@group(0) @binding({}) var<storage, read_write> result: array<f32>;",
            n + 1
        );

        src.push_str("\n@compute @workgroup_size(64)\n");
        src.push_str("fn main(@builtin(global_invocation_id) gid: vec3<u32>) {\n");
        src.push_str("    let i = gid.x;\n");
        src.push_str("    if (i >= arrayLength(&result)) {\n        return;\n    }\n");
        for input in self.inputs {
            let _ = writeln!(src, "    let {input} = in_{input}[i];");
        }
        for (idx, scalar) in self.scalars.iter().enumerate() {
            let _ = writeln!(src, "    let {scalar} = scalars[{idx}u];");
        }
        let _ = writeln!(src, "    result[i] = {};", self.operation);
        src.push_str("}\n");
        src
    }
}

// locals and bindings of the generated shader, WGSL keywords and the
// builtins operations are expected to call
const RESERVED: &[&str] = &[
    "i", "gid", "main", "result", "scalars", "alias", "array", "bitcast", "bool", "break",
    "case", "const", "const_assert", "continue", "continuing", "default", "diagnostic",
    "discard", "else", "enable", "f16", "f32", "false", "fn", "for", "i32", "if", "let",
    "loop", "override", "ptr", "requires", "return", "sampler", "struct", "switch", "true",
    "u32", "var", "vec2", "vec3", "vec4", "while", "abs", "arrayLength", "clamp", "exp",
    "max", "min", "select", "sign", "sqrt",
];

fn is_operand_name(name: &str) -> bool {
    is_identifier(name)
        && !name.starts_with("__")
        && !name.starts_with("in_")
        && !RESERVED.contains(&name)
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Validate for ElementwiseKernel {
    fn validate(&self) -> Result<(), ValidationError> {
        if !is_identifier(self.name) || self.inputs.is_empty() || self.operation.trim().is_empty()
        {
            return Err(ValidationError);
        }

        // operands are spliced into generated source as identifiers
        let mut names: Vec<&str> = self.inputs.iter().chain(self.scalars).copied().collect();
        if !names.iter().all(|name| is_operand_name(name)) {
            return Err(ValidationError);
        }
        names.sort_unstable();
        names.dedup();
        if names.len() != self.inputs.len() + self.scalars.len() {
            return Err(ValidationError);
        }

        Ok(())
    }
}

/// A validated kernel, compiled for the device when one is available.
pub struct CachedKernel {
    kernel: ElementwiseKernel,
    #[cfg(feature = "wgpu")]
    device: Option<super::wgpu::DeviceKernel>,
}

impl std::fmt::Debug for CachedKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedKernel")
            .field("signature", &self.kernel.signature())
            .field("on_device", &self.on_device())
            .finish()
    }
}

impl CachedKernel {
    fn compile(kernel: ElementwiseKernel) -> Self {
        #[cfg(feature = "wgpu")]
        let device = match super::wgpu::DeviceKernel::compile(&kernel) {
            Ok(compiled) => compiled,
            Err(err) => {
                tracing::warn!(kernel = kernel.name, error = %err, "device compilation failed, kernel runs on host");
                None
            }
        };

        Self {
            kernel,
            #[cfg(feature = "wgpu")]
            device,
        }
    }

    /// The definition this kernel was compiled from.
    #[must_use]
    pub const fn kernel(&self) -> &ElementwiseKernel {
        &self.kernel
    }

    /// Returns `true` if launches run on the GPU.
    #[must_use]
    pub fn on_device(&self) -> bool {
        #[cfg(feature = "wgpu")]
        {
            self.device.is_some()
        }
        #[cfg(not(feature = "wgpu"))]
        {
            false
        }
    }

    /// Runs the kernel over every element of `out`.
    ///
    /// # Errors
    /// - [`Error::Arity`] if the operand or scalar count does not match the definition
    /// - [`Error::ShapeMismatch`] if an operand's shape differs from `out`
    pub fn launch(
        &self,
        out: &mut Ten32,
        operands: &[&Ten32],
        scalars: &[TensorFloat],
    ) -> Result<()> {
        if operands.len() != self.kernel.inputs.len() {
            return Err(Error::Arity {
                function: self.kernel.name,
                expected: self.kernel.inputs.len(),
                found: operands.len(),
            });
        }
        if scalars.len() != self.kernel.scalars.len() {
            return Err(Error::Arity {
                function: self.kernel.name,
                expected: self.kernel.scalars.len(),
                found: scalars.len(),
            });
        }
        for operand in operands {
            out.check_same_shape(operand)?;
        }
        if out.is_empty() {
            return Ok(());
        }

        #[cfg(feature = "wgpu")]
        if let Some(device) = &self.device {
            match device.run(&mut out.data, operands, scalars) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(kernel = self.kernel.name, error = %err, "device launch failed, running on host");
                }
            }
        }

        super::cpu::launch_host(&self.kernel, out, operands, scalars);
        Ok(())
    }
}

lazy_static::lazy_static! {
    static ref KERNEL_CACHE: Mutex<HashMap<String, Arc<CachedKernel>>> = Mutex::new(HashMap::new());
}

/// Returns the cached kernel for `kernel`'s signature, compiling and caching
/// it on first request.
///
/// # Errors
/// [`Error::InvalidKernel`] if the definition fails validation.
pub fn get_or_insert(kernel: ElementwiseKernel) -> Result<Arc<CachedKernel>> {
    let signature = kernel.signature();
    let mut cache = KERNEL_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(hit) = cache.get(&signature) {
        return Ok(Arc::clone(hit));
    }

    let kernel = TrustedData::new(kernel)
        .map_err(|_| Error::InvalidKernel(signature.clone()))?
        .into_inner();
    let compiled = Arc::new(CachedKernel::compile(kernel));
    debug!(%signature, on_device = compiled.on_device(), "compiled elementwise kernel");

    cache.insert(signature, Arc::clone(&compiled));
    Ok(compiled)
}

/// Number of kernels compiled so far in this process.
pub fn cached_kernels() -> usize {
    KERNEL_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len()
}
