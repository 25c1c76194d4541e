//! Leaky rectified linear unit.
//!
//! `f(x) = x` for `x >= 0` and `f(x) = slope * x` otherwise, so the derivative
//! is `1` on the non-negative branch and `slope` on the negative one. Both
//! passes branch on the original input `x`.
//!
//! Both backends scale exactly where `x < 0` holds: the sequential path
//! copies its operand and scales the masked positions, the parallel kernel
//! selects the scaled value under the same test. Zero and NaN inputs take the
//! unscaled branch on either backend.

use crate::error::Result;
use crate::function::Function;
use crate::ops::kernel::{self, CachedKernel, ElementwiseKernel};
use crate::tensors::{Ten32, TensorFloat};
use std::sync::Arc;

fn lrelu_rule(values: &[TensorFloat], scalars: &[TensorFloat]) -> TensorFloat {
    let (cond, x, slope) = (values[0], values[1], scalars[0]);
    if cond < 0.0 { slope * x } else { x }
}

/// `y[i] = cond[i] < 0 ? slope * x[i] : x[i]`
const LRELU: ElementwiseKernel = ElementwiseKernel {
    name: "lrelu",
    inputs: &["cond", "x"],
    scalars: &["slope"],
    operation: "select(x, slope * x, cond < 0.0)",
    host: lrelu_rule,
};

fn lrelu_kernel() -> Result<Arc<CachedKernel>> {
    kernel::get_or_insert(LRELU)
}

/// Leaky rectifier unit.
///
/// The slope is fixed at construction and is not validated: negative values
/// and values above one are used as given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyReLU {
    slope: TensorFloat,
}

impl LeakyReLU {
    /// Slope used by [`LeakyReLU::default`].
    pub const DEFAULT_SLOPE: TensorFloat = 0.2;

    /// Creates the operator with the given negative-branch slope.
    #[must_use]
    pub const fn new(slope: TensorFloat) -> Self {
        Self { slope }
    }

    /// The negative-branch slope.
    #[must_use]
    pub const fn slope(&self) -> TensorFloat {
        self.slope
    }

    /// Copies `values` and scales it where `x` is negative.
    fn scale_negative(&self, x: &Ten32, values: &Ten32) -> Result<Ten32> {
        let mut out = values.clone();
        out.scale_where(&x.lt(0.0), self.slope)?;
        Ok(out)
    }

    /// Runs the cached kernel with condition `x` and value operand `values`.
    fn launch(&self, x: &Ten32, values: &Ten32) -> Result<Ten32> {
        let mut out = x.empty_like();
        lrelu_kernel()?.launch(&mut out, &[x, values], &[self.slope])?;
        Ok(out)
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SLOPE)
    }
}

impl Function for LeakyReLU {
    fn label(&self) -> &'static str {
        "LeakyReLU"
    }

    fn forward_cpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        let x = inputs[0];
        Ok(vec![self.scale_negative(x, x)?])
    }

    fn forward_gpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        let x = inputs[0];
        Ok(vec![self.launch(x, x)?])
    }

    fn backward_cpu(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        Ok(vec![self.scale_negative(inputs[0], grad_outputs[0])?])
    }

    fn backward_gpu(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        Ok(vec![self.launch(inputs[0], grad_outputs[0])?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::error::Error;
    use crate::tensors::Tensor;

    fn on(backend: Backend, data: &[TensorFloat]) -> Ten32 {
        Tensor::new(vec![data.len()], data.to_vec()).on(backend)
    }

    #[test]
    fn default_slope_is_one_fifth() {
        assert_eq!(LeakyReLU::default().slope(), 0.2);
        assert_eq!(LeakyReLU::default(), LeakyReLU::new(0.2));
    }

    #[test]
    fn forward_scales_only_negative_inputs_on_both_backends() {
        let f = LeakyReLU::new(0.1);
        for backend in [Backend::Cpu, Backend::Wgpu] {
            let x = on(backend, &[-2.0, -0.5, 0.0, 1.5]);
            let y = f.forward(&[&x]).unwrap().remove(0);
            assert_eq!(y.data, vec![0.1 * -2.0, 0.1 * -0.5, 0.0, 1.5], "{backend:?}");
            assert_eq!(y.backend(), backend);
        }
    }

    #[test]
    fn backward_masks_on_the_input_not_the_gradient() {
        let f = LeakyReLU::new(0.1);
        for backend in [Backend::Cpu, Backend::Wgpu] {
            let x = on(backend, &[-2.0, -0.5, 0.0, 1.5]);
            let gy = on(backend, &[-1.0, 1.0, -1.0, 1.0]);
            let gx = f.backward(&[&x], &[&gy]).unwrap().remove(0);
            assert_eq!(gx.data, vec![0.1 * -1.0, 0.1, -1.0, 1.0], "{backend:?}");
        }
    }

    #[test]
    fn unusual_slopes_are_accepted_as_given() {
        for slope in [-1.5, 0.0, 3.0] {
            let f = LeakyReLU::new(slope);
            let x = on(Backend::Cpu, &[-2.0, 2.0]);
            let y = f.forward(&[&x]).unwrap().remove(0);
            assert_eq!(y.data, vec![slope * -2.0, 2.0]);
        }
    }

    #[test]
    fn mismatched_gradient_shapes_surface_from_the_tensor_layer() {
        let f = LeakyReLU::default();
        for backend in [Backend::Cpu, Backend::Wgpu] {
            let x = on(backend, &[1.0, 2.0]);
            let gy = on(backend, &[1.0, 2.0, 3.0]);
            assert!(matches!(
                f.backward(&[&x], &[&gy]),
                Err(Error::ShapeMismatch { .. })
            ));
        }
    }

    #[test]
    fn kernel_is_compiled_once_per_process() {
        let first = lrelu_kernel().unwrap();
        let second = lrelu_kernel().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kernel().name, "lrelu");
    }

    #[test]
    fn host_rule_leaves_zero_and_nan_unscaled() {
        assert_eq!(lrelu_rule(&[0.0, 5.0], &[0.5]), 5.0);
        assert_eq!(lrelu_rule(&[-0.0, 5.0], &[0.5]), 5.0);
        assert_eq!(lrelu_rule(&[-1.0, 5.0], &[0.5]), 2.5);
        assert_eq!(lrelu_rule(&[TensorFloat::NAN, 5.0], &[0.5]), 5.0);
    }
}
