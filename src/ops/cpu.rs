//! Parallel host execution of elementwise kernels.
//!
//! When no GPU is available, the parallel backend still runs its kernels
//! data-parallel: every output element is computed independently by the
//! kernel's host rule, spread across threads with [`rayon`](https://docs.rs/rayon).
//!
//! Each element depends only on the operands at the same index, so the
//! result does not depend on how `rayon` splits the work.

use super::kernel::ElementwiseKernel;
use crate::tensors::{Ten32, TensorFloat};
use rayon::prelude::*;

/// Evaluates `kernel.host` for every element of `out`.
///
/// Operand count and shapes are checked by the caller
/// ([`CachedKernel::launch`](super::kernel::CachedKernel::launch)).
pub(crate) fn launch_host(
    kernel: &ElementwiseKernel,
    out: &mut Ten32,
    operands: &[&Ten32],
    scalars: &[TensorFloat],
) {
    let rule = kernel.host;
    let arity = operands.len();

    out.data.par_iter_mut().enumerate().for_each_init(
        || vec![0.0; arity],
        |values, (i, y)| {
            for (slot, operand) in values.iter_mut().zip(operands) {
                *slot = operand.data[i];
            }
            *y = rule(values, scalars);
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    fn select_rule(values: &[TensorFloat], scalars: &[TensorFloat]) -> TensorFloat {
        if values[0] > 0.0 { values[1] } else { scalars[0] }
    }

    const SELECT: ElementwiseKernel = ElementwiseKernel {
        name: "select_host_test",
        inputs: &["c", "v"],
        scalars: &["fill"],
        operation: "select(fill, v, c > 0.0)",
        host: select_rule,
    };

    #[test]
    fn host_launch_reads_operands_at_the_same_index() {
        let n = 10_000;
        let cond = Tensor::new(
            vec![n],
            (0..n).map(|i| if i % 3 == 0 { 1.0 } else { -1.0 }).collect(),
        );
        let values = Tensor::new(vec![n], (0..n).map(|i| i as TensorFloat).collect());
        let mut out = values.empty_like();

        launch_host(&SELECT, &mut out, &[&cond, &values], &[-7.0]);

        for (i, y) in out.data.iter().enumerate() {
            let expected = if i % 3 == 0 { i as TensorFloat } else { -7.0 };
            assert_eq!(*y, expected, "element {i}");
        }
    }
}
