//! Public entry points for the leaky ReLU activation.
//!
//! Two calling conventions are offered:
//!
//! - **Graph style**: [`leaky_relu`] applies the operator to a [`Variable`]
//!   and records it, so [`Variable::backward`] reaches the input later.
//! - **Closure style**: [`leaky_relu_with_grad`] returns the output tensor
//!   together with a closure mapping `dL/d(out)` to `dL/d(input)`.
//!
//! In both cases the backend is chosen from the tag of the input tensor.

use crate::activation::LeakyReLU;
use crate::error::{Error, Result};
use crate::function::{Function, Variable};
use crate::tensors::{Ten32, TensorFloat, WithGrad};

/// Closure mapping an upstream gradient to the gradient of the input.
pub type BackFn<'a> = dyn Fn(&Ten32) -> Result<Ten32> + 'a;

fn single<T>(outputs: Vec<T>) -> Result<T> {
    let found = outputs.len();
    let mut outputs = outputs.into_iter();
    match (outputs.next(), outputs.next()) {
        (Some(only), None) => Ok(only),
        _ => Err(Error::Arity {
            function: "LeakyReLU",
            expected: 1,
            found,
        }),
    }
}

/// Applies the leaky ReLU `f(x) = max(x, slope * x)` (for `0 <= slope <= 1`)
/// elementwise and records it in the graph.
///
/// # Errors
/// Propagates tensor and kernel errors from the forward pass.
///
/// # Example
/// ```rust
/// use leaky_relu::{backprop::leaky_relu, function::Variable, tensor};
///
/// let x = Variable::new(tensor!([3.0, -3.0]));
/// let y = leaky_relu(&x, 0.2).unwrap();
/// assert_eq!(y.data().data, vec![3.0, 0.2 * -3.0]);
/// ```
pub fn leaky_relu(x: &Variable, slope: TensorFloat) -> Result<Variable> {
    single(LeakyReLU::new(slope).apply(&[x])?)
}

/// [`leaky_relu`] with the default slope of `0.2`.
///
/// # Errors
/// Propagates tensor and kernel errors from the forward pass.
pub fn leaky_relu_default(x: &Variable) -> Result<Variable> {
    leaky_relu(x, LeakyReLU::DEFAULT_SLOPE)
}

/// Applies the leaky ReLU to `input.value`, returning the output and a
/// backward closure.
///
/// # Returns
/// - `out`: Tensor with negatives scaled by `slope`.
/// - `back`: Closure mapping `dL/d(out)` to `dL/d(input)`, scaling gradients
///   where the input is negative.
///
/// # Errors
/// Propagates tensor and kernel errors; the closure does the same.
///
/// # Example
/// ```rust
/// use leaky_relu::{backprop::leaky_relu_with_grad, tensor, tensors::WithGrad};
///
/// let input = WithGrad::new(tensor!([[-1.0, 2.0], [0.0, -4.0]]));
/// let (out, back) = leaky_relu_with_grad(&input, 0.5).unwrap();
/// let grad_in = back(&tensor!([[1.0, 1.0], [1.0, 1.0]])).unwrap();
/// assert_eq!(out.data, vec![-0.5, 2.0, 0.0, -2.0]);
/// assert_eq!(grad_in.data, vec![0.5, 1.0, 1.0, 0.5]);
/// ```
pub fn leaky_relu_with_grad(
    input: &WithGrad<Ten32>,
    slope: TensorFloat,
) -> Result<(Ten32, Box<BackFn<'_>>)> {
    let function = LeakyReLU::new(slope);
    let out = single(function.forward(&[&input.value])?)?;

    let back = move |grad_output: &Ten32| {
        single(function.backward(&[&input.value], &[grad_output])?)
    };

    Ok((out, Box::new(back)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::tensors::Tensor;

    #[test]
    fn graph_entry_records_a_leaky_relu_node() {
        let x = Variable::new(Tensor::new(vec![2], vec![3.0, -3.0]).on(Backend::Cpu));
        let y = leaky_relu_default(&x).unwrap();
        assert_eq!(y.data().data, vec![3.0, 0.2 * -3.0]);
        assert_eq!(y.creator().unwrap().label(), "LeakyReLU");
    }

    #[test]
    fn graph_backward_reaches_the_input() {
        let x = Variable::new(Tensor::new(vec![4], vec![-2.0, -0.5, 0.0, 1.5]).on(Backend::Wgpu));
        let y = leaky_relu(&x, 0.1).unwrap();
        y.set_grad(Tensor::new(vec![4], vec![1.0; 4]).on(Backend::Wgpu));
        y.backward().unwrap();
        assert_eq!(x.grad().unwrap().data, vec![0.1, 0.1, 1.0, 1.0]);
    }

    #[test]
    fn closure_entry_can_be_called_repeatedly() {
        let input = WithGrad::new(Tensor::new(vec![2], vec![-1.0, 1.0]).on(Backend::Cpu));
        let (out, back) = leaky_relu_with_grad(&input, 0.25).unwrap();
        assert_eq!(out.data, vec![-0.25, 1.0]);

        let g = Tensor::new(vec![2], vec![4.0, 4.0]);
        assert_eq!(back(&g).unwrap().data, vec![1.0, 4.0]);
        assert_eq!(back(&g).unwrap().data, vec![1.0, 4.0]);
    }

    #[test]
    fn single_rejects_unexpected_output_counts() {
        assert_eq!(single(vec![7]).unwrap(), 7);
        assert!(matches!(single::<u8>(vec![]), Err(Error::Arity { found: 0, .. })));
        assert!(matches!(single(vec![1, 2]), Err(Error::Arity { found: 2, .. })));
    }
}
