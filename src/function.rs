//! Autodiff node protocol.
//!
//! A [`Function`] is one node of a computation graph. It provides forward and
//! backward implementations for the sequential (`*_cpu`) and parallel
//! (`*_gpu`) backends; the provided [`Function::forward`] and
//! [`Function::backward`] pick one of them from the backend tag of the first
//! input, once per call.
//!
//! [`Function::apply`] runs the forward pass on [`Variable`]s and records the
//! node, so that [`Variable::backward`] can later replay it in reverse.
//!
//! ## Autograd Pattern
//!
//! 1. **Inputs** are `Variable`s wrapping a tensor.
//! 2. **Forward Pass** computes output tensors and wraps them in new variables
//!    that remember the node that created them.
//! 3. **Backward Pass** walks creators from the output, handing each node the
//!    inputs it saw and the gradients of its outputs.
//! 4. **Gradient Accumulation** sums gradients of variables used more than once.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::tensors::{Ten32, TensorFloat};
use std::cell::{Ref, RefCell};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::trace;

/// A differentiable operation with one implementation per backend.
pub trait Function {
    /// Name used in errors and logs.
    fn label(&self) -> &'static str;

    /// Number of tensors `forward` takes.
    fn input_count(&self) -> usize {
        1
    }

    /// Number of tensors `forward` returns.
    fn output_count(&self) -> usize {
        1
    }

    /// Forward pass on the sequential backend.
    fn forward_cpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>>;

    /// Forward pass on the parallel backend.
    fn forward_gpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>>;

    /// Backward pass on the sequential backend.
    fn backward_cpu(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>>;

    /// Backward pass on the parallel backend.
    fn backward_gpu(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>>;

    /// Runs the forward pass on the backend of the first input.
    ///
    /// # Errors
    /// [`Error::Arity`] on a wrong input count, otherwise whatever the chosen
    /// implementation returns.
    fn forward(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        let backend = leading_backend(self.label(), self.input_count(), inputs)?;
        trace!(function = self.label(), ?backend, "forward");
        if backend.is_parallel() {
            self.forward_gpu(inputs)
        } else {
            self.forward_cpu(inputs)
        }
    }

    /// Runs the backward pass on the backend of the first input.
    ///
    /// # Errors
    /// [`Error::Arity`] on a wrong input or gradient count, otherwise whatever
    /// the chosen implementation returns.
    fn backward(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>> {
        let backend = leading_backend(self.label(), self.input_count(), inputs)?;
        check_arity(self.label(), self.output_count(), grad_outputs.len())?;
        trace!(function = self.label(), ?backend, "backward");
        if backend.is_parallel() {
            self.backward_gpu(inputs, grad_outputs)
        } else {
            self.backward_cpu(inputs, grad_outputs)
        }
    }

    /// Applies the function to variables and records it in the graph.
    ///
    /// # Errors
    /// Propagates errors from [`Function::forward`]; [`Error::Arity`] if the
    /// forward pass returns the wrong number of outputs.
    fn apply(self, inputs: &[&Variable]) -> Result<Vec<Variable>>
    where
        Self: Sized + 'static,
    {
        let outputs = {
            let guards: Vec<Ref<'_, Ten32>> = inputs.iter().map(|v| v.data()).collect();
            let tensors: Vec<&Ten32> = guards.iter().map(|g| &**g).collect();
            self.forward(&tensors)?
        };
        check_arity(self.label(), self.output_count(), outputs.len())?;

        let rank = inputs
            .iter()
            .filter_map(|v| v.creator())
            .map(|node| node.rank + 1)
            .max()
            .unwrap_or(0);
        let output_meta = outputs
            .iter()
            .map(|t| (t.shape.clone(), t.backend()))
            .collect();

        let variables: Vec<Variable> = outputs.into_iter().map(Variable::new).collect();
        let node = Rc::new(Node {
            function: Box::new(self),
            inputs: inputs.iter().map(|v| (*v).clone()).collect(),
            outputs: variables.iter().map(|v| Rc::downgrade(&v.0)).collect(),
            output_meta,
            rank,
        });
        for variable in &variables {
            variable.0.borrow_mut().creator = Some(Rc::clone(&node));
        }

        Ok(variables)
    }
}

fn check_arity(function: &'static str, expected: usize, found: usize) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(Error::Arity {
            function,
            expected,
            found,
        })
    }
}

fn leading_backend(function: &'static str, expected: usize, inputs: &[&Ten32]) -> Result<Backend> {
    check_arity(function, expected, inputs.len())?;
    inputs.first().map(|t| t.backend()).ok_or(Error::Arity {
        function,
        expected,
        found: 0,
    })
}

struct Slot {
    data: Ten32,
    grad: Option<Ten32>,
    creator: Option<Rc<Node>>,
}

/// A graph value: a tensor, its gradient once computed, and the node that
/// produced it.
///
/// Cloning a `Variable` yields another handle to the same value.
#[derive(Clone)]
pub struct Variable(Rc<RefCell<Slot>>);

impl Variable {
    /// Wraps a tensor as a graph leaf.
    #[must_use]
    pub fn new(data: Ten32) -> Self {
        Self(Rc::new(RefCell::new(Slot {
            data,
            grad: None,
            creator: None,
        })))
    }

    /// The wrapped tensor.
    ///
    /// # Panics
    /// If the variable is mutably borrowed, which only happens inside
    /// [`Variable::set_grad`] and [`Variable::backward`].
    pub fn data(&self) -> Ref<'_, Ten32> {
        Ref::map(self.0.borrow(), |slot| &slot.data)
    }

    /// The gradient, once computed or set.
    #[must_use]
    pub fn grad(&self) -> Option<Ten32> {
        self.0.borrow().grad.clone()
    }

    /// Sets the gradient that [`Variable::backward`] starts from.
    pub fn set_grad(&self, grad: Ten32) {
        self.0.borrow_mut().grad = Some(grad);
    }

    /// Forgets the gradient.
    pub fn clear_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    /// The node that produced this variable; `None` for leaves.
    #[must_use]
    pub fn creator(&self) -> Option<Rc<Node>> {
        self.0.borrow().creator.clone()
    }

    /// Backpropagates from this variable to every variable it depends on.
    ///
    /// A single-element variable without a gradient is seeded with `1`.
    /// Gradients of variables reached along several paths are summed.
    ///
    /// # Errors
    /// - [`Error::MissingGradient`] if no gradient is set and the variable has
    ///   more than one element
    /// - anything a node's backward pass returns
    pub fn backward(&self) -> Result<()> {
        {
            let mut slot = self.0.borrow_mut();
            if slot.grad.is_none() {
                if slot.data.len() != 1 {
                    return Err(Error::MissingGradient(slot.data.len()));
                }
                slot.grad = Some(slot.data.full_like(1.0));
            }
        }

        let mut queue = BinaryHeap::new();
        let mut pending = HashMap::new();
        if let Some(node) = self.creator() {
            enqueue(node, &mut queue, &mut pending);
        }

        while let Some((_, key)) = queue.pop() {
            let Some(node) = pending.remove(&key) else {
                continue;
            };

            let grad_outputs = node.grad_outputs();
            let grad_inputs = {
                let guards: Vec<Ref<'_, Ten32>> = node.inputs.iter().map(|v| v.data()).collect();
                let tensors: Vec<&Ten32> = guards.iter().map(|g| &**g).collect();
                let grads: Vec<&Ten32> = grad_outputs.iter().collect();
                node.function.backward(&tensors, &grads)?
            };
            check_arity(node.label(), node.inputs.len(), grad_inputs.len())?;

            for (input, gx) in node.inputs.iter().zip(grad_inputs) {
                let creator = {
                    let mut slot = input.0.borrow_mut();
                    match &mut slot.grad {
                        Some(acc) => acc.accumulate(&gx)?,
                        empty => *empty = Some(gx),
                    }
                    slot.creator.clone()
                };
                if let Some(creator) = creator {
                    enqueue(creator, &mut queue, &mut pending);
                }
            }
        }

        Ok(())
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.0.borrow();
        f.debug_struct("Variable")
            .field("data", &slot.data)
            .field("grad", &slot.grad)
            .field("creator", &slot.creator.as_ref().map(|n| n.label()))
            .finish()
    }
}

// nodes are popped highest rank first, so every consumer of a variable runs
// before its producer
fn enqueue(
    node: Rc<Node>,
    queue: &mut BinaryHeap<(usize, usize)>,
    pending: &mut HashMap<usize, Rc<Node>>,
) {
    let key = Rc::as_ptr(&node) as usize;
    if !pending.contains_key(&key) {
        queue.push((node.rank, key));
        pending.insert(key, node);
    }
}

/// A recorded application of a [`Function`].
pub struct Node {
    function: Box<dyn Function>,
    inputs: Vec<Variable>,
    outputs: Vec<Weak<RefCell<Slot>>>,
    output_meta: Vec<(Vec<usize>, Backend)>,
    rank: usize,
}

impl Node {
    /// Label of the recorded function.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.function.label()
    }

    /// The variables the function was applied to.
    #[must_use]
    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    /// Distance from the graph leaves.
    #[must_use]
    pub const fn rank(&self) -> usize {
        self.rank
    }

    // outputs that were dropped or never received a gradient contribute zeros
    fn grad_outputs(&self) -> Vec<Ten32> {
        self.outputs
            .iter()
            .zip(&self.output_meta)
            .map(|(output, (shape, backend))| {
                output
                    .upgrade()
                    .and_then(|slot| slot.borrow().grad.clone())
                    .unwrap_or_else(|| zeros(shape, *backend))
            })
            .collect()
    }
}

fn zeros(shape: &[usize], backend: Backend) -> Ten32 {
    let len = shape.iter().product();
    Ten32::new(shape.to_vec(), vec![TensorFloat::default(); len]).on(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    /// `y = k * x`
    struct Scale(TensorFloat);

    impl Scale {
        fn scaled(&self, t: &Ten32) -> Ten32 {
            let mut out = t.clone();
            out.data.iter_mut().for_each(|v| *v *= self.0);
            out
        }
    }

    impl Function for Scale {
        fn label(&self) -> &'static str {
            "Scale"
        }

        fn forward_cpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>> {
            Ok(vec![self.scaled(inputs[0])])
        }

        fn forward_gpu(&self, inputs: &[&Ten32]) -> Result<Vec<Ten32>> {
            // marks the parallel path
            let mut out = self.scaled(inputs[0]);
            out.data.iter_mut().for_each(|v| *v += 1000.0);
            Ok(vec![out])
        }

        fn backward_cpu(&self, _: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>> {
            Ok(vec![self.scaled(grad_outputs[0])])
        }

        fn backward_gpu(&self, inputs: &[&Ten32], grad_outputs: &[&Ten32]) -> Result<Vec<Ten32>> {
            self.backward_cpu(inputs, grad_outputs)
        }
    }

    #[test]
    fn forward_follows_the_tag_of_the_first_input() {
        let cpu = Tensor::new(vec![1], vec![2.0]).on(Backend::Cpu);
        let gpu = cpu.clone().on(Backend::Wgpu);
        assert_eq!(Scale(3.0).forward(&[&cpu]).unwrap()[0].data, vec![6.0]);
        assert_eq!(Scale(3.0).forward(&[&gpu]).unwrap()[0].data, vec![1006.0]);
    }

    #[test]
    fn wrong_input_counts_are_reported() {
        let x = Tensor::new(vec![1], vec![2.0]);
        assert!(matches!(
            Scale(1.0).forward(&[]),
            Err(Error::Arity { expected: 1, found: 0, .. })
        ));
        assert!(matches!(
            Scale(1.0).backward(&[&x], &[&x, &x]),
            Err(Error::Arity { expected: 1, found: 2, .. })
        ));
    }

    #[test]
    fn apply_records_the_creator() {
        let x = Variable::new(Tensor::new(vec![2], vec![1.0, -1.0]).on(Backend::Cpu));
        let y = Scale(2.0).apply(&[&x]).unwrap().remove(0);
        assert_eq!(y.data().data, vec![2.0, -2.0]);
        let node = y.creator().unwrap();
        assert_eq!(node.label(), "Scale");
        assert_eq!(node.rank(), 0);
        assert!(x.creator().is_none());
    }

    #[test]
    fn scalar_outputs_seed_their_own_gradient() {
        let x = Variable::new(Tensor::new(vec![1], vec![4.0]).on(Backend::Cpu));
        let y = Scale(3.0).apply(&[&x]).unwrap().remove(0);
        y.backward().unwrap();
        assert_eq!(y.grad().unwrap().data, vec![1.0]);
        assert_eq!(x.grad().unwrap().data, vec![3.0]);
    }

    #[test]
    fn non_scalar_outputs_need_an_explicit_gradient() {
        let x = Variable::new(Tensor::new(vec![2], vec![4.0, 5.0]).on(Backend::Cpu));
        let y = Scale(3.0).apply(&[&x]).unwrap().remove(0);
        assert!(matches!(y.backward(), Err(Error::MissingGradient(2))));
    }

    #[test]
    fn chains_and_shared_inputs_accumulate() {
        // z = 2 * (3 * x) + 5 * x, reached through two paths
        let x = Variable::new(Tensor::new(vec![1], vec![1.0]).on(Backend::Cpu));
        let a = Scale(3.0).apply(&[&x]).unwrap().remove(0);
        let b = Scale(2.0).apply(&[&a]).unwrap().remove(0);
        let c = Scale(5.0).apply(&[&x]).unwrap().remove(0);
        assert_eq!(b.creator().unwrap().rank(), 1);

        b.backward().unwrap();
        c.backward().unwrap();
        assert_eq!(a.grad().unwrap().data, vec![2.0]);
        assert_eq!(x.grad().unwrap().data, vec![11.0]);
    }
}
