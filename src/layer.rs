//! The contract between the optimizer and a trainable layer.
//!
//! A layer owns its parameter and gradient tensors; the optimizer only reads
//! the gradients and overwrites the parameters in place. Both collections are
//! name-keyed `BTreeMap`s so iteration always visits tensors in ascending
//! sorted name order, which is the order the pairing discipline in
//! [`Adam::update`](crate::Adam::update) relies on.

use ndarray::ArrayD;
use std::collections::BTreeMap;

/// Dynamically-shaped tensor of `f32` values.
///
/// Parameters, gradients, and the optimizer's internal accumulators all share
/// this representation, so a gradient of any rank pairs with an accumulator
/// of the same rank without conversion.
pub type Tensor = ArrayD<f32>;

/// A set of trainable tensors exposed to the optimizer.
///
/// Implementations live in the training code that owns the forward and
/// backward passes; this crate never constructs layers itself. The optimizer
/// assumes the structural invariant that the sorted parameter names and the
/// sorted gradient names correspond positionally: the first sorted gradient
/// name holds the gradient of the tensor stored under the first sorted
/// parameter name, and so on. Nothing checks that the names themselves match,
/// and they usually don't (`"weight"` vs. `"grad_weight"`).
///
/// Gradients are expected to be refreshed by the backward pass before each
/// [`Adam::update`](crate::Adam::update) call and must have the same shape as
/// the parameter they correspond to.
pub trait Layer {
    /// Parameter tensors keyed by name, in ascending sorted name order.
    fn parameters(&self) -> &BTreeMap<String, Tensor>;

    /// Mutable view of the parameter tensors. The optimizer writes updated
    /// values through this map; it never inserts or removes entries.
    fn parameters_mut(&mut self) -> &mut BTreeMap<String, Tensor>;

    /// Gradient tensors keyed by name, in ascending sorted name order.
    fn gradients(&self) -> &BTreeMap<String, Tensor>;
}
