#![allow(clippy::multiple_crate_versions)]

//! # Adam parameter updates for name-keyed neural network layers
//!
//! This crate provides the optimizer half of a layer-based training loop: a
//! stateful [`Adam`] engine that maintains per-tensor momentum and velocity
//! accumulators and writes bias-corrected parameter updates back into layers
//! in place.
//!
//! The training loop owns everything else: forward and backward passes,
//! gradient computation, data loading. Per optimization step it calls
//! [`Adam::update`] once for each layer and [`Adam::advance_step`] exactly
//! once. Layers participate through the [`Layer`] trait, a pair of name-keyed
//! tensor maps.
//!
//! The update rule is:
//!
//! ```text
//! v_t = β2 * v_{t-1} + (1 - β2) * g_t²
//! m_t = β1 * m_{t-1} + (1 - β1) * g_t
//! m_hat = m_t / (1 - β1^t)
//! v_hat = v_t / (1 - β2^t)
//! w_t = w_{t-1} - lr * m_hat / √(v_hat + ε)
//! ```
//!
//! Accumulators are seeded lazily: the first time a (layer, gradient) pair is
//! seen, its momentum starts at `(1-β1) * g` and its velocity at
//! `(1-β2) * g²`, exactly as if the prior value had been zero. The step
//! counter `t` starts at 1 and only [`Adam::advance_step`] moves it; the
//! bias-correction exponent used by an update is whatever the counter holds
//! at call time.
//!
//! ## Examples
//!
//! ```rust
//! use adam_optim::{Adam, Configuration, Layer, Tensor};
//! use ndarray::array;
//! use std::collections::BTreeMap;
//!
//! struct Dense {
//!     params: BTreeMap<String, Tensor>,
//!     grads: BTreeMap<String, Tensor>,
//! }
//!
//! impl Layer for Dense {
//!     fn parameters(&self) -> &BTreeMap<String, Tensor> {
//!         &self.params
//!     }
//!
//!     fn parameters_mut(&mut self) -> &mut BTreeMap<String, Tensor> {
//!         &mut self.params
//!     }
//!
//!     fn gradients(&self) -> &BTreeMap<String, Tensor> {
//!         &self.grads
//!     }
//! }
//!
//! let mut layer = Dense {
//!     params: BTreeMap::from([("weight".to_owned(), array![[1.0_f32, -0.5]].into_dyn())]),
//!     grads: BTreeMap::from([("grad_weight".to_owned(), array![[0.2_f32, 0.1]].into_dyn())]),
//! };
//!
//! let config = Configuration::builder().beta1(0.9).build();
//! let learning_rate = config.learning_rate;
//! let mut optimizer = Adam::new(config);
//!
//! // One optimization step: update every layer, then advance the counter.
//! optimizer.update("dense0", &mut layer, learning_rate);
//! optimizer.advance_step();
//! ```
//!
//! ## Configuration
//!
//! Hyperparameters are carried by [`Configuration`]:
//! - `learning_rate`: base step size (default: 0.001); [`Adam::update`] takes
//!   the rate per call so a schedule can override it
//! - `beta1`: decay rate of the momentum average (default: 0.99)
//! - `beta2`: decay rate of the velocity average (default: 0.999)
//! - `epsilon`: numerical-stability constant added under the square root
//!   (default: 1e-8)
//!
//! Values are accepted as given, with no range validation, so
//! a non-positive `epsilon` or a decay rate outside (0, 1) is the caller's
//! own experiment.
//!
//! ## Pairing discipline
//!
//! [`Adam::update`] pairs parameters with gradients positionally after
//! sorting each name set, the convention inherited from dictionary-based
//! layer implementations. The pairing silently produces wrong results if a
//! layer's parameter and gradient name sets diverge structurally, so a size
//! divergence is logged at warn level, and [`Adam::update_declared`] accepts
//! an explicit correspondence table and fails on unknown names instead.
//!
//! ## Implementation Notes
//!
//! - Tensors are [`ndarray`] dynamic-rank arrays of `f32`
//! - Elementwise traversal is parallelized via rayon
//! - Accumulator maps grow on first sight of a tensor and never shrink
//! - Shape mismatches surface as panics from the underlying array
//!   operations, not as optimizer errors
//!
//! ## Reference
//!
//! Kingma, D. P., & Ba, J. (2015). Adam: A Method for Stochastic
//! Optimization. <https://arxiv.org/abs/1412.6980>

// Submodule imports
mod layer;
mod optimizer;


use bon::Builder;
use thiserror::Error;

pub use crate::layer::{Layer, Tensor};
pub use crate::optimizer::Adam;

/// Hyperparameters for the [`Adam`] engine.
///
/// All values are taken as configuration without range validation.
#[derive(Builder, Clone, Debug)]
pub struct Configuration {
    /// Base step size (α). [`Adam::update`] accepts the rate explicitly per
    /// call, so this is the value to pass when no schedule adjusts it.
    #[builder(default = 0.001)]
    pub learning_rate: f32,

    /// Exponential decay rate of the momentum (first moment) average
    #[builder(default = 0.99)]
    pub beta1: f32,

    /// Exponential decay rate of the velocity (second moment) average
    #[builder(default = 0.999)]
    pub beta2: f32,

    /// Numerical-stability constant added to `v_hat` under the square root
    #[builder(default = 1e-8)]
    pub epsilon: f32,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.99,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Errors that can occur during declared-pairing updates.
///
/// The positional [`Adam::update`] path raises nothing; only
/// [`Adam::update_declared`] validates names against the layer.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdamError {
    /// A correspondence table entry names a parameter the layer does not have
    #[error("declared pairing references unknown parameter {0:?}")]
    MissingParameter(String),

    /// A correspondence table entry names a gradient the layer does not have
    #[error("declared pairing references unknown gradient {0:?}")]
    MissingGradient(String),
}
