//! Adam optimizer state and bias-corrected update arithmetic.
//!
//! This module holds the crate's numeric core: the per-tensor momentum and
//! velocity accumulators, the step counter driving bias correction, and the
//! in-place parameter update. Accumulators are created lazily the first time
//! a (layer, gradient) pair is seen and live for the rest of the optimizer's
//! lifetime; the maps grow but never shrink.

use crate::layer::{Layer, Tensor};
use crate::{AdamError, Configuration};
use ndarray::Zip;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Identifies one accumulator tensor across the lifetime of the optimizer.
///
/// A composite of the layer identifier supplied by the training loop and the
/// gradient name within that layer. Keeping the components separate rather
/// than concatenating them means similarly-named layers such as `"dense1"` +
/// `"2w"` and `"dense12"` + `"w"` can never collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct AccumulatorKey {
    layer: String,
    gradient: String,
}

impl AccumulatorKey {
    fn new(layer: &str, gradient: &str) -> Self {
        Self {
            layer: layer.to_owned(),
            gradient: gradient.to_owned(),
        }
    }
}

/// Adam (adaptive moment estimation) state and update engine.
///
/// Owns the exponential moving averages of gradients (momentum) and squared
/// gradients (velocity) for every trainable tensor it has seen, plus the step
/// counter used as the bias-correction exponent. Each instance is fully
/// independent, so several training runs can hold their own optimizer
/// concurrently without sharing state.
///
/// The engine is driven by two calls from the training loop:
/// [`update`](Adam::update) once per layer per step, and
/// [`advance_step`](Adam::advance_step) exactly once per step. The two are
/// deliberately decoupled: the bias-correction exponent used during an update
/// is whatever the counter holds at that moment, and the caller is
/// responsible for invoking both in the right cadence.
#[derive(Clone, Debug)]
pub struct Adam {
    config: Configuration,
    momentum: HashMap<AccumulatorKey, Tensor>,
    velocity: HashMap<AccumulatorKey, Tensor>,
    step: u32,
}

impl Adam {
    /// Creates an optimizer with the given hyperparameters and no
    /// accumulator state. The step counter starts at 1.
    #[must_use]
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            momentum: HashMap::new(),
            velocity: HashMap::new(),
            step: 1,
        }
    }

    /// Advances the step counter by 1.
    ///
    /// Must be called exactly once per optimization step, not once per
    /// layer. Updates performed afterwards use the new counter value as the
    /// bias-correction exponent.
    pub fn advance_step(&mut self) {
        self.step += 1;
    }

    /// Current value of the step counter.
    #[must_use]
    pub fn step(&self) -> u32 {
        self.step
    }

    /// The hyperparameters this optimizer was constructed with.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Momentum accumulator for a (layer, gradient) pair, if that pair has
    /// been seen by an update.
    #[must_use]
    pub fn momentum(&self, layer_id: &str, gradient_id: &str) -> Option<&Tensor> {
        self.momentum.get(&AccumulatorKey::new(layer_id, gradient_id))
    }

    /// Velocity accumulator for a (layer, gradient) pair, if that pair has
    /// been seen by an update.
    #[must_use]
    pub fn velocity(&self, layer_id: &str, gradient_id: &str) -> Option<&Tensor> {
        self.velocity.get(&AccumulatorKey::new(layer_id, gradient_id))
    }

    /// Number of tensors with live accumulators.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.momentum.len()
    }

    /// Refreshes the accumulators for one layer and writes bias-corrected
    /// parameter values back into it.
    ///
    /// Parameters and gradients are paired positionally: the sorted parameter
    /// names are zipped against the sorted gradient names, and pairing
    /// truncates at the shorter set. Nothing checks that a parameter name and
    /// its paired gradient name refer to the same tensor; the structural
    /// correspondence invariant documented on [`Layer`] is assumed. When the
    /// two name sets differ in size the divergence is logged at warn level
    /// but the update proceeds; see [`update_declared`](Adam::update_declared)
    /// for a checked alternative.
    ///
    /// For each pair, in order:
    /// 1. velocity becomes `β2 * velocity + (1-β2) * grad²`, or
    ///    `(1-β2) * grad²` on first sight of the pair;
    /// 2. momentum becomes `β1 * momentum + (1-β1) * grad`, or
    ///    `(1-β1) * grad` on first sight;
    /// 3. the parameter is overwritten in place with
    ///    `param - learning_rate * m_hat / sqrt(v_hat + ε)`, where
    ///    `m_hat = momentum / (1-β1^t)`, `v_hat = velocity / (1-β2^t)`, and
    ///    `t` is the current step counter.
    ///
    /// # Arguments
    /// * `layer_id` - Stable, unique identifier for this layer across the run
    /// * `layer` - The layer whose parameters are updated in place
    /// * `learning_rate` - Step size for this call, typically the configured
    ///   [`learning_rate`](Configuration::learning_rate) or a scheduled value
    ///   derived from it
    ///
    /// # Panics
    /// * If a gradient's shape differs from its accumulator's or its paired
    ///   parameter's shape, the underlying elementwise traversal panics.
    ///   There is no atomicity across the parameter set: pairs processed
    ///   before the mismatch stay updated.
    pub fn update<L: Layer>(&mut self, layer_id: &str, layer: &mut L, learning_rate: f32) {
        let pairs = positional_pairs(layer_id, layer);
        self.update_pairs(layer_id, layer, learning_rate, &pairs);
    }

    /// Like [`update`](Adam::update), but pairs parameters with gradients
    /// through a caller-declared correspondence table instead of positionally.
    ///
    /// Each table entry names a parameter and the gradient belonging to it.
    /// Entries are processed in table order; a parameter left out of the
    /// table is not updated. The whole table is validated against the layer
    /// before any accumulator or parameter is touched.
    ///
    /// # Errors
    /// * [`AdamError::MissingParameter`] - An entry names a parameter the
    ///   layer does not have
    /// * [`AdamError::MissingGradient`] - An entry names a gradient the layer
    ///   does not have
    pub fn update_declared<L: Layer>(
        &mut self,
        layer_id: &str,
        layer: &mut L,
        learning_rate: f32,
        pairs: &[(String, String)],
    ) -> Result<(), AdamError> {
        for (param_id, gradient_id) in pairs {
            if !layer.parameters().contains_key(param_id) {
                return Err(AdamError::MissingParameter(param_id.clone()));
            }

            if !layer.gradients().contains_key(gradient_id) {
                return Err(AdamError::MissingGradient(gradient_id.clone()));
            }
        }

        self.update_pairs(layer_id, layer, learning_rate, pairs);
        Ok(())
    }

    /// Runs the three update phases over an already-resolved pair list.
    fn update_pairs<L: Layer>(
        &mut self,
        layer_id: &str,
        layer: &mut L,
        learning_rate: f32,
        pairs: &[(String, String)],
    ) {
        self.refresh_velocity(layer_id, layer, pairs);
        self.refresh_momentum(layer_id, layer, pairs);
        self.apply(layer_id, layer, learning_rate, pairs);
    }

    /// Folds each paired gradient's elementwise square into its velocity
    /// accumulator, seeding `(1-β2) * grad²` for pairs seen for the first
    /// time.
    fn refresh_velocity<L: Layer>(&mut self, layer_id: &str, layer: &L, pairs: &[(String, String)]) {
        let beta2 = self.config.beta2;
        let grads = layer.gradients();
        let mut fresh = 0_usize;

        for (_, gradient_id) in pairs {
            let Some(grad) = grads.get(gradient_id) else {
                continue;
            };

            match self.velocity.entry(AccumulatorKey::new(layer_id, gradient_id)) {
                Entry::Occupied(mut stored) => {
                    Zip::from(stored.get_mut()).and(grad).par_for_each(|v, &g| {
                        *v = beta2 * *v + (1.0 - beta2) * (g * g);
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(grad.mapv(|g| (1.0 - beta2) * (g * g)));
                    fresh += 1;
                }
            }
        }

        if fresh > 0 {
            debug!("layer {layer_id}: started tracking accumulators for {fresh} tensors");
        }
    }

    /// Folds each paired gradient into its momentum accumulator, seeding
    /// `(1-β1) * grad` for pairs seen for the first time.
    fn refresh_momentum<L: Layer>(&mut self, layer_id: &str, layer: &L, pairs: &[(String, String)]) {
        let beta1 = self.config.beta1;
        let grads = layer.gradients();

        for (_, gradient_id) in pairs {
            let Some(grad) = grads.get(gradient_id) else {
                continue;
            };

            match self.momentum.entry(AccumulatorKey::new(layer_id, gradient_id)) {
                Entry::Occupied(mut stored) => {
                    Zip::from(stored.get_mut()).and(grad).par_for_each(|m, &g| {
                        *m = beta1 * *m + (1.0 - beta1) * g;
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(grad.mapv(|g| (1.0 - beta1) * g));
                }
            }
        }
    }

    /// Overwrites each paired parameter with its bias-corrected Adam update.
    fn apply<L: Layer>(
        &self,
        layer_id: &str,
        layer: &mut L,
        learning_rate: f32,
        pairs: &[(String, String)],
    ) {
        let beta1 = self.config.beta1;
        let beta2 = self.config.beta2;
        let epsilon = self.config.epsilon;

        // Bias-correction denominators for the counter as it stands now.
        let t = self.step as i32;
        let bias1 = 1.0 - beta1.powi(t);
        let bias2 = 1.0 - beta2.powi(t);

        let params = layer.parameters_mut();
        for (param_id, gradient_id) in pairs {
            let key = AccumulatorKey::new(layer_id, gradient_id);

            // Both refresh passes ran over the same pair list, so the
            // accumulators exist for every key derived from it.
            let (Some(momentum), Some(velocity)) =
                (self.momentum.get(&key), self.velocity.get(&key))
            else {
                continue;
            };

            let Some(param) = params.get_mut(param_id) else {
                continue;
            };

            Zip::from(param)
                .and(momentum)
                .and(velocity)
                .par_for_each(|w, &m, &v| {
                    let m_hat = m / bias1;
                    let v_hat = v / bias2;
                    *w -= learning_rate * m_hat / (v_hat + epsilon).sqrt();
                });
        }
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(Configuration::default())
    }
}

/// Zips the sorted parameter names against the sorted gradient names,
/// truncating at the shorter set.
///
/// A size divergence between the two name sets is flagged at warn level
/// rather than fixed or rejected: the sorted-zip pairing is part of the
/// layer contract, and silently dropping the surplus names is exactly what
/// the caller opted into by using positional pairing.
fn positional_pairs<L: Layer>(layer_id: &str, layer: &L) -> Vec<(String, String)> {
    let params = layer.parameters();
    let grads = layer.gradients();

    if params.len() != grads.len() {
        warn!(
            "layer {layer_id}: {} parameters vs {} gradients; positional pairing truncates to the shorter set",
            params.len(),
            grads.len()
        );
    }

    params
        .keys()
        .zip(grads.keys())
        .map(|(param_id, gradient_id)| (param_id.clone(), gradient_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::collections::BTreeMap;

    struct StubLayer {
        params: BTreeMap<String, Tensor>,
        grads: BTreeMap<String, Tensor>,
    }

    impl StubLayer {
        fn single(param: Tensor, grad: Tensor) -> Self {
            Self {
                params: BTreeMap::from([("weight".to_owned(), param)]),
                grads: BTreeMap::from([("grad_weight".to_owned(), grad)]),
            }
        }
    }

    impl Layer for StubLayer {
        fn parameters(&self) -> &BTreeMap<String, Tensor> {
            &self.params
        }

        fn parameters_mut(&mut self) -> &mut BTreeMap<String, Tensor> {
            &mut self.params
        }

        fn gradients(&self) -> &BTreeMap<String, Tensor> {
            &self.grads
        }
    }

    #[test]
    fn test_first_update_seeds_accumulators_exactly() {
        let config = Configuration::default();
        let beta1 = config.beta1;
        let beta2 = config.beta2;
        let mut optimizer = Adam::new(config);

        // Seeding is defined as (1-β)·g regardless of the counter value, so
        // advance a few steps first to make sure it plays no part.
        optimizer.advance_step();
        optimizer.advance_step();
        optimizer.advance_step();

        let grad = array![0.5_f32, -2.0, 3.0].into_dyn();
        let mut layer = StubLayer::single(array![0.0_f32, 0.0, 0.0].into_dyn(), grad.clone());
        optimizer.update("dense0", &mut layer, 0.001);

        let expected_momentum = grad.mapv(|g| (1.0 - beta1) * g);
        let expected_velocity = grad.mapv(|g| (1.0 - beta2) * (g * g));

        assert_eq!(
            optimizer.momentum("dense0", "grad_weight"),
            Some(&expected_momentum),
            "first-sight momentum must equal (1-beta1) * grad exactly"
        );
        assert_eq!(
            optimizer.velocity("dense0", "grad_weight"),
            Some(&expected_velocity),
            "first-sight velocity must equal (1-beta2) * grad^2 exactly"
        );
    }

    #[test]
    fn test_zero_gradient_leaves_parameter_unchanged() {
        let mut optimizer = Adam::default();
        let param = array![1.5_f32, -0.25].into_dyn();
        let mut layer = StubLayer::single(param.clone(), array![0.0_f32, 0.0].into_dyn());

        optimizer.update("dense0", &mut layer, 0.001);

        assert_eq!(
            layer.params["weight"], param,
            "zero gradient must produce a zero update term"
        );

        let momentum = optimizer.momentum("dense0", "grad_weight");
        let velocity = optimizer.velocity("dense0", "grad_weight");
        assert!(
            momentum.is_some_and(|m| m.iter().all(|&x| x == 0.0)),
            "momentum must be all zeros"
        );
        assert!(
            velocity.is_some_and(|v| v.iter().all(|&x| x == 0.0)),
            "velocity must be all zeros"
        );
    }

    #[test]
    fn test_step_counter_monotonic() {
        let mut optimizer = Adam::default();
        assert_eq!(optimizer.step(), 1, "counter starts at 1");

        for _ in 0..5 {
            optimizer.advance_step();
        }

        assert_eq!(optimizer.step(), 6, "counter is initial value plus N");
    }

    #[test]
    fn test_update_does_not_advance_counter() {
        let mut optimizer = Adam::default();
        let mut layer = StubLayer::single(
            array![1.0_f32].into_dyn(),
            array![0.5_f32].into_dyn(),
        );

        optimizer.update("dense0", &mut layer, 0.001);
        optimizer.update("dense0", &mut layer, 0.001);

        assert_eq!(
            optimizer.step(),
            1,
            "only advance_step moves the counter, never update"
        );
    }

    #[test]
    fn test_known_scalar_scenario() {
        // w=1.0, g=2.0, lr=0.001, beta1=0.9, beta2=0.999, eps=1e-8, t=1:
        // momentum = 0.2, velocity = 0.004, m_hat = 2.0, v_hat = 4.0,
        // w' = 1.0 - 0.001 * 2.0 / sqrt(4.0 + 1e-8) ~= 0.999.
        let config = Configuration::builder()
            .learning_rate(0.001)
            .beta1(0.9)
            .beta2(0.999)
            .epsilon(1e-8)
            .build();
        let mut optimizer = Adam::new(config);

        let mut layer = StubLayer::single(
            array![1.0_f32].into_dyn(),
            array![2.0_f32].into_dyn(),
        );
        optimizer.update("dense0", &mut layer, 0.001);

        let momentum = optimizer.momentum("dense0", "grad_weight").map(|m| m[0]);
        let velocity = optimizer.velocity("dense0", "grad_weight").map(|v| v[0]);

        assert_abs_diff_eq!(momentum.unwrap_or(f32::NAN), 0.2, epsilon = 1e-6);
        assert_abs_diff_eq!(velocity.unwrap_or(f32::NAN), 0.004, epsilon = 1e-6);
        assert_abs_diff_eq!(layer.params["weight"][0], 0.999, epsilon = 1e-6);
    }

    #[test]
    fn test_bias_correction_tracks_counter() {
        let config = Configuration::builder().beta1(0.9).build();

        let mut at_step_one = Adam::new(config.clone());
        let mut at_step_two = Adam::new(config);
        at_step_two.advance_step();

        let param = array![1.0_f32].into_dyn();
        let grad = array![2.0_f32].into_dyn();

        let mut layer_one = StubLayer::single(param.clone(), grad.clone());
        let mut layer_two = StubLayer::single(param, grad);

        at_step_one.update("dense0", &mut layer_one, 0.001);
        at_step_two.update("dense0", &mut layer_two, 0.001);

        // Same accumulators, different bias-correction exponents: the applied
        // steps must differ.
        assert_eq!(
            at_step_one.momentum("dense0", "grad_weight"),
            at_step_two.momentum("dense0", "grad_weight"),
            "accumulator refresh is independent of the counter"
        );
        assert_ne!(
            layer_one.params["weight"], layer_two.params["weight"],
            "the counter feeds the bias-correction exponent"
        );
    }

    #[test]
    fn test_accumulator_maps_grow_once_per_key() {
        let mut optimizer = Adam::default();
        let mut layer = StubLayer::single(
            array![1.0_f32].into_dyn(),
            array![0.5_f32].into_dyn(),
        );

        optimizer.update("dense0", &mut layer, 0.001);
        assert_eq!(optimizer.tracked(), 1, "one tensor tracked after first update");

        optimizer.update("dense0", &mut layer, 0.001);
        assert_eq!(optimizer.tracked(), 1, "revisiting a key must not grow the maps");
    }
}
