//! Elastic Weight Consolidation.
//!
//! Importance is a per-layer Fisher-information proxy derived from the
//! current weights. The penalty shrinks each layer's gradient by
//! `1 / (1 + s·F)`, so layers that carry more prior knowledge move less and a
//! strength of zero leaves gradients untouched.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ImportanceMode;
use crate::domain::ModelWeights;
use crate::error::{AdaptError, AdaptResult};

/// Per-layer gradients, flattened in [`Layer::params`](crate::domain::Layer::params) order.
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    /// One vector per layer: weights then biases.
    pub layers: Vec<Vec<f32>>,
}

impl Gradients {
    /// Zero gradients shaped like `weights`.
    pub fn zeros_like(weights: &ModelWeights) -> Self {
        Gradients { layers: weights.layers.iter().map(|l| vec![0.0; l.param_count()]).collect() }
    }

    /// L2 norm over all layers.
    pub fn norm(&self) -> f64 {
        self.layers
            .iter()
            .flat_map(|l| l.iter())
            .map(|g| (*g as f64) * (*g as f64))
            .sum::<f64>()
            .sqrt()
    }

    /// Shape signature, for checks.
    pub fn shape(&self) -> Vec<usize> {
        self.layers.iter().map(Vec::len).collect()
    }
}

/// Per-layer importance in `[0, 1]`. Length equals the model's layer count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EwcImportance {
    /// One scalar per layer.
    pub per_layer: Vec<f64>,
}

impl EwcImportance {
    /// Number of layers covered.
    pub fn len(&self) -> usize {
        self.per_layer.len()
    }

    /// True when no layers are covered.
    pub fn is_empty(&self) -> bool {
        self.per_layer.is_empty()
    }
}

/// EWC regularizer with optional in-memory accumulation per user.
pub struct EwcRegularizer {
    mode: ImportanceMode,
    accumulated: DashMap<String, Vec<f64>>,
}

impl EwcRegularizer {
    /// Create a regularizer.
    pub fn new(mode: ImportanceMode) -> Self {
        Self { mode, accumulated: DashMap::new() }
    }

    /// Fisher proxy `mean(w²)` per layer, normalized by the largest layer.
    pub fn compute_importance(weights: &ModelWeights) -> EwcImportance {
        let raw: Vec<f64> = weights
            .layers
            .iter()
            .map(|l| {
                let n = l.param_count();
                if n == 0 {
                    0.0
                } else {
                    l.sq_norm() / n as f64
                }
            })
            .collect();
        let max = raw.iter().copied().fold(0.0_f64, f64::max);
        let per_layer = if max > 0.0 { raw.iter().map(|v| v / max).collect() } else { raw };
        EwcImportance { per_layer }
    }

    /// Importance for `user_id` under the configured [`ImportanceMode`].
    ///
    /// `Accumulate` blends the fresh estimate into the previous one:
    /// `F = decay·F_old + (1 - decay)·F_new`. The blend is never persisted and
    /// restarts whenever the layer count changes.
    pub fn importance_for(&self, user_id: &str, weights: &ModelWeights) -> EwcImportance {
        let fresh = Self::compute_importance(weights);
        match self.mode {
            ImportanceMode::Fresh => fresh,
            ImportanceMode::Accumulate { decay } => {
                let mut entry = self.accumulated.entry(user_id.to_string()).or_insert_with(|| fresh.per_layer.clone());
                if entry.len() != fresh.len() {
                    *entry = fresh.per_layer.clone();
                } else {
                    for (old, new) in entry.iter_mut().zip(fresh.per_layer.iter()) {
                        *old = decay * *old + (1.0 - decay) * new;
                    }
                }
                EwcImportance { per_layer: entry.clone() }
            }
        }
    }

    /// Shrink each layer's gradient by `1 / (1 + strength·F_l)`.
    ///
    /// Equivalent to subtracting the correction `g·sF/(1 + sF)`. Output shape
    /// matches input shape exactly.
    ///
    /// # Errors
    ///
    /// [`AdaptError::Validation`] if the importance does not cover every layer.
    pub fn penalize(&self, gradients: &Gradients, importance: &EwcImportance, strength: f64) -> AdaptResult<Gradients> {
        if importance.len() != gradients.layers.len() {
            return Err(AdaptError::validation(
                "ewc.importance",
                format!("{} importance values for {} layers", importance.len(), gradients.layers.len()),
            ));
        }
        if strength == 0.0 {
            return Ok(gradients.clone());
        }
        let layers = gradients
            .layers
            .iter()
            .zip(importance.per_layer.iter())
            .map(|(layer, f)| {
                let scale = (1.0 / (1.0 + strength * f)) as f32;
                layer.iter().map(|g| g * scale).collect()
            })
            .collect();
        Ok(Gradients { layers })
    }

    /// Quadratic consolidation loss `0.5·s·Σ F_l·‖after_l − before_l‖²`.
    pub fn loss(importance: &EwcImportance, strength: f64, before: &ModelWeights, after: &ModelWeights) -> f64 {
        let dist = before.layer_sq_distance(after);
        0.5 * strength * importance.per_layer.iter().zip(dist.iter()).map(|(f, d)| f * d).sum::<f64>()
    }

    /// Drop accumulated importance for `user_id`.
    pub fn forget(&self, user_id: &str) {
        self.accumulated.remove(user_id);
    }

    /// Configured mode.
    pub fn mode(&self) -> ImportanceMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn grads_for(weights: &ModelWeights, value: f32) -> Gradients {
        Gradients { layers: weights.layers.iter().map(|l| vec![value; l.param_count()]).collect() }
    }

    #[test]
    fn importance_has_one_value_per_layer() {
        let w = ModelWeights::default_architecture(3);
        let imp = EwcRegularizer::compute_importance(&w);
        assert_eq!(imp.len(), w.layer_count());
        assert!(imp.per_layer.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_relative_eq!(imp.per_layer.iter().cloned().fold(0.0, f64::max), 1.0);
    }

    #[test]
    fn larger_weights_mean_larger_importance() {
        let mut w = ModelWeights::default_architecture(3);
        for v in w.layers[2].params_mut() {
            *v *= 10.0;
        }
        let imp = EwcRegularizer::compute_importance(&w);
        assert_relative_eq!(imp.per_layer[2], 1.0);
        assert!(imp.per_layer[0] < 0.1);
    }

    #[test]
    fn zero_strength_is_noop() {
        let w = ModelWeights::default_architecture(3);
        let reg = EwcRegularizer::new(ImportanceMode::Fresh);
        let g = grads_for(&w, 0.5);
        let imp = EwcRegularizer::compute_importance(&w);
        assert_eq!(reg.penalize(&g, &imp, 0.0).unwrap(), g);
    }

    #[test]
    fn penalize_preserves_shape() {
        let w = ModelWeights::default_architecture(3);
        let reg = EwcRegularizer::new(ImportanceMode::Fresh);
        let g = grads_for(&w, 0.5);
        let out = reg.penalize(&g, &EwcRegularizer::compute_importance(&w), 2.0).unwrap();
        assert_eq!(out.shape(), g.shape());
    }

    #[test]
    fn mismatched_importance_rejected() {
        let w = ModelWeights::default_architecture(3);
        let reg = EwcRegularizer::new(ImportanceMode::Fresh);
        let imp = EwcImportance { per_layer: vec![1.0] };
        assert!(reg.penalize(&grads_for(&w, 1.0), &imp, 1.0).is_err());
    }

    #[test]
    fn accumulate_blends_with_history() {
        let reg = EwcRegularizer::new(ImportanceMode::Accumulate { decay: 0.5 });
        let w = ModelWeights::default_architecture(3);
        let first = reg.importance_for("u", &w);

        let mut scaled = w.clone();
        for v in scaled.layers[0].params_mut() {
            *v *= 100.0;
        }
        let fresh = EwcRegularizer::compute_importance(&scaled);
        let blended = reg.importance_for("u", &scaled);
        for i in 0..3 {
            assert_relative_eq!(blended.per_layer[i], 0.5 * first.per_layer[i] + 0.5 * fresh.per_layer[i]);
        }

        reg.forget("u");
        assert_eq!(reg.importance_for("u", &scaled), fresh);
    }

    #[test]
    fn loss_is_zero_without_change() {
        let w = ModelWeights::default_architecture(3);
        let imp = EwcRegularizer::compute_importance(&w);
        assert_eq!(EwcRegularizer::loss(&imp, 1.0, &w, &w), 0.0);
    }

    proptest! {
        #[test]
        fn prop_stronger_regularization_never_grows_update(
            s1 in 0.0f64..50.0,
            delta in 0.0f64..50.0,
            g in -5.0f32..5.0,
            seed in 0u64..1000,
        ) {
            let w = ModelWeights::default_architecture(seed);
            let reg = EwcRegularizer::new(ImportanceMode::Fresh);
            let imp = EwcRegularizer::compute_importance(&w);
            let grads = grads_for(&w, g);
            let weak = reg.penalize(&grads, &imp, s1).unwrap();
            let strong = reg.penalize(&grads, &imp, s1 + delta).unwrap();
            for (l, f) in imp.per_layer.iter().enumerate() {
                if *f > 0.0 {
                    for (a, b) in weak.layers[l].iter().zip(strong.layers[l].iter()) {
                        prop_assert!(b.abs() <= a.abs() + 1e-6);
                    }
                }
            }
        }
    }
}
