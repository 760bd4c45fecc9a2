//! Optimization techniques as deterministic transformations of
//! [`ModelWeights`].

use serde::{Deserialize, Serialize};

use crate::domain::{Layer, ModelWeights, Precision};

/// Fraction of weights removed by standard pruning.
const PRUNE_FRACTION: f64 = 0.2;
/// Fraction of weights removed by aggressive pruning.
const AGGRESSIVE_PRUNE_FRACTION: f64 = 0.4;
/// Fraction removed by distillation before the student is stored at f16.
const DISTILL_PRUNE_FRACTION: f64 = 0.1;
/// Fraction of input features dropped by feature selection.
const FEATURE_DROP_FRACTION: f64 = 0.25;
/// Shared values per layer for compression.
const CLUSTERS: usize = 16;
/// Shared values per layer for aggressive compression.
const AGGRESSIVE_CLUSTERS: usize = 8;
/// Hidden units whose outgoing weights are below this share of the mean are removed.
const DEAD_UNIT_RATIO: f64 = 0.01;
/// Largest ensemble the runtime will build.
const MAX_ENSEMBLE: u32 = 3;

/// One optimization technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    /// Magnitude pruning.
    Pruning,
    /// Magnitude pruning at twice the rate.
    AggressivePruning,
    /// Int8 quantization.
    Quantization,
    /// Int4 quantization.
    AggressiveQuantization,
    /// Remove dead hidden units.
    ArchitectureOptimization,
    /// Weight clustering to a small codebook.
    Compression,
    /// Weight clustering to a smaller codebook.
    AggressiveCompression,
    /// Drop the weakest input features.
    FeatureSelection,
    /// Add an ensemble member.
    Ensembling,
    /// Jitter inputs during adaptation.
    DataAugmentation,
    /// Tune output calibration.
    HyperparameterTuning,
    /// Cap the clock while hot.
    ThermalOptimization,
    /// Early exit on confident inputs.
    DynamicInference,
    /// Smooth, prune and halve precision.
    KnowledgeDistillation,
    /// Recompute activations instead of storing them.
    GradientCheckpointing,
    /// Pool GPU buffers.
    GpuMemoryOptimization,
    /// Fuse adjacent kernels.
    TensorFusion,
}

impl Technique {
    /// Stronger variant used when hardware state worsens mid-run.
    pub fn aggressive_variant(&self) -> Option<Technique> {
        match self {
            Technique::Pruning => Some(Technique::AggressivePruning),
            Technique::Quantization => Some(Technique::AggressiveQuantization),
            Technique::Compression => Some(Technique::AggressiveCompression),
            _ => None,
        }
    }

    /// Rough execution cost, used for scheduling estimates.
    pub fn estimated_cost_ms(&self) -> u64 {
        match self {
            Technique::Pruning | Technique::AggressivePruning => 40,
            Technique::Quantization | Technique::AggressiveQuantization => 30,
            Technique::ArchitectureOptimization => 60,
            Technique::Compression | Technique::AggressiveCompression => 50,
            Technique::FeatureSelection => 20,
            Technique::Ensembling => 80,
            Technique::DataAugmentation => 30,
            Technique::HyperparameterTuning => 70,
            Technique::KnowledgeDistillation => 90,
            Technique::ThermalOptimization
            | Technique::DynamicInference
            | Technique::GradientCheckpointing
            | Technique::GpuMemoryOptimization
            | Technique::TensorFusion => 5,
        }
    }

    /// Apply the technique to `weights` in place.
    pub fn apply(&self, weights: &mut ModelWeights) {
        match self {
            Technique::Pruning => prune_by_magnitude(weights, PRUNE_FRACTION),
            Technique::AggressivePruning => prune_by_magnitude(weights, AGGRESSIVE_PRUNE_FRACTION),
            Technique::Quantization => quantize(weights, Precision::Int8),
            Technique::AggressiveQuantization => quantize(weights, Precision::Int4),
            Technique::ArchitectureOptimization => remove_dead_units(weights),
            Technique::Compression => cluster(weights, CLUSTERS, Precision::Int8),
            Technique::AggressiveCompression => cluster(weights, AGGRESSIVE_CLUSTERS, Precision::Int4),
            Technique::FeatureSelection => drop_weak_features(weights, FEATURE_DROP_FRACTION),
            Technique::KnowledgeDistillation => distill(weights),
            Technique::Ensembling => {
                weights.runtime.ensemble_members = (weights.runtime.ensemble_members.max(1) + 1).min(MAX_ENSEMBLE);
            }
            Technique::DataAugmentation => weights.runtime.augmented = true,
            Technique::HyperparameterTuning => weights.runtime.tuned = true,
            Technique::ThermalOptimization => weights.runtime.thermal_governor = true,
            Technique::DynamicInference => weights.runtime.early_exit = true,
            Technique::GradientCheckpointing => weights.runtime.gradient_checkpointing = true,
            Technique::GpuMemoryOptimization => weights.runtime.gpu_memory_optimized = true,
            Technique::TensorFusion => weights.runtime.fused_kernels = true,
        }
    }
}

impl std::fmt::Display for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Technique::Pruning => "pruning",
            Technique::AggressivePruning => "aggressive_pruning",
            Technique::Quantization => "quantization",
            Technique::AggressiveQuantization => "aggressive_quantization",
            Technique::ArchitectureOptimization => "architecture_optimization",
            Technique::Compression => "compression",
            Technique::AggressiveCompression => "aggressive_compression",
            Technique::FeatureSelection => "feature_selection",
            Technique::Ensembling => "ensembling",
            Technique::DataAugmentation => "data_augmentation",
            Technique::HyperparameterTuning => "hyperparameter_tuning",
            Technique::ThermalOptimization => "thermal_optimization",
            Technique::DynamicInference => "dynamic_inference",
            Technique::KnowledgeDistillation => "knowledge_distillation",
            Technique::GradientCheckpointing => "gradient_checkpointing",
            Technique::GpuMemoryOptimization => "gpu_memory_optimization",
            Technique::TensorFusion => "tensor_fusion",
        };
        f.write_str(s)
    }
}

fn lower_precision(weights: &mut ModelWeights, target: Precision) {
    if target.bytes_per_param() < weights.precision.bytes_per_param() {
        weights.precision = target;
    }
}

/// Zero the `fraction` of non-zero weights with the smallest magnitude,
/// across all layers. Biases are kept.
fn prune_by_magnitude(weights: &mut ModelWeights, fraction: f64) {
    let mut candidates: Vec<(f32, usize, usize)> = weights
        .layers
        .iter()
        .enumerate()
        .flat_map(|(l, layer)| {
            layer
                .weights
                .iter()
                .enumerate()
                .filter(|(_, w)| **w != 0.0)
                .map(move |(i, w)| (w.abs(), l, i))
        })
        .collect();
    let k = (candidates.len() as f64 * fraction).floor() as usize;
    if k == 0 {
        return;
    }
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    for (_, l, i) in candidates.into_iter().take(k) {
        weights.layers[l].weights[i] = 0.0;
    }
}

/// Symmetric per-layer quantize-dequantize.
fn quantize(weights: &mut ModelWeights, target: Precision) {
    let levels = match target {
        Precision::Int4 => 7.0_f32,
        Precision::Int8 => 127.0,
        Precision::F16 | Precision::F32 => return,
    };
    for layer in &mut weights.layers {
        let max = layer.params().fold(0.0_f32, |m, v| m.max(v.abs()));
        if max == 0.0 {
            continue;
        }
        let scale = max / levels;
        for v in layer.params_mut() {
            *v = (*v / scale).round() * scale;
        }
    }
    lower_precision(weights, target);
}

/// Snap every non-zero weight to the nearest of `k` evenly spaced values.
fn cluster(weights: &mut ModelWeights, k: usize, codebook_precision: Precision) {
    for layer in &mut weights.layers {
        let (min, max) = layer
            .weights
            .iter()
            .filter(|w| **w != 0.0)
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), w| (lo.min(*w), hi.max(*w)));
        if !(min.is_finite() && max.is_finite()) || max <= min {
            continue;
        }
        let step = (max - min) / (k - 1) as f32;
        for w in layer.weights.iter_mut().filter(|w| **w != 0.0) {
            *w = min + ((*w - min) / step).round() * step;
        }
    }
    lower_precision(weights, codebook_precision);
}

/// Zero the weakest input columns of the first layer.
fn drop_weak_features(weights: &mut ModelWeights, fraction: f64) {
    let Some(first) = weights.layers.first_mut() else {
        return;
    };
    let mut columns: Vec<(f64, usize)> = (0..first.input_dim).map(|i| (first.column_norm(i), i)).collect();
    columns.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let k = (first.input_dim as f64 * fraction).floor() as usize;
    for (_, col) in columns.into_iter().take(k) {
        for o in 0..first.output_dim {
            first.weights[o * first.input_dim + col] = 0.0;
        }
    }
}

/// Remove hidden units whose outgoing weights are negligible.
///
/// A unit is the output row `o` of layer `l` together with input column `o`
/// of layer `l + 1`. The last layer's outputs are never removed, and every
/// layer keeps at least one unit.
fn remove_dead_units(weights: &mut ModelWeights) {
    for l in 0..weights.layers.len().saturating_sub(1) {
        let (head, tail) = weights.layers.split_at_mut(l + 1);
        let layer = &mut head[l];
        let next = &mut tail[0];

        let norms: Vec<f64> = (0..next.input_dim).map(|i| next.column_norm(i)).collect();
        let mean = norms.iter().sum::<f64>() / norms.len().max(1) as f64;
        let keep: Vec<usize> = (0..layer.output_dim).filter(|o| norms[*o] >= DEAD_UNIT_RATIO * mean).collect();
        if keep.is_empty() || keep.len() == layer.output_dim {
            continue;
        }

        *layer = Layer {
            kind: layer.kind,
            input_dim: layer.input_dim,
            output_dim: keep.len(),
            weights: keep
                .iter()
                .flat_map(|o| layer.weights[o * layer.input_dim..(o + 1) * layer.input_dim].iter().copied())
                .collect(),
            biases: keep.iter().map(|o| layer.biases[*o]).collect(),
        };
        *next = Layer {
            kind: next.kind,
            input_dim: keep.len(),
            output_dim: next.output_dim,
            weights: (0..next.output_dim)
                .flat_map(|o| keep.iter().map(move |i| (o, *i)))
                .map(|(o, i)| next.weight(o, i))
                .collect(),
            biases: next.biases.clone(),
        };
    }
}

/// Student model: rows smoothed toward their mean, weakest weights pruned,
/// stored at half precision.
fn distill(weights: &mut ModelWeights) {
    for layer in &mut weights.layers {
        for o in 0..layer.output_dim {
            let row = &mut layer.weights[o * layer.input_dim..(o + 1) * layer.input_dim];
            let mean = row.iter().sum::<f32>() / row.len().max(1) as f32;
            for w in row.iter_mut().filter(|w| **w != 0.0) {
                *w = 0.8 * *w + 0.2 * mean;
            }
        }
    }
    prune_by_magnitude(weights, DISTILL_PRUNE_FRACTION);
    lower_precision(weights, Precision::F16);
}
