//! Per-user model weights and memory accounting.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Width of the pattern feature vector fed to the first layer.
pub const FEATURE_DIM: usize = 12;
/// Width of the hidden representation.
pub const HIDDEN_DIM: usize = 24;
/// Number of personalization outputs.
pub const OUTPUT_DIM: usize = 8;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;
/// Sparse storage keeps a 16-bit index next to every non-zero value.
const SPARSE_INDEX_BYTES: f64 = 2.0;

/// Role of a layer in the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Feature embedding.
    Embedding,
    /// Hidden dense layer.
    Dense,
    /// Output head.
    Output,
}

/// Numeric precision the weights are stored at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// 32-bit float.
    F32,
    /// 16-bit float.
    F16,
    /// 8-bit integer.
    Int8,
    /// 4-bit integer.
    Int4,
}

impl Precision {
    /// Storage cost of one parameter.
    pub fn bytes_per_param(&self) -> f64 {
        match self {
            Precision::F32 => 4.0,
            Precision::F16 => 2.0,
            Precision::Int8 => 1.0,
            Precision::Int4 => 0.5,
        }
    }

    /// Relative arithmetic cost compared to f32.
    pub fn compute_factor(&self) -> f64 {
        match self {
            Precision::F32 => 1.0,
            Precision::F16 => 0.6,
            Precision::Int8 => 0.45,
            Precision::Int4 => 0.35,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Precision::F32 => "f32",
            Precision::F16 => "f16",
            Precision::Int8 => "int8",
            Precision::Int4 => "int4",
        };
        f.write_str(s)
    }
}

/// Runtime switches set by optimization techniques.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    /// Adjacent kernels fused into one dispatch.
    pub fused_kernels: bool,
    /// Inference may exit after the hidden layer on confident inputs.
    pub early_exit: bool,
    /// Activations recomputed instead of stored.
    pub gradient_checkpointing: bool,
    /// Clock is capped while the SoC is hot.
    pub thermal_governor: bool,
    /// GPU buffers are pooled and reused.
    pub gpu_memory_optimized: bool,
    /// Number of models evaluated per inference.
    pub ensemble_members: u32,
    /// Inputs are jittered during adaptation.
    pub augmented: bool,
    /// Output calibration has been tuned.
    pub tuned: bool,
}

impl Default for RuntimeProfile {
    fn default() -> Self {
        RuntimeProfile {
            fused_kernels: false,
            early_exit: false,
            gradient_checkpointing: false,
            thermal_governor: false,
            gpu_memory_optimized: false,
            ensemble_members: 1,
            augmented: false,
            tuned: false,
        }
    }
}

/// One dense layer: `out = weights · in + biases`, row-major `[output_dim][input_dim]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    /// Role in the network.
    pub kind: LayerKind,
    /// Fan-in.
    pub input_dim: usize,
    /// Fan-out.
    pub output_dim: usize,
    /// `output_dim * input_dim` values.
    pub weights: Vec<f32>,
    /// `output_dim` values.
    pub biases: Vec<f32>,
}

impl Layer {
    /// Xavier-uniform initialized layer with zero biases.
    pub fn xavier(kind: LayerKind, input_dim: usize, output_dim: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input_dim + output_dim) as f64).sqrt() as f32;
        let weights = (0..input_dim * output_dim)
            .map(|_| rng.gen_range(-limit..limit))
            .collect();
        Layer { kind, input_dim, output_dim, weights, biases: vec![0.0; output_dim] }
    }

    /// Weights plus biases.
    pub fn param_count(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    /// Parameters that are exactly zero.
    pub fn zero_count(&self) -> usize {
        self.params().filter(|v| *v == 0.0).count()
    }

    /// Iterate weights then biases.
    pub fn params(&self) -> impl Iterator<Item = f32> + '_ {
        self.weights.iter().chain(self.biases.iter()).copied()
    }

    /// Mutable iteration over weights then biases.
    pub fn params_mut(&mut self) -> impl Iterator<Item = &mut f32> + '_ {
        self.weights.iter_mut().chain(self.biases.iter_mut())
    }

    /// Squared L2 norm of all parameters.
    pub fn sq_norm(&self) -> f64 {
        self.params().map(|v| (v as f64) * (v as f64)).sum()
    }

    /// Weight at `(out, inp)`.
    #[inline]
    pub fn weight(&self, out: usize, inp: usize) -> f32 {
        self.weights[out * self.input_dim + inp]
    }

    /// L2 norm of one input column.
    pub fn column_norm(&self, inp: usize) -> f64 {
        (0..self.output_dim)
            .map(|o| {
                let w = self.weight(o, inp) as f64;
                w * w
            })
            .sum::<f64>()
            .sqrt()
    }

    /// L2 norm of one output row including its bias.
    pub fn row_norm(&self, out: usize) -> f64 {
        let start = out * self.input_dim;
        let row: f64 = self.weights[start..start + self.input_dim]
            .iter()
            .map(|w| (*w as f64) * (*w as f64))
            .sum();
        let b = self.biases[out] as f64;
        (row + b * b).sqrt()
    }

    fn shape_error(&self) -> Option<String> {
        if self.weights.len() != self.input_dim * self.output_dim {
            return Some(format!(
                "{:?} layer has {} weights, expected {}x{}",
                self.kind,
                self.weights.len(),
                self.output_dim,
                self.input_dim
            ));
        }
        if self.biases.len() != self.output_dim {
            return Some(format!(
                "{:?} layer has {} biases, expected {}",
                self.kind,
                self.biases.len(),
                self.output_dim
            ));
        }
        None
    }
}

/// The live model of one user.
///
/// Mutated only by the trainer and the optimization controller. Every change
/// is built as a complete candidate and persisted atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Ordered layers, input first.
    pub layers: Vec<Layer>,
    /// Storage precision.
    pub precision: Precision,
    /// Runtime switches.
    #[serde(default)]
    pub runtime: RuntimeProfile,
    /// Incremented on every persisted change.
    pub version: u64,
    /// Time of the last persisted change.
    pub updated_at: DateTime<Utc>,
}

impl ModelWeights {
    /// Default architecture: `Embedding 12→24`, `Dense 24→24`, `Output 24→8`.
    pub fn default_architecture(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let layers = vec![
            Layer::xavier(LayerKind::Embedding, FEATURE_DIM, HIDDEN_DIM, &mut rng),
            Layer::xavier(LayerKind::Dense, HIDDEN_DIM, HIDDEN_DIM, &mut rng),
            Layer::xavier(LayerKind::Output, HIDDEN_DIM, OUTPUT_DIM, &mut rng),
        ];
        ModelWeights {
            layers,
            precision: Precision::F32,
            runtime: RuntimeProfile::default(),
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Number of layers.
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Total parameter count.
    pub fn total_parameters(&self) -> usize {
        self.layers.iter().map(Layer::param_count).sum()
    }

    /// Parameters that are not exactly zero.
    pub fn nonzero_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.param_count() - l.zero_count()).sum()
    }

    /// Fraction of non-zero weights. Biases are excluded: they start at zero
    /// and pruning never touches them.
    pub fn density(&self) -> f64 {
        let total: usize = self.layers.iter().map(|l| l.weights.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let nonzero: usize = self.layers.iter().map(|l| l.weights.iter().filter(|v| **v != 0.0).count()).sum();
        nonzero as f64 / total as f64
    }

    /// Resident size of the model.
    ///
    /// Dense storage below 50 % density switches to sparse accounting
    /// (value plus index per non-zero). Ensembles multiply the cost.
    pub fn memory_footprint_mb(&self) -> f64 {
        let bytes = self.precision.bytes_per_param();
        let dense = self.total_parameters() as f64 * bytes;
        let stored = if self.density() < 0.5 {
            self.nonzero_parameters() as f64 * (bytes + SPARSE_INDEX_BYTES)
        } else {
            dense
        };
        stored * self.runtime.ensemble_members.max(1) as f64 / BYTES_PER_MB
    }

    /// Squared L2 distance to `other`, per layer. Layers must match in shape.
    pub fn layer_sq_distance(&self, other: &ModelWeights) -> Vec<f64> {
        self.layers
            .iter()
            .zip(other.layers.iter())
            .map(|(a, b)| {
                a.params()
                    .zip(b.params())
                    .map(|(x, y)| {
                        let d = (x - y) as f64;
                        d * d
                    })
                    .sum()
            })
            .collect()
    }

    /// Structural and numeric integrity problems, empty when healthy.
    pub fn integrity_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.layers.is_empty() {
            issues.push("model has no layers".to_string());
        }
        for (idx, layer) in self.layers.iter().enumerate() {
            if let Some(msg) = layer.shape_error() {
                issues.push(format!("layer {idx}: {msg}"));
            }
            if layer.params().any(|v| !v.is_finite()) {
                issues.push(format!("layer {idx}: non-finite parameter"));
            }
        }
        for pair in self.layers.windows(2) {
            if pair[0].output_dim != pair[1].input_dim {
                issues.push(format!(
                    "layer chain broken: {} outputs feed {} inputs",
                    pair[0].output_dim, pair[1].input_dim
                ));
            }
        }
        issues
    }

    /// True when every parameter is finite.
    pub fn is_finite(&self) -> bool {
        self.layers.iter().all(|l| l.params().all(f32::is_finite))
    }
}
