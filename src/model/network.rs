#![allow(clippy::needless_range_loop)]

//! Quantized two-layer feed-forward network.
//!
//! Weights are signed 8-bit integers reconstructed as `w / 127 * scale` at
//! evaluation time, with one scale factor per layer (not per weight). The
//! topology is fixed: 32 inputs → 64 hidden (ReLU) → 16 raw outputs, then a
//! numerically stabilized softmax over the entire output vector. Only a
//! subset of the outputs is consumed downstream, but the softmax
//! normalization depends on all 16 values, so all are always computed.

use rand::Rng;
use tracing::debug;

/// Input feature vector width.
pub const INPUT_SIZE: usize = 32;
/// Hidden layer width.
pub const HIDDEN_SIZE: usize = 64;
/// Output vector width.
pub const OUTPUT_SIZE: usize = 16;

/// Fixed-topology quantized network parameters.
#[derive(Clone, PartialEq)]
pub struct QuantizedNetwork {
    pub(crate) weights_input_hidden: [[i8; HIDDEN_SIZE]; INPUT_SIZE],
    pub(crate) weights_hidden_output: [[i8; OUTPUT_SIZE]; HIDDEN_SIZE],
    pub(crate) bias_hidden: [i8; HIDDEN_SIZE],
    pub(crate) bias_output: [i8; OUTPUT_SIZE],
    pub(crate) scale_input: f32,
    pub(crate) scale_hidden: f32,
    pub(crate) scale_output: f32,
}

impl QuantizedNetwork {
    /// Initialise with Xavier-style random weights.
    ///
    /// Each weight is sampled uniform in `(-1, 1)`, scaled by
    /// `sqrt(2 / (fan_in + fan_out))`, then quantized by multiplying by 127
    /// and truncating to `i8`. Biases are small integers in `[-10, 9]`.
    /// Layer scales start at 1.0 and are never adjusted afterwards.
    pub fn random(rng: &mut impl Rng) -> Self {
        let mut network = Self::zeroed();

        let scale = (2.0f32 / (INPUT_SIZE + HIDDEN_SIZE) as f32).sqrt();
        for i in 0..INPUT_SIZE {
            for h in 0..HIDDEN_SIZE {
                let weight: f32 = rng.gen_range(-1.0..1.0) * scale;
                network.weights_input_hidden[i][h] = (weight * 127.0) as i8;
            }
        }

        let scale = (2.0f32 / (HIDDEN_SIZE + OUTPUT_SIZE) as f32).sqrt();
        for h in 0..HIDDEN_SIZE {
            for o in 0..OUTPUT_SIZE {
                let weight: f32 = rng.gen_range(-1.0..1.0) * scale;
                network.weights_hidden_output[h][o] = (weight * 127.0) as i8;
            }
        }

        for h in 0..HIDDEN_SIZE {
            network.bias_hidden[h] = rng.gen_range(-10i32..10) as i8;
        }
        for o in 0..OUTPUT_SIZE {
            network.bias_output[o] = rng.gen_range(-10i32..10) as i8;
        }

        debug!(
            target: "bridge::model",
            input = INPUT_SIZE,
            hidden = HIDDEN_SIZE,
            output = OUTPUT_SIZE,
            "quantized network initialised with random weights"
        );

        network
    }

    /// An all-zero network. Used as the starting point for initialisation
    /// and snapshot restore.
    pub(crate) fn zeroed() -> Self {
        Self {
            weights_input_hidden: [[0; HIDDEN_SIZE]; INPUT_SIZE],
            weights_hidden_output: [[0; OUTPUT_SIZE]; HIDDEN_SIZE],
            bias_hidden: [0; HIDDEN_SIZE],
            bias_output: [0; OUTPUT_SIZE],
            scale_input: 1.0,
            scale_hidden: 1.0,
            scale_output: 1.0,
        }
    }

    /// Full forward pass: dequantized matmul, ReLU hidden activation, raw
    /// output accumulation, softmax over all outputs.
    pub fn forward(&self, features: &[f32; INPUT_SIZE]) -> [f32; OUTPUT_SIZE] {
        let mut hidden = [0.0f32; HIDDEN_SIZE];
        for h in 0..HIDDEN_SIZE {
            let mut sum = f32::from(self.bias_hidden[h]) * self.scale_hidden;
            for i in 0..INPUT_SIZE {
                sum += features[i]
                    * (f32::from(self.weights_input_hidden[i][h]) / 127.0)
                    * self.scale_input;
            }
            hidden[h] = relu(sum);
        }

        // No activation on the output layer before softmax.
        let mut output = [0.0f32; OUTPUT_SIZE];
        for o in 0..OUTPUT_SIZE {
            let mut sum = f32::from(self.bias_output[o]) * self.scale_output;
            for h in 0..HIDDEN_SIZE {
                sum += hidden[h]
                    * (f32::from(self.weights_hidden_output[h][o]) / 127.0)
                    * self.scale_hidden;
            }
            output[o] = sum;
        }

        softmax(&mut output);
        output
    }
}

impl std::fmt::Debug for QuantizedNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuantizedNetwork")
            .field("topology", &format!("{INPUT_SIZE}x{HIDDEN_SIZE}x{OUTPUT_SIZE}"))
            .field("scale_input", &self.scale_input)
            .field("scale_hidden", &self.scale_hidden)
            .field("scale_output", &self.scale_output)
            .finish()
    }
}

fn relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

/// In-place softmax, stabilized by subtracting the maximum before
/// exponentiating.
pub(crate) fn softmax(values: &mut [f32]) {
    let mut max_val = f32::NEG_INFINITY;
    for &v in values.iter() {
        if v > max_val {
            max_val = v;
        }
    }

    let mut sum = 0.0f32;
    for v in values.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }

    for v in values.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_softmax_sums_to_one() {
        let mut values = [1.0f32, 2.0, 3.0, -1.0, 0.5];
        softmax(&mut values);
        let sum: f32 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "softmax sum was {sum}");
        for &v in &values {
            assert!((0.0..=1.0).contains(&v), "element {v} outside [0, 1]");
        }
    }

    #[test]
    fn test_softmax_stable_for_large_inputs() {
        let mut values = [1000.0f32, 1001.0, 999.0];
        softmax(&mut values);
        let sum: f32 = values.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_softmax_uniform_for_equal_inputs() {
        let mut values = [4.2f32; 8];
        softmax(&mut values);
        for &v in &values {
            assert!((v - 0.125).abs() < 1e-6);
        }
    }

    #[test]
    fn test_softmax_orders_by_input_magnitude() {
        let mut values = [0.0f32, 5.0, 2.0];
        softmax(&mut values);
        assert!(values[1] > values[2]);
        assert!(values[2] > values[0]);
    }

    #[test]
    fn test_random_weights_within_quantized_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let network = QuantizedNetwork::random(&mut rng);

        // Xavier scaling keeps quantized magnitudes well inside i8 range:
        // sqrt(2/96) * 127 ≈ 18.
        for row in &network.weights_input_hidden {
            for &w in row {
                assert!(w.abs() <= 32, "weight {w} outside expected envelope");
            }
        }
        for &b in &network.bias_hidden {
            assert!((-10..=9).contains(&i32::from(b)));
        }
        for &b in &network.bias_output {
            assert!((-10..=9).contains(&i32::from(b)));
        }
    }

    #[test]
    fn test_scales_start_at_unity() {
        let mut rng = StdRng::seed_from_u64(1);
        let network = QuantizedNetwork::random(&mut rng);
        assert!((network.scale_input - 1.0).abs() < f32::EPSILON);
        assert!((network.scale_hidden - 1.0).abs() < f32::EPSILON);
        assert!((network.scale_output - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_forward_output_is_probability_distribution() {
        let mut rng = StdRng::seed_from_u64(99);
        let network = QuantizedNetwork::random(&mut rng);
        let features = [0.5f32; INPUT_SIZE];
        let output = network.forward(&features);

        let sum: f32 = output.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5, "output sum was {sum}");
        for &v in &output {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_forward_is_deterministic_for_same_weights() {
        let mut rng = StdRng::seed_from_u64(5);
        let network = QuantizedNetwork::random(&mut rng);
        let features = [0.25f32; INPUT_SIZE];
        assert_eq!(network.forward(&features), network.forward(&features));
    }

    #[test]
    fn test_forward_differs_across_inputs() {
        let mut rng = StdRng::seed_from_u64(11);
        let network = QuantizedNetwork::random(&mut rng);
        let a = network.forward(&[0.0f32; INPUT_SIZE]);
        let b = network.forward(&[1.0f32; INPUT_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_zeroed_network_forward_is_uniform() {
        let network = QuantizedNetwork::zeroed();
        let output = network.forward(&[0.7f32; INPUT_SIZE]);
        // All-zero weights produce identical logits, so softmax is uniform.
        for &v in &output {
            assert!((v - 1.0 / OUTPUT_SIZE as f32).abs() < 1e-6);
        }
    }
}
