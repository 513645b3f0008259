use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::TrainConfig;

pub mod token_mlp;

pub use token_mlp::token_mlp;

/// One micro batch: `micro_batch_size * max_sequence_length` token rows.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Array2<f32>,
    pub labels: Vec<usize>,
}

impl Batch {
    /// Seeded random inputs in `[-1, 1)` with labels drawn over this rank's label width.
    pub fn synthetic(config: &TrainConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed ^ 0x5eed);
        let rows = config.tokens_per_batch();
        let classes = config.label_classes().max(1);
        let inputs =
            Array2::from_shape_fn((rows, config.hidden_size), |_| rng.gen_range(-1.0..1.0));
        let labels = (0..rows).map(|_| rng.gen_range(0..classes)).collect();
        Self { inputs, labels }
    }

    pub fn rows(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_batch_shape() {
        let config = TrainConfig {
            micro_batch_size: 2,
            max_sequence_length: 3,
            hidden_size: 5,
            vocab_size: 8,
            tensor_parallel_size: 2,
            ..Default::default()
        };
        let batch = Batch::synthetic(&config);
        assert_eq!(batch.inputs.dim(), (6, 5));
        assert_eq!(batch.rows(), 6);
        assert!(batch.labels.iter().all(|&l| l < 4));
        assert_eq!(batch.labels, Batch::synthetic(&config).labels);
    }
}
