use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    optim::Hyperparams,
    sharding::{ShardPolicy, ShardSpec, ShardStrategy, StateDictMode},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Logged only.
    pub model_architecture_name: String,
    pub micro_batch_size: usize,
    pub max_sequence_length: usize,
    /// Divides the output (label) dimension.
    pub tensor_parallel_size: usize,
    pub vocab_size: usize,
    pub hidden_size: usize,

    pub use_sharding: bool,
    pub shard_policy: ShardPolicy,
    pub shard_strategy: ShardStrategy,
    pub shard_state_dict_mode: StateDictMode,
    pub world_size: usize,
    pub rank: usize,

    pub warmup_steps: usize,
    pub steady_steps: usize,

    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_architecture_name: "token-mlp".to_string(),
            micro_batch_size: 4,
            max_sequence_length: 32,
            tensor_parallel_size: 1,
            vocab_size: 256,
            hidden_size: 32,
            use_sharding: false,
            shard_policy: ShardPolicy::None,
            shard_strategy: ShardStrategy::FullShard,
            shard_state_dict_mode: StateDictMode::Full,
            world_size: 1,
            rank: 0,
            warmup_steps: 10,
            steady_steps: 5,
            learning_rate: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
            seed: 0,
        }
    }
}

impl TrainConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("micro_batch_size", self.micro_batch_size),
            ("max_sequence_length", self.max_sequence_length),
            ("tensor_parallel_size", self.tensor_parallel_size),
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("world_size", self.world_size),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{} must be positive", name)));
            }
        }
        if self.vocab_size % self.tensor_parallel_size != 0 {
            return Err(ConfigError::invalid(format!(
                "tensor_parallel_size {} does not divide vocab_size {}",
                self.tensor_parallel_size, self.vocab_size
            )));
        }
        if self.rank >= self.world_size {
            return Err(ConfigError::invalid(format!(
                "rank {} out of range for world_size {}",
                self.rank, self.world_size
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ConfigError::invalid("learning_rate must be positive"));
        }
        Ok(())
    }

    /// Width of the label (output) dimension on this tensor-parallel rank.
    pub fn label_classes(&self) -> usize {
        self.vocab_size / self.tensor_parallel_size.max(1)
    }

    /// Rows of one synthetic batch.
    pub fn tokens_per_batch(&self) -> usize {
        self.micro_batch_size * self.max_sequence_length
    }

    pub fn shard_spec(&self) -> ShardSpec {
        ShardSpec {
            policy: self.shard_policy,
            strategy: self.shard_strategy,
            state_dict_mode: self.shard_state_dict_mode,
            world_size: self.world_size,
            rank: self.rank,
        }
    }

    pub fn hyperparams(&self) -> Hyperparams {
        Hyperparams {
            lr: self.learning_rate,
            momentum: self.momentum,
            weight_decay: self.weight_decay,
        }
    }
}
