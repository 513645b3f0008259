use std::collections::BTreeMap;

use clap::ValueEnum;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::{
    autograd::{Tape, Var},
    error::{EngineError, ShardError},
    nn::{Layer, Model, Module, ModuleKind, Param},
};

/// Which layers get their own shard unit.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ShardPolicy {
    /// Every layer lives in the root unit.
    #[default]
    None,
    /// Linear and transformer-block layers are wrapped individually.
    Transformer,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ShardStrategy {
    #[default]
    FullShard,
    ShardGradOp,
    NoShard,
    HybridShard,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StateDictMode {
    #[default]
    #[serde(alias = "full_state_dict")]
    Full,
    #[serde(alias = "local_state_dict")]
    Local,
    #[serde(alias = "sharded_state_dict")]
    Sharded,
}

impl ShardPolicy {
    pub fn short_name(&self) -> &'static str {
        match self {
            ShardPolicy::None => "none",
            ShardPolicy::Transformer => "transformer",
        }
    }

    pub fn wraps(&self, kind: ModuleKind) -> bool {
        match self {
            ShardPolicy::None => false,
            ShardPolicy::Transformer => {
                matches!(kind, ModuleKind::Linear | ModuleKind::TransformerBlock)
            }
        }
    }
}

impl ShardStrategy {
    pub fn short_name(&self) -> &'static str {
        match self {
            ShardStrategy::FullShard => "FS",
            ShardStrategy::ShardGradOp => "SGO",
            ShardStrategy::NoShard => "NS",
            ShardStrategy::HybridShard => "HS",
        }
    }
}

impl StateDictMode {
    pub fn short_name(&self) -> &'static str {
        match self {
            StateDictMode::Full => "full",
            StateDictMode::Local => "local",
            StateDictMode::Sharded => "sharded",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShardSpec {
    pub policy: ShardPolicy,
    pub strategy: ShardStrategy,
    pub state_dict_mode: StateDictMode,
    pub world_size: usize,
    pub rank: usize,
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self {
            policy: ShardPolicy::default(),
            strategy: ShardStrategy::default(),
            state_dict_mode: StateDictMode::default(),
            world_size: 1,
            rank: 0,
        }
    }
}

impl std::fmt::Display for ShardSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{} rank {} of {}",
            self.policy.short_name(),
            self.strategy.short_name(),
            self.state_dict_mode.short_name(),
            self.rank,
            self.world_size
        )
    }
}

/// Wraps a model for sharded execution. The returned model must compute the same
/// forward pass; its layer names are not guaranteed to survive.
pub trait ShardingBackend {
    fn shard(&self, model: Model, spec: &ShardSpec) -> Result<Model, ShardError>;
}

/// Module owned by a shard unit. Unit 0 is the root unit.
pub struct ShardedModule {
    inner: Box<dyn Module>,
    unit: usize,
    strategy: ShardStrategy,
}

impl Module for ShardedModule {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        trace!(unit = self.unit, strategy = self.strategy.short_name(), "sharded forward");
        self.inner.forward(tape, input)
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Wrapped
    }

    fn parameters(&self) -> Vec<Param> {
        self.inner.parameters()
    }

    fn instrumented_as(&self) -> Option<&str> {
        self.inner.instrumented_as()
    }
}

/// Shard unit per layer: wrapped layers get consecutive units from 1, the rest share
/// root unit 0.
pub fn assign_units(model: &Model, policy: ShardPolicy) -> Vec<usize> {
    let mut next_unit = 0;
    model
        .layers()
        .iter()
        .map(|layer| {
            if policy.wraps(layer.module().kind()) {
                next_unit += 1;
                next_unit
            } else {
                0
            }
        })
        .collect()
}

/// Single-process backend: assigns shard units and hides layer names, the way a
/// distributed wrapper does, while running every layer locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalShardBackend;

impl ShardingBackend for LocalShardBackend {
    fn shard(&self, model: Model, spec: &ShardSpec) -> Result<Model, ShardError> {
        if model.is_empty() {
            return Err(ShardError::EmptyModel);
        }
        if spec.rank >= spec.world_size {
            return Err(ShardError::InvalidRank {
                rank: spec.rank,
                world_size: spec.world_size,
            });
        }
        let units = assign_units(&model, spec.policy);
        let layers: Vec<Layer> = model
            .into_layers()
            .into_iter()
            .zip(&units)
            .enumerate()
            .map(|(i, (layer, &unit))| {
                let (name, inner) = layer.into_parts();
                debug!(layer = %name, unit, "assigned shard unit");
                Layer::new(
                    format!("_shard_wrapped_module.{}", i),
                    Box::new(ShardedModule {
                        inner,
                        unit,
                        strategy: spec.strategy,
                    }),
                )
            })
            .collect();
        let wrapped = units.iter().filter(|&&u| u > 0).count();
        info!(spec = %spec, wrapped, "sharded model");
        Ok(Model::from_layers(layers))
    }
}

fn chunk_rows(value: &Array2<f32>, world_size: usize, rank: usize) -> Array2<f32> {
    let rows = value.nrows();
    let chunk = rows.div_ceil(world_size.max(1));
    let start = (chunk * rank).min(rows);
    let end = (start + chunk).min(rows);
    value.slice_axis(Axis(0), (start..end).into()).to_owned()
}

/// Exports parameters keyed by name according to the state-dict mode.
///
/// `Full` returns whole tensors, `Sharded` this rank's row chunk, and `Local` the
/// same chunk flattened into a single row.
pub fn state_dict(model: &Model, spec: &ShardSpec) -> BTreeMap<String, Array2<f32>> {
    model
        .parameters()
        .into_iter()
        .map(|p| {
            let value = p.value();
            let exported = match spec.state_dict_mode {
                StateDictMode::Full => value,
                StateDictMode::Sharded => chunk_rows(&value, spec.world_size, spec.rank),
                StateDictMode::Local => {
                    let chunk = chunk_rows(&value, spec.world_size, spec.rank);
                    let len = chunk.len();
                    Array2::from_shape_vec((1, len), chunk.iter().copied().collect())
                        .unwrap_or_else(|_| Array2::zeros((1, 0)))
                }
            };
            (p.name(), exported)
        })
        .collect()
}
