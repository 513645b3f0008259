use thiserror::Error;

/// Misuse of a recording session. These are programmer errors and are never retried.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecorderError {
    #[error("a recording session is already active")]
    AlreadyActive,
    #[error("no recording session is active")]
    NotActive,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("malformed trace line {line}: {content:?}")]
    Malformed { line: usize, content: String },
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("shape mismatch in {op}: {lhs:?} vs {rhs:?}")]
    ShapeMismatch {
        op: &'static str,
        lhs: (usize, usize),
        rhs: (usize, usize),
    },
    #[error("backward requires a scalar loss, got shape {0:?}")]
    NotScalar((usize, usize)),
    #[error("label {label} out of range for {classes} classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("backward already ran on this tape")]
    GraphConsumed,
    #[error("hook failed: {0}")]
    Hook(#[from] RecorderError),
}

#[derive(Debug, Error)]
pub enum ShardError {
    #[error("sharding requires at least one layer")]
    EmptyModel,
    #[error("rank {rank} out of range for world size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

/// Everything that can abort `Trainer::train`.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Shard(#[from] ShardError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("layer {0} is already instrumented")]
    AlreadyInstrumented(String),
    #[error("sharded model exposes {sharded} layers, expected {expected}")]
    ShardLayoutMismatch { expected: usize, sharded: usize },
}
