//! Training loop driver: warm-up, steady steps, then one profiled step whose trace is
//! sorted and written out.

use std::{collections::BTreeMap, fmt, path::Path};

use ndarray::Array2;
use tracing::{debug, info, warn};

use crate::{
    autograd::{Tape, Var},
    config::TrainConfig,
    device::{CpuDevice, Device},
    error::TrainError,
    instrument::instrument_model,
    models::Batch,
    nn::{LayerInfo, Model},
    optim::{build_param_groups, MomentumSgd, Optimizer, ParamGroup},
    postprocess,
    recorder::Recorder,
    sharding::{self, LocalShardBackend, ShardingBackend},
    trace::EventLabel,
};

/// Name under which the loss criterion is traced.
pub const LOSS_LAYER: &str = "loss";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Constructed,
    Sharded,
    Instrumented,
    WarmedUp,
    Steady,
    Profiled,
    Done,
}

impl Stage {
    pub fn short_name(&self) -> &'static str {
        match self {
            Stage::Constructed => "constructed",
            Stage::Sharded => "sharded",
            Stage::Instrumented => "instrumented",
            Stage::WarmedUp => "warmed_up",
            Stage::Steady => "steady",
            Stage::Profiled => "profiled",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

pub struct Trainer {
    config: TrainConfig,
    model: Model,
    /// Taken from the model before sharding, in layer order.
    layers: Vec<LayerInfo>,
    recorder: Recorder,
    device: Box<dyn Device>,
    /// Every stage reached so far. Never empty.
    stages: Vec<Stage>,
}

impl Trainer {
    pub fn new(config: TrainConfig, model: Model, recorder: Recorder) -> Result<Self, TrainError> {
        Self::with_backend(config, model, recorder, &LocalShardBackend)
    }

    /// Shards the model if configured, then instruments every layer under its pre-shard name.
    pub fn with_backend(
        config: TrainConfig,
        model: Model,
        recorder: Recorder,
        backend: &dyn ShardingBackend,
    ) -> Result<Self, TrainError> {
        config.validate()?;
        let layers = model.layer_infos();
        let names: Vec<String> = layers.iter().map(|l| l.name.clone()).collect();
        let mut trainer = Self {
            config,
            model,
            layers,
            recorder,
            device: Box::new(CpuDevice),
            stages: vec![Stage::Constructed],
        };

        if trainer.config.use_sharding {
            let spec = trainer.config.shard_spec();
            trainer.model = backend.shard(std::mem::take(&mut trainer.model), &spec)?;
            info!(spec = %spec, "model sharded");
            trainer.advance(Stage::Sharded);
        }

        trainer.model = instrument_model(
            std::mem::take(&mut trainer.model),
            &names,
            &trainer.recorder,
        )?;
        info!(layers = names.len(), "layers instrumented");
        trainer.advance(Stage::Instrumented);
        Ok(trainer)
    }

    pub fn with_device(mut self, device: impl Device + 'static) -> Self {
        self.device = Box::new(device);
        self
    }

    pub fn stage(&self) -> Stage {
        self.stages.last().copied().unwrap_or(Stage::Constructed)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    /// One group per layer except the last.
    pub fn param_groups(&self) -> Vec<ParamGroup> {
        build_param_groups(&self.layers, &self.config.hyperparams())
    }

    pub fn state_dict(&self) -> BTreeMap<String, Array2<f32>> {
        sharding::state_dict(&self.model, &self.config.shard_spec())
    }

    fn advance(&mut self, stage: Stage) {
        info!(from = %self.stage(), to = %stage, "stage");
        self.stages.push(stage);
    }

    /// Runs the full schedule with a [`MomentumSgd`] over [`Self::param_groups`] and a
    /// synthetic batch. Returns the sorted trace lines written to `output`.
    pub fn train(&mut self, output: impl AsRef<Path>) -> Result<Vec<String>, TrainError> {
        let mut optimizer = MomentumSgd::new(self.param_groups(), self.recorder.clone());
        let batch = Batch::synthetic(&self.config);
        self.train_with(&mut optimizer, &batch, output)
    }

    pub fn train_with(
        &mut self,
        optimizer: &mut dyn Optimizer,
        batch: &Batch,
        output: impl AsRef<Path>,
    ) -> Result<Vec<String>, TrainError> {
        info!(
            architecture = %self.config.model_architecture_name,
            micro_batch_size = self.config.micro_batch_size,
            device = self.device.name(),
            "training"
        );

        self.device.set_autotune(true);
        for step in 0..self.config.warmup_steps {
            self.train_step(optimizer, batch, false)?;
            self.device.empty_cache();
            debug!(step, "warm-up step done");
        }
        self.device.set_autotune(false);
        self.advance(Stage::WarmedUp);

        for step in 0..self.config.steady_steps {
            self.train_step(optimizer, batch, false)?;
            debug!(step, "steady step done");
        }
        self.device.synchronize()?;
        self.advance(Stage::Steady);

        self.recorder.init()?;
        let profiled = self
            .train_step(optimizer, batch, true)
            .and_then(|()| self.device.synchronize().map_err(TrainError::from));
        let log = self.recorder.finish();
        if let Err(e) = profiled {
            warn!(error = %e, "profiled step failed, trace discarded");
            return Err(e);
        }
        let log = log?;
        self.advance(Stage::Profiled);

        let lines = postprocess::process(&log, output)?;
        self.advance(Stage::Done);
        Ok(lines)
    }

    fn criterion(&self, tape: &Tape, logits: Var, labels: &[usize]) -> Result<Var, TrainError> {
        self.recorder
            .record_if_active(EventLabel::forward_start(LOSS_LAYER))?;
        let loss = tape.cross_entropy(logits, labels)?;
        self.recorder
            .record_if_active(EventLabel::forward_end(LOSS_LAYER))?;
        Ok(loss)
    }

    /// Clear gradients, forward, loss, backward, optimizer step, clear gradients.
    fn train_step(
        &self,
        optimizer: &mut dyn Optimizer,
        batch: &Batch,
        profile: bool,
    ) -> Result<(), TrainError> {
        self.model.zero_grad();
        let tape = Tape::new();
        let inputs = tape.input(batch.inputs.clone());
        let logits = self.model.forward(&tape, inputs)?;
        let loss = self.criterion(&tape, logits, &batch.labels)?;
        tape.backward(loss)?;
        optimizer.step(profile)?;
        optimizer.zero_grad();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{EngineError, RecorderError, ShardError},
        instrument::instrument,
        models::token_mlp,
        nn::Linear,
        recorder::tests::StepClock,
        sharding::{ShardPolicy, ShardSpec},
    };
    use std::{cell::RefCell, rc::Rc, sync::Arc};

    fn small_config() -> TrainConfig {
        TrainConfig {
            micro_batch_size: 2,
            max_sequence_length: 3,
            hidden_size: 4,
            vocab_size: 6,
            warmup_steps: 2,
            steady_steps: 1,
            ..Default::default()
        }
    }

    #[derive(Clone, Default)]
    struct LoggingDevice {
        calls: Rc<RefCell<Vec<String>>>,
        recorder: Option<Recorder>,
        fail_sync: bool,
    }

    impl Device for LoggingDevice {
        fn name(&self) -> &str {
            "logging"
        }

        fn synchronize(&self) -> Result<(), EngineError> {
            let active = self.recorder.as_ref().is_some_and(Recorder::is_active);
            self.calls.borrow_mut().push(format!("sync active={}", active));
            if self.fail_sync && active {
                return Err(EngineError::GraphConsumed);
            }
            Ok(())
        }

        fn empty_cache(&self) {
            self.calls.borrow_mut().push("empty_cache".to_string());
        }

        fn set_autotune(&self, enabled: bool) {
            self.calls.borrow_mut().push(format!("autotune {}", enabled));
        }
    }

    #[test]
    fn test_device_schedule() {
        let recorder = Recorder::with_clock(Arc::new(StepClock::new(1)));
        let config = small_config();
        let device = LoggingDevice {
            recorder: Some(recorder.clone()),
            ..Default::default()
        };
        let calls = device.calls.clone();
        let mut trainer = Trainer::new(config.clone(), token_mlp(&config), recorder)
            .unwrap()
            .with_device(device);
        let dir = tempfile::tempdir().unwrap();
        trainer.train(dir.path().join("trace.log")).unwrap();

        assert_eq!(
            *calls.borrow(),
            vec![
                "autotune true",
                "empty_cache",
                "empty_cache",
                "autotune false",
                "sync active=false",
                "sync active=true",
            ]
        );
        assert_eq!(trainer.stage(), Stage::Done);
        assert_eq!(
            trainer.stages(),
            [
                Stage::Constructed,
                Stage::Instrumented,
                Stage::WarmedUp,
                Stage::Steady,
                Stage::Profiled,
                Stage::Done,
            ]
        );
    }

    #[test]
    fn test_failed_profiled_step_discards_session() {
        let recorder = Recorder::with_clock(Arc::new(StepClock::new(1)));
        let config = small_config();
        let device = LoggingDevice {
            recorder: Some(recorder.clone()),
            fail_sync: true,
            ..Default::default()
        };
        let mut trainer = Trainer::new(config.clone(), token_mlp(&config), recorder.clone())
            .unwrap()
            .with_device(device);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        assert!(matches!(
            trainer.train(&dest),
            Err(TrainError::Engine(EngineError::GraphConsumed))
        ));
        assert!(!recorder.is_active());
        assert!(!dest.exists());
        assert_eq!(trainer.stage(), Stage::Steady);
    }

    #[test]
    fn test_active_session_aborts_before_profiling() {
        let recorder = Recorder::new();
        let config = small_config();
        let mut trainer = Trainer::new(config.clone(), token_mlp(&config), recorder.clone()).unwrap();
        recorder.init().unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            trainer.train(dir.path().join("trace.log")),
            Err(TrainError::Recorder(RecorderError::AlreadyActive))
        ));
    }

    #[test]
    fn test_warmup_error_propagates() {
        let config = small_config();
        let mut batch = Batch::synthetic(&config);
        batch.labels[0] = config.label_classes();
        let mut trainer = Trainer::new(config.clone(), token_mlp(&config), Recorder::new()).unwrap();
        let mut optimizer = MomentumSgd::new(trainer.param_groups(), Recorder::new());
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("trace.log");
        assert!(matches!(
            trainer.train_with(&mut optimizer, &batch, &dest),
            Err(TrainError::Engine(EngineError::LabelOutOfRange { .. }))
        ));
        assert_eq!(trainer.stage(), Stage::Instrumented);
        assert!(!dest.exists());
    }

    #[test]
    fn test_names_survive_sharding() {
        let config = TrainConfig {
            use_sharding: true,
            shard_policy: ShardPolicy::Transformer,
            ..small_config()
        };
        let trainer = Trainer::new(config.clone(), token_mlp(&config), Recorder::new()).unwrap();
        assert_eq!(trainer.layer_names(), vec!["input_proj", "act", "block", "head"]);
        assert_eq!(trainer.model().layer_names(), trainer.layer_names());
        let groups: Vec<_> = trainer.param_groups().into_iter().map(|g| g.layer).collect();
        assert_eq!(groups, vec!["input_proj", "act", "block"]);
        assert_eq!(trainer.state_dict().len(), 8);
        assert_eq!(
            trainer.stages(),
            [Stage::Constructed, Stage::Sharded, Stage::Instrumented]
        );
    }

    #[test]
    fn test_instrumented_model_rejected_through_sharding() {
        let config = TrainConfig {
            use_sharding: true,
            shard_policy: ShardPolicy::Transformer,
            ..small_config()
        };
        let recorder = Recorder::new();
        let model = instrument(token_mlp(&config), &recorder).unwrap();
        assert!(matches!(
            Trainer::new(config.clone(), model, recorder.clone()),
            Err(TrainError::AlreadyInstrumented(name)) if name == "input_proj"
        ));

        let unsharded = TrainConfig {
            use_sharding: false,
            ..config
        };
        let model = instrument(token_mlp(&unsharded), &recorder).unwrap();
        assert!(matches!(
            Trainer::new(unsharded, model, recorder),
            Err(TrainError::AlreadyInstrumented(name)) if name == "input_proj"
        ));
    }

    struct SplittingBackend;

    impl ShardingBackend for SplittingBackend {
        fn shard(&self, model: Model, _spec: &ShardSpec) -> Result<Model, ShardError> {
            Ok(model.push("extra", Linear::new("extra", 4, 4, 0)))
        }
    }

    #[test]
    fn test_shard_layout_mismatch() {
        let config = TrainConfig {
            use_sharding: true,
            ..small_config()
        };
        assert!(matches!(
            Trainer::with_backend(config.clone(), token_mlp(&config), Recorder::new(), &SplittingBackend),
            Err(TrainError::ShardLayoutMismatch {
                expected: 4,
                sharded: 5
            })
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrainConfig {
            hidden_size: 0,
            ..small_config()
        };
        let model = Model::new().push("fc", Linear::new("fc", 1, 1, 0));
        assert!(matches!(
            Trainer::new(config, model, Recorder::new()),
            Err(TrainError::Config(_))
        ));
    }
}
