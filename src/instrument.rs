//! Per-layer timestamp instrumentation.
//!
//! [`Instrumented`] decorates a module: forward is bracketed by `forward start/end`, the
//! invocation's output node gets a `backward start` pre-hook, and layers whose parameters
//! are all trainable get a `backward end` hook over the nodes they created.

use tracing::debug;

use crate::{
    autograd::{BackwardHooks, Hook, Tape, Var},
    error::{EngineError, TrainError},
    nn::{Layer, Model, Module, ModuleKind, Param},
    recorder::Recorder,
    trace::EventLabel,
};

pub struct Instrumented {
    name: String,
    inner: Box<dyn Module>,
    recorder: Recorder,
    track_backward_end: bool,
}

fn timestamp_hook(recorder: &Recorder, label: EventLabel) -> Hook {
    let recorder = recorder.clone();
    let label = label.to_string();
    Box::new(move || recorder.record_if_active(&label).map(drop))
}

impl Instrumented {
    pub fn new(name: impl ToString, inner: Box<dyn Module>, recorder: Recorder) -> Self {
        let track_backward_end = inner.has_trainable_parameters();
        Instrumented {
            name: name.to_string(),
            inner,
            recorder,
            track_backward_end,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracks_backward_end(&self) -> bool {
        self.track_backward_end
    }
}

impl Module for Instrumented {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        self.recorder
            .record_if_active(EventLabel::forward_start(&self.name))?;
        let mark = tape.mark();
        let output = self.inner.forward(tape, input)?;
        self.recorder
            .record_if_active(EventLabel::forward_end(&self.name))?;

        tape.register_prehook(
            output,
            timestamp_hook(&self.recorder, EventLabel::backward_start(&self.name)),
        );
        if self.track_backward_end {
            tape.register_scope_posthook(
                mark,
                output,
                timestamp_hook(&self.recorder, EventLabel::backward_end(&self.name)),
            );
        }
        Ok(output)
    }

    fn kind(&self) -> ModuleKind {
        self.inner.kind()
    }

    fn parameters(&self) -> Vec<Param> {
        self.inner.parameters()
    }

    fn instrumented_as(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Wraps every top-level layer, naming them from `names` in order.
///
/// Fails if a layer's module already emits events under the name it would get here,
/// even when that module sits under other wrappers. Wrapping twice would emit every
/// event twice.
pub fn instrument_model(
    model: Model,
    names: &[String],
    recorder: &Recorder,
) -> Result<Model, TrainError> {
    if names.len() != model.len() {
        return Err(TrainError::ShardLayoutMismatch {
            expected: names.len(),
            sharded: model.len(),
        });
    }
    if let Some(name) = model
        .layers()
        .iter()
        .zip(names)
        .find(|(layer, name)| layer.module().instrumented_as() == Some(name.as_str()))
        .map(|(_, name)| name)
    {
        return Err(TrainError::AlreadyInstrumented(name.clone()));
    }
    let layers = model
        .into_layers()
        .into_iter()
        .zip(names)
        .map(|(layer, name)| {
            let wrapped = Instrumented::new(name, layer.module, recorder.clone());
            debug!(
                layer = %name,
                backward_end = wrapped.tracks_backward_end(),
                "instrumented layer"
            );
            Layer::new(name, Box::new(wrapped))
        })
        .collect();
    Ok(Model::from_layers(layers))
}

/// Instruments a model that was never wrapped, keeping its own layer names.
pub fn instrument(model: Model, recorder: &Recorder) -> Result<Model, TrainError> {
    let names = model.layer_names();
    instrument_model(model, &names, recorder)
}
