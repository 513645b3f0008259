use ndarray::Array2;
use tracing::{debug, warn};

use crate::{
    error::TrainError,
    nn::{LayerInfo, Param},
    recorder::Recorder,
    trace::{Boundary, EventLabel, Phase},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparams {
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
}

impl Default for Hyperparams {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 5e-4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Param>,
    pub lr: f32,
    pub momentum: f32,
    pub weight_decay: f32,
    pub layer: String,
}

/// One group per layer, in layer order, leaving out the last layer.
///
/// The final layer (usually the output head) is never handed to the grouped optimizer.
/// Layers without parameters still get an (empty) group so group order matches layer order.
pub fn build_param_groups(layers: &[LayerInfo], hp: &Hyperparams) -> Vec<ParamGroup> {
    if layers.len() < 2 {
        warn!(
            layers = layers.len(),
            "model has fewer than two layers, no parameter groups built"
        );
    }
    let keep = layers.len().saturating_sub(1);
    layers[..keep]
        .iter()
        .map(|layer| ParamGroup {
            params: layer.params.clone(),
            lr: hp.lr,
            momentum: hp.momentum,
            weight_decay: hp.weight_decay,
            layer: layer.name.clone(),
        })
        .collect()
}

pub trait Optimizer {
    /// Applies one update. With `profile` set, every group's update is bracketed by
    /// `optimizer start/end <layer>` events on the active recording session.
    fn step(&mut self, profile: bool) -> Result<(), TrainError>;

    fn zero_grad(&mut self);
}

/// SGD with momentum and L2 weight decay:
/// `g += wd * w; v = m * v + g; w -= lr * v`.
pub struct MomentumSgd {
    groups: Vec<ParamGroup>,
    velocity: Vec<Vec<Option<Array2<f32>>>>,
    recorder: Recorder,
}

impl MomentumSgd {
    pub fn new(groups: Vec<ParamGroup>, recorder: Recorder) -> Self {
        let velocity = groups.iter().map(|g| vec![None; g.params.len()]).collect();
        Self {
            groups,
            velocity,
            recorder,
        }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }
}

impl Optimizer for MomentumSgd {
    fn step(&mut self, profile: bool) -> Result<(), TrainError> {
        for (group, velocity) in self.groups.iter().zip(self.velocity.iter_mut()) {
            if profile {
                self.recorder
                    .record(EventLabel::new(Phase::Optimizer, Boundary::Start, &group.layer))?;
            }
            let mut updated = 0;
            for (param, v) in group.params.iter().zip(velocity.iter_mut()) {
                if !param.requires_grad() {
                    continue;
                }
                let ran = param.update(|w, g| {
                    let g = g + &(&*w * group.weight_decay);
                    let next = match v.take() {
                        Some(prev) if group.momentum != 0.0 => prev * group.momentum + &g,
                        _ => g,
                    };
                    w.scaled_add(-group.lr, &next);
                    *v = Some(next);
                });
                updated += ran as usize;
            }
            debug!(layer = %group.layer, updated, "optimizer group step");
            if profile {
                self.recorder
                    .record(EventLabel::new(Phase::Optimizer, Boundary::End, &group.layer))?;
            }
        }
        Ok(())
    }

    fn zero_grad(&mut self) {
        self.groups
            .iter()
            .flat_map(|g| g.params.iter())
            .for_each(Param::zero_grad);
    }
}
