use ndarray::Array2;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    autograd::{Tape, Var},
    error::EngineError,
};

use super::{Module, ModuleKind, Param};

fn uniform(rng: &mut StdRng, rows: usize, cols: usize, bound: f32) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-bound..=bound))
}

/// `y = x W + b` with `W: [in, out]` and `b: [1, out]`.
pub struct Linear {
    weight: Param,
    bias: Param,
}

impl Linear {
    pub fn new(name: impl ToString, in_features: usize, out_features: usize, seed: u64) -> Self {
        let name = name.to_string();
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        Self::from_weights(
            name,
            uniform(&mut rng, in_features, out_features, bound),
            uniform(&mut rng, 1, out_features, bound),
        )
    }

    pub fn from_weights(name: impl ToString, weight: Array2<f32>, bias: Array2<f32>) -> Self {
        let name = name.to_string();
        Linear {
            weight: Param::new(format!("{}.weight", name), weight),
            bias: Param::new(format!("{}.bias", name), bias),
        }
    }

    /// Stops gradient flow into this layer's parameters.
    pub fn frozen(self) -> Self {
        self.weight.set_requires_grad(false);
        self.bias.set_requires_grad(false);
        self
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape().0
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape().1
    }
}

impl Module for Linear {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        let weight = tape.param(&self.weight);
        let bias = tape.param(&self.bias);
        let h = tape.matmul(input, weight)?;
        tape.add_bias(h, bias)
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Linear
    }

    fn parameters(&self) -> Vec<Param> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

pub struct Relu;

impl Module for Relu {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        Ok(tape.relu(input))
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::Activation
    }
}

/// Feed-forward half of a transformer block: `x + W2 relu(W1 x)`.
pub struct ResidualMlp {
    up: Linear,
    down: Linear,
}

impl ResidualMlp {
    pub fn new(name: impl ToString, hidden: usize, intermediate: usize, seed: u64) -> Self {
        let name = name.to_string();
        ResidualMlp {
            up: Linear::new(format!("{}.up", name), hidden, intermediate, seed),
            down: Linear::new(format!("{}.down", name), intermediate, hidden, seed.wrapping_add(1)),
        }
    }
}

impl Module for ResidualMlp {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        let h = self.up.forward(tape, input)?;
        let h = tape.relu(h);
        let h = self.down.forward(tape, h)?;
        tape.add(input, h)
    }

    fn kind(&self) -> ModuleKind {
        ModuleKind::TransformerBlock
    }

    fn parameters(&self) -> Vec<Param> {
        let mut params = self.up.parameters();
        params.extend(self.down.parameters());
        params
    }
}
