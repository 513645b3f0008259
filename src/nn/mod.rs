use std::{cell::RefCell, fmt, rc::Rc};

use ndarray::Array2;

use crate::{
    autograd::{Tape, Var},
    error::EngineError,
};

pub mod layers;
pub use layers::{Linear, Relu, ResidualMlp};

/// Trainable tensor shared between the model, the tape and the optimizer.
#[derive(Clone)]
pub struct Param(Rc<RefCell<ParamData>>);

struct ParamData {
    name: String,
    value: Array2<f32>,
    grad: Option<Array2<f32>>,
    requires_grad: bool,
}

impl Param {
    pub fn new(name: impl ToString, value: Array2<f32>) -> Self {
        Param(Rc::new(RefCell::new(ParamData {
            name: name.to_string(),
            value,
            grad: None,
            requires_grad: true,
        })))
    }

    pub fn name(&self) -> String {
        self.0.borrow().name.clone()
    }

    pub fn value(&self) -> Array2<f32> {
        self.0.borrow().value.clone()
    }

    pub fn shape(&self) -> (usize, usize) {
        self.0.borrow().value.dim()
    }

    pub fn grad(&self) -> Option<Array2<f32>> {
        self.0.borrow().grad.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.0.borrow().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.0.borrow_mut().requires_grad = requires_grad;
    }

    pub fn accumulate_grad(&self, grad: &Array2<f32>) {
        let data = &mut *self.0.borrow_mut();
        match &mut data.grad {
            Some(acc) => *acc += grad,
            None => data.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&self) {
        self.0.borrow_mut().grad = None;
    }

    /// Applies `f(value, grad)` if a gradient is present. Returns whether it ran.
    pub fn update(&self, f: impl FnOnce(&mut Array2<f32>, &Array2<f32>)) -> bool {
        let mut data = self.0.borrow_mut();
        let ParamData { value, grad, .. } = &mut *data;
        match grad {
            Some(grad) => {
                f(value, grad);
                true
            }
            None => false,
        }
    }

    pub fn ptr_eq(&self, other: &Param) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        f.debug_struct("Param")
            .field("name", &data.name)
            .field("shape", &data.value.dim())
            .field("requires_grad", &data.requires_grad)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Linear,
    Activation,
    TransformerBlock,
    /// Produced by a sharding backend around another module.
    Wrapped,
    Other,
}

pub trait Module {
    fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError>;

    fn kind(&self) -> ModuleKind;

    fn parameters(&self) -> Vec<Param> {
        Vec::new()
    }

    /// True when there is at least one parameter and every parameter requires grad.
    fn has_trainable_parameters(&self) -> bool {
        let params = self.parameters();
        !params.is_empty() && params.iter().all(Param::requires_grad)
    }

    /// Name this module already emits trace events under. Wrappers must delegate so the
    /// marker survives rewrapping.
    fn instrumented_as(&self) -> Option<&str> {
        None
    }
}

/// A named top-level unit of the model.
pub struct Layer {
    pub(crate) name: String,
    pub(crate) module: Box<dyn Module>,
}

impl Layer {
    pub fn new(name: impl ToString, module: Box<dyn Module>) -> Self {
        Layer {
            name: name.to_string(),
            module,
        }
    }

    pub fn into_parts(self) -> (String, Box<dyn Module>) {
        (self.name, self.module)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &dyn Module {
        self.module.as_ref()
    }

    pub fn is_instrumented(&self) -> bool {
        self.module.instrumented_as().is_some()
    }
}

/// Snapshot of a layer taken before any wrapping.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    pub name: String,
    pub params: Vec<Param>,
    pub has_trainable_parameters: bool,
}

/// Layers in execution order. The order is fixed when the model is assembled.
#[derive(Default)]
pub struct Model {
    layers: Vec<Layer>,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, name: impl ToString, module: impl Module + 'static) -> Self {
        self.layers.push(Layer::new(name, Box::new(module)));
        self
    }

    pub fn from_layers(layers: Vec<Layer>) -> Self {
        Model { layers }
    }

    pub fn into_layers(self) -> Vec<Layer> {
        self.layers
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    pub fn layer_infos(&self) -> Vec<LayerInfo> {
        self.layers
            .iter()
            .map(|l| LayerInfo {
                name: l.name.clone(),
                params: l.module.parameters(),
                has_trainable_parameters: l.module.has_trainable_parameters(),
            })
            .collect()
    }

    pub fn parameters(&self) -> Vec<Param> {
        self.layers
            .iter()
            .flat_map(|l| l.module.parameters())
            .collect()
    }

    pub fn forward(&self, tape: &Tape, input: Var) -> Result<Var, EngineError> {
        self.layers
            .iter()
            .try_fold(input, |x, layer| layer.module.forward(tape, x))
    }

    pub fn zero_grad(&self) {
        self.parameters().iter().for_each(Param::zero_grad);
    }
}
