//! Reference reverse-mode autodiff engine.
//!
//! Every forward call appends nodes to a [`Tape`]; node indices are creation order, which
//! is also a topological order, so backward simply walks the tape in reverse. Hooks hang
//! off individual nodes of one invocation, never off a layer globally.

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet},
};

use ndarray::{Array2, Axis, Zip};
use petgraph::{
    graph::{DiGraph, NodeIndex},
    visit::{Dfs, Reversed},
};

use crate::{
    error::{EngineError, RecorderError},
    nn::Param,
};

pub type Hook = Box<dyn FnMut() -> Result<(), RecorderError>>;

/// Handle to a value recorded on a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Var(NodeIndex);

impl Var {
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// Position on the tape; every node created afterwards has an index `>=` the mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mark(usize);

/// Callback registration on the per-invocation nodes of the backward graph.
pub trait BackwardHooks {
    /// Fires when backward computation for `node` begins.
    fn register_prehook(&self, node: Var, hook: Hook);
    /// Fires once backward computation for `node` is done.
    fn register_posthook(&self, node: Var, hook: Hook);
    /// Fires once every node created between `since` and `output` (inclusive) that takes
    /// part in the backward pass is done.
    fn register_scope_posthook(&self, since: Mark, output: Var, hook: Hook);
}

enum Op {
    Input,
    Param(Param),
    MatMul(NodeIndex, NodeIndex),
    AddBias(NodeIndex, NodeIndex),
    Add(NodeIndex, NodeIndex),
    Relu(NodeIndex),
    CrossEntropy {
        logits: NodeIndex,
        probs: Array2<f32>,
        targets: Vec<usize>,
    },
}

struct Node {
    op: Op,
    value: Array2<f32>,
    requires_grad: bool,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
}

struct ScopeHook {
    first: usize,
    last: usize,
    hook: Hook,
}

#[derive(Default)]
pub struct Tape {
    graph: RefCell<DiGraph<Node, ()>>,
    scope_hooks: RefCell<Vec<ScopeHook>>,
    consumed: Cell<bool>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.graph.borrow().node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark(&self) -> Mark {
        Mark(self.len())
    }

    pub fn value(&self, var: Var) -> Array2<f32> {
        self.graph.borrow()[var.0].value.clone()
    }

    pub fn shape(&self, var: Var) -> (usize, usize) {
        self.graph.borrow()[var.0].value.dim()
    }

    pub fn requires_grad(&self, var: Var) -> bool {
        self.graph.borrow()[var.0].requires_grad
    }

    fn push(&self, op: Op, value: Array2<f32>, requires_grad: bool, inputs: &[NodeIndex]) -> Var {
        let mut graph = self.graph.borrow_mut();
        let idx = graph.add_node(Node {
            op,
            value,
            requires_grad,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        });
        for &input in inputs {
            graph.add_edge(input, idx, ());
        }
        Var(idx)
    }

    pub fn input(&self, value: Array2<f32>) -> Var {
        self.push(Op::Input, value, false, &[])
    }

    pub fn param(&self, param: &Param) -> Var {
        self.push(
            Op::Param(param.clone()),
            param.value(),
            param.requires_grad(),
            &[],
        )
    }

    pub fn matmul(&self, a: Var, b: Var) -> Result<Var, EngineError> {
        let (value, requires_grad) = {
            let graph = self.graph.borrow();
            let (x, y) = (&graph[a.0], &graph[b.0]);
            if x.value.ncols() != y.value.nrows() {
                return Err(EngineError::ShapeMismatch {
                    op: "matmul",
                    lhs: x.value.dim(),
                    rhs: y.value.dim(),
                });
            }
            (x.value.dot(&y.value), x.requires_grad || y.requires_grad)
        };
        Ok(self.push(Op::MatMul(a.0, b.0), value, requires_grad, &[a.0, b.0]))
    }

    /// `x + bias` with a `[1, d]` bias broadcast over the rows of `x`.
    pub fn add_bias(&self, x: Var, bias: Var) -> Result<Var, EngineError> {
        let (value, requires_grad) = {
            let graph = self.graph.borrow();
            let (x, b) = (&graph[x.0], &graph[bias.0]);
            if b.value.nrows() != 1 || b.value.ncols() != x.value.ncols() {
                return Err(EngineError::ShapeMismatch {
                    op: "add_bias",
                    lhs: x.value.dim(),
                    rhs: b.value.dim(),
                });
            }
            (&x.value + &b.value, x.requires_grad || b.requires_grad)
        };
        Ok(self.push(Op::AddBias(x.0, bias.0), value, requires_grad, &[x.0, bias.0]))
    }

    pub fn add(&self, a: Var, b: Var) -> Result<Var, EngineError> {
        let (value, requires_grad) = {
            let graph = self.graph.borrow();
            let (x, y) = (&graph[a.0], &graph[b.0]);
            if x.value.dim() != y.value.dim() {
                return Err(EngineError::ShapeMismatch {
                    op: "add",
                    lhs: x.value.dim(),
                    rhs: y.value.dim(),
                });
            }
            (&x.value + &y.value, x.requires_grad || y.requires_grad)
        };
        Ok(self.push(Op::Add(a.0, b.0), value, requires_grad, &[a.0, b.0]))
    }

    pub fn relu(&self, x: Var) -> Var {
        let (value, requires_grad) = {
            let graph = self.graph.borrow();
            let node = &graph[x.0];
            (node.value.mapv(|v| v.max(0.0)), node.requires_grad)
        };
        self.push(Op::Relu(x.0), value, requires_grad, &[x.0])
    }

    /// Mean softmax cross-entropy of `logits` (`[n, classes]`) against class indices.
    pub fn cross_entropy(&self, logits: Var, targets: &[usize]) -> Result<Var, EngineError> {
        let (probs, loss, requires_grad) = {
            let graph = self.graph.borrow();
            let node = &graph[logits.0];
            let (rows, classes) = node.value.dim();
            if rows != targets.len() {
                return Err(EngineError::ShapeMismatch {
                    op: "cross_entropy",
                    lhs: (rows, classes),
                    rhs: (targets.len(), 1),
                });
            }
            if let Some(&label) = targets.iter().find(|&&t| t >= classes) {
                return Err(EngineError::LabelOutOfRange { label, classes });
            }
            let mut probs = node.value.clone();
            for mut row in probs.rows_mut() {
                let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                row.mapv_inplace(|v| (v - max).exp());
                let sum = row.sum();
                row.mapv_inplace(|v| v / sum);
            }
            let loss = targets
                .iter()
                .enumerate()
                .map(|(row, &t)| -probs[[row, t]].max(f32::MIN_POSITIVE).ln())
                .sum::<f32>()
                / rows.max(1) as f32;
            (probs, loss, node.requires_grad)
        };
        Ok(self.push(
            Op::CrossEntropy {
                logits: logits.0,
                probs,
                targets: targets.to_vec(),
            },
            Array2::from_elem((1, 1), loss),
            requires_grad,
            &[logits.0],
        ))
    }

    /// Runs the backward pass from a scalar `loss`. A tape can be differentiated once.
    pub fn backward(&self, loss: Var) -> Result<(), EngineError> {
        if self.consumed.replace(true) {
            return Err(EngineError::GraphConsumed);
        }
        let mut graph = self.graph.borrow_mut();
        let shape = graph[loss.0].value.dim();
        if shape != (1, 1) {
            return Err(EngineError::NotScalar(shape));
        }

        let mut reached = HashSet::new();
        {
            let reversed = Reversed(&*graph);
            let mut dfs = Dfs::new(reversed, loss.0);
            while let Some(idx) = dfs.next(reversed) {
                if graph[idx].requires_grad {
                    reached.insert(idx);
                }
            }
        }

        // Walking in reverse, the lowest reached index of a scope is the last to finish.
        for ScopeHook { first, last, hook } in self.scope_hooks.borrow_mut().drain(..) {
            let target = (first..=last)
                .map(NodeIndex::new)
                .find(|idx| reached.contains(idx));
            if let Some(target) = target {
                graph[target].post_hooks.push(hook);
            }
        }

        let mut grads: HashMap<NodeIndex, Array2<f32>> = HashMap::new();
        grads.insert(loss.0, Array2::ones((1, 1)));

        for idx in (0..=loss.0.index()).rev().map(NodeIndex::new) {
            if !reached.contains(&idx) {
                continue;
            }
            let Some(grad) = grads.remove(&idx) else {
                continue;
            };
            for hook in graph[idx].pre_hooks.iter_mut() {
                hook()?;
            }

            let contributions = match &graph[idx].op {
                Op::Input => vec![],
                Op::Param(param) => {
                    param.accumulate_grad(&grad);
                    vec![]
                }
                Op::MatMul(a, b) => vec![
                    (*a, grad.dot(&graph[*b].value.t())),
                    (*b, graph[*a].value.t().dot(&grad)),
                ],
                Op::AddBias(x, bias) => vec![
                    (*x, grad.clone()),
                    (*bias, grad.sum_axis(Axis(0)).insert_axis(Axis(0))),
                ],
                Op::Add(a, b) => vec![(*a, grad.clone()), (*b, grad)],
                Op::Relu(x) => {
                    let mut dx = grad;
                    Zip::from(&mut dx)
                        .and(&graph[*x].value)
                        .for_each(|d, &v| {
                            if v <= 0.0 {
                                *d = 0.0;
                            }
                        });
                    vec![(*x, dx)]
                }
                Op::CrossEntropy {
                    logits,
                    probs,
                    targets,
                } => {
                    let scale = grad[[0, 0]] / targets.len().max(1) as f32;
                    let mut dlogits = probs.clone();
                    for (row, &t) in targets.iter().enumerate() {
                        dlogits[[row, t]] -= 1.0;
                    }
                    dlogits *= scale;
                    vec![(*logits, dlogits)]
                }
            };

            for (input, g) in contributions {
                if !graph[input].requires_grad {
                    continue;
                }
                match grads.get_mut(&input) {
                    Some(acc) => *acc += &g,
                    None => {
                        grads.insert(input, g);
                    }
                }
            }

            for hook in graph[idx].post_hooks.iter_mut() {
                hook()?;
            }
        }
        Ok(())
    }
}

impl BackwardHooks for Tape {
    fn register_prehook(&self, node: Var, hook: Hook) {
        self.graph.borrow_mut()[node.0].pre_hooks.push(hook);
    }

    fn register_posthook(&self, node: Var, hook: Hook) {
        self.graph.borrow_mut()[node.0].post_hooks.push(hook);
    }

    fn register_scope_posthook(&self, since: Mark, output: Var, hook: Hook) {
        self.scope_hooks.borrow_mut().push(ScopeHook {
            first: since.0,
            last: output.index(),
            hook,
        });
    }
}
