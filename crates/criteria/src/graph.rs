//! # Criterion Graph
//!
//! The arena that owns criterion nodes and drives them. Nodes live in a
//! petgraph `DiGraph`; edges point from input to consumer and carry the
//! input slot they fill, so one source can feed several criteria (or
//! several slots of the same criterion) and gradient accumulation makes
//! the diamond correct.
//!
//! ## Node Contract
//!
//! - `validate` checks shapes and residency before any evaluation.
//! - `evaluate` computes the node's 1×1 value from its inputs' values
//!   and bumps the node's generation, invalidating backward caches.
//! - `compute_input_partial(i)` reads the chain-rule seed from the
//!   node's own gradient and *adds* the scaled partial into input `i`'s
//!   gradient accumulator. It never overwrites.
//! - `forward`/`backward` drive the whole graph in topological order.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Seek, Write};
use std::mem;

use bitflags::bitflags;
use log::warn;
use num_traits::Float;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use trellis_core::{CriterionError, Matrix, MinibatchLayout, Placement};

use crate::class_softmax::ClassSoftmaxState;
use crate::crf::CrfState;
use crate::elementwise::{CrossEntropyState, CrossEntropyWithSoftmaxState, SquareErrorState};
use crate::nce::{NceEvalMode, NceState};
use crate::node::{InputMeta, Op};
use crate::reg::L1RegState;
use crate::{class_softmax, crf, dummy, elementwise, nce, reg};

bitflags! {
    /// What [`CriterionGraph::copy_node_state`] carries over.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CopyFlags: u8 {
        /// The forward value and gradient matrices.
        const VALUE = 1 << 0;
        /// Kind-specific state such as the NCE eval mode and caches.
        const STATE = 1 << 1;
    }
}

/// One node: its operation, forward value, gradient accumulator, and
/// the generation of its last forward evaluation.
#[derive(Debug, Clone)]
struct Node<E> {
    op: Op<E>,
    value: Matrix<E>,
    gradient: Matrix<E>,
    generation: u64,
}

impl<E: Float> Node<E> {
    fn new(op: Op<E>, value: Matrix<E>) -> Self {
        Self {
            op,
            value,
            gradient: Matrix::zeros(0, 0),
            generation: 0,
        }
    }
}

/// A computation graph of sources and criterion nodes.
pub struct CriterionGraph<E> {
    graph: DiGraph<Node<E>, usize>,
    layout: Option<MinibatchLayout>,
    generation: u64,
}

impl<E: Float> CriterionGraph<E> {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            layout: None,
            generation: 0,
        }
    }

    // ========================================================================
    // Construction
    // ========================================================================

    /// Add a source node holding a zero matrix of the given shape.
    pub fn source(&mut self, rows: usize, cols: usize) -> NodeIndex {
        self.graph.add_node(Node::new(Op::Source, Matrix::zeros(rows, cols)))
    }

    /// Add a source node holding the given value.
    pub fn source_from(&mut self, value: Matrix<E>) -> NodeIndex {
        self.graph.add_node(Node::new(Op::Source, value))
    }

    pub fn square_error(&mut self, left: NodeIndex, right: NodeIndex) -> NodeIndex {
        self.add_criterion(Op::SquareError(SquareErrorState::new()), &[left, right])
    }

    pub fn cross_entropy(&mut self, label: NodeIndex, prediction: NodeIndex) -> NodeIndex {
        self.add_criterion(Op::CrossEntropy(CrossEntropyState::new()), &[label, prediction])
    }

    pub fn cross_entropy_with_softmax(
        &mut self,
        label: NodeIndex,
        prediction: NodeIndex,
    ) -> NodeIndex {
        self.add_criterion(
            Op::CrossEntropyWithSoftmax(CrossEntropyWithSoftmaxState::new()),
            &[label, prediction],
        )
    }

    pub fn l1_reg(&mut self, input: NodeIndex) -> NodeIndex {
        self.add_criterion(Op::L1Reg(L1RegState::new()), &[input])
    }

    pub fn l2_reg(&mut self, input: NodeIndex) -> NodeIndex {
        self.add_criterion(Op::L2Reg, &[input])
    }

    pub fn nce(
        &mut self,
        descriptor: NodeIndex,
        hidden: NodeIndex,
        weight: NodeIndex,
        bias: NodeIndex,
        mode: NceEvalMode,
    ) -> NodeIndex {
        self.add_criterion(
            Op::Nce(NceState::new(mode)),
            &[descriptor, hidden, weight, bias],
        )
    }

    pub fn class_cross_entropy_with_softmax(
        &mut self,
        label: NodeIndex,
        hidden: NodeIndex,
        weight: NodeIndex,
        class_scores: NodeIndex,
    ) -> NodeIndex {
        self.add_criterion(
            Op::ClassCrossEntropyWithSoftmax(ClassSoftmaxState::new()),
            &[label, hidden, weight, class_scores],
        )
    }

    pub fn crf(
        &mut self,
        label: NodeIndex,
        emission: NodeIndex,
        transition: NodeIndex,
    ) -> NodeIndex {
        self.add_criterion(Op::Crf(CrfState::new()), &[label, emission, transition])
    }

    pub fn dummy_criterion(
        &mut self,
        objective: NodeIndex,
        derivative: NodeIndex,
        prediction: NodeIndex,
    ) -> NodeIndex {
        self.add_criterion(Op::DummyCriterion, &[objective, derivative, prediction])
    }

    fn add_criterion(&mut self, op: Op<E>, inputs: &[NodeIndex]) -> NodeIndex {
        debug_assert_eq!(inputs.len(), op.arity());
        let idx = self.graph.add_node(Node::new(op, Matrix::zeros(1, 1)));
        for (slot, &src) in inputs.iter().enumerate() {
            self.graph.add_edge(src, idx, slot);
        }
        idx
    }

    /// Rewire a node's inputs, replacing any existing ones.
    ///
    /// The graph must stay acyclic: a node wired as its own input is
    /// rejected here, and any longer cycle is a contract violation by
    /// the builder.
    pub fn attach_inputs(
        &mut self,
        node: NodeIndex,
        inputs: &[NodeIndex],
    ) -> Result<(), CriterionError> {
        let expected = self.graph[node].op.arity();
        if inputs.len() != expected {
            return Err(CriterionError::ArityMismatch {
                op: self.graph[node].op.name(),
                expected,
                got: inputs.len(),
            });
        }
        if inputs.contains(&node) {
            return Err(CriterionError::InvalidState {
                op: self.graph[node].op.name(),
                reason: "a node cannot be one of its own inputs".into(),
            });
        }
        let existing: Vec<_> = self
            .graph
            .edges_directed(node, Direction::Incoming)
            .map(|e| e.id())
            .collect();
        for e in existing {
            self.graph.remove_edge(e);
        }
        for (slot, &src) in inputs.iter().enumerate() {
            self.graph.add_edge(src, node, slot);
        }
        Ok(())
    }

    // ========================================================================
    // Access
    // ========================================================================

    pub fn value(&self, node: NodeIndex) -> &Matrix<E> {
        &self.graph[node].value
    }

    pub fn value_mut(&mut self, node: NodeIndex) -> &mut Matrix<E> {
        &mut self.graph[node].value
    }

    pub fn set_value(&mut self, node: NodeIndex, value: Matrix<E>) {
        self.graph[node].value = value;
    }

    pub fn gradient(&self, node: NodeIndex) -> &Matrix<E> {
        &self.graph[node].gradient
    }

    pub fn op(&self, node: NodeIndex) -> &Op<E> {
        &self.graph[node].op
    }

    pub fn op_mut(&mut self, node: NodeIndex) -> &mut Op<E> {
        &mut self.graph[node].op
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn set_layout(&mut self, layout: MinibatchLayout) {
        self.layout = Some(layout);
    }

    pub fn clear_layout(&mut self) {
        self.layout = None;
    }

    pub fn layout(&self) -> Option<&MinibatchLayout> {
        self.layout.as_ref()
    }

    /// Inputs of a node in slot order.
    fn ordered_inputs(&self, node: NodeIndex) -> Result<Vec<NodeIndex>, CriterionError> {
        let arity = self.graph[node].op.arity();
        let mut slots: Vec<Option<NodeIndex>> = vec![None; arity];
        let mut got = 0usize;
        for edge in self.graph.edges_directed(node, Direction::Incoming) {
            let slot = *edge.weight();
            if slot < arity && slots[slot].is_none() {
                slots[slot] = Some(edge.source());
            }
            got += 1;
        }
        if got != arity || slots.iter().any(|s| s.is_none()) {
            return Err(CriterionError::ArityMismatch {
                op: self.graph[node].op.name(),
                expected: arity,
                got,
            });
        }
        Ok(slots.into_iter().flatten().collect())
    }

    fn meta(&self, node: NodeIndex) -> InputMeta {
        let v = &self.graph[node].value;
        InputMeta {
            rows: v.rows(),
            cols: v.cols(),
            placement: v.placement(),
        }
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// Check a node's inputs against its kind's structural requirements
    /// and size its output to 1×1.
    pub fn validate(&mut self, node: NodeIndex) -> Result<(), CriterionError> {
        let ordered = self.ordered_inputs(node)?;
        let metas: Vec<InputMeta> = ordered.iter().map(|&i| self.meta(i)).collect();
        match &self.graph[node].op {
            Op::Source => return Ok(()),
            Op::SquareError(_) => elementwise::validate_matching_pair("SquareError", &metas)?,
            Op::CrossEntropy(_) => elementwise::validate_matching_pair("CrossEntropy", &metas)?,
            Op::CrossEntropyWithSoftmax(_) => {
                elementwise::validate_matching_pair("CrossEntropyWithSoftmax", &metas)?
            }
            Op::L1Reg(_) => reg::validate_single("MatrixL1Reg", &metas)?,
            Op::L2Reg => reg::validate_single("MatrixL2Reg", &metas)?,
            Op::Nce(_) => nce::validate(&metas)?,
            Op::ClassCrossEntropyWithSoftmax(_) => class_softmax::validate(&metas)?,
            Op::Crf(_) => crf::validate(&metas)?,
            Op::DummyCriterion => dummy::validate(&metas)?,
        }
        // An unset derivative parameter inherits the prediction's width.
        if matches!(self.graph[node].op, Op::DummyCriterion) && metas[1].cols != metas[2].cols {
            let rows = metas[1].rows;
            self.graph[ordered[1]].value.resize(rows, metas[2].cols);
        }
        self.graph[node].op.prepare(&metas);
        self.graph[node].value.resize(1, 1);
        Ok(())
    }

    /// Validate every criterion node in the graph.
    pub fn validate_all(&mut self) -> Result<(), CriterionError> {
        let nodes: Vec<_> = self.graph.node_indices().collect();
        for node in nodes {
            self.validate(node)?;
        }
        Ok(())
    }

    // ========================================================================
    // Forward
    // ========================================================================

    /// Topological order via Kahn's algorithm.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        let mut result: Vec<NodeIndex> = Vec::new();

        for node in self.graph.node_indices() {
            let degree = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .count();
            in_degree.insert(node, degree);
            if degree == 0 {
                queue.push_back(node);
            }
        }

        while let Some(node) = queue.pop_front() {
            result.push(node);
            for successor in self.graph.neighbors_directed(node, Direction::Outgoing) {
                let deg = in_degree.get_mut(&successor).expect("successor seeded");
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(successor);
                }
            }
        }

        result
    }

    /// Evaluate one criterion node from its inputs' current values.
    pub fn evaluate(&mut self, node: NodeIndex) -> Result<(), CriterionError> {
        if !self.graph[node].op.is_criterion() {
            return Ok(());
        }
        let ordered = self.ordered_inputs(node)?;
        let inputs: Vec<Matrix<E>> = ordered.iter().map(|&i| self.graph[i].value.clone()).collect();
        let layout = self.layout.clone();
        let layout = layout.as_ref();

        self.generation += 1;
        let n = &mut self.graph[node];
        n.generation = self.generation;
        let value = match &mut n.op {
            Op::Source => unreachable!("sources are not evaluated"),
            Op::SquareError(s) => s.evaluate(&inputs[0], &inputs[1], layout)?,
            Op::CrossEntropy(s) => s.evaluate(&inputs[0], &inputs[1], layout)?,
            Op::CrossEntropyWithSoftmax(s) => s.evaluate(&inputs[0], &inputs[1], layout)?,
            Op::L1Reg(s) => s.evaluate(&inputs[0], layout)?,
            Op::L2Reg => reg::l2_evaluate(&inputs[0], layout)?,
            Op::Nce(s) => s.evaluate(&inputs[0], &inputs[1], &inputs[2], &inputs[3], layout)?,
            Op::ClassCrossEntropyWithSoftmax(s) => {
                s.evaluate(&inputs[0], &inputs[1], &inputs[2], &inputs[3], layout)?
            }
            Op::Crf(s) => s.evaluate(&inputs[0], &inputs[1], &inputs[2], layout)?,
            Op::DummyCriterion => dummy::evaluate(&inputs[0])?,
        };
        if value.has_nan() {
            warn!("{} produced NaN for this minibatch", n.op.name());
        }
        n.value = value;
        Ok(())
    }

    /// Evaluate every criterion in dependency order.
    pub fn forward(&mut self) -> Result<(), CriterionError> {
        for node in self.topological_order() {
            self.evaluate(node)?;
        }
        Ok(())
    }

    // ========================================================================
    // Backward
    // ========================================================================

    /// Drop all gradient accumulators. They are re-created on demand the
    /// next time a partial flows into them.
    pub fn clear_gradients(&mut self) {
        for node in self.graph.node_weights_mut() {
            node.gradient.resize(0, 0);
        }
    }

    /// Accumulate the partial of `node`'s objective into input `index`'s
    /// gradient, scaled by the seed read from `node`'s own gradient.
    pub fn compute_input_partial(
        &mut self,
        node: NodeIndex,
        index: usize,
    ) -> Result<(), CriterionError> {
        let op_name = self.graph[node].op.name();
        let arity = self.graph[node].op.arity();
        if index >= arity {
            return Err(CriterionError::InvalidInputIndex {
                op: op_name,
                index,
                arity,
            });
        }
        if let Op::Nce(state) = &self.graph[node].op {
            if state.mode != NceEvalMode::None {
                return Err(CriterionError::InvalidState {
                    op: op_name,
                    reason: format!(
                        "eval mode {:?} defines no gradient; training requires mode None",
                        state.mode
                    ),
                });
            }
        }
        if !self.graph[node].op.supports_gradient(index) {
            return Err(CriterionError::UnsupportedGradient { op: op_name, index });
        }
        if self.graph[node].gradient.is_empty() {
            return Err(CriterionError::InvalidState {
                op: op_name,
                reason: "no gradient seed; run backward first".into(),
            });
        }

        let ordered = self.ordered_inputs(node)?;
        let inputs: Vec<Matrix<E>> = ordered.iter().map(|&i| self.graph[i].value.clone()).collect();
        let layout = self.layout.clone();
        let layout = layout.as_ref();
        let target = ordered[index];

        let (n, input) = self.graph.index_twice_mut(node, target);
        if (input.gradient.rows(), input.gradient.cols())
            != (input.value.rows(), input.value.cols())
        {
            input.gradient.resize(input.value.rows(), input.value.cols());
        }
        let seed = n.gradient.first();
        let generation = n.generation;
        let own_value = n.value.first();
        let grad = &mut input.gradient;
        match &mut n.op {
            Op::Source => {}
            Op::SquareError(s) => s.partial(index, seed, grad)?,
            Op::CrossEntropy(s) => s.partial(index, seed, &inputs[0], &inputs[1], layout, grad)?,
            Op::CrossEntropyWithSoftmax(s) => s.partial(index, seed, &inputs[0], layout, grad)?,
            Op::L1Reg(s) => s.partial(seed, &inputs[0], layout, grad)?,
            Op::L2Reg => reg::l2_partial(seed, own_value, &inputs[0], layout, grad)?,
            Op::Nce(s) => s.partial(index, seed, generation, &inputs, layout, grad)?,
            Op::ClassCrossEntropyWithSoftmax(s) => {
                s.partial(index, seed, generation, &inputs, layout, grad)?
            }
            Op::Crf(s) => s.partial(index, seed, &inputs, layout, grad)?,
            Op::DummyCriterion => dummy::partial(seed, &inputs[1], grad)?,
        }
        Ok(())
    }

    /// Clear all gradients, seed `criterion`'s with `seed`, and run the
    /// chain rule in reverse topological order.
    pub fn backward(&mut self, criterion: NodeIndex, seed: E) -> Result<(), CriterionError> {
        self.clear_gradients();
        self.graph[criterion].gradient = Matrix::scalar(seed);
        let order = self.topological_order();
        for &node in order.iter().rev() {
            if !self.graph[node].op.is_criterion() || self.graph[node].gradient.is_empty() {
                continue;
            }
            let arity = self.graph[node].op.arity();
            for index in 0..arity {
                if self.graph[node].op.supports_gradient(index) {
                    self.compute_input_partial(node, index)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Node state management
    // ========================================================================

    /// Copy value and/or kind-specific state between two nodes of the
    /// same kind.
    pub fn copy_node_state(
        &mut self,
        src: NodeIndex,
        dst: NodeIndex,
        flags: CopyFlags,
    ) -> Result<(), CriterionError> {
        if src == dst {
            return Ok(());
        }
        let (s, d) = self.graph.index_twice_mut(src, dst);
        if mem::discriminant(&s.op) != mem::discriminant(&d.op) {
            return Err(CriterionError::InvalidState {
                op: "copy_node_state",
                reason: format!("cannot copy {} state into {}", s.op.name(), d.op.name()),
            });
        }
        if flags.contains(CopyFlags::STATE) {
            d.op = s.op.clone();
        }
        if flags.contains(CopyFlags::VALUE) {
            d.value = s.value.clone();
            d.gradient = s.gradient.clone();
        }
        Ok(())
    }

    /// Persist a node's kind-specific state. Kinds with nothing to
    /// persist write nothing, so a checkpoint can walk every node.
    pub fn save_node_state<W: Write>(&self, node: NodeIndex, writer: &mut W) -> io::Result<()> {
        match &self.graph[node].op {
            Op::Nce(s) => s.save_mode(writer),
            _ => Ok(()),
        }
    }

    /// Restore a node's kind-specific state written by
    /// [`save_node_state`](Self::save_node_state).
    pub fn load_node_state<R: Read + Seek>(
        &mut self,
        node: NodeIndex,
        reader: &mut R,
    ) -> io::Result<()> {
        match &mut self.graph[node].op {
            Op::Nce(s) => s.load_mode(reader),
            _ => Ok(()),
        }
    }

    /// Re-tag the intended residency of a node's matrices.
    pub fn move_matrices_to_device(&mut self, node: NodeIndex, placement: Placement) {
        let n = &mut self.graph[node];
        n.value.transfer_to(placement);
        n.gradient.transfer_to(placement);
        n.op.transfer_to(placement);
    }
}

impl<E: Float> Default for CriterionGraph<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::PackingFlags;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-10
    }

    #[test]
    fn test_forward_backward_square_error() {
        let mut g = CriterionGraph::new();
        let a = g.source_from(Matrix::from_columns(1, 2, vec![3.0, -1.0]));
        let b = g.source_from(Matrix::from_columns(1, 2, vec![1.0, 1.0]));
        let crit = g.square_error(a, b);

        g.validate_all().unwrap();
        g.forward().unwrap();
        assert!(close(g.value(crit).first(), 0.5 * (4.0 + 4.0)));

        g.backward(crit, 1.0).unwrap();
        assert_eq!(g.gradient(a).data(), &[2.0, -2.0]);
        assert_eq!(g.gradient(b).data(), &[-2.0, 2.0]);
    }

    #[test]
    fn test_gradient_accumulates_across_calls() {
        let mut g = CriterionGraph::new();
        let a = g.source_from(Matrix::from_columns(1, 1, vec![2.0]));
        let b = g.source_from(Matrix::from_columns(1, 1, vec![0.0]));
        let crit = g.square_error(a, b);

        g.forward().unwrap();
        g.backward(crit, 1.0).unwrap();
        assert_eq!(g.gradient(a).data(), &[2.0]);

        // A second partial into the same accumulator adds.
        g.compute_input_partial(crit, 0).unwrap();
        assert_eq!(g.gradient(a).data(), &[4.0]);

        // A fresh backward clears first.
        g.backward(crit, 1.0).unwrap();
        assert_eq!(g.gradient(a).data(), &[2.0]);
    }

    #[test]
    fn test_shared_source_receives_both_partials() {
        // The same source feeds both slots, so d/dx of -x ln x needs
        // the partials through both inputs added together.
        let mut g = CriterionGraph::new();
        let x = g.source_from(Matrix::from_columns(1, 1, vec![0.5]));
        let crit = g.cross_entropy(x, x);

        g.forward().unwrap();
        assert!(close(g.value(crit).first(), -0.5 * 0.5f64.ln()));

        g.backward(crit, 1.0).unwrap();
        assert!(close(g.gradient(x).data()[0], -(0.5f64.ln() + 1.0)));
    }

    #[test]
    fn test_attach_inputs_arity_checked() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(1, 1);
        let b = g.source(1, 1);
        let crit = g.square_error(a, b);
        let err = g.attach_inputs(crit, &[a]).unwrap_err();
        assert!(matches!(
            err,
            CriterionError::ArityMismatch {
                expected: 2,
                got: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_attach_self_input_rejected() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(1, 1);
        let b = g.source(1, 1);
        let crit = g.square_error(a, b);
        let err = g.attach_inputs(crit, &[a, crit]).unwrap_err();
        assert!(matches!(err, CriterionError::InvalidState { .. }));

        // The original wiring survives the rejected rewire.
        g.forward().unwrap();
    }

    #[test]
    fn test_invalid_input_index() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(1, 1);
        let b = g.source(1, 1);
        let crit = g.square_error(a, b);
        g.forward().unwrap();
        g.backward(crit, 1.0).unwrap();
        let err = g.compute_input_partial(crit, 5).unwrap_err();
        assert!(matches!(err, CriterionError::InvalidInputIndex { .. }));
    }

    #[test]
    fn test_unsupported_gradient_slot() {
        let mut g = CriterionGraph::new();
        let obj = g.source_from(Matrix::scalar(1.5));
        let drv = g.source_from(Matrix::from_columns(1, 2, vec![0.5, 0.5]));
        let pred = g.source_from(Matrix::from_columns(1, 2, vec![0.0, 0.0]));
        let crit = g.dummy_criterion(obj, drv, pred);

        g.forward().unwrap();
        g.backward(crit, 2.0).unwrap();
        assert_eq!(g.gradient(pred).data(), &[1.0, 1.0]);

        let err = g.compute_input_partial(crit, 0).unwrap_err();
        assert!(matches!(err, CriterionError::UnsupportedGradient { .. }));
    }

    #[test]
    fn test_nce_eval_mode_blocks_gradients() {
        let mut g = CriterionGraph::new();
        let desc = g.source_from(Matrix::from_rows(
            4,
            1,
            vec![1.0, 0.25f64.ln(), 0.0, 0.25f64.ln()],
        ));
        let hidden = g.source_from(Matrix::from_columns(1, 1, vec![1.0]));
        let weight = g.source_from(Matrix::from_columns(1, 2, vec![0.5, -0.5]));
        let bias = g.source_from(Matrix::from_columns(2, 1, vec![0.0, 0.0]));
        let crit = g.nce(desc, hidden, weight, bias, NceEvalMode::Softmax);

        g.forward().unwrap();
        let err = g.backward(crit, 1.0).unwrap_err();
        assert!(matches!(err, CriterionError::InvalidState { .. }));
    }

    #[test]
    fn test_partial_without_seed_rejected() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(1, 1);
        let b = g.source(1, 1);
        let crit = g.square_error(a, b);
        g.forward().unwrap();
        let err = g.compute_input_partial(crit, 0).unwrap_err();
        assert!(matches!(err, CriterionError::InvalidState { .. }));
    }

    #[test]
    fn test_validate_rejects_shape_mismatch() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(2, 3);
        let b = g.source(3, 2);
        let crit = g.square_error(a, b);
        let err = g.validate(crit).unwrap_err();
        assert!(matches!(err, CriterionError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_validate_rejects_offhost_crf_label() {
        let mut g = CriterionGraph::<f64>::new();
        let label = g.source_from(Matrix::from_columns(2, 1, vec![1.0, 0.0]));
        let emission = g.source(2, 1);
        let trans = g.source(2, 2);
        let crit = g.crf(label, emission, trans);

        g.value_mut(label).transfer_to(Placement::Accelerator(0));
        let err = g.validate(crit).unwrap_err();
        assert!(matches!(
            err,
            CriterionError::DeviceResidencyViolation { index: 0, .. }
        ));
    }

    #[test]
    fn test_dummy_derivative_resized_to_prediction() {
        let mut g = CriterionGraph::new();
        let obj = g.source_from(Matrix::scalar(0.0));
        let drv = g.source(1, 1);
        let pred = g.source(1, 4);
        let crit = g.dummy_criterion(obj, drv, pred);

        g.validate(crit).unwrap();
        assert_eq!(g.value(drv).cols(), 4);
    }

    #[test]
    fn test_layout_masks_loss_through_graph() {
        let mut layout = MinibatchLayout::dense(2, 1);
        layout.set(1, 0, PackingFlags::NO_LABEL);

        let mut g = CriterionGraph::new();
        let label = g.source_from(Matrix::from_columns(2, 2, vec![1.0, 0.0, 0.0, 1.0]));
        let pred = g.source_from(Matrix::from_columns(2, 2, vec![0.0, 0.0, 5.0, -5.0]));
        let crit = g.cross_entropy_with_softmax(label, pred);
        g.set_layout(layout);

        g.forward().unwrap();
        assert!(close(g.value(crit).first(), 2.0f64.ln()));

        g.backward(crit, 1.0).unwrap();
        assert_eq!(g.gradient(pred).col(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_copy_node_state_requires_same_kind() {
        let mut g = CriterionGraph::<f64>::new();
        let a = g.source(1, 1);
        let b = g.source(1, 1);
        let sq = g.square_error(a, b);
        let l1 = g.l1_reg(a);
        let err = g
            .copy_node_state(sq, l1, CopyFlags::STATE)
            .unwrap_err();
        assert!(matches!(err, CriterionError::InvalidState { .. }));
    }

    #[test]
    fn test_node_state_round_trips_through_graph() {
        use std::io::Cursor;

        let mut g = CriterionGraph::new();
        let desc = g.source_from(Matrix::from_columns(1, 1, vec![-1.0]));
        let hidden = g.source_from(Matrix::from_columns(1, 1, vec![1.0]));
        let weight = g.source_from(Matrix::from_columns(1, 2, vec![0.5, -0.5]));
        let bias = g.source_from(Matrix::from_columns(2, 1, vec![0.0, 0.0]));
        let n1 = g.nce(desc, hidden, weight, bias, NceEvalMode::Unnormalized);
        let n2 = g.nce(desc, hidden, weight, bias, NceEvalMode::None);
        let sq = g.square_error(hidden, hidden);

        let mut buf = Cursor::new(Vec::new());
        g.save_node_state(n1, &mut buf).unwrap();
        // A kind with no persisted state writes nothing.
        g.save_node_state(sq, &mut buf).unwrap();
        assert_eq!(buf.get_ref().len(), 4);

        buf.set_position(0);
        g.load_node_state(n2, &mut buf).unwrap();
        match g.op(n2) {
            Op::Nce(s) => assert_eq!(s.mode, NceEvalMode::Unnormalized),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn test_copy_node_state_carries_nce_mode() {
        let mut g = CriterionGraph::new();
        let desc = g.source_from(Matrix::from_columns(1, 1, vec![-1.0]));
        let hidden = g.source_from(Matrix::from_columns(1, 1, vec![1.0]));
        let weight = g.source_from(Matrix::from_columns(1, 2, vec![0.5, -0.5]));
        let bias = g.source_from(Matrix::from_columns(2, 1, vec![0.0, 0.0]));
        let n1 = g.nce(desc, hidden, weight, bias, NceEvalMode::Unnormalized);
        let n2 = g.nce(desc, hidden, weight, bias, NceEvalMode::None);

        g.copy_node_state(n1, n2, CopyFlags::STATE).unwrap();
        match g.op(n2) {
            Op::Nce(s) => assert_eq!(s.mode, NceEvalMode::Unnormalized),
            _ => panic!("wrong kind"),
        }
    }
}
