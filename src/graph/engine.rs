// src/graph/engine.rs
// Expression graph. Sole owner of nodes, edges and identity allocation.
// Edges point from an operator's output node to its operands, weighted by
// the operand's zero-based position, so the argument list is always
// reconstructible in order. Self-loop rejection is what makes the graph a
// DAG by construction; acyclicity is never re-verified elsewhere.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::backend::DeviceMem;
use crate::error::{GradixError, Result};
use crate::graph::node::{Node, NodeId};
use crate::ops::{KernelRegistry, Operator};
use crate::value::{DualValuePool, Value};

pub struct ExprGraph<T>
where
    T: crate::backend::GradixF,
{
    nodes: HashMap<NodeId, Node<T>>,
    edges: HashMap<(NodeId, NodeId), f64>,
    next_id: u64,
    // tensor provenance id -> leaf node, so a value handed in twice reuses
    // its node. Scalars are never cached.
    value_cache: HashMap<u64, NodeId>,
    kernels: Arc<KernelRegistry<T>>,
}

impl<T> ExprGraph<T>
where
    T: crate::backend::GradixF,
{
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            edges: HashMap::new(),
            next_id: 0,
            value_cache: HashMap::new(),
            kernels: Arc::new(KernelRegistry::new()),
        }
    }

    /// The elementwise kernel tables shared by every tensor binop built
    /// against this graph.
    pub fn kernels(&self) -> Arc<KernelRegistry<T>> {
        Arc::clone(&self.kernels)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    // ===== node and edge primitives =====

    /// Allocates an unbound node with a fresh identity. The node is not
    /// part of the graph until `add_node`.
    pub fn new_node(&mut self) -> Node<T> {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        Node::new(id)
    }

    /// Registers a node. Identity collisions are programmer errors and
    /// panic.
    pub fn add_node(&mut self, node: Node<T>) -> NodeId {
        let id = node.id();
        if self.nodes.contains_key(&id) {
            panic!("node identity collision: {id}");
        }
        self.nodes.insert(id, node);
        id
    }

    /// Allocates and registers an unbound node in one step.
    pub fn new_vertex(&mut self) -> NodeId {
        let node = self.new_node();
        self.add_node(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node<T>> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node<T>> {
        self.nodes.get_mut(&id)
    }

    fn expect_node(&self, id: NodeId) -> Result<&Node<T>> {
        self.nodes.get(&id).ok_or(GradixError::Unbound {
            id: id.0,
            what: "node",
        })
    }

    /// Attaches a directed edge `from -> to` carrying the operand position
    /// as its weight. Self-loops are programmer errors and panic.
    pub fn set_weighted_edge(&mut self, from: NodeId, to: NodeId, weight: f64) {
        if from == to {
            panic!("self-loop edge rejected: {from}");
        }
        assert!(self.nodes.contains_key(&from), "unknown node {from}");
        assert!(self.nodes.contains_key(&to), "unknown node {to}");
        self.edges.insert((from, to), weight);
    }

    pub fn new_weighted_edge(&mut self, from: NodeId, to: NodeId, weight: f64) {
        self.set_weighted_edge(from, to, weight);
    }

    /// Children of `id`, ordered by edge weight (operand position).
    pub fn from(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<(NodeId, f64)> = self
            .edges
            .iter()
            .filter(|((f, _), _)| *f == id)
            .map(|((_, t), w)| (*t, *w))
            .collect();
        out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        out.into_iter().map(|(t, _)| t).collect()
    }

    /// Parents of `id` (operators consuming it).
    pub fn to(&self, id: NodeId) -> Vec<NodeId> {
        let mut out: Vec<NodeId> = self
            .edges
            .keys()
            .filter(|(_, t)| *t == id)
            .map(|(f, _)| *f)
            .collect();
        out.sort();
        out
    }

    pub fn has_edge_from_to(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.contains_key(&(from, to))
    }

    pub fn has_edge_between(&self, a: NodeId, b: NodeId) -> bool {
        self.has_edge_from_to(a, b) || self.has_edge_from_to(b, a)
    }

    pub fn weight(&self, from: NodeId, to: NodeId) -> Option<f64> {
        self.edges.get(&(from, to)).copied()
    }

    /// No-op when the edge is absent.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) {
        self.edges.remove(&(from, to));
    }

    /// Operand nodes of `id` in declaration order. Read from the node's
    /// recorded input list, which, unlike the edge set, survives duplicated
    /// operands (`x * x`).
    pub fn operands(&self, id: NodeId) -> Vec<NodeId> {
        match self.nodes.get(&id) {
            Some(node) if !node.inputs().is_empty() => node.inputs().to_vec(),
            _ => self.from(id),
        }
    }

    // ===== builders =====

    /// Adds a leaf bound to `value` and marked constant. Constant operands
    /// are skipped during product differentiation.
    pub fn constant(&mut self, value: Value<T>) -> Result<NodeId> {
        let id = self.leaf(value)?;
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_constant(true);
        }
        Ok(id)
    }

    /// Adds a differentiable leaf bound to `value`.
    pub fn variable(&mut self, value: Value<T>) -> Result<NodeId> {
        self.leaf(value)
    }

    fn leaf(&mut self, value: Value<T>) -> Result<NodeId> {
        let uid = value.as_tensor().map(crate::tensor::Tensor::uid);
        let mut node = self.new_node();
        node.apply_data(value)?;
        let id = self.add_node(node);
        if let Some(uid) = uid {
            self.value_cache.insert(uid, id);
        }
        debug!("leaf {} added", id);
        Ok(id)
    }

    /// Find-or-create the leaf node for a value. Tensors are recognized by
    /// their provenance id; scalars always get a fresh leaf.
    pub fn find_or_create(&mut self, value: Value<T>) -> Result<NodeId> {
        if let Some(t) = value.as_tensor() {
            if let Some(&id) = self.value_cache.get(&t.uid()) {
                debug!("value cache hit for tensor {} -> {}", t.uid(), id);
                return Ok(id);
            }
        }
        self.leaf(value)
    }

    /// Applies an operator to existing nodes: validates arity, resolves the
    /// output dtype and shape, computes eagerly when every input carries a
    /// value, and wires output->operand edges weighted by position.
    pub fn apply_op(&mut self, op: Box<dyn Operator<T>>, inputs: &[NodeId]) -> Result<NodeId> {
        if inputs.len() != op.arity() {
            return Err(GradixError::ArityMismatch {
                op: op.name(),
                expected: op.arity(),
                got: inputs.len(),
            });
        }

        let mut dtypes = Vec::with_capacity(inputs.len());
        let mut shapes: Vec<Vec<usize>> = Vec::with_capacity(inputs.len());
        for &input in inputs {
            let node = self.expect_node(input)?;
            dtypes.push(node.dtype().ok_or(GradixError::Unbound {
                id: input.0,
                what: "dtype",
            })?);
            shapes.push(
                node.shape()
                    .ok_or(GradixError::Unbound {
                        id: input.0,
                        what: "shape",
                    })?
                    .to_vec(),
            );
        }
        let out_dtype = op.out_dtype(&dtypes)?;
        let shape_refs: Vec<&[usize]> = shapes.iter().map(Vec::as_slice).collect();
        let out_shape = op.infer_shape(&shape_refs)?;

        let all_bound = inputs
            .iter()
            .all(|&i| self.node(i).map(Node::is_bound).unwrap_or(false));
        let computed = if all_bound {
            let mut vals = Vec::with_capacity(inputs.len());
            for &input in inputs {
                vals.push(self.expect_node(input)?.value()?.clone());
            }
            Some(op.do_op(false, &vals)?)
        } else {
            None
        };

        let op_name = op.name();
        let mut node = self.new_node();
        node.set_op(op);
        node.set_inputs(inputs.to_vec());
        match computed {
            Some(value) => node.apply_data(value)?,
            None => node.set_type_shape(out_dtype, out_shape),
        }
        let out = self.add_node(node);
        for (i, &input) in inputs.iter().enumerate() {
            self.set_weighted_edge(out, input, i as f64);
        }
        debug!("applied {} -> {}", op_name, out);
        Ok(out)
    }

    /// Applies an operator to raw values, running each operand through the
    /// find-or-create cache first.
    pub fn apply_values(&mut self, op: Box<dyn Operator<T>>, values: &[Value<T>]) -> Result<NodeId> {
        let mut inputs = Vec::with_capacity(values.len());
        for value in values {
            inputs.push(self.find_or_create(value.clone())?);
        }
        self.apply_op(op, &inputs)
    }

    // ===== traversal =====

    /// Nodes reachable from `root` in reverse topological order (root
    /// first, operands after their consumers).
    pub fn sorted_from(&self, root: NodeId) -> Vec<NodeId> {
        let mut visited = std::collections::HashSet::new();
        let mut post = Vec::new();
        let mut stack = vec![(root, false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                post.push(id);
                continue;
            }
            if !visited.insert(id) {
                continue;
            }
            stack.push((id, true));
            for child in self.from(id) {
                if !visited.contains(&child) {
                    stack.push((child, false));
                }
            }
        }
        post.reverse();
        post
    }

    /// Bound value of a node, for reading results off the graph.
    pub fn value(&self, id: NodeId) -> Result<&Value<T>> {
        self.expect_node(id)?.value()
    }

    /// Accumulated derivative of a node, if any.
    pub fn deriv(&self, id: NodeId) -> Result<Option<&Value<T>>> {
        Ok(match self.expect_node(id)?.dual() {
            Ok(dual) => dual.deriv(),
            Err(_) => None,
        })
    }

    /// Releases every dual value reachable from `root` into a reuse pool,
    /// leaving those nodes unbound. Tensor buffers go back to `ctx`'s
    /// allocator on the way. Call between backward runs whose next forward
    /// pass rebinds the graph anyway. Returns the number of duals recycled.
    pub fn recycle_duals(
        &mut self,
        ctx: &dyn DeviceMem<T>,
        root: NodeId,
        pool: &DualValuePool<T>,
    ) -> usize {
        let mut released = 0;
        for id in self.sorted_from(root) {
            if let Some(dual) = self.nodes.get_mut(&id).and_then(Node::take_dual) {
                pool.put(ctx, dual);
                released += 1;
            }
        }
        debug!("recycled {} dual value(s) from {}", released, root);
        released
    }
}

impl<T> Default for ExprGraph<T>
where
    T: crate::backend::GradixF,
{
    fn default() -> Self {
        Self::new()
    }
}
