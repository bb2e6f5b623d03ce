use std::collections::VecDeque;

use crate::{
  device::Device,
  error::{GraphError, Result},
  init::ParamInit,
  layer::{Engine, Layer, OpKernelContext, VectorKind},
  optimize::Optimizer,
  parameter::{ParamKind, Parameter},
  scalar::{Inner, Real},
  shape::Shape3d,
  tensor::Tensor,
};

/// Parameters below this size are updated serially; thread spawning
/// would cost more than it saves.
const PARALLEL_UPDATE_THRESHOLD: usize = 512;


/// Stable handle to a node in a [Graph] arena.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EdgeId(usize);


/// Shared tensor pair connecting two nodes. The edge exclusively owns
/// its data and gradient storage; nodes refer to it by id.
///
/// `samples` is the logical batch row count; the tensors' leading axis
/// only grows, so buffers may hold more rows than that.

#[derive(Debug)]
pub struct Edge<T: Inner> {
  data: Tensor<T>,
  grad: Tensor<T>,
  kind: VectorKind,
  shape: Shape3d,
  samples: usize,
  producer: Option<NodeId>,
  consumers: Vec<NodeId>,
}

impl<T: Real> Edge<T> {
  fn new(producer: Option<NodeId>, shape: Shape3d, kind: VectorKind) -> Self {
    Self {
      data: Tensor::zeros(&[1, shape.size()]),
      grad: Tensor::zeros(&[1, shape.size()]),
      kind,
      shape,
      samples: 1,
      producer,
      consumers: vec![],
    }
  }

  pub fn data(&self) -> &Tensor<T> {
    &self.data
  }

  pub fn grad(&self) -> &Tensor<T> {
    &self.grad
  }

  pub fn kind(&self) -> VectorKind {
    self.kind
  }

  fn resize(&mut self, samples: usize) {
    self.data.resize_axis(samples);
    self.grad.resize_axis(samples);
  }
}


/// A unit of computation in the graph: the polymorphic operation plus
/// its owned parameters, slot wiring, engine selection and device
/// binding.

#[derive(Debug)]
pub struct Node<T: Real> {
  op: Box<dyn Layer<T>>,
  params: Vec<Parameter<T>>,
  in_edges: Vec<Option<EdgeId>>,
  out_edges: Vec<Option<EdgeId>>,
  engine: Engine,
  parallelize: bool,
  device: Option<Device>,
  weight_init: ParamInit<T>,
  bias_init: ParamInit<T>,
}

impl<T: Real> Node<T> {
  pub fn op(&self) -> &dyn Layer<T> {
    &*self.op
  }

  pub fn engine(&self) -> Engine {
    self.engine
  }

  /// Parameters in declaration order, weights before biases; external
  /// serializers rely on this order being stable.

  pub fn parameters(&self) -> &[Parameter<T>] {
    &self.params
  }

  pub fn parameters_mut(&mut self) -> &mut [Parameter<T>] {
    &mut self.params
  }

  pub fn set_trainable(&mut self, trainable: bool) {
    for param in &mut self.params {
      param.set_trainable(trainable);
    }
  }
}


/// Arena of nodes and edges forming a computation DAG.
///
/// The graph owns all storage; nodes and edges address each other
/// through stable ids, so fan-in/fan-out topologies carry no lifetime
/// ambiguity. Edges are allocated lazily the first time a slot is used
/// and reused from then on.

#[derive(Debug)]
pub struct Graph<T: Real> {
  nodes: Vec<Node<T>>,
  edges: Vec<Edge<T>>,
  // merged-gradient scratch, reused across updates
  diff: Tensor<T>,
}

impl<T: Real> Graph<T> {
  pub fn new() -> Self {
    Self { nodes: vec![], edges: vec![], diff: Tensor::zeros(&[0]) }
  }

  pub fn add(&mut self, op: impl Layer<T> + 'static) -> NodeId {
    self.add_with_engine(op, Engine::default())
  }

  /// Add a node computing `op` on the given engine. The engine choice is
  /// fixed for the node's lifetime.

  pub fn add_with_engine(&mut self, op: impl Layer<T> + 'static, engine: Engine) -> NodeId {
    let op: Box<dyn Layer<T>> = Box::new(op);
    let params = op.param_specs().iter().map(Parameter::new).collect();
    let in_edges = vec![None; op.in_kinds().len()];
    let out_edges = vec![None; op.out_kinds().len()];
    self.nodes.push(Node {
      op,
      params,
      in_edges,
      out_edges,
      engine,
      parallelize: true,
      device: None,
      weight_init: ParamInit::xavier(),
      bias_init: ParamInit::constant(T::zero()),
    });
    NodeId(self.nodes.len() - 1)
  }

  pub fn node(&self, id: NodeId) -> &Node<T> {
    &self.nodes[id.0]
  }

  pub fn node_mut(&mut self, id: NodeId) -> &mut Node<T> {
    &mut self.nodes[id.0]
  }

  pub fn set_parallelize(&mut self, id: NodeId, parallelize: bool) {
    self.nodes[id.0].parallelize = parallelize;
  }

  pub fn set_device(&mut self, id: NodeId, device: &Device) {
    self.nodes[id.0].device = Some(device.clone());
  }

  pub fn set_weight_init(&mut self, id: NodeId, init: ParamInit<T>) {
    self.nodes[id.0].weight_init = init;
  }

  pub fn set_bias_init(&mut self, id: NodeId, init: ParamInit<T>) {
    self.nodes[id.0].bias_init = init;
  }

  fn alloc_edge(&mut self, producer: Option<NodeId>, shape: Shape3d, kind: VectorKind) -> EdgeId {
    self.edges.push(Edge::new(producer, shape, kind));
    EdgeId(self.edges.len() - 1)
  }

  fn ensure_in_edge(&mut self, id: NodeId, slot: usize) -> EdgeId {
    if let Some(edge) = self.nodes[id.0].in_edges[slot] {
      return edge;
    }
    // no producer; this input is fed from outside the graph
    let shape = self.nodes[id.0].op.in_shape()[slot];
    let kind = self.nodes[id.0].op.in_kinds()[slot];
    let edge = self.alloc_edge(None, shape, kind);
    self.edges[edge.0].consumers.push(id);
    self.nodes[id.0].in_edges[slot] = Some(edge);
    edge
  }

  fn ensure_out_edge(&mut self, id: NodeId, slot: usize) -> EdgeId {
    if let Some(edge) = self.nodes[id.0].out_edges[slot] {
      return edge;
    }
    let shape = self.nodes[id.0].op.out_shape()[slot];
    let kind = self.nodes[id.0].op.out_kinds()[slot];
    let edge = self.alloc_edge(Some(id), shape, kind);
    self.nodes[id.0].out_edges[slot] = Some(edge);
    edge
  }

  /// Wire the producer's first output to the consumer's first input.

  pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<()> {
    self.connect_slots(from, 0, to, 0)
  }

  /// Wire `from`'s output slot to `to`'s input slot. When the consumer
  /// declares an unset input shape, the producer's shape is propagated
  /// into it instead of failing.

  pub fn connect_slots(&mut self, from: NodeId, out_slot: usize, to: NodeId, in_slot: usize) -> Result<()> {
    let out_shape = self.nodes[from.0].op.out_shape()[out_slot];
    let mut in_shape = self.nodes[to.0].op.in_shape()[in_slot];

    if in_shape.is_none() {
      self.nodes[to.0].op.set_in_shape(out_shape)?;
      in_shape = out_shape;
    }
    if out_shape != in_shape {
      return Err(GraphError::Connection {
        from: self.nodes[from.0].op.layer_type().to_string(),
        to: self.nodes[to.0].op.layer_type().to_string(),
        out_shape: out_shape.to_string(),
        in_shape: in_shape.to_string(),
      });
    }

    let edge = self.ensure_out_edge(from, out_slot);
    self.nodes[to.0].in_edges[in_slot] = Some(edge);
    self.edges[edge.0].consumers.push(to);
    log::trace!("connected {}[{}] -> {}[{}]",
      self.nodes[from.0].op.layer_type(), out_slot,
      self.nodes[to.0].op.layer_type(), in_slot);
    Ok(())
  }

  /// Allocate the node's missing edges and initialize any parameter that
  /// is not yet filled (all of them when `reset_weights` is set).
  /// Inconsistent slot declarations fail before anything is allocated.

  pub fn setup(&mut self, id: NodeId, reset_weights: bool) -> Result<()> {
    {
      let node = &self.nodes[id.0];
      let in_shapes = node.op.in_shape().len();
      if in_shapes != node.in_edges.len() {
        return Err(GraphError::Setup {
          layer: node.op.layer_type().to_string(),
          dir: "input",
          channels: node.in_edges.len(),
          shapes: in_shapes,
        });
      }
      let out_shapes = node.op.out_shape().len();
      if out_shapes != node.out_edges.len() {
        return Err(GraphError::Setup {
          layer: node.op.layer_type().to_string(),
          dir: "output",
          channels: node.out_edges.len(),
          shapes: out_shapes,
        });
      }
    }

    for slot in 0..self.nodes[id.0].out_edges.len() {
      self.ensure_out_edge(id, slot);
    }

    let needs_init = reset_weights
      || self.nodes[id.0].params.iter().any(|p| !p.is_initialized() );
    if needs_init {
      self.init_parameters(id);
    }
    Ok(())
  }

  pub fn setup_all(&mut self, reset_weights: bool) -> Result<()> {
    for i in 0..self.nodes.len() {
      self.setup(NodeId(i), reset_weights)?;
    }
    Ok(())
  }

  fn init_parameters(&mut self, id: NodeId) {
    let node = &mut self.nodes[id.0];
    log::debug!("initializing {} parameters of {}",
      node.params.len(), node.op.layer_type());
    for i in 0..node.params.len() {
      let fan_in = node.op.fan_in_size(i);
      let fan_out = node.op.fan_out_size(i);
      let init = match node.params[i].kind() {
        ParamKind::Weight => node.weight_init.clone(),
        ParamKind::Bias => node.bias_init.clone(),
      };
      node.params[i].initialize(&init, fan_in, fan_out);
    }
  }

  /// Feed a `[samples, size]` tensor into one of the node's input edges,
  /// synthesizing a producer-less edge if the node is unwired.

  pub fn set_input(&mut self, id: NodeId, slot: usize, input: &Tensor<T>) -> Result<()> {
    let edge_id = self.ensure_in_edge(id, slot);
    let edge = &mut self.edges[edge_id.0];
    let samples = input.shape().dims[0];
    let row_size = input.size() / samples;
    if row_size != edge.shape.size() {
      return Err(GraphError::Shape {
        from: input.shape().to_string(),
        to: format!("Shape[{}, {}]", samples, edge.shape.size()),
      });
    }
    edge.resize(samples);
    for s in 0..samples {
      edge.data.at(&[s]).feed(&input.at(&[s]));
    }
    edge.samples = samples;
    Ok(())
  }

  /// Feed an output gradient, for driving a backward pass from outside.

  pub fn set_out_grad(&mut self, id: NodeId, slot: usize, grad: &Tensor<T>) -> Result<()> {
    let edge_id = self.ensure_out_edge(id, slot);
    let edge = &mut self.edges[edge_id.0];
    let samples = grad.shape().dims[0];
    let row_size = grad.size() / samples;
    if row_size != edge.shape.size() {
      return Err(GraphError::Shape {
        from: grad.shape().to_string(),
        to: format!("Shape[{}, {}]", samples, edge.shape.size()),
      });
    }
    edge.resize(samples);
    for s in 0..samples {
      edge.grad.at(&[s]).feed(&grad.at(&[s]));
    }
    edge.samples = samples;
    Ok(())
  }

  fn set_sample_count(&mut self, id: NodeId, samples: usize) {
    let in_edges: Vec<EdgeId> = self.nodes[id.0].in_edges.iter().flatten().copied().collect();
    let out_edges: Vec<EdgeId> = self.nodes[id.0].out_edges.iter().flatten().copied().collect();
    for edge in in_edges.into_iter().chain(out_edges) {
      self.edges[edge.0].resize(samples);
    }
    for param in &mut self.nodes[id.0].params {
      param.resize_grad(samples);
    }
  }

  fn program_for(&self, id: NodeId) -> Option<std::sync::Arc<crate::device::Program>> {
    let node = &self.nodes[id.0];
    match (&node.device, node.op.kernel_signature()) {
      (Some(device), Some(signature)) => device.registry().lookup(&signature),
      _ => None,
    }
  }

  /// Run the node's forward kernel: grow edges to the current batch,
  /// clear the downstream gradients and invoke the operation.

  pub fn forward_node(&mut self, id: NodeId) -> Result<()> {
    self.setup(id, false)?;
    for slot in 0..self.nodes[id.0].in_edges.len() {
      self.ensure_in_edge(id, slot);
    }

    let samples = self.nodes[id.0].in_edges.first()
      .and_then(|e| *e )
      .map(|e| self.edges[e.0].samples )
      .unwrap_or(1);
    self.set_sample_count(id, samples);

    let in_edges: Vec<EdgeId> = self.nodes[id.0].in_edges.iter().flatten().copied().collect();
    let out_edges: Vec<EdgeId> = self.nodes[id.0].out_edges.iter().flatten().copied().collect();

    // gradients downstream of this node are stale now
    for edge in &out_edges {
      self.edges[edge.0].grad.refill(T::zero());
    }

    let in_data = in_edges.iter().map(|e| self.edges[e.0].data.clone() ).collect();
    let out_data = out_edges.iter().map(|e| self.edges[e.0].data.clone() ).collect();
    let program = self.program_for(id);

    {
      let Node { op, params, engine, parallelize, .. } = &mut self.nodes[id.0];
      let mut ctx = OpKernelContext {
        in_data,
        out_data,
        in_grad: vec![],
        out_grad: vec![],
        params: params.as_mut_slice(),
        engine: *engine,
        parallelize: *parallelize,
        samples,
        program,
      };
      op.forward_op(&mut ctx)?;
    }

    for edge in &out_edges {
      self.edges[edge.0].samples = samples;
    }
    Ok(())
  }

  /// Run the node's backward kernel over the same tensors the forward
  /// pass used, writing the upstream input gradient and accumulating the
  /// per-sample parameter gradients.

  pub fn backward_node(&mut self, id: NodeId) -> Result<()> {
    self.setup(id, false)?;
    for slot in 0..self.nodes[id.0].in_edges.len() {
      self.ensure_in_edge(id, slot);
    }

    let samples = self.nodes[id.0].out_edges.first()
      .and_then(|e| *e )
      .map(|e| self.edges[e.0].samples )
      .unwrap_or(1);
    self.set_sample_count(id, samples);

    let in_edges: Vec<EdgeId> = self.nodes[id.0].in_edges.iter().flatten().copied().collect();
    let out_edges: Vec<EdgeId> = self.nodes[id.0].out_edges.iter().flatten().copied().collect();

    let in_data = in_edges.iter().map(|e| self.edges[e.0].data.clone() ).collect();
    let in_grad = in_edges.iter().map(|e| self.edges[e.0].grad.clone() ).collect();
    let out_data = out_edges.iter().map(|e| self.edges[e.0].data.clone() ).collect();
    let out_grad = out_edges.iter().map(|e| self.edges[e.0].grad.clone() ).collect();
    let program = self.program_for(id);

    {
      let Node { op, params, engine, parallelize, .. } = &mut self.nodes[id.0];
      let mut ctx = OpKernelContext {
        in_data,
        out_data,
        in_grad,
        out_grad,
        params: params.as_mut_slice(),
        engine: *engine,
        parallelize: *parallelize,
        samples,
        program,
      };
      op.backward_op(&mut ctx)?;
    }

    for edge in &in_edges {
      self.edges[edge.0].samples = samples;
    }
    Ok(())
  }

  /// Breadth-first, producer-gated traversal order. Graph inputs come
  /// first; a node is visited once all of its producers have been.

  fn traversal(&self) -> Vec<NodeId> {
    let mut pending: Vec<usize> = self.nodes.iter()
      .map(|node| node.in_edges.iter()
        .flatten()
        .filter(|e| self.edges[e.0].producer.is_some() )
        .count())
      .collect();

    let mut queue: VecDeque<NodeId> = pending.iter()
      .enumerate()
      .filter(|(_, &p)| p == 0 )
      .map(|(i, _)| NodeId(i) )
      .collect();

    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(id) = queue.pop_front() {
      order.push(id);
      for edge in self.nodes[id.0].out_edges.iter().flatten() {
        for &consumer in &self.edges[edge.0].consumers {
          pending[consumer.0] -= 1;
          if pending[consumer.0] == 0 {
            queue.push_back(consumer);
          }
        }
      }
    }
    order
  }

  /// Forward pass over the whole graph, inputs first.

  pub fn forward(&mut self) -> Result<()> {
    for id in self.traversal() {
      self.forward_node(id)?;
    }
    Ok(())
  }

  /// Backward pass over the whole graph, outputs first.

  pub fn backward(&mut self) -> Result<()> {
    for id in self.traversal().into_iter().rev() {
      self.backward_node(id)?;
    }
    Ok(())
  }

  /// Forward a single node on explicit `[samples, size]` inputs, one per
  /// data slot, and return its data outputs.

  pub fn forward_with(&mut self, id: NodeId, inputs: &[Tensor<T>]) -> Result<Vec<Tensor<T>>> {
    self.setup(id, false)?;
    let data_slots: Vec<usize> = self.nodes[id.0].op.in_kinds().iter()
      .enumerate()
      .filter(|(_, &kind)| kind == VectorKind::Data )
      .map(|(slot, _)| slot )
      .collect();
    for (slot, input) in data_slots.into_iter().zip(inputs) {
      self.set_input(id, slot, input)?;
    }
    self.forward_node(id)?;

    let node = &self.nodes[id.0];
    Ok(node.out_edges.iter()
      .flatten()
      .map(|e| &self.edges[e.0] )
      .filter(|edge| edge.kind == VectorKind::Data )
      .map(|edge| edge.data.head_rows(edge.samples) )
      .collect())
  }

  /// Backward a single node on explicit output gradients and return the
  /// input gradients it produced.

  pub fn backward_with(&mut self, id: NodeId, out_grads: &[Tensor<T>]) -> Result<Vec<Tensor<T>>> {
    self.setup(id, false)?;
    let data_slots: Vec<usize> = self.nodes[id.0].op.out_kinds().iter()
      .enumerate()
      .filter(|(_, &kind)| kind == VectorKind::Data )
      .map(|(slot, _)| slot )
      .collect();
    for (slot, grad) in data_slots.into_iter().zip(out_grads) {
      self.set_out_grad(id, slot, grad)?;
    }
    self.backward_node(id)?;

    let node = &self.nodes[id.0];
    Ok(node.in_edges.iter()
      .flatten()
      .map(|e| &self.edges[e.0] )
      .filter(|edge| edge.kind == VectorKind::Data )
      .map(|edge| edge.grad.head_rows(edge.samples) )
      .collect())
  }

  /// One optimizer step: merge every trainable parameter's per-sample
  /// gradient rows, scale by the batch size and update the data in
  /// place, then clear all gradients for the next iteration.

  pub fn update_parameters<O: Optimizer<T>>(&mut self, optimizer: &mut O) {
    let mut diff = std::mem::replace(&mut self.diff, Tensor::zeros(&[0]));
    for i in 0..self.nodes.len() {
      let parallelize_node = self.nodes[i].parallelize;
      for p in 0..self.nodes[i].params.len() {
        if !self.nodes[i].params[p].is_trainable() { continue }
        let param = &mut self.nodes[i].params[p];
        param.merge_grads(&mut diff);

        let batch = param.grad().shape().dims[0];
        let rcp_batch = T::one() / T::from(batch).unwrap();
        {
          let mut d = diff.raw_mut();
          for v in d.iter_mut() {
            *v = *v * rcp_batch;
          }
        }

        let parallelize = parallelize_node && param.size() >= PARALLEL_UPDATE_THRESHOLD;
        optimizer.update(&diff, param, parallelize);
      }
      self.clear_node_grads(NodeId(i));
    }
    self.diff = diff;
  }

  fn clear_node_grads(&mut self, id: NodeId) {
    let in_edges: Vec<EdgeId> = self.nodes[id.0].in_edges.iter().flatten().copied().collect();
    for edge in in_edges {
      self.edges[edge.0].grad.refill(T::zero());
    }
    for param in &mut self.nodes[id.0].params {
      param.clear_grads();
    }
  }

  /// Zero all edge and parameter gradients, returning every node to the
  /// ready state.

  pub fn clear_grads(&mut self) {
    for i in 0..self.nodes.len() {
      self.clear_node_grads(NodeId(i));
    }
  }
}

impl<T: Real> Default for Graph<T> {
  fn default() -> Self {
    Self::new()
  }
}
