use std::fmt::Debug;
use std::sync::Arc;

use serde::{Serialize, Deserialize};

use crate::{
  device::Program,
  error::{GraphError, Result},
  parameter::{Parameter, ParamSpec},
  scalar::{Inner, Real},
  shape::Shape3d,
  tensor::Tensor,
};


/// Compute engine backing a node's kernels.
///
/// Every operation ships `Internal`, the portable reference engine.
/// `Simd` is a vectorization-friendly unrolled variant, `Blas` delegates
/// to a third-party matrix library and `Accel` invokes a program compiled
/// for an accelerator [Device](crate::Device).

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Engine {
  Internal,
  Simd,
  Blas,
  Accel,
}

impl Default for Engine {
  fn default() -> Self {
    Engine::Internal
  }
}

impl std::fmt::Display for Engine {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    let name = match self {
      Engine::Internal => "internal",
      Engine::Simd => "simd",
      Engine::Blas => "blas",
      Engine::Accel => "accel",
    };
    write!(f, "{}", name)
  }
}


/// Role of a slot or the edge occupying it.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorKind {
  Data,
  Weight,
  Bias,
  /// Side-channel outputs, e.g. pooling argmax indices.
  Aux,
}


/// Everything an operation's kernels need for one forward or backward
/// call. The tensors share storage with the owning edges, so kernel
/// writes land directly in the graph.
///
/// `samples` is the logical batch size; edge buffers may hold more rows
/// than that because the leading axis only ever grows.

pub struct OpKernelContext<'a, T: Inner> {
  pub in_data: Vec<Tensor<T>>,
  pub out_data: Vec<Tensor<T>>,
  pub in_grad: Vec<Tensor<T>>,
  pub out_grad: Vec<Tensor<T>>,
  pub params: &'a mut [Parameter<T>],
  pub engine: Engine,
  pub parallelize: bool,
  pub samples: usize,
  pub program: Option<Arc<Program>>,
}

impl<'a, T: Real> OpKernelContext<'a, T> {
  pub fn parameter(&self, i: usize) -> &Parameter<T> {
    &self.params[i]
  }

  /// The compiled program for this node, required by the accel engine.

  pub fn program(&self, op: &str) -> Result<Arc<Program>> {
    self.program.clone().ok_or_else(|| GraphError::UnsupportedEngine {
      op: op.to_string(),
      engine: Engine::Accel,
    })
  }
}


/// The polymorphic unit of computation.
///
/// A layer declares its slot layout and shapes, the parameters it owns
/// and the forward/backward kernels; the [Graph](crate::Graph) wires its
/// edges, drives the state machine and owns the parameter storage.

pub trait Layer<T: Real>: Debug {
  /// Name of the operation, unique per concrete type. Embedded in error
  /// diagnostics, so it is part of the crate's debugging contract.
  fn layer_type(&self) -> &'static str;

  fn in_kinds(&self) -> Vec<VectorKind> {
    vec![VectorKind::Data]
  }

  fn out_kinds(&self) -> Vec<VectorKind> {
    vec![VectorKind::Data]
  }

  /// Input shapes, one per input slot. A [none](Shape3d::none) entry
  /// asks for inference from the producer on connect.
  fn in_shape(&self) -> Vec<Shape3d>;

  fn out_shape(&self) -> Vec<Shape3d>;

  /// Back-fill an inferred input shape. Only layers whose geometry
  /// follows from their input support this.
  fn set_in_shape(&mut self, _shape: Shape3d) -> Result<()> {
    Err(GraphError::Inference { layer: self.layer_type().to_string() })
  }

  /// Incoming connections per output unit, for fan-scaled initializers.
  fn fan_in_size(&self, _i: usize) -> usize {
    self.in_shape()[0].width
  }

  /// Outgoing connections per input unit.
  fn fan_out_size(&self, _i: usize) -> usize {
    self.out_shape()[0].width
  }

  /// Parameters this operation owns, weights before biases.
  fn param_specs(&self) -> Vec<ParamSpec> {
    vec![]
  }

  fn forward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()>;

  fn backward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()>;

  /// Identity of this operation's accelerator program, for layers that
  /// ship one. Registration and the compile-once cache key off it.
  fn kernel_signature(&self) -> Option<String> {
    None
  }
}
