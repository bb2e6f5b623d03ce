use thiserror::Error;

use crate::layer::Engine;


pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building or running a layer graph.
///
/// Messages embed the concrete layer types, shapes and engines involved;
/// callers rely on them to debug network topology.

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("cannot reshape {from} into {to}")]
  Shape { from: String, to: String },

  #[error("shape mismatch connecting {from} (out: {out_shape}) to {to} (in: {in_shape})")]
  Connection {
    from: String,
    to: String,
    out_shape: String,
    in_shape: String,
  },

  #[error("{layer} does not support input shape inference")]
  Inference { layer: String },

  #[error("{layer}: {channels} {dir} channels declared but {shapes} shapes given")]
  Setup {
    layer: String,
    dir: &'static str,
    channels: usize,
    shapes: usize,
  },

  #[error("{op} has no implementation for engine {engine}")]
  UnsupportedEngine { op: String, engine: Engine },

  #[error("cannot register {op}: device has disabled accelerator support")]
  DeviceWithoutAccel { op: String },

  #[error("cannot register {op}: operation must declare the {required} engine, found {actual}")]
  EngineRequired {
    op: String,
    required: Engine,
    actual: Engine,
  },

  #[error("{layer}: connectivity index overflow ({index} >= {len})")]
  AllocationInvariant {
    layer: String,
    index: usize,
    len: usize,
  },
}
