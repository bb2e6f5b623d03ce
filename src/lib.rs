//! Layer-graph execution engine for trainable networks.
//!
//! Represents a computation as a DAG of operation nodes connected by
//! tensor-valued edges, drives forward and backward passes over it, and
//! updates trainable parameters from batch-merged gradients.
//!
//! # Features
//!
//! - **Arena-owned graphs** — Nodes and edges live in a [Graph] arena and
//! address each other by stable ids; edges are allocated lazily on first
//! use and shapes are inferred on connect where a layer allows it.
//!
//! - **Pluggable engines** — Every operation ships a portable reference
//! kernel and may add vectorized, third-party or accelerator variants,
//! selected per node by [Engine] tag.
//!
//! - **Compile-once program cache** — Accelerator [devices](Device)
//! register operations through an injectable [ProgramRegistry] that
//! compiles each operation signature at most once.
//!
//! - **Batched gradients** — Parameters accumulate one gradient row per
//! sample and merge them deterministically before each
//! [optimizer](optimize::Optimizer) step.
//!
//! # Examples
//!
//! One training iteration over a single fully-connected node:
//! ```
//! use gradnet::{ Graph, ParamInit, Tensor, layers::FullyConnected, optimize::GradientDescent };
//!
//! let mut graph = Graph::<f32>::new();
//! let fc = graph.add(FullyConnected::new(2, 1));
//! graph.set_weight_init(fc, ParamInit::constant(0.5));
//!
//! // forward a two-sample batch
//! let input = Tensor::new(&[2, 2], vec![1.0, 0.0, 0.0, 1.0]);
//! let output = graph.forward_with(fc, &[input]).unwrap();
//! assert_eq!(output[0].get(&[0, 0]), 0.5);
//!
//! // back-propagate a loss gradient and take an optimizer step
//! let grad = Tensor::new(&[2, 1], vec![0.5, -0.5]);
//! graph.backward_with(fc, &[grad]).unwrap();
//! graph.update_parameters(&mut GradientDescent::default());
//! ```
//!
//! Wiring nodes into a network:
//! ```
//! use gradnet::{ Graph, Tensor, layers::{ Activation, ActivationKind, FullyConnected } };
//!
//! let mut graph = Graph::<f32>::new();
//! let fc = graph.add(FullyConnected::new(3, 2));
//! let act = graph.add(Activation::new(ActivationKind::Sigmoid));
//!
//! // the activation's input shape is inferred from the producer
//! graph.connect(fc, act).unwrap();
//!
//! graph.set_input(fc, 0, &Tensor::new(&[1, 3], vec![0.5, -1.0, 2.0])).unwrap();
//! graph.forward().unwrap();
//! ```

mod device;
mod error;
mod graph;
mod init;
mod layer;
mod parameter;
mod shape;
mod tensor;

pub mod kernels;
pub mod layers;
pub mod optimize;
pub mod scalar;

pub use device::{Device, DeviceKind, Program, ProgramRegistry};
pub use error::{GraphError, Result};
pub use graph::{Edge, Graph, Node, NodeId};
pub use init::ParamInit;
pub use layer::{Engine, Layer, OpKernelContext, VectorKind};
pub use parameter::{ParamKind, ParamSpec, Parameter};
pub use shape::{Shape, Shape3d};
pub use tensor::Tensor;
