use itertools::izip;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};

use crate::{
  error::{GraphError, Result},
  layer::{Engine, Layer, OpKernelContext},
  scalar::Real,
  shape::Shape3d,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationKind {
  Sigmoid,
  ReLU,
  Tanh,
}

impl ActivationKind {
  fn name(&self) -> &'static str {
    match self {
      ActivationKind::Sigmoid => "sigmoid",
      ActivationKind::ReLU => "relu",
      ActivationKind::Tanh => "tanh",
    }
  }

  fn apply<T: Real>(&self, x: T) -> T {
    match self {
      ActivationKind::Sigmoid => T::one() / (T::one() + (-x).exp()),
      ActivationKind::ReLU => if x > T::zero() { x } else { T::zero() },
      ActivationKind::Tanh => x.tanh(),
    }
  }

  /// Derivative in terms of the input `x` and the forward output `y`.

  fn derive<T: Real>(&self, x: T, y: T) -> T {
    match self {
      ActivationKind::Sigmoid => y * (T::one() - y),
      ActivationKind::ReLU => if x > T::zero() { T::one() } else { T::zero() },
      ActivationKind::Tanh => T::one() - y * y,
    }
  }
}


/// Element-wise activation. Constructed without a shape it declares an
/// unset input and lets shape inference back-fill it on connect.

#[derive(Debug, Clone)]
pub struct Activation {
  kind: ActivationKind,
  shape: Shape3d,
}

impl Activation {
  pub fn new(kind: ActivationKind) -> Self {
    Self { kind, shape: Shape3d::none() }
  }

  pub fn with_shape(kind: ActivationKind, shape: Shape3d) -> Self {
    Self { kind, shape }
  }
}

impl<T: Real> Layer<T> for Activation {
  fn layer_type(&self) -> &'static str {
    self.kind.name()
  }

  fn in_shape(&self) -> Vec<Shape3d> {
    vec![self.shape]
  }

  fn out_shape(&self) -> Vec<Shape3d> {
    vec![self.shape]
  }

  fn set_in_shape(&mut self, shape: Shape3d) -> Result<()> {
    self.shape = shape;
    Ok(())
  }

  fn forward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    if ctx.engine != Engine::Internal {
      return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine: ctx.engine,
      });
    }
    let len = ctx.samples * self.shape.size();
    let in_guard = ctx.in_data[0].raw();
    let input = &in_guard[..len];
    let mut out_guard = ctx.out_data[0].raw_mut();
    let out = &mut out_guard[..len];

    let kind = self.kind;
    if ctx.parallelize {
      (out, input).into_par_iter().for_each(|(y, &x)| *y = kind.apply(x) );
    } else {
      izip!(out.iter_mut(), input).for_each(|(y, &x)| *y = kind.apply(x) );
    }
    Ok(())
  }

  fn backward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    if ctx.engine != Engine::Internal {
      return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine: ctx.engine,
      });
    }
    let len = ctx.samples * self.shape.size();
    let in_guard = ctx.in_data[0].raw();
    let input = &in_guard[..len];
    let out_guard = ctx.out_data[0].raw();
    let output = &out_guard[..len];
    let cd_guard = ctx.out_grad[0].raw();
    let cd = &cd_guard[..len];
    let mut pd_guard = ctx.in_grad[0].raw_mut();
    let pd = &mut pd_guard[..len];

    let kind = self.kind;
    if ctx.parallelize {
      (pd, input, output, cd).into_par_iter()
        .for_each(|(dx, &x, &y, &dy)| *dx = dy * kind.derive(x, y) );
    } else {
      izip!(pd.iter_mut(), input, output, cd)
        .for_each(|(dx, &x, &y, &dy)| *dx = dy * kind.derive(x, y) );
    }
    Ok(())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sigmoid_values() {
    assert_eq!(ActivationKind::Sigmoid.apply(0.0f64), 0.5);
    assert!((ActivationKind::Sigmoid.apply(2.0f64) - 0.8807970779778823).abs() < 1e-12);
  }

  #[test]
  fn relu_gates_by_input_sign() {
    assert_eq!(ActivationKind::ReLU.apply(-3.0f32), 0.0);
    assert_eq!(ActivationKind::ReLU.apply(3.0f32), 3.0);
    assert_eq!(ActivationKind::ReLU.derive(-3.0f32, 0.0), 0.0);
    assert_eq!(ActivationKind::ReLU.derive(3.0f32, 3.0), 1.0);
  }

  #[test]
  fn inference_fills_shape() {
    let mut layer = Activation::new(ActivationKind::Sigmoid);
    assert!(Layer::<f32>::in_shape(&layer)[0].is_none());
    Layer::<f32>::set_in_shape(&mut layer, Shape3d::new(4, 1, 1)).unwrap();
    assert_eq!(Layer::<f32>::in_shape(&layer)[0], Shape3d::new(4, 1, 1));
  }
}
