use crate::{
  error::{GraphError, Result},
  kernels::fully_connected::{self as kernel, FullyParams},
  layer::{Engine, Layer, OpKernelContext},
  parameter::ParamSpec,
  scalar::Real,
  shape::Shape3d,
};


/// Fully-connected (dense) operation: `out = x W + b`.

#[derive(Debug, Clone)]
pub struct FullyConnected {
  params: FullyParams,
}

impl FullyConnected {
  pub fn new(in_size: usize, out_size: usize) -> Self {
    Self { params: FullyParams { in_size, out_size, has_bias: true } }
  }

  pub fn without_bias(in_size: usize, out_size: usize) -> Self {
    Self { params: FullyParams { in_size, out_size, has_bias: false } }
  }
}

impl<T: Real> Layer<T> for FullyConnected {
  fn layer_type(&self) -> &'static str {
    "fully-connected"
  }

  fn in_shape(&self) -> Vec<Shape3d> {
    vec![Shape3d::new(self.params.in_size, 1, 1)]
  }

  fn out_shape(&self) -> Vec<Shape3d> {
    vec![Shape3d::new(self.params.out_size, 1, 1)]
  }

  fn fan_in_size(&self, _i: usize) -> usize {
    self.params.in_size
  }

  fn fan_out_size(&self, _i: usize) -> usize {
    self.params.out_size
  }

  fn param_specs(&self) -> Vec<ParamSpec> {
    let weight = Shape3d::new(self.params.in_size, self.params.out_size, 1);
    let mut specs = vec![ParamSpec::weight(weight)];
    if self.params.has_bias {
      specs.push(ParamSpec::bias(Shape3d::new(self.params.out_size, 1, 1)));
    }
    specs
  }

  fn forward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    let weights = ctx.parameter(0).data().clone();
    let bias = self.params.has_bias.then(|| ctx.parameter(1).data().clone() );

    match ctx.engine {
      Engine::Internal => kernel::forward_internal(&self.params, &ctx.in_data[0],
        &weights, bias.as_ref(), &ctx.out_data[0], ctx.samples, ctx.parallelize),
      Engine::Simd => kernel::forward_simd(&self.params, &ctx.in_data[0],
        &weights, bias.as_ref(), &ctx.out_data[0], ctx.samples, ctx.parallelize),
      Engine::Blas => kernel::forward_blas(&self.params, &ctx.in_data[0],
        &weights, bias.as_ref(), &ctx.out_data[0], ctx.samples),
      engine => return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine,
      }),
    }
    Ok(())
  }

  fn backward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    let weights = ctx.parameter(0).data().clone();
    let dw = ctx.parameter(0).grad().clone();
    let db = self.params.has_bias.then(|| ctx.parameter(1).grad().clone() );

    match ctx.engine {
      Engine::Internal | Engine::Simd => kernel::backward_internal(&self.params,
        &ctx.in_data[0], &weights, &dw, db.as_ref(),
        &ctx.out_grad[0], &ctx.in_grad[0], ctx.samples, ctx.parallelize),
      Engine::Blas => kernel::backward_blas(&self.params,
        &ctx.in_data[0], &weights, &dw, db.as_ref(),
        &ctx.out_grad[0], &ctx.in_grad[0], ctx.samples, ctx.parallelize),
      engine => return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine,
      }),
    }
    Ok(())
  }
}
