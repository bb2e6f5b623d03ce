use crate::{
  error::{GraphError, Result},
  kernels::max_pooling::{self as kernel, MaxPoolParams, pool_out_length},
  layer::{Engine, Layer, OpKernelContext, VectorKind},
  scalar::Real,
  shape::Shape3d,
};


/// Spatial max-pooling. The winning input position of each window is
/// recorded in an auxiliary output edge during forward and routes the
/// delta during backward.

#[derive(Debug, Clone)]
pub struct MaxPooling {
  params: MaxPoolParams,
  out2in: Vec<Vec<usize>>,
}

impl MaxPooling {
  pub fn new(in_shape: Shape3d, pool: usize) -> Result<Self> {
    Self::with_stride(in_shape, pool, pool)
  }

  pub fn with_stride(in_shape: Shape3d, pool: usize, stride: usize) -> Result<Self> {
    let params = MaxPoolParams {
      in_shape,
      out_shape: Shape3d::new(
        pool_out_length(in_shape.width, pool, stride),
        pool_out_length(in_shape.height, pool, stride),
        in_shape.depth,
      ),
      pool_x: pool,
      pool_y: pool,
      stride_x: stride,
      stride_y: stride,
    };
    let (out2in, _in2out) = kernel::build_tables(&params, "max-pool")?;
    Ok(Self { params, out2in })
  }

  pub fn pool_size(&self) -> usize {
    self.params.pool_x
  }
}

impl<T: Real> Layer<T> for MaxPooling {
  fn layer_type(&self) -> &'static str {
    "max-pool"
  }

  fn out_kinds(&self) -> Vec<VectorKind> {
    vec![VectorKind::Data, VectorKind::Aux]
  }

  fn in_shape(&self) -> Vec<Shape3d> {
    vec![self.params.in_shape]
  }

  fn out_shape(&self) -> Vec<Shape3d> {
    vec![self.params.out_shape, self.params.out_shape]
  }

  fn fan_in_size(&self, _i: usize) -> usize {
    self.out2in[0].len()
  }

  fn fan_out_size(&self, _i: usize) -> usize {
    1
  }

  fn forward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    if ctx.engine != Engine::Internal {
      return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine: ctx.engine,
      });
    }
    kernel::forward_internal(&self.params, &self.out2in, &ctx.in_data[0],
      &ctx.out_data[0], &ctx.out_data[1], ctx.samples, ctx.parallelize);
    Ok(())
  }

  fn backward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    if ctx.engine != Engine::Internal {
      return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine: ctx.engine,
      });
    }
    kernel::backward_internal(&self.params, &ctx.out_data[1],
      &ctx.out_grad[0], &ctx.in_grad[0], ctx.samples, ctx.parallelize);
    Ok(())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn output_shape_halves_input() {
    let pool = MaxPooling::new(Shape3d::new(4, 4, 3), 2).unwrap();
    assert_eq!(Layer::<f32>::out_shape(&pool)[0], Shape3d::new(2, 2, 3));
    assert_eq!(Layer::<f32>::fan_in_size(&pool, 0), 4);
  }

  #[test]
  fn declares_an_aux_output() {
    let pool = MaxPooling::new(Shape3d::new(4, 4, 1), 2).unwrap();
    assert_eq!(Layer::<f32>::out_kinds(&pool), vec![VectorKind::Data, VectorKind::Aux]);
  }
}
