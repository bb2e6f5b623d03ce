use crate::{
  error::{GraphError, Result},
  kernels::ConnectionTable,
  kernels::conv2d::{self as kernel, Conv2dParams, Padding, conv_out_length, padded_length},
  layer::{Engine, Layer, OpKernelContext},
  parameter::ParamSpec,
  scalar::Real,
  shape::Shape3d,
};


/// 2-D convolution over channel-major spatial data.
///
/// Channel connectivity is governed by an explicit [ConnectionTable];
/// the default connects every (out, in) channel pair. This operation
/// ships an accelerator program, so it can be registered on an accel
/// [Device](crate::Device) and run with [Engine::Accel].

#[derive(Debug, Clone)]
pub struct Convolutional {
  in_shape: Shape3d,
  window_x: usize,
  window_y: usize,
  out_channels: usize,
  stride_x: usize,
  stride_y: usize,
  padding: Padding,
  table: ConnectionTable,
  has_bias: bool,
}

impl Convolutional {
  pub fn new(in_shape: Shape3d, window: usize, out_channels: usize) -> Self {
    Self {
      in_shape,
      window_x: window,
      window_y: window,
      out_channels,
      stride_x: 1,
      stride_y: 1,
      padding: Padding::Valid,
      table: ConnectionTable::full(),
      has_bias: true,
    }
  }

  pub fn padding(mut self, padding: Padding) -> Self {
    self.padding = padding;
    self
  }

  pub fn stride(mut self, stride_x: usize, stride_y: usize) -> Self {
    self.stride_x = stride_x;
    self.stride_y = stride_y;
    self
  }

  pub fn connection_table(mut self, table: ConnectionTable) -> Self {
    self.table = table;
    self
  }

  pub fn without_bias(mut self) -> Self {
    self.has_bias = false;
    self
  }

  fn weight_shape(&self) -> Shape3d {
    Shape3d::new(self.window_x, self.window_y, self.in_shape.depth * self.out_channels)
  }

  fn conv_params(&self) -> Conv2dParams {
    Conv2dParams {
      in_shape: self.in_shape,
      in_padded: Shape3d::new(
        padded_length(self.in_shape.width, self.window_x, self.padding),
        padded_length(self.in_shape.height, self.window_y, self.padding),
        self.in_shape.depth,
      ),
      out_shape: self.output_shape(),
      weight: self.weight_shape(),
      w_stride: self.stride_x,
      h_stride: self.stride_y,
      padding: self.padding,
      table: self.table.clone(),
      has_bias: self.has_bias,
    }
  }

  fn output_shape(&self) -> Shape3d {
    Shape3d::new(
      conv_out_length(self.in_shape.width, self.window_x, self.stride_x, self.padding),
      conv_out_length(self.in_shape.height, self.window_y, self.stride_y, self.padding),
      self.out_channels,
    )
  }
}

impl<T: Real> Layer<T> for Convolutional {
  fn layer_type(&self) -> &'static str {
    "conv2d"
  }

  fn in_shape(&self) -> Vec<Shape3d> {
    vec![self.in_shape]
  }

  fn out_shape(&self) -> Vec<Shape3d> {
    vec![self.output_shape()]
  }

  fn fan_in_size(&self, _i: usize) -> usize {
    self.window_x * self.window_y * self.in_shape.depth
  }

  fn fan_out_size(&self, _i: usize) -> usize {
    self.window_x * self.window_y * self.out_channels
  }

  fn param_specs(&self) -> Vec<ParamSpec> {
    let mut specs = vec![ParamSpec::weight(self.weight_shape())];
    if self.has_bias {
      specs.push(ParamSpec::bias(Shape3d::new(self.out_channels, 1, 1)));
    }
    specs
  }

  fn kernel_signature(&self) -> Option<String> {
    Some(format!("conv2d_{}_w{}x{}_o{}",
      self.in_shape, self.window_x, self.window_y, self.out_channels))
  }

  fn forward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    let params = self.conv_params();
    let weights = ctx.parameter(0).data().clone();
    let bias = self.has_bias.then(|| ctx.parameter(1).data().clone() );

    match ctx.engine {
      Engine::Internal => kernel::forward_internal(&params, &ctx.in_data[0],
        &weights, bias.as_ref(), &ctx.out_data[0], ctx.samples, ctx.parallelize),
      Engine::Accel => {
        let program = ctx.program(Layer::<T>::layer_type(self))?;
        program.launch(|| kernel::forward_internal(&params, &ctx.in_data[0],
          &weights, bias.as_ref(), &ctx.out_data[0], ctx.samples, ctx.parallelize) );
      },
      engine => return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine,
      }),
    }
    Ok(())
  }

  fn backward_op(&self, ctx: &mut OpKernelContext<T>) -> Result<()> {
    let params = self.conv_params();
    let weights = ctx.parameter(0).data().clone();
    let dw = ctx.parameter(0).grad().clone();
    let db = self.has_bias.then(|| ctx.parameter(1).grad().clone() );

    match ctx.engine {
      Engine::Internal => kernel::backward_internal(&params, &ctx.in_data[0],
        &weights, &dw, db.as_ref(), &ctx.out_grad[0], &ctx.in_grad[0],
        ctx.samples, ctx.parallelize),
      Engine::Accel => {
        let program = ctx.program(Layer::<T>::layer_type(self))?;
        program.launch(|| kernel::backward_internal(&params, &ctx.in_data[0],
          &weights, &dw, db.as_ref(), &ctx.out_grad[0], &ctx.in_grad[0],
          ctx.samples, ctx.parallelize) );
      },
      engine => return Err(GraphError::UnsupportedEngine {
        op: Layer::<T>::layer_type(self).to_string(),
        engine,
      }),
    }
    Ok(())
  }
}
