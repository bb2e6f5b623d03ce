use serde::{Serialize, Deserialize};

use crate::{
  init::ParamInit,
  scalar::{Inner, Real},
  shape::Shape3d,
  tensor::Tensor,
};


/// Kind of trainable parameter owned by a node.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamKind {
  Weight,
  Bias,
}

/// Blueprint from which a node creates one of its parameters, declared by
/// a [Layer](crate::Layer). Weights are declared before biases so that
/// external serializers see a stable iteration order.

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
  pub kind: ParamKind,
  pub shape: Shape3d,
  pub fmaps: usize,
  pub trainable: bool,
}

impl ParamSpec {
  pub fn weight(shape: Shape3d) -> Self {
    Self { kind: ParamKind::Weight, shape, fmaps: 1, trainable: true }
  }

  pub fn bias(shape: Shape3d) -> Self {
    Self { kind: ParamKind::Bias, shape, fmaps: 1, trainable: true }
  }

  pub fn size(&self) -> usize {
    self.shape.size() * self.fmaps
  }
}


/// A trainable or frozen tensor pair: flat `data` plus a per-sample
/// gradient with one row per batch sample, so backward passes can
/// accumulate without synchronization and merge afterwards.
///
/// Stateful optimizers keep their auxiliary tensors (moment estimates,
/// accumulated squared gradients) in slots allocated alongside the
/// parameter, lazily and zero-initialized on first use.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter<T: Inner> {
  kind: ParamKind,
  shape: Shape3d,
  fmaps: usize,
  trainable: bool,
  initialized: bool,
  data: Tensor<T>,
  grad: Tensor<T>,
  aux: Vec<Tensor<T>>,
}

impl<T: Real> Parameter<T> {
  pub fn new(spec: &ParamSpec) -> Self {
    let size = spec.size();
    Self {
      kind: spec.kind,
      shape: spec.shape,
      fmaps: spec.fmaps,
      trainable: spec.trainable,
      initialized: false,
      data: Tensor::zeros(&[size]),
      grad: Tensor::zeros(&[1, size]),
      aux: vec![],
    }
  }

  pub fn kind(&self) -> ParamKind {
    self.kind
  }

  pub fn shape(&self) -> Shape3d {
    self.shape
  }

  pub fn size(&self) -> usize {
    self.shape.size() * self.fmaps
  }

  pub fn is_trainable(&self) -> bool {
    self.trainable
  }

  pub fn set_trainable(&mut self, trainable: bool) {
    self.trainable = trainable;
  }

  pub fn is_initialized(&self) -> bool {
    self.initialized
  }

  /// Fill `data` from the policy. Nodes call this once per parameter at
  /// setup and again only when a weight reset was requested explicitly.

  pub fn initialize(&mut self, init: &ParamInit<T>, fan_in: usize, fan_out: usize) {
    init.fill(&self.data, fan_in, fan_out);
    self.initialized = true;
  }

  pub fn data(&self) -> &Tensor<T> {
    &self.data
  }

  pub fn set_data(&mut self, data: &Tensor<T>) {
    self.data.feed(data);
    self.initialized = true;
  }

  pub fn grad(&self) -> &Tensor<T> {
    &self.grad
  }

  pub fn set_grad(&mut self, grad: &Tensor<T>) {
    self.grad = grad.detach();
  }

  /// Shape the gradient as one row per sample of the upcoming batch.
  /// Row contents are unspecified afterwards; a fresh backward pass must
  /// be preceded by [clear_grads](Parameter::clear_grads).

  pub fn resize_grad(&mut self, samples: usize) {
    if self.grad.shape().dims[0] != samples {
      self.grad = Tensor::zeros(&[samples, self.size()]);
    }
  }

  /// Reduce the per-sample gradient rows into `dst` by summation.
  ///
  /// Rows are accumulated serially in ascending order, so the result is
  /// deterministic and independent of how backward partitions wrote them.

  pub fn merge_grads(&self, dst: &mut Tensor<T>) {
    let size = self.size();
    if dst.size() != size {
      *dst = Tensor::zeros(&[size]);
    }
    let rows = self.grad.shape().dims[0];
    let grad = self.grad.raw();
    let mut out = dst.raw_mut();
    out[..size].copy_from_slice(&grad[..size]);
    for sample in 1..rows {
      let base = sample * size;
      for i in 0..size {
        out[i] += grad[base + i];
      }
    }
  }

  pub fn clear_grads(&self) {
    self.grad.refill(T::zero());
  }

  /// Auxiliary optimizer state, lazily grown to `slots` tensors shaped
  /// like `data` and zero-initialized.

  pub fn aux_state(&mut self, slots: usize) -> &mut [Tensor<T>] {
    while self.aux.len() < slots {
      self.aux.push(Tensor::zeros(&[self.size()]));
    }
    &mut self.aux[..slots]
  }

  pub fn clear_aux(&mut self) {
    self.aux.clear();
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn weight_3x3() -> Parameter<f32> {
    Parameter::new(&ParamSpec::weight(Shape3d::new(3, 3, 1)))
  }

  #[test]
  fn construction() {
    let p = weight_3x3();
    assert_eq!(p.kind(), ParamKind::Weight);
    assert_eq!(p.size(), 9);
    assert!(p.is_trainable());
    assert!(!p.is_initialized());
    assert_eq!(p.grad().shape().dims, vec![1, 9]);
  }

  #[test]
  fn initialize_marks_parameter() {
    let mut p = weight_3x3();
    p.initialize(&ParamInit::constant(2.0), 3, 3);
    assert!(p.is_initialized());
    assert_eq!(p.data(), &Tensor::fill(&[9], 2.0));
  }

  #[test]
  fn merge_grads_sums_rows() {
    let mut p = Parameter::<f32>::new(&ParamSpec::bias(Shape3d::new(2, 1, 1)));
    p.set_grad(&Tensor::new(&[3, 2], vec![1.0, 2.0, 2.0, 1.0, -4.0, 5.0]));

    let mut merged = Tensor::zeros(&[2]);
    p.merge_grads(&mut merged);
    assert_eq!(merged, Tensor::vec(&[-1.0, 8.0]));
  }

  #[test]
  fn merge_grads_is_row_order_invariant() {
    let mut a = Parameter::<f32>::new(&ParamSpec::bias(Shape3d::new(2, 1, 1)));
    let mut b = a.clone();
    a.set_grad(&Tensor::new(&[2, 2], vec![0.25, -1.5, 3.0, 0.125]));
    b.set_grad(&Tensor::new(&[2, 2], vec![3.0, 0.125, 0.25, -1.5]));

    let mut merged_a = Tensor::zeros(&[2]);
    let mut merged_b = Tensor::zeros(&[2]);
    a.merge_grads(&mut merged_a);
    b.merge_grads(&mut merged_b);
    assert_eq!(merged_a, merged_b);
  }

  #[test]
  fn clear_and_resize_grads() {
    let mut p = weight_3x3();
    p.resize_grad(4);
    assert_eq!(p.grad().shape().dims, vec![4, 9]);
    p.grad().refill(1.0);
    p.clear_grads();
    assert_eq!(p.grad(), &Tensor::zeros(&[4, 9]));
  }

  #[test]
  fn aux_state_is_lazy_and_zeroed() {
    let mut p = weight_3x3();
    {
      let aux = p.aux_state(2);
      assert_eq!(aux.len(), 2);
      assert_eq!(aux[0], Tensor::zeros(&[9]));
      aux[1].refill(5.0);
    }
    // a second request returns the same slots
    assert_eq!(p.aux_state(2)[1], Tensor::fill(&[9], 5.0));
  }
}
