use std::rc::Rc;
use std::cell::{Ref, RefMut, RefCell};

use serde::{Serialize, Deserialize};

use crate::{
  error::Result,
  scalar::{Inner, Numeric},
  shape::Shape,
};


/// Multidimensional array with batch-major layout.
///
/// The first dimension conventionally counts samples in a mini-batch.
/// Storage is contiguous and shared between a tensor and its views;
/// [at](Tensor::at) produces a lightweight view aliasing a sub-range of
/// the parent's buffer. The leading axis only ever grows
/// (see [resize_axis](Tensor::resize_axis)), so row views taken before a
/// resize stay valid.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tensor<T: Inner> {
  shape: Shape,
  data: Rc<RefCell<Vec<T>>>,
}

impl<T: Inner> PartialEq for Tensor<T> {
  fn eq(&self, rhs: &Self) -> bool {
    if self.shape.dims != rhs.shape.dims { return false }
    let data_l = self.data.borrow();
    let data_r = rhs.data.borrow();
    let (ol, or) = (self.shape.offset, rhs.shape.offset);
    (0..self.size()).all(|i| data_l[ol + i] == data_r[or + i] )
  }
}

impl<T: Inner> Tensor<T> {
  pub fn from_shape(shape: Shape, data: Vec<T>) -> Self {
    assert_eq!(shape.size(), data.len(),
      "{} doesn't match data length {}", shape, data.len());
    Self { shape, data: Rc::new(RefCell::new(data)) }
  }

  pub fn new(dims: &[usize], data: Vec<T>) -> Self {
    Self::from_shape(Shape::new(dims), data)
  }

  pub fn vec(vec: &[T]) -> Self {
    Self::new(&[vec.len()], vec.to_vec())
  }

  pub fn fill(dims: &[usize], filler: T) -> Self {
    Self::new(dims, vec![filler; dims.iter().product()])
  }

  pub fn shape(&self) -> &Shape {
    &self.shape
  }

  pub fn size(&self) -> usize {
    self.shape.size()
  }

  pub fn rank(&self) -> usize {
    self.shape.rank()
  }

  /// Borrow the backing buffer. Views address it starting at
  /// [offset](Tensor::offset).

  pub fn raw(&self) -> Ref<Vec<T>> {
    self.data.borrow()
  }

  pub fn raw_mut(&self) -> RefMut<Vec<T>> {
    self.data.borrow_mut()
  }

  pub fn offset(&self) -> usize {
    self.shape.offset
  }

  pub fn shares_storage_with(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.data, &other.data)
  }

  pub fn get(&self, indices: &[usize]) -> T {
    self.data.borrow()[self.shape.index(indices)]
  }

  pub fn set(&self, indices: &[usize], value: T) {
    let idx = self.shape.index(indices);
    self.data.borrow_mut()[idx] = value;
  }

  /// Overwrite every element of this tensor (or view) with `value`.

  pub fn refill(&self, value: T) {
    let mut data = self.data.borrow_mut();
    let offset = self.shape.offset;
    for slot in &mut data[offset..offset + self.shape.size()] {
      *slot = value;
    }
  }

  /// Copy another tensor's elements into this one. Sizes must match;
  /// shapes may differ.

  pub fn feed(&self, other: &Self) {
    assert_eq!(self.size(), other.size(),
      "could not feed {} tensor from {}", self.shape, other.shape);
    // Avoid a clashing borrow when both handles share storage
    let other = if self.shares_storage_with(other) {
      other.detach()
    } else {
      other.clone()
    };
    let mut data = self.data.borrow_mut();
    let other_data = other.data.borrow();
    let (ol, or) = (self.shape.offset, other.shape.offset);
    for i in 0..self.size() {
      data[ol + i] = other_data[or + i];
    }
  }

  /// View of the sub-tensor addressed by fixing the leading indices.
  /// Shares storage with `self`.

  pub fn at(&self, indices: &[usize]) -> Self {
    Self {
      shape: self.shape.take(indices),
      data: self.data.clone(),
    }
  }

  pub fn iter_axis0(&self) -> impl Iterator<Item = Tensor<T>> + '_ {
    let rows = self.shape.dims.first().copied().unwrap_or(0);
    (0..rows).map(move |i| self.at(&[i]) )
  }

  /// View of the first `rows` leading-axis rows. Shares storage, so it
  /// trims a grown buffer down to the logical batch without copying.

  pub fn head_rows(&self, rows: usize) -> Self {
    debug_assert!(rows <= self.shape.dims[0]);
    let mut shape = self.shape.clone();
    shape.dims[0] = rows;
    Self { shape, data: self.data.clone() }
  }

  /// Strict reshape: the element count must be unchanged.

  pub fn reshape(&self, dims: &[usize]) -> Result<Self> {
    Ok(Self {
      shape: self.shape.reshaped(dims)?,
      data: self.data.clone(),
    })
  }

  /// Standalone copy of this tensor's elements.

  pub fn detach(&self) -> Self {
    let data = self.data.borrow();
    let offset = self.shape.offset;
    Self::new(&self.shape.dims, data[offset..offset + self.shape.size()].to_vec())
  }

  pub fn to_vec(&self) -> Vec<T> {
    let data = self.data.borrow();
    let offset = self.shape.offset;
    data[offset..offset + self.shape.size()].to_vec()
  }
}

impl<T: Numeric> Tensor<T> {
  pub fn zeros(dims: &[usize]) -> Self {
    Self::fill(dims, T::zero())
  }

  pub fn ones(dims: &[usize]) -> Self {
    Self::fill(dims, T::one())
  }

  /// Grow the leading axis to `rows`, reallocating and zero-filling the
  /// new rows. Monotonic: shrinking is a no-op, so buffers are reused
  /// across batches of varying but bounded size.

  pub fn resize_axis(&mut self, rows: usize) {
    debug_assert_eq!(self.shape.offset, 0, "cannot resize a view");
    let current = self.shape.dims.first().copied().unwrap_or(0);
    if rows <= current { return }
    let row_size: usize = self.shape.dims[1..].iter().product();
    self.data.borrow_mut().resize(rows * row_size, T::zero());
    self.shape.dims[0] = rows;
  }
}

impl<T: Inner> std::fmt::Display for Tensor<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Tensor{:?} {:?}", self.shape.dims, self.to_vec())
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn views() {
    let x = Tensor::new(&[2,2,2], vec![1, 2, 3, 4, 5, 6, 7, 8]);
    assert_eq!(x.at(&[0,0]), Tensor::vec(&[1, 2]));
    assert_eq!(x.at(&[1,1]), Tensor::vec(&[7, 8]));
    assert_eq!(x.at(&[0]), Tensor::new(&[2,2], vec![1, 2, 3, 4]));
  }

  #[test]
  fn view_writes_parent() {
    let x = Tensor::new(&[2,2], vec![1, 2, 3, 4]);
    x.at(&[1]).refill(0);
    assert_eq!(x, Tensor::new(&[2,2], vec![1, 2, 0, 0]));
  }

  #[test]
  fn feed() {
    let x = Tensor::zeros(&[2,2]);
    x.feed(&Tensor::vec(&[1, 2, 3, 4]));
    assert_eq!(x, Tensor::new(&[2,2], vec![1, 2, 3, 4]));
  }

  #[test]
  fn reshape_checks_size() {
    let x = Tensor::new(&[2,3], vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(x.reshape(&[3,2]).unwrap().shape().dims, vec![3,2]);
    assert!(x.reshape(&[4]).is_err());
  }

  #[test]
  fn resize_axis_preserves_rows() {
    let mut x = Tensor::new(&[2,2], vec![1, 2, 3, 4]);
    x.resize_axis(4);
    assert_eq!(x.shape().dims, vec![4,2]);
    assert_eq!(x.at(&[0]), Tensor::vec(&[1, 2]));
    assert_eq!(x.at(&[1]), Tensor::vec(&[3, 4]));
    assert_eq!(x.at(&[3]), Tensor::vec(&[0, 0]));

    // shrinking is a no-op
    x.resize_axis(1);
    assert_eq!(x.shape().dims, vec![4,2]);
  }

  #[test]
  fn detach_copies() {
    let x = Tensor::new(&[2], vec![1, 2]);
    let y = x.detach();
    y.refill(0);
    assert_eq!(x, Tensor::vec(&[1, 2]));
  }
}
