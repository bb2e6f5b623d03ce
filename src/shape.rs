use serde::{Serialize, Deserialize};

use crate::error::{GraphError, Result};


/// The shape of a [Tensor](crate::Tensor): row-major dimensions plus a
/// storage offset, so views can address a sub-range of a parent's buffer.

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape {
  pub dims: Vec<usize>,
  pub(crate) offset: usize,
}

impl Shape {
  pub fn new(dims: &[usize]) -> Self {
    Self { dims: dims.to_vec(), offset: 0 }
  }

  pub fn size(&self) -> usize {
    self.dims.iter().product()
  }

  pub fn rank(&self) -> usize {
    self.dims.len()
  }

  pub fn strides(&self) -> Vec<usize> {
    let mut strides = vec![1; self.rank()];
    for d in (1..self.rank()).rev() {
      strides[d - 1] = strides[d] * self.dims[d];
    }
    strides
  }

  /// Storage index for a multi-dimensional index, accumulating strides
  /// from the trailing dimension first. Missing trailing indices are
  /// treated as zero.

  pub(crate) fn index(&self, indices: &[usize]) -> usize {
    debug_assert!(indices.len() <= self.rank());
    debug_assert!(indices.iter().zip(&self.dims).all(|(&i, &n)| i < n ),
      "index {:?} out of range for {}", indices, self);
    let mut idx = 0;
    let mut stride = 1;
    for d in (0..self.rank()).rev() {
      idx += indices.get(d).copied().unwrap_or(0) * stride;
      stride *= self.dims[d];
    }
    idx + self.offset
  }

  /// Shape of the sub-view addressed by fixing the leading `indices`.

  pub(crate) fn take(&self, indices: &[usize]) -> Self {
    let offset = self.index(indices);
    Self { dims: self.dims[indices.len()..].to_vec(), offset }
  }

  pub(crate) fn reshaped(&self, dims: &[usize]) -> Result<Self> {
    if dims.iter().product::<usize>() != self.size() {
      return Err(GraphError::Shape {
        from: self.to_string(),
        to: Shape::new(dims).to_string(),
      });
    }
    Ok(Self { dims: dims.to_vec(), offset: self.offset })
  }
}

impl std::fmt::Display for Shape {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "Shape{:?}", self.dims)
  }
}


/// Spatial extent of a layer's data: width x height x depth, where depth
/// counts channels. A zero-sized shape stands for "not yet known" and is
/// filled in by shape inference on connect.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shape3d {
  pub width: usize,
  pub height: usize,
  pub depth: usize,
}

impl Shape3d {
  pub fn new(width: usize, height: usize, depth: usize) -> Self {
    Self { width, height, depth }
  }

  pub fn none() -> Self {
    Self { width: 0, height: 0, depth: 0 }
  }

  pub fn is_none(&self) -> bool {
    self.size() == 0
  }

  pub fn size(&self) -> usize {
    self.width * self.height * self.depth
  }

  pub fn area(&self) -> usize {
    self.width * self.height
  }

  /// Storage index within one sample, channel-major as in the kernels:
  /// `(depth * height + y) * width + x`.

  pub fn get_index(&self, x: usize, y: usize, channel: usize) -> usize {
    debug_assert!(x < self.width && y < self.height && channel < self.depth);
    (self.height * channel + y) * self.width + x
  }
}

impl std::fmt::Display for Shape3d {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "{}x{}x{}", self.width, self.height, self.depth)
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strides() {
    let shape = Shape::new(&[3,2,2]);
    assert_eq!(shape.strides(), vec![4,2,1]);

    let shape = Shape::new(&[2,3,2]);
    assert_eq!(shape.strides(), vec![6,2,1]);
  }

  #[test]
  fn index() {
    let shape = Shape::new(&[2,3]);
    assert_eq!(shape.index(&[0]), 0);
    assert_eq!(shape.index(&[1,0]), 3);
    assert_eq!(shape.index(&[1,2]), 5);
  }

  #[test]
  fn take() {
    let shape = Shape::new(&[3,4]).take(&[2]);
    assert_eq!(shape.dims, vec![4]);
    assert_eq!(shape.offset, 8);
  }

  #[test]
  fn reshaped() {
    let shape = Shape::new(&[2,6]).reshaped(&[3,4]).unwrap();
    assert_eq!(shape.dims, vec![3,4]);
    assert!(Shape::new(&[2,6]).reshaped(&[5]).is_err());
  }

  #[test]
  fn spatial_index() {
    let shape = Shape3d::new(5, 5, 2);
    assert_eq!(shape.get_index(0, 0, 0), 0);
    assert_eq!(shape.get_index(2, 1, 0), 7);
    assert_eq!(shape.get_index(0, 0, 1), 25);
    assert_eq!(shape.size(), 50);
  }
}
