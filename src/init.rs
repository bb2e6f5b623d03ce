use rand::Rng;
use serde::{Serialize, Deserialize};

use crate::{
  scalar::Real,
  tensor::Tensor,
};


/// Parameter initialization policy, consumed through
/// [Parameter::initialize](crate::Parameter::initialize).
///
/// Fan-scaled policies draw from a uniform distribution whose range is
/// derived from the number of incoming/outgoing connections per unit.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParamInit<T> {
  Constant(T),
  Xavier { scale: T },
  LeCun,
}

impl<T: Real> ParamInit<T> {
  /// Xavier/Glorot fill with the customary scale of 6.

  pub fn xavier() -> Self {
    Self::Xavier { scale: T::from(6.0).unwrap() }
  }

  pub fn constant(value: T) -> Self {
    Self::Constant(value)
  }

  pub fn fill(&self, data: &Tensor<T>, fan_in: usize, fan_out: usize) {
    match self {
      Self::Constant(value) => data.refill(*value),
      Self::Xavier { scale } => {
        let range = (*scale / T::from(fan_in + fan_out).unwrap()).sqrt();
        uniform(data, range);
      },
      Self::LeCun => {
        let range = T::one() / T::from(fan_in).unwrap().sqrt();
        uniform(data, range);
      },
    }
  }
}

fn uniform<T: Real>(data: &Tensor<T>, range: T) {
  let mut rng = rand::thread_rng();
  let size = data.size();
  let offset = data.offset();
  let mut buf = data.raw_mut();
  for slot in &mut buf[offset..offset + size] {
    *slot = rng.gen_range(-range, range);
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constant() {
    let data = Tensor::zeros(&[5]);
    ParamInit::constant(4.0).fill(&data, 1, 1);
    assert_eq!(data, Tensor::fill(&[5], 4.0));
  }

  #[test]
  fn xavier_range() {
    let data = Tensor::<f32>::zeros(&[100]);
    ParamInit::xavier().fill(&data, 3, 3);
    let bound = (6.0f32 / 6.0).sqrt();
    assert!(data.to_vec().iter().all(|v| v.abs() <= bound ));
    // a hundred uniform draws are never all zero
    assert!(data.to_vec().iter().any(|v| *v != 0.0 ));
  }
}
