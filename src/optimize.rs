use itertools::izip;
use rayon::prelude::*;

use crate::{
  parameter::Parameter,
  scalar::Real,
  tensor::Tensor,
};


/// A parameter update rule consuming the mini-batch-merged gradient and
/// mutating the parameter data in place.
///
/// Auxiliary state (moment estimates, accumulated squared gradients)
/// lives in slots allocated alongside each [Parameter], created lazily
/// and zero-initialized on first use. Element updates carry no
/// cross-element dependency, so they may be partitioned freely across
/// worker threads.

pub trait Optimizer<T: Real> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool);

  /// Pre-learning reset of any per-run decay state.
  fn reset(&mut self) {}
}


/// Plain gradient descent: `W -= alpha * (dW + lambda * W)`.

#[derive(Debug, Clone)]
pub struct GradientDescent<T> {
  pub alpha: T,
  pub lambda: T,
}

impl<T: Real> GradientDescent<T> {
  pub fn new(alpha: T) -> Self {
    Self { alpha, lambda: T::zero() }
  }
}

impl<T: Real> Default for GradientDescent<T> {
  fn default() -> Self {
    Self::new(T::from(0.01).unwrap())
  }
}

impl<T: Real> Optimizer<T> for GradientDescent<T> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool) {
    let (alpha, lambda) = (self.alpha, self.lambda);
    let weights = param.data().clone();
    let mut w_guard = weights.raw_mut();
    let w = &mut w_guard[..];
    let dw_guard = dw.raw();
    let dw = &dw_guard[..];

    if parallelize {
      (w, dw).into_par_iter()
        .for_each(|(w, &dw)| *w = *w - alpha * (dw + lambda * *w) );
    } else {
      izip!(w.iter_mut(), dw)
        .for_each(|(w, &dw)| *w = *w - alpha * (dw + lambda * *w) );
    }
  }
}


/// Gradient descent with momentum:
/// `V = mu * V - alpha * (dW + lambda * W); W += V`.

#[derive(Debug, Clone)]
pub struct Momentum<T> {
  pub alpha: T,
  pub lambda: T,
  pub mu: T,
}

impl<T: Real> Default for Momentum<T> {
  fn default() -> Self {
    Self {
      alpha: T::from(0.01).unwrap(),
      lambda: T::zero(),
      mu: T::from(0.9).unwrap(),
    }
  }
}

impl<T: Real> Optimizer<T> for Momentum<T> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool) {
    let (alpha, lambda, mu) = (self.alpha, self.lambda, self.mu);
    let velocity = param.aux_state(1)[0].clone();
    let weights = param.data().clone();
    let mut w_guard = weights.raw_mut();
    let w = &mut w_guard[..];
    let mut v_guard = velocity.raw_mut();
    let v = &mut v_guard[..];
    let dw_guard = dw.raw();
    let dw = &dw_guard[..];

    let rule = |w: &mut T, v: &mut T, dw: T| {
      *v = mu * *v - alpha * (dw + *w * lambda);
      *w = *w + *v;
    };

    if parallelize {
      (w, v, dw).into_par_iter().for_each(|(w, v, &dw)| rule(w, v, dw) );
    } else {
      izip!(w.iter_mut(), v.iter_mut(), dw).for_each(|(w, v, &dw)| rule(w, v, dw) );
    }
  }
}


/// Adaptive gradient: `G += dW^2; W -= alpha * dW / (sqrt(G) + eps)`.
///
/// J Duchi, E Hazan and Y Singer,
/// Adaptive subgradient methods for online learning and stochastic
/// optimization, JMLR 2011.

#[derive(Debug, Clone)]
pub struct Adagrad<T> {
  pub alpha: T,
  eps: T,
}

impl<T: Real> Default for Adagrad<T> {
  fn default() -> Self {
    Self {
      alpha: T::from(0.01).unwrap(),
      eps: T::from(1e-8).unwrap(),
    }
  }
}

impl<T: Real> Optimizer<T> for Adagrad<T> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool) {
    let (alpha, eps) = (self.alpha, self.eps);
    let squared = param.aux_state(1)[0].clone();
    let weights = param.data().clone();
    let mut w_guard = weights.raw_mut();
    let w = &mut w_guard[..];
    let mut g_guard = squared.raw_mut();
    let g = &mut g_guard[..];
    let dw_guard = dw.raw();
    let dw = &dw_guard[..];

    let rule = |w: &mut T, g: &mut T, dw: T| {
      *g = *g + dw * dw;
      *w = *w - alpha * dw / (g.sqrt() + eps);
    };

    if parallelize {
      (w, g, dw).into_par_iter().for_each(|(w, g, &dw)| rule(w, g, dw) );
    } else {
      izip!(w.iter_mut(), g.iter_mut(), dw).for_each(|(w, g, &dw)| rule(w, g, dw) );
    }
  }
}


/// RMSprop: exponential moving average of the squared gradient.
///
/// T Tieleman and G E Hinton, Lecture 6.5 - rmsprop,
/// COURSERA: Neural Networks for Machine Learning (2012).

#[derive(Debug, Clone)]
pub struct RmsProp<T> {
  pub alpha: T,
  pub mu: T,
  eps: T,
}

impl<T: Real> Default for RmsProp<T> {
  fn default() -> Self {
    Self {
      alpha: T::from(0.0001).unwrap(),
      mu: T::from(0.99).unwrap(),
      eps: T::from(1e-8).unwrap(),
    }
  }
}

impl<T: Real> Optimizer<T> for RmsProp<T> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool) {
    let (alpha, mu, eps) = (self.alpha, self.mu, self.eps);
    let squared = param.aux_state(1)[0].clone();
    let weights = param.data().clone();
    let mut w_guard = weights.raw_mut();
    let w = &mut w_guard[..];
    let mut g_guard = squared.raw_mut();
    let g = &mut g_guard[..];
    let dw_guard = dw.raw();
    let dw = &dw_guard[..];

    let rule = |w: &mut T, g: &mut T, dw: T| {
      *g = mu * *g + (T::one() - mu) * dw * dw;
      *w = *w - alpha * dw / (*g + eps).sqrt();
    };

    if parallelize {
      (w, g, dw).into_par_iter().for_each(|(w, g, &dw)| rule(w, g, dw) );
    } else {
      izip!(w.iter_mut(), g.iter_mut(), dw).for_each(|(w, g, &dw)| rule(w, g, dw) );
    }
  }
}


/// Adaptive moment estimation with bias-corrected first and second
/// moments. The correction terms decay on every call.
///
/// D Kingma and J Ba, Adam: A Method for Stochastic Optimization,
/// http://arxiv.org/abs/1412.6980.

#[derive(Debug, Clone)]
pub struct Adam<T> {
  pub alpha: T,
  pub b1: T,
  pub b2: T,
  b1_t: T,
  b2_t: T,
  eps: T,
}

impl<T: Real> Default for Adam<T> {
  fn default() -> Self {
    let b1 = T::from(0.9).unwrap();
    let b2 = T::from(0.999).unwrap();
    Self {
      alpha: T::from(0.001).unwrap(),
      b1,
      b2,
      b1_t: b1,
      b2_t: b2,
      eps: T::from(1e-8).unwrap(),
    }
  }
}

impl<T: Real> Optimizer<T> for Adam<T> {
  fn update(&mut self, dw: &Tensor<T>, param: &mut Parameter<T>, parallelize: bool) {
    self.b1_t = self.b1_t * self.b1;
    self.b2_t = self.b2_t * self.b2;
    let (alpha, b1, b2, b1_t, b2_t, eps) =
      (self.alpha, self.b1, self.b2, self.b1_t, self.b2_t, self.eps);

    let (mt, vt) = {
      let aux = param.aux_state(2);
      (aux[0].clone(), aux[1].clone())
    };
    let weights = param.data().clone();
    let mut w_guard = weights.raw_mut();
    let w = &mut w_guard[..];
    let mut m_guard = mt.raw_mut();
    let m = &mut m_guard[..];
    let mut v_guard = vt.raw_mut();
    let v = &mut v_guard[..];
    let dw_guard = dw.raw();
    let dw = &dw_guard[..];

    let rule = |w: &mut T, m: &mut T, v: &mut T, dw: T| {
      *m = b1 * *m + (T::one() - b1) * dw;
      *v = b2 * *v + (T::one() - b2) * dw * dw;
      *w = *w - alpha * (*m / (T::one() - b1_t)) / (*v / (T::one() - b2_t) + eps).sqrt();
    };

    if parallelize {
      (w, m, v, dw).into_par_iter().for_each(|(w, m, v, &dw)| rule(w, m, v, dw) );
    } else {
      izip!(w.iter_mut(), m.iter_mut(), v.iter_mut(), dw)
        .for_each(|(w, m, v, &dw)| rule(w, m, v, dw) );
    }
  }

  fn reset(&mut self) {
    self.b1_t = self.b1;
    self.b2_t = self.b2;
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use crate::{parameter::ParamSpec, shape::Shape3d};

  fn bias_param(size: usize, fill: f64) -> Parameter<f64> {
    let mut p = Parameter::new(&ParamSpec::bias(Shape3d::new(size, 1, 1)));
    p.data().refill(fill);
    p
  }

  #[test]
  fn gradient_descent_steps() {
    let mut opt = GradientDescent::<f64>::default();
    let mut p = bias_param(1, 1.0);
    let dw = Tensor::vec(&[0.5]);

    opt.update(&dw, &mut p, false);
    assert!((p.data().get(&[0]) - 0.995).abs() < 1e-12);
    opt.update(&dw, &mut p, false);
    assert!((p.data().get(&[0]) - 0.99).abs() < 1e-12);
  }

  #[test]
  fn momentum_accumulates_velocity() {
    let mut opt = Momentum::<f64>::default();
    let mut p = bias_param(1, 1.0);
    let dw = Tensor::vec(&[0.5]);

    opt.update(&dw, &mut p, false);
    assert!((p.data().get(&[0]) - 0.995).abs() < 1e-12);
    opt.update(&dw, &mut p, false);
    // V2 = 0.9 * -0.005 - 0.005 = -0.0095
    assert!((p.data().get(&[0]) - 0.9855).abs() < 1e-12);
  }

  #[test]
  fn adagrad_scales_by_history() {
    let mut opt = Adagrad::<f64>::default();
    let mut p = bias_param(1, 1.0);
    let dw = Tensor::vec(&[0.5]);

    opt.update(&dw, &mut p, false);
    assert!((p.data().get(&[0]) - (1.0 - 0.01 * 0.5 / (0.25f64.sqrt() + 1e-8))).abs() < 1e-12);
    opt.update(&dw, &mut p, false);
    let expected = 1.0
      - 0.01 * 0.5 / (0.25f64.sqrt() + 1e-8)
      - 0.01 * 0.5 / (0.5f64.sqrt() + 1e-8);
    assert!((p.data().get(&[0]) - expected).abs() < 1e-12);
  }

  #[test]
  fn rmsprop_first_step() {
    let mut opt = RmsProp::<f64>::default();
    let mut p = bias_param(1, 0.0);
    let dw = Tensor::vec(&[1.0]);

    opt.update(&dw, &mut p, false);
    let g = 0.01 * 1.0;
    let expected = -0.0001 / (g + 1e-8f64).sqrt();
    assert!((p.data().get(&[0]) - expected).abs() < 1e-12);
  }

  #[test]
  fn adam_bias_corrected_trajectory() {
    let mut opt = Adam::<f64>::default();
    let mut p = bias_param(2, 0.0);
    let dw = Tensor::vec(&[0.1, -0.2]);

    opt.update(&dw, &mut p, false);
    // first step, dW = 0.1: m = 0.01, v = 1e-5, b1_t = 0.81, b2_t = 0.998001
    assert!((p.data().get(&[0]) + 7.44136e-4).abs() < 1e-7);

    opt.update(&dw, &mut p, false);

    // longhand scalar reference for both elements across both steps
    for (slot, g) in [0.1f64, -0.2].iter().enumerate() {
      let (mut w, mut m, mut v) = (0.0f64, 0.0, 0.0);
      let (mut b1_t, mut b2_t) = (0.9f64, 0.999f64);
      for _ in 0..2 {
        b1_t *= 0.9;
        b2_t *= 0.999;
        m = 0.9 * m + 0.1 * g;
        v = 0.999 * v + 0.001 * g * g;
        w -= 0.001 * (m / (1.0 - b1_t)) / (v / (1.0 - b2_t) + 1e-8).sqrt();
      }
      assert!((p.data().get(&[slot]) - w).abs() < 1e-12);
    }
  }

  #[test]
  fn adam_reset_restores_decay_state() {
    let mut a = Adam::<f64>::default();
    let mut b = Adam::<f64>::default();
    let dw = Tensor::vec(&[0.1]);

    let mut p1 = bias_param(1, 0.0);
    a.update(&dw, &mut p1, false);
    a.reset();

    let mut p2 = bias_param(1, 0.0);
    b.update(&dw, &mut p2, false);
    assert!((p1.data().get(&[0]) - p2.data().get(&[0])).abs() < 1e-15);
  }

  #[test]
  fn state_is_kept_per_parameter() {
    let mut opt = Momentum::<f64>::default();
    let mut p1 = bias_param(1, 1.0);
    let mut p2 = bias_param(1, 1.0);
    let dw = Tensor::vec(&[0.5]);

    opt.update(&dw, &mut p1, false);
    opt.update(&dw, &mut p1, false);
    opt.update(&dw, &mut p2, false);

    // p2 saw one step, p1 two; their velocities must not mix
    assert!((p2.data().get(&[0]) - 0.995).abs() < 1e-12);
    assert!((p1.data().get(&[0]) - 0.9855).abs() < 1e-12);
  }

  #[test]
  fn parallel_update_matches_serial() {
    let mut serial = Adam::<f64>::default();
    let mut parallel = Adam::<f64>::default();
    let dw = Tensor::new(&[100], (0..100).map(|i| (i as f64 - 50.0) * 0.01 ).collect());

    let mut p1 = bias_param(100, 1.0);
    let mut p2 = bias_param(100, 1.0);
    serial.update(&dw, &mut p1, false);
    parallel.update(&dw, &mut p2, true);

    assert_eq!(p1.data(), p2.data());
  }
}
