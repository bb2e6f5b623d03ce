use std::borrow::Cow;

use itertools::izip;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};

use crate::{
  kernels::ConnectionTable,
  scalar::Real,
  shape::Shape3d,
  tensor::Tensor,
};


#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Padding {
  /// Output shrinks by the window extent.
  Valid,
  /// Input is zero-padded so the output keeps the input's extent.
  Same,
}

/// Geometry of a 2-D convolution. The weight block for channel pair
/// `(o, inc)` lives at feature-map index `in_depth * o + inc` of the
/// `weight` shape.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2dParams {
  pub in_shape: Shape3d,
  pub in_padded: Shape3d,
  pub out_shape: Shape3d,
  pub weight: Shape3d,
  pub w_stride: usize,
  pub h_stride: usize,
  pub padding: Padding,
  pub table: ConnectionTable,
  pub has_bias: bool,
}

pub fn conv_out_length(in_length: usize, window: usize, stride: usize, padding: Padding) -> usize {
  let out = match padding {
    Padding::Same => in_length,
    Padding::Valid => in_length - window + 1,
  };
  (out + stride - 1) / stride
}

pub fn padded_length(in_length: usize, window: usize, padding: Padding) -> usize {
  match padding {
    Padding::Valid => in_length,
    Padding::Same => in_length + 2 * (window / 2),
  }
}

fn pad_input<'a, T: Real>(params: &Conv2dParams, in_row: &'a [T]) -> Cow<'a, [T]> {
  match params.padding {
    Padding::Valid => Cow::Borrowed(in_row),
    Padding::Same => {
      let mut padded = vec![T::zero(); params.in_padded.size()];
      let px = params.weight.width / 2;
      let py = params.weight.height / 2;
      for c in 0..params.in_shape.depth {
        for y in 0..params.in_shape.height {
          let src = params.in_shape.get_index(0, y, c);
          let dst = params.in_padded.get_index(px, py + y, c);
          padded[dst..dst + params.in_shape.width]
            .copy_from_slice(&in_row[src..src + params.in_shape.width]);
        }
      }
      Cow::Owned(padded)
    },
  }
}

fn propagate_delta<T: Real>(params: &Conv2dParams, w: &[T], cd_row: &[T], pd_target: &mut [T]) {
  for inc in 0..params.in_shape.depth {
    for o in 0..params.out_shape.depth {
      if !params.table.is_connected(o, inc) { continue }

      let pw = &w[params.weight.get_index(0, 0, params.in_shape.depth * o + inc)..];
      let cd_base = params.out_shape.get_index(0, 0, o);
      let pd_base = params.in_padded.get_index(0, 0, inc);

      for y in 0..params.out_shape.height {
        for x in 0..params.out_shape.width {
          let delta = cd_row[cd_base + y * params.out_shape.width + x];
          let dst = pd_base
            + y * params.h_stride * params.in_padded.width
            + x * params.w_stride;
          for wy in 0..params.weight.height {
            for wx in 0..params.weight.width {
              pd_target[dst + wy * params.in_padded.width + wx] +=
                pw[wy * params.weight.width + wx] * delta;
            }
          }
        }
      }
    }
  }
}

fn unpad_delta<T: Real>(params: &Conv2dParams, padded: &[T], pd_row: &mut [T]) {
  let px = params.weight.width / 2;
  let py = params.weight.height / 2;
  for c in 0..params.in_shape.depth {
    for y in 0..params.in_shape.height {
      let src = params.in_padded.get_index(px, py + y, c);
      let dst = params.in_shape.get_index(0, y, c);
      pd_row[dst..dst + params.in_shape.width]
        .copy_from_slice(&padded[src..src + params.in_shape.width]);
    }
  }
}

/// Reference convolution. Output is zeroed, then every connected
/// (out-channel, in-channel) pair accumulates `sum(weight * padded_input)`
/// per output position; bias is added last.

pub fn forward_internal<T: Real>(
  params: &Conv2dParams,
  in_data: &Tensor<T>,
  weights: &Tensor<T>,
  bias: Option<&Tensor<T>>,
  out_data: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let in_len = params.in_shape.size();
  let out_len = params.out_shape.size();
  let in_guard = in_data.raw();
  let input = &in_guard[..samples * in_len];
  let w_guard = weights.raw();
  let w = &w_guard[..params.weight.size()];
  let bias_guard = bias.map(|b| b.raw() );
  let bias = bias_guard.as_ref().map(|b| &b[..params.out_shape.depth] );
  let mut out_guard = out_data.raw_mut();
  let out = &mut out_guard[..samples * out_len];

  let run = |in_row: &[T], out_row: &mut [T]| {
    let padded = pad_input(params, in_row);
    let pin = padded.as_ref();
    out_row.iter_mut().for_each(|slot| *slot = T::zero() );

    for o in 0..params.out_shape.depth {
      for inc in 0..params.in_shape.depth {
        if !params.table.is_connected(o, inc) { continue }

        let pw = &w[params.weight.get_index(0, 0, params.in_shape.depth * o + inc)..];
        let pi_base = params.in_padded.get_index(0, 0, inc);
        let pa_base = params.out_shape.get_index(0, 0, o);

        for y in 0..params.out_shape.height {
          for x in 0..params.out_shape.width {
            let ppi = pi_base
              + params.in_padded.width * (y * params.h_stride)
              + x * params.w_stride;
            let mut sum = T::zero();
            for wy in 0..params.weight.height {
              for wx in 0..params.weight.width {
                sum += pw[wy * params.weight.width + wx]
                  * pin[ppi + wy * params.in_padded.width + wx];
              }
            }
            out_row[pa_base + y * params.out_shape.width + x] += sum;
          }
        }
      }

      if let Some(bias) = bias {
        let pa_base = params.out_shape.get_index(0, 0, o);
        for slot in &mut out_row[pa_base..pa_base + params.out_shape.area()] {
          *slot += bias[o];
        }
      }
    }
  };

  if parallelize {
    (out.par_chunks_mut(out_len), input.par_chunks(in_len))
      .into_par_iter()
      .for_each(|(out_row, in_row)| run(in_row, out_row) );
  } else {
    izip!(out.chunks_mut(out_len), input.chunks(in_len))
      .for_each(|(out_row, in_row)| run(in_row, out_row) );
  }
}

/// Reference backward pass: routes the output delta back through the
/// window (input delta), then accumulates per-sample weight and bias
/// gradient rows.

pub fn backward_internal<T: Real>(
  params: &Conv2dParams,
  prev_out: &Tensor<T>,
  weights: &Tensor<T>,
  dw: &Tensor<T>,
  db: Option<&Tensor<T>>,
  curr_delta: &Tensor<T>,
  prev_delta: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let in_len = params.in_shape.size();
  let out_len = params.out_shape.size();
  let w_len = params.weight.size();
  let po_guard = prev_out.raw();
  let po = &po_guard[..samples * in_len];
  let w_guard = weights.raw();
  let w = &w_guard[..w_len];
  let cd_guard = curr_delta.raw();
  let cd = &cd_guard[..samples * out_len];
  {
    let mut pd_guard = prev_delta.raw_mut();
    let pd = &mut pd_guard[..samples * in_len];
    let mut dw_guard = dw.raw_mut();
    let dw = &mut dw_guard[..samples * w_len];

    let run = |po_row: &[T], cd_row: &[T], pd_row: &mut [T], dw_row: &mut [T]| {
      let po_padded = pad_input(params, po_row);
      let po_pin = po_padded.as_ref();

      // propagate delta to the previous layer, in padded coordinates
      match params.padding {
        Padding::Valid => {
          pd_row.iter_mut().for_each(|slot| *slot = T::zero() );
          propagate_delta(params, w, cd_row, pd_row);
        },
        Padding::Same => {
          let mut scratch = vec![T::zero(); params.in_padded.size()];
          propagate_delta(params, w, cd_row, &mut scratch);
          unpad_delta(params, &scratch, pd_row);
        },
      }

      // accumulate dW
      for inc in 0..params.in_shape.depth {
        for o in 0..params.out_shape.depth {
          if !params.table.is_connected(o, inc) { continue }

          let cd_base = params.out_shape.get_index(0, 0, o);
          for wy in 0..params.weight.height {
            for wx in 0..params.weight.width {
              let po_base = params.in_padded.get_index(wx, wy, inc);
              let mut dst = T::zero();
              for y in 0..params.out_shape.height {
                let po_idx = po_base + y * params.h_stride * params.in_padded.width;
                let cd_idx = cd_base + y * params.out_shape.width;
                for x in 0..params.out_shape.width {
                  dst += po_pin[po_idx + x * params.w_stride] * cd_row[cd_idx + x];
                }
              }
              dw_row[params.weight.get_index(wx, wy, params.in_shape.depth * o + inc)] += dst;
            }
          }
        }
      }
    };

    if parallelize {
      (pd.par_chunks_mut(in_len), dw.par_chunks_mut(w_len),
       po.par_chunks(in_len), cd.par_chunks(out_len))
        .into_par_iter()
        .for_each(|(pd_row, dw_row, po_row, cd_row)| run(po_row, cd_row, pd_row, dw_row) );
    } else {
      izip!(pd.chunks_mut(in_len), dw.chunks_mut(w_len),
        po.chunks(in_len), cd.chunks(out_len))
        .for_each(|(pd_row, dw_row, po_row, cd_row)| run(po_row, cd_row, pd_row, dw_row) );
    }
  }

  if let Some(db) = db {
    let depth = params.out_shape.depth;
    let mut db_guard = db.raw_mut();
    let db = &mut db_guard[..samples * depth];
    for (db_row, cd_row) in db.chunks_mut(depth).zip(cd.chunks(out_len)) {
      for o in 0..depth {
        let base = params.out_shape.get_index(0, 0, o);
        db_row[o] += cd_row[base..base + params.out_shape.area()]
          .iter().copied().fold(T::zero(), |acc, d| acc + d );
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn params_5x5() -> Conv2dParams {
    Conv2dParams {
      in_shape: Shape3d::new(5, 5, 1),
      in_padded: Shape3d::new(5, 5, 1),
      out_shape: Shape3d::new(3, 3, 1),
      weight: Shape3d::new(3, 3, 1),
      w_stride: 1,
      h_stride: 1,
      padding: Padding::Valid,
      table: ConnectionTable::full(),
      has_bias: false,
    }
  }

  fn reference_input() -> Tensor<f32> {
    Tensor::new(&[1, 25], vec![
      3.0, 2.0, 1.0, 5.0, 2.0,
      3.0, 0.0, 2.0, 0.0, 1.0,
      0.0, 6.0, 1.0, 1.0, 10.0,
      3.0, -1.0, 2.0, 9.0, 0.0,
      1.0, 2.0, 1.0, 5.0, 5.0,
    ])
  }

  fn reference_weights() -> Tensor<f32> {
    Tensor::vec(&[
      0.3, 0.1, 0.2,
      0.0, -0.1, -0.1,
      0.05, -0.2, 0.05,
    ])
  }

  #[test]
  fn zero_weights_give_zero_output() {
    let params = params_5x5();
    let weights = Tensor::zeros(&[9]);
    let out = Tensor::fill(&[1, 9], 7.0);
    forward_internal(&params, &reference_input(), &weights, None, &out, 1, false);
    assert_eq!(out, Tensor::zeros(&[1, 9]));
  }

  #[test]
  fn forward_reference_values() {
    let params = params_5x5();
    let out = Tensor::zeros(&[1, 9]);
    forward_internal(&params, &reference_input(), &reference_weights(), None, &out, 1, false);

    let expected = [-0.05, 1.65, 1.45, 1.05, 0.0, -2.0, 0.4, 1.15, 0.8];
    for (o, e) in out.to_vec().iter().zip(expected) {
      assert!((o - e).abs() < 1e-5, "{} != {}", o, e);
    }
  }

  #[test]
  fn disconnected_pairs_contribute_nothing() {
    let mut params = params_5x5();
    params.table = ConnectionTable::new(1, 1, &[]).unwrap();
    let out = Tensor::fill(&[1, 9], 3.0);
    forward_internal(&params, &reference_input(), &reference_weights(), None, &out, 1, false);
    assert_eq!(out, Tensor::zeros(&[1, 9]));
  }

  #[test]
  fn backward_single_window() {
    // 3x3 input, 3x3 window, one output position
    let params = Conv2dParams {
      in_shape: Shape3d::new(3, 3, 1),
      in_padded: Shape3d::new(3, 3, 1),
      out_shape: Shape3d::new(1, 1, 1),
      weight: Shape3d::new(3, 3, 1),
      w_stride: 1,
      h_stride: 1,
      padding: Padding::Valid,
      table: ConnectionTable::full(),
      has_bias: true,
    };
    let prev_out = Tensor::new(&[1, 9], (1..=9).map(|i| i as f32 ).collect());
    let weights = Tensor::vec(&[0.5; 9]);
    let curr_delta = Tensor::new(&[1, 1], vec![2.0]);
    let prev_delta = Tensor::zeros(&[1, 9]);
    let dw = Tensor::zeros(&[1, 9]);
    let db = Tensor::zeros(&[1, 1]);

    backward_internal(&params, &prev_out, &weights, &dw, Some(&db),
      &curr_delta, &prev_delta, 1, false);

    // pd = w * delta, dW = in * delta, db = delta
    assert_eq!(prev_delta, Tensor::new(&[1, 9], vec![1.0; 9]));
    assert_eq!(dw, Tensor::new(&[1, 9], (1..=9).map(|i| 2.0 * i as f32 ).collect()));
    assert_eq!(db, Tensor::new(&[1, 1], vec![2.0]));
  }

  #[test]
  fn same_padding_keeps_extent() {
    let window = 3;
    let in_shape = Shape3d::new(4, 4, 1);
    let params = Conv2dParams {
      in_shape,
      in_padded: Shape3d::new(
        padded_length(4, window, Padding::Same),
        padded_length(4, window, Padding::Same),
        1,
      ),
      out_shape: Shape3d::new(
        conv_out_length(4, window, 1, Padding::Same),
        conv_out_length(4, window, 1, Padding::Same),
        1,
      ),
      weight: Shape3d::new(window, window, 1),
      w_stride: 1,
      h_stride: 1,
      padding: Padding::Same,
      table: ConnectionTable::full(),
      has_bias: false,
    };
    assert_eq!(params.out_shape, Shape3d::new(4, 4, 1));

    // identity kernel reproduces the input
    let mut w = vec![0.0; 9];
    w[4] = 1.0;
    let weights = Tensor::vec(&w);
    let input = Tensor::new(&[1, 16], (0..16).map(|i| i as f32 ).collect());
    let out = Tensor::zeros(&[1, 16]);
    forward_internal(&params, &input, &weights, None, &out, 1, false);
    assert_eq!(out, input);
  }
}
