use itertools::izip;
use num_traits::NumCast;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};

use crate::{
  error::{GraphError, Result},
  scalar::Real,
  shape::Shape3d,
  tensor::Tensor,
};


/// Geometry of a max-pooling operation.

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MaxPoolParams {
  pub in_shape: Shape3d,
  pub out_shape: Shape3d,
  pub pool_x: usize,
  pub pool_y: usize,
  pub stride_x: usize,
  pub stride_y: usize,
}

pub fn pool_out_length(in_length: usize, pool: usize, stride: usize) -> usize {
  (in_length - pool + stride) / stride
}

/// Build the out->in (1:N) and in->out (N:1) position tables. Windows are
/// clipped at the input border. Index overflow here is a broken
/// connectivity contract and is fatal.

pub fn build_tables(params: &MaxPoolParams, layer: &str) -> Result<(Vec<Vec<usize>>, Vec<usize>)> {
  let mut out2in = vec![vec![]; params.out_shape.size()];
  let mut in2out = vec![0; params.in_shape.size()];

  for c in 0..params.in_shape.depth {
    for y in 0..params.out_shape.height {
      for x in 0..params.out_shape.width {
        let dymax = params.pool_y.min(params.in_shape.height - y * params.stride_y);
        let dxmax = params.pool_x.min(params.in_shape.width - x * params.stride_x);
        for dy in 0..dymax {
          for dx in 0..dxmax {
            let in_index = params.in_shape.get_index(
              x * params.stride_x + dx, y * params.stride_y + dy, c);
            let out_index = params.out_shape.get_index(x, y, c);
            if in_index >= in2out.len() {
              return Err(GraphError::AllocationInvariant {
                layer: layer.to_string(), index: in_index, len: in2out.len(),
              });
            }
            if out_index >= out2in.len() {
              return Err(GraphError::AllocationInvariant {
                layer: layer.to_string(), index: out_index, len: out2in.len(),
              });
            }
            in2out[in_index] = out_index;
            out2in[out_index].push(in_index);
          }
        }
      }
    }
  }
  Ok((out2in, in2out))
}

/// Reference pooling: each output takes the maximum over its window and
/// records the winning input position in the aux output.

pub fn forward_internal<T: Real>(
  params: &MaxPoolParams,
  out2in: &[Vec<usize>],
  in_data: &Tensor<T>,
  out_data: &Tensor<T>,
  argmax: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let in_len = params.in_shape.size();
  let out_len = params.out_shape.size();
  let in_guard = in_data.raw();
  let input = &in_guard[..samples * in_len];
  let mut out_guard = out_data.raw_mut();
  let out = &mut out_guard[..samples * out_len];
  let mut am_guard = argmax.raw_mut();
  let am = &mut am_guard[..samples * out_len];

  let run = |in_row: &[T], out_row: &mut [T], am_row: &mut [T]| {
    for (idx, positions) in out2in.iter().enumerate() {
      let mut max = in_row[positions[0]];
      let mut winner = positions[0];
      for &pos in &positions[1..] {
        if in_row[pos] > max {
          max = in_row[pos];
          winner = pos;
        }
      }
      out_row[idx] = max;
      am_row[idx] = T::from(winner).unwrap();
    }
  };

  if parallelize {
    (out.par_chunks_mut(out_len), am.par_chunks_mut(out_len), input.par_chunks(in_len))
      .into_par_iter()
      .for_each(|(out_row, am_row, in_row)| run(in_row, out_row, am_row) );
  } else {
    izip!(out.chunks_mut(out_len), am.chunks_mut(out_len), input.chunks(in_len))
      .for_each(|(out_row, am_row, in_row)| run(in_row, out_row, am_row) );
  }
}

/// Routes each output delta back to the input position that won the
/// forward pass.

pub fn backward_internal<T: Real>(
  params: &MaxPoolParams,
  argmax: &Tensor<T>,
  curr_delta: &Tensor<T>,
  prev_delta: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let in_len = params.in_shape.size();
  let out_len = params.out_shape.size();
  let am_guard = argmax.raw();
  let am = &am_guard[..samples * out_len];
  let cd_guard = curr_delta.raw();
  let cd = &cd_guard[..samples * out_len];
  let mut pd_guard = prev_delta.raw_mut();
  let pd = &mut pd_guard[..samples * in_len];

  let run = |am_row: &[T], cd_row: &[T], pd_row: &mut [T]| {
    pd_row.iter_mut().for_each(|slot| *slot = T::zero() );
    for (idx, &delta) in cd_row.iter().enumerate() {
      let winner: usize = NumCast::from(am_row[idx]).unwrap();
      pd_row[winner] += delta;
    }
  };

  if parallelize {
    (pd.par_chunks_mut(in_len), am.par_chunks(out_len), cd.par_chunks(out_len))
      .into_par_iter()
      .for_each(|(pd_row, am_row, cd_row)| run(am_row, cd_row, pd_row) );
  } else {
    izip!(pd.chunks_mut(in_len), am.chunks(out_len), cd.chunks(out_len))
      .for_each(|(pd_row, am_row, cd_row)| run(am_row, cd_row, pd_row) );
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn params_4x4() -> MaxPoolParams {
    MaxPoolParams {
      in_shape: Shape3d::new(4, 4, 1),
      out_shape: Shape3d::new(2, 2, 1),
      pool_x: 2,
      pool_y: 2,
      stride_x: 2,
      stride_y: 2,
    }
  }

  #[test]
  fn tables_cover_the_input() {
    let params = params_4x4();
    let (out2in, in2out) = build_tables(&params, "max-pool").unwrap();
    assert_eq!(out2in.len(), 4);
    assert!(out2in.iter().all(|positions| positions.len() == 4 ));
    assert_eq!(in2out.len(), 16);
    assert_eq!(in2out[0], 0);
    assert_eq!(in2out[15], 3);
  }

  #[test]
  fn forward_takes_window_maxima() {
    let params = params_4x4();
    let (out2in, _) = build_tables(&params, "max-pool").unwrap();
    let input = Tensor::new(&[1, 16], vec![
      1.0, 2.0, 0.0, 0.0,
      3.0, 4.0, 0.0, 1.0,
      0.5, 0.0, 9.0, 2.0,
      0.0, 0.25, 2.0, 8.0,
    ]);
    let out = Tensor::zeros(&[1, 4]);
    let argmax = Tensor::zeros(&[1, 4]);
    forward_internal(&params, &out2in, &input, &out, &argmax, 1, false);

    assert_eq!(out, Tensor::new(&[1, 4], vec![4.0, 1.0, 0.5, 9.0]));
    assert_eq!(argmax, Tensor::new(&[1, 4], vec![5.0, 7.0, 8.0, 10.0]));
  }

  #[test]
  fn backward_routes_through_argmax() {
    let params = params_4x4();
    let argmax = Tensor::new(&[1, 4], vec![5.0, 7.0, 8.0, 10.0]);
    let curr_delta = Tensor::new(&[1, 4], vec![1.0, 2.0, 3.0, 4.0]);
    let prev_delta = Tensor::fill(&[1, 16], 9.0);
    backward_internal(&params, &argmax, &curr_delta, &prev_delta, 1, false);

    let mut expected = vec![0.0; 16];
    expected[5] = 1.0;
    expected[7] = 2.0;
    expected[8] = 3.0;
    expected[10] = 4.0;
    assert_eq!(prev_delta, Tensor::new(&[1, 16], expected));
  }
}
