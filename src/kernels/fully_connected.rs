use itertools::izip;
use rayon::prelude::*;
use serde::{Serialize, Deserialize};

use crate::{
  scalar::Real,
  tensor::Tensor,
};


/// Geometry of a fully-connected operation. Weights are laid out
/// `W[i * out_size + o]`, input-major.

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FullyParams {
  pub in_size: usize,
  pub out_size: usize,
  pub has_bias: bool,
}

pub fn forward_internal<T: Real>(
  params: &FullyParams,
  in_data: &Tensor<T>,
  weights: &Tensor<T>,
  bias: Option<&Tensor<T>>,
  out_data: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  let in_guard = in_data.raw();
  let input = &in_guard[..samples * in_len];
  let w_guard = weights.raw();
  let w = &w_guard[..in_len * out_len];
  let bias_guard = bias.map(|b| b.raw() );
  let bias = bias_guard.as_ref().map(|b| &b[..out_len] );
  let mut out_guard = out_data.raw_mut();
  let out = &mut out_guard[..samples * out_len];

  let run = |in_row: &[T], out_row: &mut [T]| {
    for (o, slot) in out_row.iter_mut().enumerate() {
      let mut sum = T::zero();
      for (i, &x) in in_row.iter().enumerate() {
        sum += w[i * out_len + o] * x;
      }
      if let Some(bias) = bias {
        sum += bias[o];
      }
      *slot = sum;
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

/// Vectorization-friendly variant: row-contiguous axpy accumulation with
/// a four-wide unrolled inner loop.

pub fn forward_simd<T: Real>(
  params: &FullyParams,
  in_data: &Tensor<T>,
  weights: &Tensor<T>,
  bias: Option<&Tensor<T>>,
  out_data: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  let in_guard = in_data.raw();
  let input = &in_guard[..samples * in_len];
  let w_guard = weights.raw();
  let w = &w_guard[..in_len * out_len];
  let bias_guard = bias.map(|b| b.raw() );
  let bias = bias_guard.as_ref().map(|b| &b[..out_len] );
  let mut out_guard = out_data.raw_mut();
  let out = &mut out_guard[..samples * out_len];

  let run = |in_row: &[T], out_row: &mut [T]| {
    match bias {
      Some(bias) => out_row.copy_from_slice(bias),
      None => out_row.iter_mut().for_each(|slot| *slot = T::zero() ),
    }
    for (i, &x) in in_row.iter().enumerate() {
      let w_row = &w[i * out_len..(i + 1) * out_len];
      let mut out_chunks = out_row.chunks_exact_mut(4);
      let mut w_chunks = w_row.chunks_exact(4);
      for (oc, wc) in (&mut out_chunks).zip(&mut w_chunks) {
        oc[0] += x * wc[0];
        oc[1] += x * wc[1];
        oc[2] += x * wc[2];
        oc[3] += x * wc[3];
      }
      for (slot, &w) in out_chunks.into_remainder().iter_mut().zip(w_chunks.remainder()) {
        *slot += x * w;
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

/// Third-party engine: one gemm over the whole batch, bias added after.

pub fn forward_blas<T: Real>(
  params: &FullyParams,
  in_data: &Tensor<T>,
  weights: &Tensor<T>,
  bias: Option<&Tensor<T>>,
  out_data: &Tensor<T>,
  samples: usize,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  let in_guard = in_data.raw();
  let input = &in_guard[..samples * in_len];
  let w_guard = weights.raw();
  let w = &w_guard[..in_len * out_len];
  let mut out_guard = out_data.raw_mut();
  let out = &mut out_guard[..samples * out_len];

  unsafe {
    T::gemm(
      samples, in_len, out_len,
      T::one(),
      input.as_ptr(), in_len as isize, 1,
      w.as_ptr(), out_len as isize, 1,
      T::zero(),
      out.as_mut_ptr(), out_len as isize, 1,
    );
  }

  if let Some(bias) = bias {
    let bias_guard = bias.raw();
    let bias = &bias_guard[..out_len];
    for out_row in out.chunks_mut(out_len) {
      for (slot, &b) in out_row.iter_mut().zip(bias) {
        *slot += b;
      }
    }
  }
}

pub fn backward_internal<T: Real>(
  params: &FullyParams,
  prev_out: &Tensor<T>,
  weights: &Tensor<T>,
  dw: &Tensor<T>,
  db: Option<&Tensor<T>>,
  curr_delta: &Tensor<T>,
  prev_delta: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  {
    let w_guard = weights.raw();
    let w = &w_guard[..in_len * out_len];
    let cd_guard = curr_delta.raw();
    let cd = &cd_guard[..samples * out_len];
    let mut pd_guard = prev_delta.raw_mut();
    let pd = &mut pd_guard[..samples * in_len];

    let run = |cd_row: &[T], pd_row: &mut [T]| {
      for (i, slot) in pd_row.iter_mut().enumerate() {
        let w_row = &w[i * out_len..(i + 1) * out_len];
        let mut sum = T::zero();
        for (&d, &w) in cd_row.iter().zip(w_row) {
          sum += d * w;
        }
        *slot = sum;
      }
    };

    if parallelize {
      (pd.par_chunks_mut(in_len), cd.par_chunks(out_len))
        .into_par_iter()
        .for_each(|(pd_row, cd_row)| run(cd_row, pd_row) );
    } else {
      izip!(pd.chunks_mut(in_len), cd.chunks(out_len))
        .for_each(|(pd_row, cd_row)| run(cd_row, pd_row) );
    }
  }
  accumulate_dw_db(params, prev_out, dw, db, curr_delta, samples, parallelize);
}

/// Third-party engine backward: gemm for the input delta, reference
/// accumulation for the parameter gradients.

pub fn backward_blas<T: Real>(
  params: &FullyParams,
  prev_out: &Tensor<T>,
  weights: &Tensor<T>,
  dw: &Tensor<T>,
  db: Option<&Tensor<T>>,
  curr_delta: &Tensor<T>,
  prev_delta: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  {
    let w_guard = weights.raw();
    let w = &w_guard[..in_len * out_len];
    let cd_guard = curr_delta.raw();
    let cd = &cd_guard[..samples * out_len];
    let mut pd_guard = prev_delta.raw_mut();
    let pd = &mut pd_guard[..samples * in_len];

    // prev_delta = curr_delta x W^T
    unsafe {
      T::gemm(
        samples, out_len, in_len,
        T::one(),
        cd.as_ptr(), out_len as isize, 1,
        w.as_ptr(), 1, out_len as isize,
        T::zero(),
        pd.as_mut_ptr(), in_len as isize, 1,
      );
    }
  }
  accumulate_dw_db(params, prev_out, dw, db, curr_delta, samples, parallelize);
}

/// Per-sample parameter gradient rows: `dW[s][i, o] += in[s][i] * delta[s][o]`
/// and `db[s][o] += delta[s][o]`. Rows are disjoint per sample.

fn accumulate_dw_db<T: Real>(
  params: &FullyParams,
  prev_out: &Tensor<T>,
  dw: &Tensor<T>,
  db: Option<&Tensor<T>>,
  curr_delta: &Tensor<T>,
  samples: usize,
  parallelize: bool,
) {
  let (in_len, out_len) = (params.in_size, params.out_size);
  let w_len = in_len * out_len;
  let po_guard = prev_out.raw();
  let po = &po_guard[..samples * in_len];
  let cd_guard = curr_delta.raw();
  let cd = &cd_guard[..samples * out_len];
  {
    let mut dw_guard = dw.raw_mut();
    let dw = &mut dw_guard[..samples * w_len];

    let run = |po_row: &[T], cd_row: &[T], dw_row: &mut [T]| {
      for (i, &x) in po_row.iter().enumerate() {
        let dw_r = &mut dw_row[i * out_len..(i + 1) * out_len];
        for (slot, &d) in dw_r.iter_mut().zip(cd_row) {
          *slot += x * d;
        }
      }
    };

    if parallelize {
      (dw.par_chunks_mut(w_len), po.par_chunks(in_len), cd.par_chunks(out_len))
        .into_par_iter()
        .for_each(|(dw_row, po_row, cd_row)| run(po_row, cd_row, dw_row) );
    } else {
      izip!(dw.chunks_mut(w_len), po.chunks(in_len), cd.chunks(out_len))
        .for_each(|(dw_row, po_row, cd_row)| run(po_row, cd_row, dw_row) );
    }
  }

  if let Some(db) = db {
    let mut db_guard = db.raw_mut();
    let db = &mut db_guard[..samples * out_len];
    for (db_row, cd_row) in db.chunks_mut(out_len).zip(cd.chunks(out_len)) {
      for (slot, &d) in db_row.iter_mut().zip(cd_row) {
        *slot += d;
      }
    }
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  const PARAMS: FullyParams = FullyParams { in_size: 3, out_size: 2, has_bias: true };

  fn fixtures() -> (Tensor<f32>, Tensor<f32>, Tensor<f32>) {
    // W[i * out + o]
    let weights = Tensor::vec(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let bias = Tensor::vec(&[0.5, -0.5]);
    let input = Tensor::new(&[1, 3], vec![1.0, 2.0, 0.5]);
    (weights, bias, input)
  }

  #[test]
  fn forward_reference_values() {
    let (weights, bias, input) = fixtures();
    let out = Tensor::zeros(&[1, 2]);
    forward_internal(&PARAMS, &input, &weights, Some(&bias), &out, 1, false);
    assert_eq!(out, Tensor::new(&[1, 2], vec![10.0, 12.5]));
  }

  #[test]
  fn engines_agree() {
    let (weights, bias, input) = fixtures();

    let internal = Tensor::zeros(&[1, 2]);
    forward_internal(&PARAMS, &input, &weights, Some(&bias), &internal, 1, false);

    let simd = Tensor::zeros(&[1, 2]);
    forward_simd(&PARAMS, &input, &weights, Some(&bias), &simd, 1, false);
    assert_eq!(internal, simd);

    let blas = Tensor::zeros(&[1, 2]);
    forward_blas(&PARAMS, &input, &weights, Some(&bias), &blas, 1);
    for (a, b) in internal.to_vec().iter().zip(blas.to_vec()) {
      assert!((a - b).abs() < 1e-5);
    }
  }

  #[test]
  fn backward_reference_values() {
    let (weights, _, input) = fixtures();
    let curr_delta = Tensor::new(&[1, 2], vec![1.0, -1.0]);
    let prev_delta = Tensor::zeros(&[1, 3]);
    let dw = Tensor::zeros(&[1, 6]);
    let db = Tensor::zeros(&[1, 2]);

    backward_internal(&PARAMS, &input, &weights, &dw, Some(&db),
      &curr_delta, &prev_delta, 1, false);

    // pd[i] = sum_o cd[o] * W[i, o]
    assert_eq!(prev_delta, Tensor::new(&[1, 3], vec![-1.0, -1.0, -1.0]));
    // dW[i, o] = in[i] * cd[o]
    assert_eq!(dw, Tensor::new(&[1, 6], vec![1.0, -1.0, 2.0, -2.0, 0.5, -0.5]));
    assert_eq!(db, Tensor::new(&[1, 2], vec![1.0, -1.0]));
  }

  #[test]
  fn backward_blas_agrees() {
    let (weights, _, input) = fixtures();
    let curr_delta = Tensor::new(&[1, 2], vec![0.25, 0.75]);

    let pd_a = Tensor::zeros(&[1, 3]);
    let dw_a = Tensor::zeros(&[1, 6]);
    backward_internal(&PARAMS, &input, &weights, &dw_a, None, &curr_delta, &pd_a, 1, false);

    let pd_b = Tensor::zeros(&[1, 3]);
    let dw_b = Tensor::zeros(&[1, 6]);
    backward_blas(&PARAMS, &input, &weights, &dw_b, None, &curr_delta, &pd_b, 1, false);

    for (a, b) in pd_a.to_vec().iter().zip(pd_b.to_vec()) {
      assert!((a - b).abs() < 1e-5);
    }
    assert_eq!(dw_a, dw_b);
  }

  #[test]
  fn parallel_matches_serial() {
    let (weights, bias, _) = fixtures();
    let input = Tensor::new(&[4, 3], (0..12).map(|i| i as f32 * 0.25 ).collect());

    let serial = Tensor::zeros(&[4, 2]);
    forward_internal(&PARAMS, &input, &weights, Some(&bias), &serial, 4, false);

    let parallel = Tensor::zeros(&[4, 2]);
    forward_internal(&PARAMS, &input, &weights, Some(&bias), &parallel, 4, true);

    assert_eq!(serial, parallel);
  }
}
