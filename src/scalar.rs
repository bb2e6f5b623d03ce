use rand::distributions::uniform::SampleUniform;
use num_traits::{NumAssignOps, Num, NumCast};


/// All types that may be stored in a [Tensor](crate::Tensor).
///
/// This trait gets implemented automatically for all types
/// that satisfy its dependent traits.

pub trait Inner: PartialEq + Clone + Copy + Send + Sync + std::fmt::Debug {}
impl<T: PartialEq + Clone + Copy + Send + Sync + std::fmt::Debug> Inner for T {}


/// All numeric types.
///
/// This trait gets implemented automatically for all types
/// that satisfy its dependent traits.

pub trait Numeric: Inner + PartialOrd + Num + NumCast + NumAssignOps + std::iter::Sum {}
impl<T: Inner + PartialOrd + Num + NumCast + NumAssignOps + std::iter::Sum> Numeric for T {}


/// All continuous numeric types. Network data, gradients and parameters
/// are tensors of some `Real` type, `f32` in practice.
///
/// This trait gets implemented automatically for all types
/// that satisfy its dependent traits.

pub trait Real: Numeric + num_traits::Float + SampleUniform + Gemm {}
impl<T: Numeric + num_traits::Float + SampleUniform + Gemm> Real for T {}


/// Scalar types with a packed matrix multiply provided by [matrixmultiply].
///
/// Row/column strides are in elements. The output matrix must not alias
/// either input.

pub trait Gemm: Sized {
  unsafe fn gemm(
    m: usize, k: usize, n: usize,
    alpha: Self,
    a: *const Self, rsa: isize, csa: isize,
    b: *const Self, rsb: isize, csb: isize,
    beta: Self,
    c: *mut Self, rsc: isize, csc: isize,
  );
}

impl Gemm for f32 {
  unsafe fn gemm(
    m: usize, k: usize, n: usize,
    alpha: Self,
    a: *const Self, rsa: isize, csa: isize,
    b: *const Self, rsb: isize, csb: isize,
    beta: Self,
    c: *mut Self, rsc: isize, csc: isize,
  ) {
    matrixmultiply::sgemm(m, k, n, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc)
  }
}

impl Gemm for f64 {
  unsafe fn gemm(
    m: usize, k: usize, n: usize,
    alpha: Self,
    a: *const Self, rsa: isize, csa: isize,
    b: *const Self, rsb: isize, csb: isize,
    beta: Self,
    c: *mut Self, rsc: isize, csc: isize,
  ) {
    matrixmultiply::dgemm(m, k, n, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc)
  }
}
