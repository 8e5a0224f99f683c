//! Tensor Operations
//!
//! A minimal row-major `f32` tensor with exactly the operations the layers
//! need. Activations inside the model are kept 2D (`[batch * seq, features]`),
//! so most kernels only handle matrices; attention slices per-sequence row
//! blocks out of them.
//!
//! ## Example
//!
//! ```rust
//! use scribe::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Parallelism
//!
//! Large matrix products use a cache-blocked kernel parallelized over row
//! blocks with Rayon; element-wise operations use parallel iterators. Every
//! kernel accumulates in a fixed order, so results are bit-identical between
//! runs regardless of thread scheduling.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// A dense row-major tensor of `f32` values.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage in row-major order
    pub data: Vec<f32>,
    /// Dimensions, outermost first
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// # Panics
    ///
    /// Panics if the product of `shape` differs from `data.len()`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_size: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_size,
            "Data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected_size
        );
        Self { data, shape }
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Draw every element from `N(0, std²)`.
    ///
    /// Elements are drawn in row-major order, so the same RNG state always
    /// produces the same tensor.
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, std: f32, rng: &mut R) -> Self {
        let size: usize = shape.iter().product();
        let normal = Normal::new(0.0f32, std).expect("standard deviation must be finite and >= 0");
        let data = (0..size).map(|_| normal.sample(rng)).collect();
        Self::new(data, shape)
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Rows of a 2D tensor.
    pub fn rows(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "rows() requires a 2D tensor");
        self.shape[0]
    }

    /// Columns of a 2D tensor.
    pub fn cols(&self) -> usize {
        assert_eq!(self.shape.len(), 2, "cols() requires a 2D tensor");
        self.shape[1]
    }

    /// Inner loop of the blocked matmul: `result[j] += a_val * b[j]`.
    #[inline(always)]
    fn matmul_inner(a_val: f32, b: &[f32], result: &mut [f32]) {
        for (r, &b_val) in result.iter_mut().zip(b.iter()) {
            *r += a_val * b_val;
        }
    }

    /// 2D matrix multiplication: `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// Products with fewer than 1K multiply-adds run sequentially; larger ones
    /// use the parallel cache-blocked kernel.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.shape.len() == 2 && other.shape.len() == 2,
            "Unsupported matmul shapes: {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "Matrix dimensions incompatible: [{}, {}] @ [{}, {}]",
            self.shape[0], self.shape[1], other.shape[0], other.shape[1]
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 1_000 {
            return self.matmul_parallel_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let row = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                Self::matmul_inner(self.data[i * k + l], &other.data[l * n..(l + 1) * n], row);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    /// Parallel cache-blocked matrix multiplication.
    ///
    /// Rows are split into blocks of 8 that Rayon distributes across cores;
    /// inside a block the inner dimension is walked in ascending order, which
    /// keeps the summation order identical to the sequential path.
    fn matmul_parallel_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK_SIZE: usize = 8;

        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK_SIZE * n)
            .enumerate()
            .for_each(|(block_i, result_block)| {
                let i_start = block_i * BLOCK_SIZE;
                let i_end = (i_start + BLOCK_SIZE).min(m);

                for j_start in (0..n).step_by(BLOCK_SIZE) {
                    let j_end = (j_start + BLOCK_SIZE).min(n);
                    for i in i_start..i_end {
                        let row_offset = (i - i_start) * n;
                        for k_idx in 0..k {
                            Self::matmul_inner(
                                self.data[i * k + k_idx],
                                &other.data[k_idx * n + j_start..k_idx * n + j_end],
                                &mut result_block[row_offset + j_start..row_offset + j_end],
                            );
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// Transpose a 2D tensor.
    pub fn transpose(&self) -> Tensor {
        let rows = self.rows();
        let cols = self.cols();
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Row-wise softmax of a 2D tensor.
    ///
    /// Uses the max-subtracted form, so `-inf` entries map to exactly `0.0` as
    /// long as each row has at least one finite value.
    pub fn softmax_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut result = self.data.clone();
        result.par_chunks_mut(cols).for_each(softmax_in_place);
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition.
    ///
    /// Supports equal shapes and broadcasting a vector over the last
    /// dimension (`[*, n] + [n]`, e.g. a bias).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last_dim = *self.shape.last().expect("cannot broadcast into a scalar");
        assert!(
            other.shape.len() == 1 && other.shape[0] == last_dim,
            "Unsupported broadcast for add: {:?} + {:?}",
            self.shape,
            other.shape
        );
        let result = self
            .data
            .par_iter()
            .enumerate()
            .map(|(i, a)| a + other.data[i % last_dim])
            .collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place element-wise accumulation, used to sum gradients.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "Shapes must match for accumulation");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply all elements by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// Reinterpret the data with a new shape of the same size.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.data.len(),
            new_size,
            "Cannot reshape {:?} into {:?}: element count mismatch",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Copy `count` consecutive rows of a 2D tensor starting at `start`.
    pub fn row_block(&self, start: usize, count: usize) -> Tensor {
        let cols = self.cols();
        assert!(start + count <= self.rows(), "row block out of range");
        Tensor::new(
            self.data[start * cols..(start + count) * cols].to_vec(),
            vec![count, cols],
        )
    }

    /// Stack 2D tensors with equal column counts on top of each other.
    pub fn stack_rows(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "cannot stack zero tensors");
        let cols = parts[0].cols();
        let mut data = Vec::with_capacity(parts.iter().map(|p| p.numel()).sum());
        let mut rows = 0;
        for part in parts {
            assert_eq!(part.cols(), cols, "column counts must match when stacking rows");
            data.extend_from_slice(&part.data);
            rows += part.rows();
        }
        Tensor::new(data, vec![rows, cols])
    }

    /// Concatenate 2D tensors with equal row counts along the feature axis.
    pub fn concat_cols(parts: &[Tensor]) -> Tensor {
        assert!(!parts.is_empty(), "cannot concatenate zero tensors");
        let rows = parts[0].rows();
        let total_cols: usize = parts.iter().map(|p| p.cols()).sum();
        let mut data = Vec::with_capacity(rows * total_cols);
        for r in 0..rows {
            for part in parts {
                assert_eq!(part.rows(), rows, "row counts must match when concatenating");
                let c = part.cols();
                data.extend_from_slice(&part.data[r * c..(r + 1) * c]);
            }
        }
        Tensor::new(data, vec![rows, total_cols])
    }

    /// Split a 2D tensor into equal-width column groups (inverse of `concat_cols`).
    pub fn split_cols(&self, width: usize) -> Vec<Tensor> {
        let rows = self.rows();
        let cols = self.cols();
        assert!(width > 0 && cols % width == 0, "cannot split {} columns by {}", cols, width);
        (0..cols / width)
            .map(|g| {
                let mut data = Vec::with_capacity(rows * width);
                for r in 0..rows {
                    let start = r * cols + g * width;
                    data.extend_from_slice(&self.data[start..start + width]);
                }
                Tensor::new(data, vec![rows, width])
            })
            .collect()
    }

    /// Sum a 2D tensor over its rows, giving one value per column.
    pub fn sum_rows(&self) -> Tensor {
        let cols = self.cols();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (acc, &v) in result.iter_mut().zip(row) {
                *acc += v;
            }
        }
        Tensor::new(result, vec![cols])
    }
}

/// Numerically stable softmax over one row, in place.
pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_matmul_small_and_blocked_agree() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Tensor::randn(vec![20, 13], 1.0, &mut rng);
        let b = Tensor::randn(vec![13, 11], 1.0, &mut rng);

        let blocked = a.matmul(&b);
        assert_eq!(blocked.shape, vec![20, 11]);

        for i in 0..20 {
            for j in 0..11 {
                let expected: f32 = (0..13).map(|l| a.data[i * 13 + l] * b.data[l * 11 + j]).sum();
                assert_abs_diff_eq!(blocked.data[i * 11 + j], expected, epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_softmax_masks_neg_infinity_to_zero() {
        let t = Tensor::new(vec![1.0, f32::NEG_INFINITY, 2.0, 3.0], vec![2, 2]);
        let s = t.softmax_rows();
        assert_eq!(s.data[0], 1.0);
        assert_eq!(s.data[1], 0.0);
        assert_abs_diff_eq!(s.data[2] + s.data[3], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_add_broadcasts_bias() {
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![10.0, 20.0], vec![2]);
        assert_eq!(x.add(&b).data, vec![11.0, 22.0, 13.0, 24.0]);
    }

    #[test]
    fn test_concat_and_split_cols_are_inverse() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], vec![2, 2]);
        let joined = Tensor::concat_cols(&[a.clone(), b.clone()]);
        assert_eq!(joined.data, vec![1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]);
        assert_eq!(joined.split_cols(2), vec![a, b]);
    }

    #[test]
    fn test_row_block_and_stack() {
        let t = Tensor::new((0..6).map(|v| v as f32).collect(), vec![3, 2]);
        let top = t.row_block(0, 1);
        let rest = t.row_block(1, 2);
        assert_eq!(rest.data, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(Tensor::stack_rows(&[top, rest]), t);
    }

    #[test]
    fn test_transpose_and_sum_rows() {
        let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
        let tt = t.transpose();
        assert_eq!(tt.shape, vec![3, 2]);
        assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(t.sum_rows().data, vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_randn_is_seeded() {
        let a = Tensor::randn(vec![4, 4], 0.02, &mut StdRng::seed_from_u64(1));
        let b = Tensor::randn(vec![4, 4], 0.02, &mut StdRng::seed_from_u64(1));
        assert_eq!(a, b);
    }
}
