//! Strided `f32` GEMM for the dense stage.
//!
//! Operands are viewed through `(row_stride, col_stride)` so a transpose is a swap of
//! strides rather than a copy. With the `matrixmultiply` feature the product runs on that
//! crate's `sgemm`; otherwise a plain loop computes it.

/// A read-only `(rows, cols)` view into a flat buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct View<'a> {
    data: &'a [f32],
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> View<'a> {
    /// `data` holds a row-major `(rows, cols)` matrix.
    pub(crate) fn row_major(data: &'a [f32], rows: usize, cols: usize) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self {
            data,
            rows,
            cols,
            row_stride: cols,
            col_stride: 1,
        }
    }

    /// The same buffer read as its `(cols, rows)` transpose.
    pub(crate) fn t(self) -> Self {
        Self {
            data: self.data,
            rows: self.cols,
            cols: self.rows,
            row_stride: self.col_stride,
            col_stride: self.row_stride,
        }
    }

    #[inline]
    #[cfg_attr(feature = "matrixmultiply", allow(dead_code))]
    fn at(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.row_stride + c * self.col_stride]
    }
}

/// `out = a * b + beta * out`, where `out` is row-major `(a.rows, b.cols)`.
///
/// `beta = 0.0` overwrites, `beta = 1.0` accumulates.
pub(crate) fn gemm(a: View<'_>, b: View<'_>, beta: f32, out: &mut [f32]) {
    assert_eq!(a.cols, b.rows, "gemm inner dimensions differ");
    let (m, k, n) = (a.rows, a.cols, b.cols);
    assert_eq!(out.len(), m * n, "gemm output has the wrong length");
    if m == 0 || n == 0 {
        return;
    }

    #[cfg(feature = "matrixmultiply")]
    // SAFETY: the asserts above and the view constructors keep every strided index
    // of a, b and out inside their slices.
    unsafe {
        matrixmultiply::sgemm(
            m,
            k,
            n,
            1.0,
            a.data.as_ptr(),
            a.row_stride as isize,
            a.col_stride as isize,
            b.data.as_ptr(),
            b.row_stride as isize,
            b.col_stride as isize,
            beta,
            out.as_mut_ptr(),
            n as isize,
            1,
        );
    }

    #[cfg(not(feature = "matrixmultiply"))]
    for i in 0..m {
        for j in 0..n {
            let acc = (0..k).fold(0.0_f32, |acc, p| a.at(i, p).mul_add(b.at(p, j), acc));
            let slot = &mut out[i * n + j];
            *slot = acc + beta * *slot;
        }
    }
}
