use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatrixError {
    #[error("matrix is singular (zero pivot in column {0})")]
    Singular(usize),
    #[error("scratch buffer too small: need {need}, got {got}")]
    ScratchTooSmall { need: usize, got: usize },
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
}

/// Dense row-major matrix with a logical-transpose flag.
///
/// The flag makes `transpose` O(1): element access reinterprets indices
/// instead of reshuffling storage. Workspace matrices are allocated once at
/// init and reused, so none of the arithmetic below allocates.
#[derive(Clone, Debug)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    transposed: bool,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self { rows, cols, transposed: false, data: vec![0.0; rows * cols] }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        m.fill_diag();
        m
    }

    /// Logical row count (honours the transpose flag).
    pub fn rows(&self) -> usize {
        if self.transposed { self.cols } else { self.rows }
    }

    /// Logical column count (honours the transpose flag).
    pub fn cols(&self) -> usize {
        if self.transposed { self.rows } else { self.cols }
    }

    pub fn is_transposed(&self) -> bool {
        self.transposed
    }

    #[inline]
    fn idx(&self, row: usize, col: usize) -> usize {
        if self.transposed {
            col * self.cols + row
        } else {
            row * self.cols + col
        }
    }

    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f64 {
        self.data[self.idx(row, col)]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        let i = self.idx(row, col);
        self.data[i] = val;
    }

    #[inline]
    pub fn add_at(&mut self, row: usize, col: usize, val: f64) {
        let i = self.idx(row, col);
        self.data[i] += val;
    }

    /// Flip the transpose flag. Applying twice is a no-op for both the data
    /// layout and the logical shape.
    pub fn transpose(&mut self) {
        self.transposed = !self.transposed;
    }

    pub fn zero(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Zero the matrix and set ones on the main diagonal.
    pub fn fill_diag(&mut self) {
        self.zero();
        let n = self.rows().min(self.cols());
        for i in 0..n {
            self.set(i, i, 1.0);
        }
    }

    pub fn scale(&mut self, s: f64) {
        self.data.iter_mut().for_each(|v| *v *= s);
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Column-vector accessor shorthand used by the filter code.
    #[inline]
    pub fn vec_at(&self, row: usize) -> f64 {
        self.at(row, 0)
    }

    #[inline]
    pub fn vec_set(&mut self, row: usize, val: f64) {
        self.set(row, 0, val);
    }

    pub fn copy_from(&mut self, src: &Matrix) {
        assert!(
            self.rows() == src.rows() && self.cols() == src.cols(),
            "copy_from shape mismatch"
        );
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                self.set(r, c, src.at(r, c));
            }
        }
    }

    /// self += other
    pub fn add_assign(&mut self, other: &Matrix) {
        assert!(
            self.rows() == other.rows() && self.cols() == other.cols(),
            "add shape mismatch"
        );
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                self.add_at(r, c, other.at(r, c));
            }
        }
    }

    /// self -= other
    pub fn sub_assign(&mut self, other: &Matrix) {
        assert!(
            self.rows() == other.rows() && self.cols() == other.cols(),
            "sub shape mismatch"
        );
        for r in 0..self.rows() {
            for c in 0..self.cols() {
                self.add_at(r, c, -other.at(r, c));
            }
        }
    }

    /// out = a - b
    pub fn sub(a: &Matrix, b: &Matrix, out: &mut Matrix) {
        assert!(
            a.rows() == b.rows() && a.cols() == b.cols(),
            "sub shape mismatch"
        );
        assert!(
            out.rows() == a.rows() && out.cols() == a.cols(),
            "sub output shape mismatch"
        );
        for r in 0..a.rows() {
            for c in 0..a.cols() {
                out.set(r, c, a.at(r, c) - b.at(r, c));
            }
        }
    }

    /// out = a * b
    pub fn mul(a: &Matrix, b: &Matrix, out: &mut Matrix) {
        assert!(a.cols() == b.rows(), "mul inner dimension mismatch");
        assert!(
            out.rows() == a.rows() && out.cols() == b.cols(),
            "mul output shape mismatch"
        );
        for r in 0..a.rows() {
            for c in 0..b.cols() {
                let mut acc = 0.0;
                for k in 0..a.cols() {
                    acc += a.at(r, k) * b.at(k, c);
                }
                out.set(r, c, acc);
            }
        }
    }

    /// out = a * b, short-circuiting on zero entries of `a`. Worth it when
    /// `a` is a block-sparse Jacobian; the inner loop is skipped entirely for
    /// structural zeros.
    pub fn mul_sparse(a: &Matrix, b: &Matrix, out: &mut Matrix) {
        assert!(a.cols() == b.rows(), "mul inner dimension mismatch");
        assert!(
            out.rows() == a.rows() && out.cols() == b.cols(),
            "mul output shape mismatch"
        );
        out.zero();
        for r in 0..a.rows() {
            for k in 0..a.cols() {
                let av = a.at(r, k);
                if av == 0.0 {
                    continue;
                }
                for c in 0..b.cols() {
                    out.add_at(r, c, av * b.at(k, c));
                }
            }
        }
    }

    /// out = a * b * aᵀ; `tmp` holds the intermediate a * b and must be
    /// (a.rows × b.cols).
    pub fn sandwich(a: &Matrix, b: &Matrix, out: &mut Matrix, tmp: &mut Matrix) {
        Self::mul(a, b, tmp);
        Self::mul_transposed_rhs(tmp, a, out);
    }

    /// Sparse-optimised sandwich product for block-sparse `a`.
    pub fn sandwich_sparse(a: &Matrix, b: &Matrix, out: &mut Matrix, tmp: &mut Matrix) {
        Self::mul_sparse(a, b, tmp);
        Self::mul_transposed_rhs(tmp, a, out);
    }

    /// out = a * bᵀ without touching b's transpose flag.
    fn mul_transposed_rhs(a: &Matrix, b: &Matrix, out: &mut Matrix) {
        assert!(a.cols() == b.cols(), "mul inner dimension mismatch");
        assert!(
            out.rows() == a.rows() && out.cols() == b.rows(),
            "mul output shape mismatch"
        );
        for r in 0..a.rows() {
            for c in 0..b.rows() {
                let mut acc = 0.0;
                for k in 0..a.cols() {
                    acc += a.at(r, k) * b.at(c, k);
                }
                out.set(r, c, acc);
            }
        }
    }

    /// Write `src` into this matrix with its top-left corner at (row, col).
    /// Only valid on an untransposed destination.
    pub fn write_submatrix(&mut self, row: usize, col: usize, src: &Matrix) {
        assert!(!self.transposed, "write_submatrix into transposed matrix");
        assert!(
            row + src.rows() <= self.rows && col + src.cols() <= self.cols,
            "submatrix out of bounds"
        );
        for r in 0..src.rows() {
            for c in 0..src.cols() {
                self.set(row + r, col + c, src.at(r, c));
            }
        }
    }

    /// Gauss-Jordan inversion into `out`, using `scratch` for the augmented
    /// system. `scratch` must hold at least 2·n² floats. Returns an error on
    /// a zero pivot or an undersized scratch buffer; `out` contents are
    /// unspecified after a failure.
    pub fn invert_into(&self, out: &mut Matrix, scratch: &mut [f64]) -> Result<(), MatrixError> {
        let n = self.rows();
        if self.cols() != n {
            return Err(MatrixError::Shape("inversion requires a square matrix"));
        }
        if out.rows() != n || out.cols() != n {
            return Err(MatrixError::Shape("inversion output shape mismatch"));
        }
        let need = 2 * n * n;
        if scratch.len() < need {
            return Err(MatrixError::ScratchTooSmall { need, got: scratch.len() });
        }

        // Augmented [A | I], row-major with stride 2n.
        let stride = 2 * n;
        for r in 0..n {
            for c in 0..n {
                scratch[r * stride + c] = self.at(r, c);
                scratch[r * stride + n + c] = if r == c { 1.0 } else { 0.0 };
            }
        }

        for col in 0..n {
            // Partial pivoting: pick the largest magnitude in this column.
            let mut pivot_row = col;
            let mut pivot_abs = scratch[col * stride + col].abs();
            for r in (col + 1)..n {
                let a = scratch[r * stride + col].abs();
                if a > pivot_abs {
                    pivot_abs = a;
                    pivot_row = r;
                }
            }
            if pivot_abs == 0.0 || !pivot_abs.is_finite() {
                return Err(MatrixError::Singular(col));
            }
            if pivot_row != col {
                for c in 0..stride {
                    scratch.swap(col * stride + c, pivot_row * stride + c);
                }
            }

            let pivot = scratch[col * stride + col];
            for c in 0..stride {
                scratch[col * stride + c] /= pivot;
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = scratch[r * stride + col];
                if factor == 0.0 {
                    continue;
                }
                for c in 0..stride {
                    scratch[r * stride + c] -= factor * scratch[col * stride + c];
                }
            }
        }

        for r in 0..n {
            for c in 0..n {
                out.set(r, c, scratch[r * stride + n + c]);
            }
        }

        Ok(())
    }
}
